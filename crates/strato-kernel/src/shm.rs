//! System V shared memory, emulator-local.
//!
//! Segments live inside the emulator; attaching maps a SHARED region whose
//! bytes alias the segment, so every attachment observes every write. There
//! is no cross-process sharing (the emulator is the only process).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use strato_abi::Errno;
use strato_mmu::{Mmu, Prot, SharedSeg};
use tracing::debug;

pub const IPC_PRIVATE: i32 = 0;
pub const IPC_CREAT: i32 = 0o1000;
pub const IPC_EXCL: i32 = 0o2000;
pub const IPC_RMID: i32 = 0;
pub const IPC_STAT: i32 = 2;

struct Segment {
    key: i32,
    bytes: SharedSeg,
    attached: u32,
    removed: bool,
}

#[derive(Default)]
pub struct SharedMemory {
    segments: BTreeMap<i32, Segment>,
    attachments: BTreeMap<u64, i32>,
    next_id: i32,
}

impl SharedMemory {
    pub fn new() -> SharedMemory {
        SharedMemory {
            next_id: 1,
            ..SharedMemory::default()
        }
    }

    pub fn shmget(&mut self, key: i32, size: u64, flags: i32) -> Result<i32, Errno> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        if size > strato_mmu::MAX_MAP_LEN {
            return Err(Errno::ENOMEM);
        }
        if key != IPC_PRIVATE {
            if let Some((id, _)) = self
                .segments
                .iter()
                .find(|(_, s)| s.key == key && !s.removed)
            {
                if flags & IPC_CREAT != 0 && flags & IPC_EXCL != 0 {
                    return Err(Errno::EEXIST);
                }
                return Ok(*id);
            }
            if flags & IPC_CREAT == 0 {
                return Err(Errno::ENOENT);
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.segments.insert(
            id,
            Segment {
                key,
                bytes: Rc::new(RefCell::new(vec![0u8; size as usize])),
                attached: 0,
                removed: false,
            },
        );
        debug!(id, size, "shmget created segment");
        Ok(id)
    }

    pub fn shmat(&mut self, mmu: &mut Mmu, id: i32, addr_hint: u64) -> Result<u64, Errno> {
        let segment = self.segments.get_mut(&id).ok_or(Errno::EINVAL)?;
        let len = segment.bytes.borrow().len() as u64;
        let base = mmu
            .mmap_shared(
                addr_hint,
                len,
                Prot::READ | Prot::WRITE,
                segment.bytes.clone(),
                &format!("shm:{id}"),
            )
            .map_err(|_| Errno::ENOMEM)?;
        segment.attached += 1;
        self.attachments.insert(base, id);
        Ok(base)
    }

    pub fn shmdt(&mut self, mmu: &mut Mmu, addr: u64) -> Result<u64, Errno> {
        let id = self.attachments.remove(&addr).ok_or(Errno::EINVAL)?;
        let len = {
            let segment = self.segments.get_mut(&id).ok_or(Errno::EINVAL)?;
            segment.attached = segment.attached.saturating_sub(1);
            segment.bytes.borrow().len() as u64
        };
        let _ = mmu.munmap(addr, len);
        self.gc(id);
        Ok(0)
    }

    pub fn shmctl(&mut self, id: i32, cmd: i32) -> Result<u64, Errno> {
        match cmd {
            IPC_RMID => {
                let segment = self.segments.get_mut(&id).ok_or(Errno::EINVAL)?;
                segment.removed = true;
                self.gc(id);
                Ok(0)
            }
            IPC_STAT => {
                self.segments.get(&id).ok_or(Errno::EINVAL)?;
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn gc(&mut self, id: i32) {
        if let Some(segment) = self.segments.get(&id) {
            if segment.removed && segment.attached == 0 {
                self.segments.remove(&id);
            }
        }
    }
}
