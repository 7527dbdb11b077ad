//! Memory-management syscalls: delegated to the MMU, plus System V shm.

use strato_abi::Errno;
use strato_mmu::{MapError, MapFlags, Prot};
use tracing::warn;

use super::{ret, Control, SysCtx};
use crate::SysFault;

fn prot_from_guest(prot: i32) -> Prot {
    let mut out = Prot::empty();
    if prot & libc::PROT_READ != 0 {
        out |= Prot::READ;
    }
    if prot & libc::PROT_WRITE != 0 {
        out |= Prot::WRITE;
    }
    if prot & libc::PROT_EXEC != 0 {
        out |= Prot::EXEC;
    }
    out
}

fn map_flags_from_guest(flags: i32) -> MapFlags {
    let mut out = MapFlags::empty();
    if flags & libc::MAP_PRIVATE != 0 {
        out |= MapFlags::PRIVATE;
    }
    if flags & libc::MAP_SHARED != 0 {
        out |= MapFlags::SHARED;
    }
    if flags & libc::MAP_ANONYMOUS != 0 {
        out |= MapFlags::ANONYMOUS;
    }
    if flags & libc::MAP_FIXED != 0 {
        out |= MapFlags::FIXED;
    }
    if flags & libc::MAP_FIXED_NOREPLACE != 0 {
        out |= MapFlags::FIXED | MapFlags::NO_REPLACE;
    }
    out
}

fn map_errno(err: MapError) -> Errno {
    match err {
        MapError::Exists => Errno::EEXIST,
        MapError::NoMemory => Errno::ENOMEM,
        MapError::Invalid => Errno::EINVAL,
    }
}

pub(super) fn mmap(
    ctx: &mut SysCtx<'_>,
    addr: u64,
    length: u64,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<Control, SysFault> {
    let prot = prot_from_guest(prot);
    let map_flags = map_flags_from_guest(flags);

    let base = match ctx.mmu.mmap(addr, length, prot, map_flags) {
        Ok(base) => base,
        Err(e) => return ret(Err(map_errno(e))),
    };

    if !map_flags.contains(MapFlags::ANONYMOUS) {
        // File-backed: pull the bytes through the file table into the fresh
        // private region, then leave the requested protection in place.
        let bytes = match ctx.files.pread(fd, length as usize, offset) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = ctx.mmu.munmap(base, length);
                return ret(Err(e));
            }
        };
        ctx.mmu.copy_to_mmu_forced(base, &bytes)?;
        if let Some(path) = file_path(ctx, fd) {
            ctx.mmu.set_region_file(base, path.clone(), offset as u64);
            ctx.mmu.set_region_name(base, &path.to_string_lossy());
        }
    }
    ret(Ok(base))
}

fn file_path(ctx: &SysCtx<'_>, fd: i32) -> Option<std::path::PathBuf> {
    match ctx.files.get(fd).ok()? {
        crate::fs::FileDesc::Host { path, .. } => Some(path.clone()),
        _ => None,
    }
}

pub(super) fn munmap(ctx: &mut SysCtx<'_>, addr: u64, length: u64) -> Result<Control, SysFault> {
    if length == 0 {
        return ret(Err(Errno::EINVAL));
    }
    match ctx.mmu.munmap(addr, length) {
        Ok(()) => ret(Ok(0)),
        Err(_) => ret(Err(Errno::EINVAL)),
    }
}

pub(super) fn mprotect(ctx: &mut SysCtx<'_>, addr: u64, length: u64, prot: i32) -> Result<Control, SysFault> {
    match ctx.mmu.mprotect(addr, length, prot_from_guest(prot)) {
        Ok(()) => ret(Ok(0)),
        Err(strato_mmu::MemFault::RangeOverflow { .. }) => ret(Err(Errno::EINVAL)),
        Err(_) => ret(Err(Errno::ENOMEM)),
    }
}

pub(super) fn brk(ctx: &mut SysCtx<'_>, new_end: u64) -> Result<Control, SysFault> {
    ret(Ok(ctx.mmu.brk(new_end)))
}

pub(super) fn mincore(ctx: &mut SysCtx<'_>, addr: u64, length: u64, vec: u64) -> Result<Control, SysFault> {
    match ctx.mmu.mincore(addr, length) {
        Ok(bits) => {
            ctx.mmu.copy_to_mmu(vec, &bits)?;
            ret(Ok(0))
        }
        Err(_) => ret(Err(Errno::ENOMEM)),
    }
}

pub(super) fn shmget(ctx: &mut SysCtx<'_>, key: i32, size: u64, flags: i32) -> Result<Control, SysFault> {
    if !ctx.config.enable_shm {
        warn!("shm disabled by configuration");
        return ret(Err(Errno::ENOTSUP));
    }
    ret(ctx.shm.shmget(key, size, flags).map(|id| id as u64))
}

pub(super) fn shmat(ctx: &mut SysCtx<'_>, id: i32, addr: u64) -> Result<Control, SysFault> {
    if !ctx.config.enable_shm {
        return ret(Err(Errno::ENOTSUP));
    }
    ret(ctx.shm.shmat(ctx.mmu, id, addr))
}

pub(super) fn shmdt(ctx: &mut SysCtx<'_>, addr: u64) -> Result<Control, SysFault> {
    if !ctx.config.enable_shm {
        return ret(Err(Errno::ENOTSUP));
    }
    ret(ctx.shm.shmdt(ctx.mmu, addr))
}

pub(super) fn shmctl(ctx: &mut SysCtx<'_>, id: i32, cmd: i32) -> Result<Control, SysFault> {
    if !ctx.config.enable_shm {
        return ret(Err(Errno::ENOTSUP));
    }
    ret(ctx.shm.shmctl(id, cmd))
}
