//! The guest's virtual address space.
//!
//! The 64-bit space is partitioned into non-overlapping page-aligned regions
//! held in an ordered map keyed by base address, giving O(log n) lookup,
//! split, and merge. Every access is checked against the owning region's
//! protection; a violation or an unmapped address is a guest fault that the
//! caller treats as fatal.

mod region;

pub use region::{Backing, Region, SharedSeg};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use bitflags::bitflags;
use thiserror::Error;
use tracing::warn;

pub const PAGE_SIZE: u64 = 4096;

/// Lowest address handed out when the caller lets the MMU choose.
pub const MMAP_FLOOR: u64 = 0x1_0000;

/// Policy ceiling for a single mapping. Region storage is host-allocated,
/// so a length beyond this is ENOMEM before it reaches the allocator.
pub const MAX_MAP_LEN: u64 = 1 << 40;

pub fn page_round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round up to the next page boundary. Only for values already known to be
/// far from the top of the address space; guest-supplied values go through
/// [`page_round_up_checked`].
pub fn page_round_up(addr: u64) -> u64 {
    (addr + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

/// Overflow-checked page round-up for guest-controlled values.
pub fn page_round_up_checked(addr: u64) -> Option<u64> {
    addr.checked_add(PAGE_SIZE - 1).map(|v| v & !(PAGE_SIZE - 1))
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const PRIVATE = 1;
        const SHARED = 2;
        const ANONYMOUS = 4;
        const FIXED = 8;
        const NO_REPLACE = 16;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

impl Access {
    fn required(self) -> Prot {
        match self {
            Access::Read => Prot::READ,
            Access::Write => Prot::WRITE,
            Access::Exec => Prot::EXEC,
        }
    }
}

/// A guest memory fault. Fatal to the emulated process, except for
/// `RangeOverflow`, which the syscall layer reports as a plain errno.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MemFault {
    #[error("{access:?} of {len} bytes at unmapped guest address {addr:#x}")]
    Unmapped { addr: u64, access: Access, len: u64 },
    #[error("{access:?} at {addr:#x} violates region protection {prot:?}")]
    Protection { addr: u64, access: Access, prot: Prot },
    #[error("{len}-byte access at {addr:#x} crosses a region boundary")]
    Straddle { addr: u64, len: u64 },
    #[error("range {addr:#x}+{len:#x} wraps the address space")]
    RangeOverflow { addr: u64, len: u64 },
}

/// Why a mapping request was refused; the syscall layer turns these into
/// guest errno values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// FIXED|NO_REPLACE over an existing region.
    Exists,
    /// Address space exhaustion (or an unmappable hint).
    NoMemory,
    /// Malformed request (zero length, unaligned FIXED address).
    Invalid,
}

#[derive(Default)]
pub struct Mmu {
    regions: BTreeMap<u64, Region>,
    heap: Option<(u64, u64)>,
}

impl Mmu {
    pub fn new() -> Mmu {
        Mmu::default()
    }

    /// Region covering `addr`, if any.
    pub fn find_region(&self, addr: u64) -> Option<&Region> {
        let (_, region) = self.regions.range(..=addr).next_back()?;
        (addr < region.end()).then_some(region)
    }

    fn find_region_mut(&mut self, addr: u64) -> Option<&mut Region> {
        let (_, region) = self.regions.range_mut(..=addr).next_back()?;
        (addr < region.end()).then_some(region)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Map a new region. Without FIXED the lowest free page-aligned range at
    /// or above the hint (or the global floor) is chosen. File-backed content
    /// is copied in by the caller afterwards; this only creates storage.
    pub fn mmap(
        &mut self,
        addr_hint: u64,
        length: u64,
        prot: Prot,
        flags: MapFlags,
    ) -> Result<u64, MapError> {
        let mut flags = flags;
        if length == 0 {
            return Err(MapError::Invalid);
        }
        // Guest-controlled length: a value near u64::MAX must come back as
        // ENOMEM, not wrap the rounding arithmetic or reach the allocator.
        let length = page_round_up_checked(length)
            .filter(|len| *len <= MAX_MAP_LEN)
            .ok_or(MapError::NoMemory)?;
        if flags.contains(MapFlags::SHARED) && prot.contains(Prot::WRITE) {
            warn!("writable shared mapping downgraded to private");
            flags.remove(MapFlags::SHARED);
            flags.insert(MapFlags::PRIVATE);
        }

        let base = if flags.contains(MapFlags::FIXED) {
            if addr_hint % PAGE_SIZE != 0 {
                return Err(MapError::Invalid);
            }
            if addr_hint.checked_add(length).is_none() {
                return Err(MapError::NoMemory);
            }
            if self.intersects(addr_hint, length) {
                if flags.contains(MapFlags::NO_REPLACE) {
                    return Err(MapError::Exists);
                }
                self.unmap(addr_hint, length);
            }
            addr_hint
        } else {
            self.find_free(addr_hint.max(MMAP_FLOOR), length)
                .ok_or(MapError::NoMemory)?
        };

        let region = Region::new_anonymous(base, length, prot, flags);
        self.regions.insert(base, region);
        Ok(base)
    }

    /// Map a region whose bytes live in a shared segment (System V shm).
    pub fn mmap_shared(
        &mut self,
        addr_hint: u64,
        length: u64,
        prot: Prot,
        seg: SharedSeg,
        name: &str,
    ) -> Result<u64, MapError> {
        if length == 0 {
            return Err(MapError::Invalid);
        }
        let length = page_round_up_checked(length)
            .filter(|len| *len <= MAX_MAP_LEN)
            .ok_or(MapError::NoMemory)?;
        let base = if addr_hint != 0 {
            if addr_hint % PAGE_SIZE != 0 || addr_hint.checked_add(length).is_none() {
                return Err(MapError::Invalid);
            }
            if self.intersects(addr_hint, length) {
                return Err(MapError::Invalid);
            }
            addr_hint
        } else {
            self.find_free(MMAP_FLOOR, length).ok_or(MapError::NoMemory)?
        };
        let mut region = Region::new_shared(base, length, prot, seg);
        region.set_name(name);
        self.regions.insert(base, region);
        Ok(base)
    }

    fn intersects(&self, base: u64, length: u64) -> bool {
        let end = base + length;
        self.regions
            .range(..end)
            .next_back()
            .is_some_and(|(_, r)| r.end() > base)
    }

    fn find_free(&self, floor: u64, length: u64) -> Option<u64> {
        let mut candidate = page_round_down(floor.max(MMAP_FLOOR));
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.base() >= candidate && region.base() - candidate >= length {
                return Some(candidate);
            }
            candidate = region.end();
        }
        candidate.checked_add(length).map(|_| candidate)
    }

    /// Unmap every page in `[addr, addr+length)`. Idempotent on holes;
    /// regions partially covered are truncated or split. A range wrapping
    /// the address space is refused.
    pub fn munmap(&mut self, addr: u64, length: u64) -> Result<(), MemFault> {
        if length == 0 {
            return Ok(());
        }
        let (start, end) = self.guest_range(addr, length)?;
        self.unmap(start, end - start);
        Ok(())
    }

    /// Validate a guest `(addr, length)` pair and return its page-rounded
    /// bounds.
    fn guest_range(&self, addr: u64, length: u64) -> Result<(u64, u64), MemFault> {
        let end = addr
            .checked_add(length)
            .and_then(page_round_up_checked)
            .ok_or(MemFault::RangeOverflow { addr, len: length })?;
        Ok((page_round_down(addr), end))
    }

    fn unmap(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = start + length;
        // Collect bases first; mutating while iterating is not an option.
        let bases: Vec<u64> = self
            .regions
            .range(..end)
            .filter(|(_, r)| r.end() > start)
            .map(|(b, _)| *b)
            .collect();
        for base in bases {
            let region = self.regions.remove(&base).expect("region disappeared");
            let (before, _, after) = region.split3(start, end);
            if let Some(before) = before {
                self.regions.insert(before.base(), before);
            }
            if let Some(after) = after {
                self.regions.insert(after.base(), after);
            }
        }
    }

    /// Change protection on every region covered by the range, splitting at
    /// the boundary pages. Zero-length requests are a no-op.
    pub fn mprotect(&mut self, addr: u64, length: u64, prot: Prot) -> Result<(), MemFault> {
        if length == 0 {
            return Ok(());
        }
        let (start, end) = self.guest_range(addr, length)?;
        let bases: Vec<u64> = self
            .regions
            .range(..end)
            .filter(|(_, r)| r.end() > start)
            .map(|(b, _)| *b)
            .collect();
        if bases.is_empty() && length > 0 {
            return Err(MemFault::Unmapped {
                addr,
                access: Access::Write,
                len: length,
            });
        }
        for base in bases {
            let region = self.regions.remove(&base).expect("region disappeared");
            let (before, mut middle, after) = region.split3(start, end);
            middle.set_prot(prot);
            for r in [before, Some(middle), after].into_iter().flatten() {
                self.regions.insert(r.base(), r);
            }
        }
        Ok(())
    }

    /// Record the heap bounds so `brk` knows which region to grow.
    pub fn set_heap(&mut self, base: u64, end: u64) {
        self.heap = Some((base, end));
    }

    /// Grow or shrink the heap region; returns the new program break.
    /// A request below the heap base or colliding with a neighboring region
    /// leaves the break unchanged, mirroring the kernel's brk contract.
    pub fn brk(&mut self, new_end: u64) -> u64 {
        let Some((base, end)) = self.heap else {
            return 0;
        };
        if new_end <= base {
            return end;
        }
        let Some(new_end) = page_round_up_checked(new_end) else {
            return end;
        };
        if new_end == end {
            return end;
        }
        if new_end > end {
            if new_end - base > MAX_MAP_LEN {
                return end;
            }
            let collides = self
                .regions
                .range(base + 1..)
                .next()
                .is_some_and(|(b, _)| *b < new_end);
            if collides {
                return end;
            }
        }
        let Some(region) = self.find_region_mut(base) else {
            return end;
        };
        region.resize(new_end - base);
        self.heap = Some((base, new_end));
        new_end
    }

    pub fn heap_end(&self) -> u64 {
        self.heap.map(|(_, end)| end).unwrap_or(0)
    }

    fn checked_region(
        &self,
        addr: u64,
        len: u64,
        access: Access,
    ) -> Result<&Region, MemFault> {
        let region = self.find_region(addr).ok_or(MemFault::Unmapped {
            addr,
            access,
            len,
        })?;
        let end = addr
            .checked_add(len)
            .ok_or(MemFault::Straddle { addr, len })?;
        if end > region.end() {
            return Err(MemFault::Straddle { addr, len });
        }
        if !region.prot().contains(access.required()) {
            return Err(MemFault::Protection {
                addr,
                access,
                prot: region.prot(),
            });
        }
        Ok(region)
    }

    fn checked_region_mut(
        &mut self,
        addr: u64,
        len: u64,
        access: Access,
    ) -> Result<&mut Region, MemFault> {
        // Borrow-checker friendly double lookup.
        self.checked_region(addr, len, access)?;
        Ok(self.find_region_mut(addr).expect("region disappeared"))
    }

    pub fn read8(&self, addr: u64) -> Result<u8, MemFault> {
        let region = self.checked_region(addr, 1, Access::Read)?;
        let mut buf = [0u8; 1];
        region.read(addr, &mut buf);
        Ok(buf[0])
    }

    pub fn read16(&self, addr: u64) -> Result<u16, MemFault> {
        let region = self.checked_region(addr, 2, Access::Read)?;
        let mut buf = [0u8; 2];
        region.read(addr, &mut buf);
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read32(&self, addr: u64) -> Result<u32, MemFault> {
        let region = self.checked_region(addr, 4, Access::Read)?;
        let mut buf = [0u8; 4];
        region.read(addr, &mut buf);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read64(&self, addr: u64) -> Result<u64, MemFault> {
        let region = self.checked_region(addr, 8, Access::Read)?;
        let mut buf = [0u8; 8];
        region.read(addr, &mut buf);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read128(&self, addr: u64) -> Result<u128, MemFault> {
        let region = self.checked_region(addr, 16, Access::Read)?;
        let mut buf = [0u8; 16];
        region.read(addr, &mut buf);
        Ok(u128::from_le_bytes(buf))
    }

    pub fn write8(&mut self, addr: u64, value: u8) -> Result<(), MemFault> {
        let region = self.checked_region_mut(addr, 1, Access::Write)?;
        region.write(addr, &[value]);
        Ok(())
    }

    pub fn write16(&mut self, addr: u64, value: u16) -> Result<(), MemFault> {
        let region = self.checked_region_mut(addr, 2, Access::Write)?;
        region.write(addr, &value.to_le_bytes());
        Ok(())
    }

    pub fn write32(&mut self, addr: u64, value: u32) -> Result<(), MemFault> {
        let region = self.checked_region_mut(addr, 4, Access::Write)?;
        region.write(addr, &value.to_le_bytes());
        Ok(())
    }

    pub fn write64(&mut self, addr: u64, value: u64) -> Result<(), MemFault> {
        let region = self.checked_region_mut(addr, 8, Access::Write)?;
        region.write(addr, &value.to_le_bytes());
        Ok(())
    }

    pub fn write128(&mut self, addr: u64, value: u128) -> Result<(), MemFault> {
        let region = self.checked_region_mut(addr, 16, Access::Write)?;
        region.write(addr, &value.to_le_bytes());
        Ok(())
    }

    /// Bulk copy into guest memory with per-byte permission checks; the range
    /// may span adjacent regions.
    pub fn copy_to_mmu(&mut self, mut addr: u64, mut src: &[u8]) -> Result<(), MemFault> {
        while !src.is_empty() {
            let region = self.find_region(addr).ok_or(MemFault::Unmapped {
                addr,
                access: Access::Write,
                len: src.len() as u64,
            })?;
            if !region.prot().contains(Prot::WRITE) {
                return Err(MemFault::Protection {
                    addr,
                    access: Access::Write,
                    prot: region.prot(),
                });
            }
            let chunk = ((region.end() - addr) as usize).min(src.len());
            let region = self.find_region_mut(addr).expect("region disappeared");
            region.write(addr, &src[..chunk]);
            addr += chunk as u64;
            src = &src[chunk..];
        }
        Ok(())
    }

    /// Bulk copy out of guest memory with per-byte permission checks.
    pub fn copy_from_mmu(&self, mut addr: u64, mut len: u64) -> Result<Vec<u8>, MemFault> {
        let mut out = Vec::with_capacity(len as usize);
        while len > 0 {
            let region = self.find_region(addr).ok_or(MemFault::Unmapped {
                addr,
                access: Access::Read,
                len,
            })?;
            if !region.prot().contains(Prot::READ) {
                return Err(MemFault::Protection {
                    addr,
                    access: Access::Read,
                    prot: region.prot(),
                });
            }
            let chunk = (region.end() - addr).min(len);
            let mut buf = vec![0u8; chunk as usize];
            region.read(addr, &mut buf);
            out.extend_from_slice(&buf);
            addr += chunk;
            len -= chunk;
        }
        Ok(out)
    }

    /// Copy into a region regardless of its current protection: WRITE is
    /// added for the duration of the copy and the old protection restored.
    /// Used when loading file bytes into freshly mapped segments.
    pub fn copy_to_mmu_forced(&mut self, addr: u64, src: &[u8]) -> Result<(), MemFault> {
        let region = self.find_region(addr).ok_or(MemFault::Unmapped {
            addr,
            access: Access::Write,
            len: src.len() as u64,
        })?;
        let base = region.base();
        let saved = region.prot();
        let region = self.find_region_mut(base).expect("region disappeared");
        region.set_prot(saved | Prot::WRITE);
        let result = self.copy_to_mmu(addr, src);
        let region = self.find_region_mut(base).expect("region disappeared");
        region.set_prot(saved);
        result
    }

    /// Read a NUL-terminated guest string.
    pub fn read_cstring(&self, mut addr: u64) -> Result<String, MemFault> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read8(addr)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            addr += 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fetch up to `max_len` instruction bytes at `addr`; requires EXEC.
    pub fn fetch(&self, addr: u64, max_len: u64) -> Result<Vec<u8>, MemFault> {
        let region = self.find_region(addr).ok_or(MemFault::Unmapped {
            addr,
            access: Access::Exec,
            len: max_len,
        })?;
        if !region.prot().contains(Prot::EXEC) {
            return Err(MemFault::Protection {
                addr,
                access: Access::Exec,
                prot: region.prot(),
            });
        }
        let len = (region.end() - addr).min(max_len);
        let mut buf = vec![0u8; len as usize];
        region.read(addr, &mut buf);
        Ok(buf)
    }

    /// Presence bitmap for mincore: nothing is ever swapped out, so every
    /// mapped page reports resident. Checking page by page keeps a huge
    /// guest length from allocating the full bitmap before the first
    /// unmapped page fails the call.
    pub fn mincore(&self, addr: u64, length: u64) -> Result<Vec<u8>, MemFault> {
        let (start, end) = self.guest_range(addr, length)?;
        let mut out = Vec::new();
        let mut page = start;
        while page < end {
            if self.find_region(page).is_none() {
                return Err(MemFault::Unmapped {
                    addr: page,
                    access: Access::Read,
                    len: PAGE_SIZE,
                });
            }
            out.push(1);
            page += PAGE_SIZE;
        }
        Ok(out)
    }

    pub fn set_region_name(&mut self, addr: u64, name: &str) {
        if let Some(region) = self.find_region_mut(addr) {
            region.set_name(name);
        }
    }

    pub fn set_region_file(&mut self, addr: u64, path: PathBuf, offset: u64) {
        if let Some(region) = self.find_region_mut(addr) {
            region.set_file(path, offset);
        }
    }

    /// One line per region, for fault dumps.
    pub fn dump_regions(&self) -> String {
        let mut out = String::new();
        for region in self.regions.values() {
            let prot = [
                if region.prot().contains(Prot::READ) { 'r' } else { '-' },
                if region.prot().contains(Prot::WRITE) { 'w' } else { '-' },
                if region.prot().contains(Prot::EXEC) { 'x' } else { '-' },
            ];
            let _ = writeln!(
                out,
                "  {:#14x}-{:#14x} {}{}{} {}",
                region.base(),
                region.end(),
                prot[0],
                prot[1],
                prot[2],
                region.name(),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests;
