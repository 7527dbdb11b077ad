//! Lazily populated decode cache.
//!
//! Executable guest memory is disassembled on demand into sections: a
//! contiguous address range and its sorted instruction sequence, where every
//! instruction's successor starts exactly at `addr + len`. Branch targets go
//! through dedicated call/jmp caches. Invalidation is lazy: when a range
//! loses EXEC or is unmapped, overlapping sections and the target caches are
//! purged and a version bump invalidates any execution-point hints held by
//! threads.

use std::collections::HashMap;

use strato_mmu::{Mmu, Prot};
use strato_x86::Inst;

use crate::fault::Fault;

/// A decoded run of instructions covering `[start, end)` of one executable
/// region.
pub struct Section {
    pub start: u64,
    pub end: u64,
    pub insts: Vec<Inst>,
}

impl Section {
    /// Binary search for an exact instruction boundary.
    fn find(&self, addr: u64) -> Option<usize> {
        self.insts.binary_search_by_key(&addr, |i| i.addr).ok()
    }
}

/// Position of one instruction in the cache, valid for a single cache
/// version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Loc {
    pub section: usize,
    pub index: usize,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
pub struct CodeCache {
    sections: Vec<Section>,
    call_cache: HashMap<u64, (usize, usize)>,
    jmp_cache: HashMap<u64, (usize, usize)>,
    version: u64,
    stats: CacheStats,
}

impl CodeCache {
    pub fn new() -> CodeCache {
        CodeCache::default()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn inst(&self, loc: Loc) -> &Inst {
        &self.sections[loc.section].insts[loc.index]
    }

    /// The fall-through successor inside the same section, if the hint is
    /// still valid.
    pub fn next(&self, loc: Loc) -> Option<Loc> {
        if loc.version != self.version {
            return None;
        }
        let section = self.sections.get(loc.section)?;
        let index = loc.index + 1;
        (index < section.insts.len()).then_some(Loc {
            section: loc.section,
            index,
            version: self.version,
        })
    }

    /// Resolve a call target, consulting the call cache first.
    pub fn lookup_call(&mut self, mmu: &Mmu, target: u64) -> Result<Loc, Fault> {
        if let Some(&(section, index)) = self.call_cache.get(&target) {
            self.stats.hits += 1;
            return Ok(Loc {
                section,
                index,
                version: self.version,
            });
        }
        let loc = self.lookup(mmu, target, None)?;
        self.call_cache.insert(target, (loc.section, loc.index));
        Ok(loc)
    }

    /// Resolve a jump/return target, consulting the jmp cache first.
    pub fn lookup_jmp(&mut self, mmu: &Mmu, target: u64) -> Result<Loc, Fault> {
        if let Some(&(section, index)) = self.jmp_cache.get(&target) {
            self.stats.hits += 1;
            return Ok(Loc {
                section,
                index,
                version: self.version,
            });
        }
        let loc = self.lookup(mmu, target, None)?;
        self.jmp_cache.insert(target, (loc.section, loc.index));
        Ok(loc)
    }

    /// The full lookup protocol: section hint, then the global cache, then
    /// on-demand disassembly of the enclosing executable region. Fails if
    /// `ip` is not an instruction boundary.
    pub fn lookup(&mut self, mmu: &Mmu, ip: u64, hint: Option<usize>) -> Result<Loc, Fault> {
        if let Some(section_idx) = hint {
            if let Some(section) = self.sections.get(section_idx) {
                if section.start <= ip && ip < section.end {
                    if let Some(index) = section.find(ip) {
                        self.stats.hits += 1;
                        return Ok(Loc {
                            section: section_idx,
                            index,
                            version: self.version,
                        });
                    }
                }
            }
        }
        for (section_idx, section) in self.sections.iter().enumerate() {
            if section.start <= ip && ip < section.end {
                return match section.find(ip) {
                    Some(index) => {
                        self.stats.hits += 1;
                        Ok(Loc {
                            section: section_idx,
                            index,
                            version: self.version,
                        })
                    }
                    // Inside a cached section but between boundaries: the
                    // guest jumped into the middle of an instruction.
                    None => Err(Fault::NotInstructionBoundary { addr: ip }),
                };
            }
        }
        self.stats.misses += 1;
        self.decode_at(mmu, ip)
    }

    /// Disassemble a bounded prefix of the executable region holding `ip`:
    /// up to the next already-cached section, or the region end.
    fn decode_at(&mut self, mmu: &Mmu, ip: u64) -> Result<Loc, Fault> {
        let region = self.exec_region(mmu, ip)?;
        let mut end = region.1;
        for section in &self.sections {
            if ip < section.start && section.start < end {
                end = section.start;
            }
        }
        let bytes = mmu.fetch(ip, end - ip)?;
        let decoded = strato_decoder::decode_range(&bytes, ip);
        if decoded.insts.is_empty() {
            return Err(Fault::NotInstructionBoundary { addr: ip });
        }
        let section = Section {
            start: ip,
            end: decoded.next_addr,
            insts: decoded.insts,
        };
        self.sections.push(section);
        Ok(Loc {
            section: self.sections.len() - 1,
            index: 0,
            version: self.version,
        })
    }

    fn exec_region(&self, mmu: &Mmu, ip: u64) -> Result<(u64, u64), Fault> {
        let region = mmu
            .find_region(ip)
            .ok_or(strato_mmu::MemFault::Unmapped {
                addr: ip,
                access: strato_mmu::Access::Exec,
                len: 1,
            })?;
        if !region.prot().contains(Prot::EXEC) {
            return Err(Fault::Mem(strato_mmu::MemFault::Protection {
                addr: ip,
                access: strato_mmu::Access::Exec,
                prot: region.prot(),
            }));
        }
        Ok((region.base(), region.end()))
    }

    /// Drop every section overlapping `[start, end)` along with the branch
    /// target caches. Called when mappings or protections change under
    /// executable code.
    pub fn invalidate_range(&mut self, start: u64, end: u64) {
        let before = self.sections.len();
        self.sections
            .retain(|s| s.end <= start || s.start >= end);
        if self.sections.len() != before {
            self.call_cache.clear();
            self.jmp_cache.clear();
            self.version += 1;
        }
    }

    /// Forget everything (exec_region change wholesale, e.g. exit cleanup).
    pub fn clear(&mut self) {
        self.sections.clear();
        self.call_cache.clear();
        self.jmp_cache.clear();
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_mmu::{MapFlags, Mmu, Prot};

    fn exec_mmu(code: &[u8], base: u64) -> Mmu {
        let mut mmu = Mmu::new();
        mmu.mmap(
            base,
            code.len() as u64,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .unwrap();
        mmu.copy_to_mmu(base, code).unwrap();
        mmu.mprotect(base, code.len() as u64, Prot::READ | Prot::EXEC)
            .unwrap();
        mmu
    }

    #[test]
    fn first_lookup_misses_then_hits() {
        let base = 0x1000;
        let mmu = exec_mmu(&[0x90, 0x90, 0xC3], base);
        let mut cache = CodeCache::new();

        let loc = cache.lookup(&mmu, base, None).unwrap();
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.inst(loc).addr, base);

        let again = cache.lookup(&mmu, base + 1, Some(loc.section)).unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.inst(again).addr, base + 1);
    }

    #[test]
    fn sections_are_contiguous() {
        let base = 0x1000;
        let mmu = exec_mmu(&[0x48, 0x89, 0xC8, 0x90, 0xC3], base); // mov rax,rcx; nop; ret
        let mut cache = CodeCache::new();
        let loc = cache.lookup(&mmu, base, None).unwrap();
        let section = &cache.sections[loc.section];
        for pair in section.insts.windows(2) {
            assert_eq!(pair[0].addr + pair[0].len as u64, pair[1].addr);
        }
        assert_eq!(section.end, base + 5);
    }

    #[test]
    fn lookup_into_instruction_middle_faults() {
        let base = 0x1000;
        // mov rax, rcx (3 bytes)
        let mmu = exec_mmu(&[0x48, 0x89, 0xC8, 0xC3], base);
        let mut cache = CodeCache::new();
        cache.lookup(&mmu, base, None).unwrap();
        assert!(matches!(
            cache.lookup(&mmu, base + 1, None),
            Err(Fault::NotInstructionBoundary { .. })
        ));
    }

    #[test]
    fn invalidation_purges_overlapping_sections_and_bumps_version() {
        let base = 0x1000;
        let mmu = exec_mmu(&[0x90, 0xC3], base);
        let mut cache = CodeCache::new();
        let loc = cache.lookup(&mmu, base, None).unwrap();
        let v0 = cache.version();

        cache.invalidate_range(base, base + 0x1000);
        assert_ne!(cache.version(), v0);
        assert!(cache.next(loc).is_none());

        let reloaded = cache.lookup(&mmu, base, None).unwrap();
        assert_eq!(cache.stats().misses, 2);
        assert_eq!(cache.inst(reloaded).addr, base);
    }

    #[test]
    fn call_cache_serves_repeat_targets() {
        let base = 0x1000;
        let mmu = exec_mmu(&[0x90, 0xC3], base);
        let mut cache = CodeCache::new();
        cache.lookup_call(&mmu, base).unwrap();
        let misses = cache.stats().misses;
        cache.lookup_call(&mmu, base).unwrap();
        assert_eq!(cache.stats().misses, misses);
        assert!(cache.stats().hits >= 1);
    }
}
