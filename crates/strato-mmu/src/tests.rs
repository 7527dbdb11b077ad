use super::*;
use proptest::prelude::*;

fn rw() -> Prot {
    Prot::READ | Prot::WRITE
}

fn anon_private() -> MapFlags {
    MapFlags::PRIVATE | MapFlags::ANONYMOUS
}

#[test]
fn mmap_rounds_length_to_pages_and_zero_fills() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, 100, rw(), anon_private()).unwrap();
    let region = mmu.find_region(base).unwrap();
    assert_eq!(region.len(), PAGE_SIZE);
    assert_eq!(mmu.read64(base + PAGE_SIZE - 8).unwrap(), 0);
}

#[test]
fn regions_never_overlap_and_stay_page_aligned() {
    let mut mmu = Mmu::new();
    for len in [1, PAGE_SIZE, 3 * PAGE_SIZE + 1, 17] {
        mmu.mmap(0, len, rw(), anon_private()).unwrap();
    }
    let regions: Vec<_> = mmu.regions().collect();
    for r in &regions {
        assert_eq!(r.base() % PAGE_SIZE, 0);
        assert_eq!(r.end() % PAGE_SIZE, 0);
    }
    for pair in regions.windows(2) {
        assert!(pair[0].end() <= pair[1].base());
    }
}

#[test]
fn fixed_no_replace_over_existing_region_fails() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, PAGE_SIZE, rw(), anon_private()).unwrap();
    let err = mmu
        .mmap(
            base,
            PAGE_SIZE,
            rw(),
            anon_private() | MapFlags::FIXED | MapFlags::NO_REPLACE,
        )
        .unwrap_err();
    assert_eq!(err, MapError::Exists);
}

#[test]
fn fixed_replaces_existing_mapping() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0x40_0000, PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED).unwrap();
    mmu.write64(base, 0xdead_beef).unwrap();
    let again = mmu
        .mmap(base, PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED)
        .unwrap();
    assert_eq!(again, base);
    assert_eq!(mmu.read64(base).unwrap(), 0);
}

#[test]
fn munmap_then_mmap_with_same_hint_reuses_the_range() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0x7000_0000, 16 * PAGE_SIZE, rw(), anon_private()).unwrap();
    mmu.munmap(base, 16 * PAGE_SIZE).unwrap();
    assert!(mmu.find_region(base).is_none());
    let again = mmu.mmap(base, 16 * PAGE_SIZE, rw(), anon_private()).unwrap();
    assert_eq!(again, base);
}

#[test]
fn munmap_middle_splits_region() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, 4 * PAGE_SIZE, rw(), anon_private()).unwrap();
    mmu.write64(base, 0x1111).unwrap();
    mmu.write64(base + 3 * PAGE_SIZE, 0x2222).unwrap();
    mmu.munmap(base + PAGE_SIZE, 2 * PAGE_SIZE).unwrap();

    assert_eq!(mmu.read64(base).unwrap(), 0x1111);
    assert_eq!(mmu.read64(base + 3 * PAGE_SIZE).unwrap(), 0x2222);
    assert!(matches!(
        mmu.read8(base + PAGE_SIZE),
        Err(MemFault::Unmapped { .. })
    ));
    assert!(matches!(
        mmu.read8(base + 2 * PAGE_SIZE + 17),
        Err(MemFault::Unmapped { .. })
    ));
}

#[test]
fn munmap_is_idempotent_on_holes() {
    let mut mmu = Mmu::new();
    mmu.munmap(0x5000_0000, 8 * PAGE_SIZE).unwrap();
    let base = mmu.mmap(0x5000_0000, PAGE_SIZE, rw(), anon_private()).unwrap();
    mmu.munmap(base, PAGE_SIZE).unwrap();
    mmu.munmap(base, PAGE_SIZE).unwrap();
    assert!(mmu.find_region(base).is_none());
}

#[test]
fn writes_require_write_protection() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, PAGE_SIZE, Prot::READ, anon_private()).unwrap();
    assert!(matches!(
        mmu.write8(base, 1),
        Err(MemFault::Protection { .. })
    ));
    assert_eq!(mmu.read8(base).unwrap(), 0);
}

#[test]
fn reads_require_read_protection() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, PAGE_SIZE, Prot::empty(), anon_private()).unwrap();
    assert!(matches!(
        mmu.read8(base),
        Err(MemFault::Protection { .. })
    ));
}

#[test]
fn fetch_requires_exec_protection() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, PAGE_SIZE, rw(), anon_private()).unwrap();
    assert!(matches!(
        mmu.fetch(base, 15),
        Err(MemFault::Protection { .. })
    ));
    mmu.mprotect(base, PAGE_SIZE, Prot::READ | Prot::EXEC).unwrap();
    assert_eq!(mmu.fetch(base, 15).unwrap().len(), 15);
}

#[test]
fn multi_byte_access_across_region_boundary_faults() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0x2000_0000, PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED).unwrap();
    assert!(matches!(
        mmu.read32(base + PAGE_SIZE - 2),
        Err(MemFault::Straddle { .. })
    ));
    assert!(matches!(
        mmu.write64(base + PAGE_SIZE - 4, 1),
        Err(MemFault::Straddle { .. })
    ));
}

#[test]
fn mprotect_splits_at_boundary_pages() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, 3 * PAGE_SIZE, rw(), anon_private()).unwrap();
    mmu.write64(base + PAGE_SIZE, 0xabcd).unwrap();
    mmu.mprotect(base + PAGE_SIZE, PAGE_SIZE, Prot::READ).unwrap();

    assert_eq!(mmu.regions().count(), 3);
    mmu.write8(base, 1).unwrap();
    mmu.write8(base + 2 * PAGE_SIZE, 1).unwrap();
    assert!(matches!(
        mmu.write8(base + PAGE_SIZE, 1),
        Err(MemFault::Protection { .. })
    ));
    // Content survives the split.
    assert_eq!(mmu.read64(base + PAGE_SIZE).unwrap(), 0xabcd);
}

#[test]
fn mprotect_is_idempotent() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, 2 * PAGE_SIZE, rw(), anon_private()).unwrap();
    mmu.mprotect(base, PAGE_SIZE, Prot::READ).unwrap();
    let first: Vec<_> = mmu.regions().map(|r| (r.base(), r.end(), r.prot())).collect();
    mmu.mprotect(base, PAGE_SIZE, Prot::READ).unwrap();
    let second: Vec<_> = mmu.regions().map(|r| (r.base(), r.end(), r.prot())).collect();
    assert_eq!(first, second);
}

#[test]
fn copy_round_trip_preserves_bytes() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, 2 * PAGE_SIZE, rw(), anon_private()).unwrap();
    let pattern: Vec<u8> = (0..512u32).map(|i| (i * 7) as u8).collect();
    mmu.copy_to_mmu(base + 100, &pattern).unwrap();
    assert_eq!(mmu.copy_from_mmu(base + 100, 512).unwrap(), pattern);
}

#[test]
fn forced_copy_restores_protection() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, PAGE_SIZE, Prot::READ, anon_private()).unwrap();
    mmu.copy_to_mmu_forced(base, &[1, 2, 3]).unwrap();
    assert_eq!(mmu.find_region(base).unwrap().prot(), Prot::READ);
    assert_eq!(mmu.copy_from_mmu(base, 3).unwrap(), vec![1, 2, 3]);
}

#[test]
fn brk_grows_and_shrinks_the_heap() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0x800_0000, 4 * PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED).unwrap();
    mmu.set_heap(base, base + 4 * PAGE_SIZE);

    let grown = mmu.brk(base + 8 * PAGE_SIZE);
    assert_eq!(grown, base + 8 * PAGE_SIZE);
    mmu.write64(base + 7 * PAGE_SIZE, 7).unwrap();

    let shrunk = mmu.brk(base + 2 * PAGE_SIZE);
    assert_eq!(shrunk, base + 2 * PAGE_SIZE);
    assert!(matches!(
        mmu.read8(base + 3 * PAGE_SIZE),
        Err(MemFault::Straddle { .. }) | Err(MemFault::Unmapped { .. })
    ));
}

#[test]
fn brk_refuses_to_grow_into_a_neighbor() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0x800_0000, PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED).unwrap();
    mmu.set_heap(base, base + PAGE_SIZE);
    mmu.mmap(base + 2 * PAGE_SIZE, PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED)
        .unwrap();
    assert_eq!(mmu.brk(base + 4 * PAGE_SIZE), base + PAGE_SIZE);
}

#[test]
fn mmap_with_absurd_length_is_enomem_not_a_panic() {
    let mut mmu = Mmu::new();
    assert_eq!(
        mmu.mmap(0, u64::MAX, rw(), anon_private()),
        Err(MapError::NoMemory)
    );
    assert_eq!(
        mmu.mmap(0, u64::MAX - PAGE_SIZE, rw(), anon_private()),
        Err(MapError::NoMemory)
    );
    // FIXED near the top of the address space wraps addr + length.
    let top = page_round_down(u64::MAX);
    assert_eq!(
        mmu.mmap(top, 2 * PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED),
        Err(MapError::NoMemory)
    );
}

#[test]
fn wrapping_ranges_are_refused_not_rounded() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, PAGE_SIZE, rw(), anon_private()).unwrap();
    let addr = 0xFFFF_FFFF_FFFF_F000;

    assert!(matches!(
        mmu.munmap(addr, 0x2000),
        Err(MemFault::RangeOverflow { .. })
    ));
    assert!(matches!(
        mmu.mprotect(addr, 0x2000, Prot::READ),
        Err(MemFault::RangeOverflow { .. })
    ));
    assert!(matches!(
        mmu.mincore(addr, 0x2000),
        Err(MemFault::RangeOverflow { .. })
    ));
    assert!(matches!(
        mmu.munmap(base, u64::MAX),
        Err(MemFault::RangeOverflow { .. })
    ));
    // The refused calls left the region map untouched.
    assert_eq!(mmu.read8(base).unwrap(), 0);
}

#[test]
fn brk_to_the_top_of_the_address_space_is_refused() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0x800_0000, PAGE_SIZE, rw(), anon_private() | MapFlags::FIXED).unwrap();
    mmu.set_heap(base, base + PAGE_SIZE);
    assert_eq!(mmu.brk(u64::MAX), base + PAGE_SIZE);
}

#[test]
fn mincore_reports_every_mapped_page_resident() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, 3 * PAGE_SIZE, rw(), anon_private()).unwrap();
    assert_eq!(mmu.mincore(base, 3 * PAGE_SIZE).unwrap(), vec![1, 1, 1]);
    assert!(mmu.mincore(base + 2 * PAGE_SIZE, 2 * PAGE_SIZE).is_err());
}

#[test]
fn read_cstring_stops_at_nul() {
    let mut mmu = Mmu::new();
    let base = mmu.mmap(0, PAGE_SIZE, rw(), anon_private()).unwrap();
    mmu.copy_to_mmu(base, b"hello\0world").unwrap();
    assert_eq!(mmu.read_cstring(base).unwrap(), "hello");
}

#[test]
fn shared_segment_split_keeps_aliasing() {
    let mut mmu = Mmu::new();
    let seg: SharedSeg = std::rc::Rc::new(std::cell::RefCell::new(vec![0u8; 4 * PAGE_SIZE as usize]));
    let base = mmu.mmap_shared(0, 4 * PAGE_SIZE, rw(), seg.clone(), "shm").unwrap();
    mmu.mprotect(base + PAGE_SIZE, PAGE_SIZE, Prot::READ).unwrap();
    // Writes through the still-writable tail land in the shared segment at
    // the right offset.
    mmu.write8(base + 2 * PAGE_SIZE, 0x5a).unwrap();
    assert_eq!(seg.borrow()[2 * PAGE_SIZE as usize], 0x5a);
}

proptest! {
    #[test]
    fn copy_round_trip_random(offset in 0u64..3000, data in proptest::collection::vec(any::<u8>(), 1..600)) {
        let mut mmu = Mmu::new();
        let base = mmu.mmap(0, PAGE_SIZE, rw(), anon_private() | MapFlags::ANONYMOUS).unwrap();
        prop_assume!(offset + data.len() as u64 <= PAGE_SIZE);
        mmu.copy_to_mmu(base + offset, &data).unwrap();
        prop_assert_eq!(mmu.copy_from_mmu(base + offset, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn find_free_never_hands_out_overlap(lens in proptest::collection::vec(1u64..5, 1..12)) {
        let mut mmu = Mmu::new();
        for pages in lens {
            mmu.mmap(0, pages * PAGE_SIZE, rw(), anon_private()).unwrap();
        }
        let regions: Vec<_> = mmu.regions().map(|r| (r.base(), r.end())).collect();
        for pair in regions.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn extreme_guest_ranges_never_panic(
        addr in any::<u64>(),
        len in (u64::MAX - 0x100_0000)..=u64::MAX,
    ) {
        let mut mmu = Mmu::new();
        prop_assert!(mmu.mmap(addr, len, rw(), anon_private()).is_err());
        let _ = mmu.munmap(addr, len);
        let _ = mmu.mprotect(addr, len, Prot::READ);
        let _ = mmu.mincore(addr, len);
    }
}
