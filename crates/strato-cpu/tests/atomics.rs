mod common;

use common::{Harness, DATA_BASE};
use strato_cpu::Fault;
use strato_x86::Reg;

#[test]
fn lock_cmpxchg_success_and_failure() {
    // lock cmpxchg [rsi], cl (r/m8)
    {
        let mut h = Harness::new(&[0xF0, 0x0F, 0xB0, 0x0E]);
        h.state.write_reg(Reg::Rsi, DATA_BASE);
        h.state.write_reg(Reg::Rax, 0x11);
        h.state.write_reg(Reg::Rcx, 0x22);
        h.mmu.write8(DATA_BASE, 0x11).unwrap();
        h.steps(1);
        assert_eq!(h.mmu.read8(DATA_BASE).unwrap(), 0x22);
        assert_eq!(h.state.read_reg(Reg::Rax) & 0xff, 0x11);
        assert!(h.state.flags.zf);
    }

    // Failure loads the current value into the accumulator.
    {
        let mut h = Harness::new(&[0xF0, 0x0F, 0xB1, 0x0E]); // lock cmpxchg [rsi], ecx
        h.state.write_reg(Reg::Rsi, DATA_BASE);
        h.state.write_reg(Reg::Rax, 2);
        h.state.write_reg(Reg::Rcx, 0x3333_3333);
        h.mmu.write32(DATA_BASE, 1).unwrap();
        h.steps(1);
        assert_eq!(h.mmu.read32(DATA_BASE).unwrap(), 1);
        assert_eq!(h.state.read_reg(Reg::Rax), 1);
        assert!(!h.state.flags.zf);
    }
}

#[test]
fn lock_xadd_updates_memory_register_and_flags() {
    // lock xadd [rsi], ecx
    let mut h = Harness::new(&[0xF0, 0x0F, 0xC1, 0x0E]);
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.mmu.write32(DATA_BASE, 0x8000_0000).unwrap();
    h.state.write_reg(Reg::Rcx, 0x8000_0001);
    h.steps(1);
    assert_eq!(h.mmu.read32(DATA_BASE).unwrap(), 1);
    assert_eq!(h.state.read_reg(Reg::Rcx), 0x8000_0000);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.of);
}

#[test]
fn xchg_with_memory_swaps() {
    // xchg [rsi], eax
    let mut h = Harness::new(&[0x87, 0x06]);
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.mmu.write32(DATA_BASE, 0xAABB_CCDD).unwrap();
    h.state.write_reg(Reg::Rax, 0x1234_5678);
    h.steps(1);
    assert_eq!(h.mmu.read32(DATA_BASE).unwrap(), 0x1234_5678);
    assert_eq!(h.state.read_reg(Reg::Rax), 0xAABB_CCDD);
}

#[test]
fn lock_inc_preserves_carry() {
    // stc; lock inc dword [rsi]
    let mut h = Harness::new(&[0xF9, 0xF0, 0xFF, 0x06]);
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.mmu.write32(DATA_BASE, 0x7fff_ffff).unwrap();
    h.steps(2);
    assert_eq!(h.mmu.read32(DATA_BASE).unwrap(), 0x8000_0000);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.of);
}

#[test]
fn lock_prefix_on_register_destination_is_invalid() {
    // lock add eax, ecx
    let mut h = Harness::new(&[0xF0, 0x01, 0xC8]);
    assert!(matches!(h.step_one(), Err(Fault::InvalidOpcode { .. })));
}

#[test]
fn lock_prefix_on_non_rmw_instruction_is_invalid() {
    // lock mov eax, ecx is not encodable as a legal lock form.
    let mut h = Harness::new(&[0xF0, 0x89, 0xC8]);
    assert!(matches!(h.step_one(), Err(Fault::InvalidOpcode { .. })));
}

#[test]
fn spinlock_acquire_release_pattern() {
    // A miniature mutex: cmpxchg to acquire, store to release.
    //   xor eax, eax
    //   mov ecx, 1
    //   lock cmpxchg [rsi], ecx   ; 0 -> 1 succeeds
    //   mov dword [rsi], 0        ; release
    let mut h = Harness::new(&[
        0x31, 0xC0, // xor eax, eax
        0xB9, 0x01, 0x00, 0x00, 0x00, // mov ecx, 1
        0xF0, 0x0F, 0xB1, 0x0E, // lock cmpxchg [rsi], ecx
        0xC7, 0x06, 0x00, 0x00, 0x00, 0x00, // mov dword [rsi], 0
    ]);
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.steps(3);
    assert!(h.state.flags.zf, "lock acquisition should succeed");
    assert_eq!(h.mmu.read32(DATA_BASE).unwrap(), 1);
    h.steps(1);
    assert_eq!(h.mmu.read32(DATA_BASE).unwrap(), 0);
}
