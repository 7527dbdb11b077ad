mod common;

use common::{Harness, DATA_BASE};
use strato_x86::Reg;

#[test]
fn rep_movsb_copies_forward() {
    // rep movsb
    let mut h = Harness::new(&[0xF3, 0xA4]);
    h.mmu.copy_to_mmu(DATA_BASE, b"guest memory copy").unwrap();
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.state.write_reg(Reg::Rdi, DATA_BASE + 0x100);
    h.state.write_reg(Reg::Rcx, 17);
    h.steps(1);
    assert_eq!(
        h.mmu.copy_from_mmu(DATA_BASE + 0x100, 17).unwrap(),
        b"guest memory copy"
    );
    assert_eq!(h.state.read_reg(Reg::Rcx), 0);
    assert_eq!(h.state.read_reg(Reg::Rsi), DATA_BASE + 17);
    assert_eq!(h.state.read_reg(Reg::Rdi), DATA_BASE + 0x100 + 17);
}

#[test]
fn rep_movsq_moves_quadwords() {
    // rep movsq
    let mut h = Harness::new(&[0xF3, 0x48, 0xA5]);
    for i in 0..4 {
        h.mmu.write64(DATA_BASE + 8 * i, 0x1111_0000 + i).unwrap();
    }
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.state.write_reg(Reg::Rdi, DATA_BASE + 0x200);
    h.state.write_reg(Reg::Rcx, 4);
    h.steps(1);
    for i in 0..4 {
        assert_eq!(h.mmu.read64(DATA_BASE + 0x200 + 8 * i).unwrap(), 0x1111_0000 + i);
    }
}

#[test]
fn rep_stosd_fills_a_pattern() {
    // rep stosd
    let mut h = Harness::new(&[0xF3, 0xAB]);
    h.state.write_reg(Reg::Rax, 0xDEAD_BEEF);
    h.state.write_reg(Reg::Rdi, DATA_BASE);
    h.state.write_reg(Reg::Rcx, 8);
    h.steps(1);
    for i in 0..8 {
        assert_eq!(h.mmu.read32(DATA_BASE + 4 * i).unwrap(), 0xDEAD_BEEF);
    }
    assert_eq!(h.state.read_reg(Reg::Rcx), 0);
}

#[test]
fn repne_scasb_finds_the_terminator() {
    // repne scasb: classic strlen idiom.
    let mut h = Harness::new(&[0xF2, 0xAE]);
    h.mmu.copy_to_mmu(DATA_BASE, b"hello\0").unwrap();
    h.state.write_reg(Reg::Rax, 0);
    h.state.write_reg(Reg::Rdi, DATA_BASE);
    h.state.write_reg(Reg::Rcx, u64::MAX);
    h.steps(1);
    // RDI stops one past the NUL.
    assert_eq!(h.state.read_reg(Reg::Rdi), DATA_BASE + 6);
    assert!(h.state.flags.zf);
}

#[test]
fn repe_cmpsb_stops_at_first_difference() {
    // repe cmpsb
    let mut h = Harness::new(&[0xF3, 0xA6]);
    h.mmu.copy_to_mmu(DATA_BASE, b"abcX").unwrap();
    h.mmu.copy_to_mmu(DATA_BASE + 0x100, b"abcY").unwrap();
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.state.write_reg(Reg::Rdi, DATA_BASE + 0x100);
    h.state.write_reg(Reg::Rcx, 4);
    h.steps(1);
    assert!(!h.state.flags.zf);
    assert_eq!(h.state.read_reg(Reg::Rcx), 0);
    assert_eq!(h.state.read_reg(Reg::Rsi), DATA_BASE + 4);
}

#[test]
fn std_reverses_direction() {
    // std; movsb; cld
    let mut h = Harness::new(&[0xFD, 0xA4, 0xFC]);
    h.mmu.write8(DATA_BASE + 10, 0x42).unwrap();
    h.state.write_reg(Reg::Rsi, DATA_BASE + 10);
    h.state.write_reg(Reg::Rdi, DATA_BASE + 20);
    h.steps(3);
    assert_eq!(h.mmu.read8(DATA_BASE + 20).unwrap(), 0x42);
    assert_eq!(h.state.read_reg(Reg::Rsi), DATA_BASE + 9);
    assert_eq!(h.state.read_reg(Reg::Rdi), DATA_BASE + 19);
    assert!(!h.state.flags.df);
}

#[test]
fn rep_with_zero_count_does_nothing() {
    // rep movsb with rcx = 0
    let mut h = Harness::new(&[0xF3, 0xA4]);
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.state.write_reg(Reg::Rdi, DATA_BASE + 1);
    h.state.write_reg(Reg::Rcx, 0);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rsi), DATA_BASE);
    assert_eq!(h.state.read_reg(Reg::Rdi), DATA_BASE + 1);
}
