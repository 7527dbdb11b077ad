mod common;

use common::{Harness, DATA_BASE};
use strato_cpu::Fault;
use strato_x86::Reg;

#[test]
fn add_sets_carry_and_overflow_on_signed_wrap() {
    // add eax, ecx
    let mut h = Harness::new(&[0x01, 0xC8]);
    h.state.write_reg(Reg::Rax, 0x8000_0000);
    h.state.write_reg(Reg::Rcx, 0x8000_0001);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 1);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.of);
    assert!(!h.state.flags.zf);
    assert!(!h.state.flags.sf);
}

#[test]
fn sub_borrow_and_sign() {
    // sub eax, ecx
    let mut h = Harness::new(&[0x29, 0xC8]);
    h.state.write_reg(Reg::Rax, 1);
    h.state.write_reg(Reg::Rcx, 2);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 0xffff_ffff);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.sf);
    assert!(!h.state.flags.of);
}

#[test]
fn adc_chains_the_carry() {
    // add rax, rcx; adc rdx, rbx
    let mut h = Harness::new(&[0x48, 0x01, 0xC8, 0x48, 0x11, 0xDA]);
    h.state.write_reg(Reg::Rax, u64::MAX);
    h.state.write_reg(Reg::Rcx, 1);
    h.state.write_reg(Reg::Rdx, 5);
    h.state.write_reg(Reg::Rbx, 0);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax), 0);
    assert_eq!(h.state.read_reg(Reg::Rdx), 6);
}

#[test]
fn inc_preserves_carry_but_sets_overflow() {
    // stc; inc eax
    let mut h = Harness::new(&[0xF9, 0xFF, 0xC0]);
    h.state.write_reg(Reg::Rax, 0x7fff_ffff);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax), 0x8000_0000);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.of);
    assert!(h.state.flags.sf);
}

#[test]
fn neg_sets_carry_for_nonzero() {
    // neg rax
    let mut h = Harness::new(&[0x48, 0xF7, 0xD8]);
    h.state.write_reg(Reg::Rax, 2);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), (-2i64) as u64);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.sf);
}

#[test]
fn logic_ops_clear_carry_and_overflow() {
    // stc; and eax, ecx
    let mut h = Harness::new(&[0xF9, 0x21, 0xC8]);
    h.state.write_reg(Reg::Rax, 0xf0f0);
    h.state.write_reg(Reg::Rcx, 0x0ff0);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax), 0x00f0);
    assert!(!h.state.flags.cf);
    assert!(!h.state.flags.of);
}

#[test]
fn dword_result_zero_extends_to_the_full_register() {
    // mov rax, -1 (imm32 sign-extended); xor eax, eax
    let mut h = Harness::new(&[0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF, 0x31, 0xC0]);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax), 0);
}

#[test]
fn shl_carries_out_the_top_bit() {
    // shl eax, 1
    let mut h = Harness::new(&[0xC1, 0xE0, 0x01]);
    h.state.write_reg(Reg::Rax, 0x8000_0001);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 2);
    assert!(h.state.flags.cf);
}

#[test]
fn sar_keeps_the_sign() {
    // sar eax, 4
    let mut h = Harness::new(&[0xC1, 0xF8, 0x04]);
    h.state.write_reg(Reg::Rax, 0x8000_0000);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 0xf800_0000);
}

#[test]
fn shift_count_zero_leaves_flags_alone() {
    // stc; shl eax, 0
    let mut h = Harness::new(&[0xF9, 0xC1, 0xE0, 0x00]);
    h.state.write_reg(Reg::Rax, 1);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax), 1);
    assert!(h.state.flags.cf);
}

#[test]
fn mul_widens_into_rdx_rax() {
    // mul rcx
    let mut h = Harness::new(&[0x48, 0xF7, 0xE1]);
    h.state.write_reg(Reg::Rax, 1 << 63);
    h.state.write_reg(Reg::Rcx, 4);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 0);
    assert_eq!(h.state.read_reg(Reg::Rdx), 2);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.of);
}

#[test]
fn imul_two_operand_truncates_and_flags_overflow() {
    // imul eax, ecx
    let mut h = Harness::new(&[0x0F, 0xAF, 0xC1]);
    h.state.write_reg(Reg::Rax, 0x4000_0000);
    h.state.write_reg(Reg::Rcx, 4);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 0);
    assert!(h.state.flags.cf);
    assert!(h.state.flags.of);
}

#[test]
fn div_produces_quotient_and_remainder() {
    // div ecx (EDX:EAX / ecx)
    let mut h = Harness::new(&[0xF7, 0xF1]);
    h.state.write_reg(Reg::Rax, 17);
    h.state.write_reg(Reg::Rdx, 0);
    h.state.write_reg(Reg::Rcx, 5);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 3);
    assert_eq!(h.state.read_reg(Reg::Rdx), 2);
}

#[test]
fn division_by_zero_faults() {
    // div ecx with ecx = 0
    let mut h = Harness::new(&[0xF7, 0xF1]);
    h.state.write_reg(Reg::Rax, 1);
    h.state.write_reg(Reg::Rdx, 0);
    h.state.write_reg(Reg::Rcx, 0);
    assert!(matches!(h.step_one(), Err(Fault::DivideError { .. })));
}

#[test]
fn idiv_quotient_overflow_faults() {
    // idiv ecx: INT_MIN / -1 does not fit
    let mut h = Harness::new(&[0xF7, 0xF9]);
    h.state.write_reg(Reg::Rax, 0x8000_0000);
    h.state.write_reg(Reg::Rdx, 0xffff_ffff);
    h.state.write_reg(Reg::Rcx, 0xffff_ffff);
    assert!(matches!(h.step_one(), Err(Fault::DivideError { .. })));
}

#[test]
fn bts_btr_btc_against_memory_follow_the_bit_offset() {
    // bts [rsi], ecx / btr / btc with ecx = 33: the bit lands in the next
    // dword over.
    let mut h = Harness::new(&[
        0x0F, 0xAB, 0x0E, // bts [rsi], ecx
        0x0F, 0xB3, 0x0E, // btr [rsi], ecx
        0x0F, 0xBB, 0x0E, // btc [rsi], ecx
    ]);
    h.state.write_reg(Reg::Rsi, DATA_BASE);
    h.state.write_reg(Reg::Rcx, 33);

    h.steps(1);
    assert_eq!(h.mmu.read32(DATA_BASE).unwrap(), 0);
    assert_eq!(h.mmu.read32(DATA_BASE + 4).unwrap(), 2);
    assert!(!h.state.flags.cf);

    h.steps(1);
    assert_eq!(h.mmu.read32(DATA_BASE + 4).unwrap(), 0);
    assert!(h.state.flags.cf);

    h.steps(1);
    assert_eq!(h.mmu.read32(DATA_BASE + 4).unwrap(), 2);
    assert!(!h.state.flags.cf);
}

#[test]
fn bsf_bsr_and_zero_source() {
    // bsf eax, ecx; bsr edx, ecx
    let mut h = Harness::new(&[0x0F, 0xBC, 0xC1, 0x0F, 0xBD, 0xD1]);
    h.state.write_reg(Reg::Rcx, 0x0010_0100);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax), 8);
    assert_eq!(h.state.read_reg(Reg::Rdx), 20);
    assert!(!h.state.flags.zf);
}

#[test]
fn popcnt_counts_and_zeroes_other_flags() {
    // popcnt eax, ecx
    let mut h = Harness::new(&[0xF3, 0x0F, 0xB8, 0xC1]);
    h.state.write_reg(Reg::Rcx, 0xff00_00ff);
    h.state.flags.cf = true;
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rax), 16);
    assert!(!h.state.flags.cf);
    assert!(!h.state.flags.zf);
}

#[test]
fn bswap_reverses_byte_order() {
    // bswap eax; bswap rcx
    let mut h = Harness::new(&[0x0F, 0xC8, 0x48, 0x0F, 0xC9]);
    h.state.write_reg(Reg::Rax, 0x1122_3344);
    h.state.write_reg(Reg::Rcx, 0x1122_3344_5566_7788);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax), 0x4433_2211);
    assert_eq!(h.state.read_reg(Reg::Rcx), 0x8877_6655_4433_2211);
}

#[test]
fn cdq_and_cqo_spread_the_sign_into_rdx() {
    // cdq; cqo
    let mut h = Harness::new(&[0x99, 0x48, 0x99]);
    h.state.write_reg(Reg::Rax, 0x8000_0000);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rdx), 0xffff_ffff);
    h.state.write_reg(Reg::Rax, 1);
    h.steps(1);
    assert_eq!(h.state.read_reg(Reg::Rdx), 0);
}

#[test]
fn high_byte_registers_are_separate_lanes() {
    // mov ah, 0x7f; add al, ah
    let mut h = Harness::new(&[0xB4, 0x7F, 0x00, 0xE0]);
    h.state.write_reg(Reg::Rax, 0x01);
    h.steps(2);
    assert_eq!(h.state.read_reg(Reg::Rax) & 0xff, 0x80);
    assert_eq!(h.state.read_high8(Reg::Rax), 0x7f);
    assert!(h.state.flags.of);
}
