//! The instruction interpreter.

mod arith;
mod string;

use strato_mmu::Mmu;
use strato_x86::{Inst, InstKind, MemRef, Operand, Reg, Seg, Width};

use crate::fault::Fault;
use crate::fpu;
use crate::state::CpuState;

/// How control continues after one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepExit {
    /// Fall through to the next instruction in the section.
    Continue,
    /// RIP was redirected; the caller must re-resolve the execution point.
    Branch,
    /// A `syscall` instruction; the dispatcher takes over.
    Syscall,
}

/// Execute one decoded instruction. On entry RIP still points at `inst`;
/// it is advanced to the fall-through address before the semantics run, so
/// branch targets and the syscall return address come out right.
pub fn step(state: &mut CpuState, mmu: &mut Mmu, inst: &Inst) -> Result<StepExit, Fault> {
    state.rip = inst.next_addr();

    if inst.lock && !lockable(&inst.kind) {
        return Err(Fault::InvalidOpcode {
            rip: inst.addr,
            bytes: Vec::new(),
        });
    }

    match inst.kind {
        InstKind::Alu {
            op,
            width,
            dst,
            src,
        } => arith::alu(state, mmu, op, width, dst, src)?,
        InstKind::Cmp { width, a, b } => arith::cmp(state, mmu, width, a, b)?,
        InstKind::Test { width, a, b } => arith::test(state, mmu, width, a, b)?,
        InstKind::Unary { op, width, dst } => arith::unary(state, mmu, op, width, dst)?,
        InstKind::Mul { width, src } => arith::mul(state, mmu, width, src)?,
        InstKind::Imul1 { width, src } => arith::imul1(state, mmu, width, src)?,
        InstKind::Imul2 { width, dst, src } => {
            let a = state.read_reg_w(dst, width);
            let b = read_op(state, mmu, width, src)?;
            let res = arith::imul_flags(state, width, a, b);
            state.write_reg_w(dst, width, res);
        }
        InstKind::Imul3 {
            width,
            dst,
            src,
            imm,
        } => {
            let a = read_op(state, mmu, width, src)?;
            let res = arith::imul_flags(state, width, a, imm & width.mask());
            state.write_reg_w(dst, width, res);
        }
        InstKind::Div { width, src, signed } => {
            arith::div(state, mmu, width, src, signed, inst.addr)?
        }
        InstKind::Shift {
            op,
            width,
            dst,
            count,
        } => arith::shift(state, mmu, op, width, dst, count)?,
        InstKind::ShiftD {
            left,
            width,
            dst,
            src,
            count,
        } => arith::shiftd(state, mmu, left, width, dst, src, count)?,
        InstKind::Mov { width, dst, src } => {
            let v = read_op(state, mmu, width, src)?;
            write_op(state, mmu, width, dst, v)?;
        }
        InstKind::MovExt {
            sign,
            dst,
            dst_width,
            src,
            src_width,
        } => {
            let v = read_op(state, mmu, src_width, src)?;
            let v = if sign { src_width.sign_extend(v) } else { v };
            state.write_reg_w(dst, dst_width, v);
        }
        InstKind::Lea { width, dst, mem } => {
            let addr = ea(state, &mem);
            state.write_reg_w(dst, width, addr);
        }
        InstKind::Push { width, src } => {
            let v = read_op(state, mmu, width, src)?;
            push(state, mmu, width, v)?;
        }
        InstKind::Pop { width, dst } => {
            let v = pop(state, mmu, width)?;
            write_op(state, mmu, width, dst, v)?;
        }
        InstKind::Xchg { width, a, b } => {
            let va = read_op(state, mmu, width, a)?;
            let vb = read_op(state, mmu, width, b)?;
            write_op(state, mmu, width, a, vb)?;
            write_op(state, mmu, width, b, va)?;
        }
        InstKind::Xadd { width, dst, src } => {
            let a = read_op(state, mmu, width, dst)?;
            let b = read_op(state, mmu, width, src)?;
            let res = arith::add_flags(state, width, a, b);
            write_op(state, mmu, width, src, a)?;
            write_op(state, mmu, width, dst, res)?;
        }
        InstKind::Cmpxchg { width, dst, src } => {
            let acc = state.read_reg_w(Reg::Rax, width);
            let cur = read_op(state, mmu, width, dst)?;
            arith::sub_flags(state, width, acc, cur);
            if acc == cur {
                let v = read_op(state, mmu, width, src)?;
                write_op(state, mmu, width, dst, v)?;
            } else {
                state.write_reg_w(Reg::Rax, width, cur);
            }
        }
        InstKind::SetCc { cond, dst } => {
            let v = state.flags.cond(cond) as u64;
            write_op(state, mmu, Width::W8, dst, v)?;
        }
        InstKind::CmovCc {
            cond,
            width,
            dst,
            src,
        } => {
            // The destination is written either way; a 32-bit cmov
            // zero-extends even when the condition is false.
            let v = if state.flags.cond(cond) {
                read_op(state, mmu, width, src)?
            } else {
                state.read_reg_w(dst, width)
            };
            state.write_reg_w(dst, width, v);
        }
        InstKind::JmpRel { target } => {
            state.rip = target;
            return Ok(StepExit::Branch);
        }
        InstKind::JccRel { cond, target } => {
            if state.flags.cond(cond) {
                state.rip = target;
                return Ok(StepExit::Branch);
            }
        }
        InstKind::JmpInd { src } => {
            state.rip = read_op(state, mmu, Width::W64, src)?;
            return Ok(StepExit::Branch);
        }
        InstKind::CallRel { target } => {
            let ret_addr = state.rip;
            push(state, mmu, Width::W64, ret_addr)?;
            state.rip = target;
            return Ok(StepExit::Branch);
        }
        InstKind::CallInd { src } => {
            let target = read_op(state, mmu, Width::W64, src)?;
            let ret_addr = state.rip;
            push(state, mmu, Width::W64, ret_addr)?;
            state.rip = target;
            return Ok(StepExit::Branch);
        }
        InstKind::Ret { pop: extra } => {
            state.rip = pop(state, mmu, Width::W64)?;
            let rsp = state.rsp().wrapping_add(extra as u64);
            state.set_rsp(rsp);
            return Ok(StepExit::Branch);
        }
        InstKind::Leave => {
            state.set_rsp(state.read_reg(Reg::Rbp));
            let rbp = pop(state, mmu, Width::W64)?;
            state.write_reg(Reg::Rbp, rbp);
        }
        InstKind::Nop => {}
        InstKind::Ud2 => return Err(Fault::Ud2 { rip: inst.addr }),
        InstKind::Hlt => return Err(Fault::Hlt { rip: inst.addr }),
        InstKind::Syscall => {
            // The ISA clobbers RCX with the return address and R11 with
            // RFLAGS; glibc's syscall stubs rely on the register layout.
            state.write_reg(Reg::Rcx, state.rip);
            state.write_reg(Reg::R11, state.flags.to_rflags());
            return Ok(StepExit::Syscall);
        }
        InstKind::Cpuid => cpuid(state),
        InstKind::Rdtsc => {
            state.write_reg_w(Reg::Rax, Width::W32, state.tsc & 0xffff_ffff);
            state.write_reg_w(Reg::Rdx, Width::W32, state.tsc >> 32);
        }
        InstKind::Xgetbv => {
            // XCR0: x87 + SSE states enabled.
            state.write_reg_w(Reg::Rax, Width::W32, 0x3);
            state.write_reg_w(Reg::Rdx, Width::W32, 0);
        }
        InstKind::Bit {
            op,
            width,
            dst,
            bit,
        } => arith::bit(state, mmu, op, width, dst, bit)?,
        InstKind::BitScan {
            reverse,
            width,
            dst,
            src,
        } => arith::bit_scan(state, mmu, reverse, width, dst, src)?,
        InstKind::Count {
            op,
            width,
            dst,
            src,
        } => arith::count(state, mmu, op, width, dst, src)?,
        InstKind::Bswap { width, reg } => {
            let v = state.read_reg_w(reg, width);
            let swapped = match width {
                Width::W32 => (v as u32).swap_bytes() as u64,
                Width::W64 => v.swap_bytes(),
                // bswap on a 16-bit register is undefined; modelled as zero.
                _ => 0,
            };
            state.write_reg_w(reg, width, swapped);
        }
        InstKind::Ext { op } => arith::extend(state, op),
        InstKind::String { op, width, rep } => string::string(state, mmu, op, width, rep)?,
        InstKind::DirFlag { set } => state.flags.df = set,
        InstKind::CarryFlag { set } => {
            state.flags.cf = match set {
                Some(b) => b,
                None => !state.flags.cf,
            }
        }
        InstKind::Sse(sse) => fpu::sse(state, mmu, &sse, inst.addr)?,
        InstKind::X87(x87) => fpu::x87(state, mmu, &x87, inst.addr)?,
        InstKind::Unknown { bytes } => {
            return Err(Fault::InvalidOpcode {
                rip: inst.addr,
                bytes: bytes[..inst.len as usize].to_vec(),
            })
        }
    }
    Ok(StepExit::Continue)
}

/// LOCK is legal only on the read-modify-write forms with a memory target.
fn lockable(kind: &InstKind) -> bool {
    use strato_x86::{AluOp, BitOp, UnaryOp};
    match kind {
        InstKind::Alu { op, dst, .. } => {
            matches!(
                op,
                AluOp::Add | AluOp::Adc | AluOp::Sub | AluOp::Sbb | AluOp::And | AluOp::Or | AluOp::Xor
            ) && dst.is_mem()
        }
        InstKind::Unary { op, dst, .. } => {
            matches!(
                op,
                UnaryOp::Not | UnaryOp::Neg | UnaryOp::Inc | UnaryOp::Dec
            ) && dst.is_mem()
        }
        InstKind::Xchg { a, b, .. } => a.is_mem() || b.is_mem(),
        InstKind::Xadd { dst, .. } | InstKind::Cmpxchg { dst, .. } => dst.is_mem(),
        InstKind::Bit { op, dst, .. } => {
            matches!(op, BitOp::Set | BitOp::Reset | BitOp::Complement) && dst.is_mem()
        }
        _ => false,
    }
}

/// Effective address of a memory operand. FS/GS overrides add the per-thread
/// segment base; every other segment contributes zero in long mode.
pub(crate) fn ea(state: &CpuState, m: &MemRef) -> u64 {
    let mut addr = m.disp;
    if let Some(base) = m.base {
        addr = addr.wrapping_add(state.read_reg(base));
    }
    if let Some(index) = m.index {
        addr = addr.wrapping_add(state.read_reg(index).wrapping_mul(m.scale as u64));
    }
    match m.seg {
        Seg::None => addr,
        Seg::Fs => addr.wrapping_add(state.fs_base),
        Seg::Gs => addr.wrapping_add(state.gs_base),
    }
}

pub(crate) fn read_mem(mmu: &Mmu, addr: u64, width: Width) -> Result<u64, Fault> {
    let v = match width {
        Width::W8 => mmu.read8(addr)? as u64,
        Width::W16 => mmu.read16(addr)? as u64,
        Width::W32 => mmu.read32(addr)? as u64,
        Width::W64 => mmu.read64(addr)?,
    };
    Ok(v)
}

pub(crate) fn write_mem(mmu: &mut Mmu, addr: u64, width: Width, value: u64) -> Result<(), Fault> {
    match width {
        Width::W8 => mmu.write8(addr, value as u8)?,
        Width::W16 => mmu.write16(addr, value as u16)?,
        Width::W32 => mmu.write32(addr, value as u32)?,
        Width::W64 => mmu.write64(addr, value)?,
    }
    Ok(())
}

pub(crate) fn read_op(
    state: &CpuState,
    mmu: &Mmu,
    width: Width,
    op: Operand,
) -> Result<u64, Fault> {
    match op {
        Operand::Reg(reg) => Ok(state.read_reg_w(reg, width)),
        Operand::HighReg(reg) => Ok(state.read_high8(reg)),
        Operand::Imm(v) => Ok(v & width.mask()),
        Operand::Mem(m) => read_mem(mmu, ea(state, &m), width),
    }
}

pub(crate) fn write_op(
    state: &mut CpuState,
    mmu: &mut Mmu,
    width: Width,
    op: Operand,
    value: u64,
) -> Result<(), Fault> {
    match op {
        Operand::Reg(reg) => {
            state.write_reg_w(reg, width, value);
            Ok(())
        }
        Operand::HighReg(reg) => {
            state.write_high8(reg, value);
            Ok(())
        }
        Operand::Imm(_) => Err(Fault::InvalidOpcode {
            rip: state.rip,
            bytes: Vec::new(),
        }),
        Operand::Mem(m) => write_mem(mmu, ea(state, &m), width, value),
    }
}

pub(crate) fn push(
    state: &mut CpuState,
    mmu: &mut Mmu,
    width: Width,
    value: u64,
) -> Result<(), Fault> {
    let rsp = state.rsp().wrapping_sub(width.bytes());
    write_mem(mmu, rsp, width, value)?;
    state.set_rsp(rsp);
    Ok(())
}

pub(crate) fn pop(state: &mut CpuState, mmu: &mut Mmu, width: Width) -> Result<u64, Fault> {
    let rsp = state.rsp();
    let value = read_mem(mmu, rsp, width)?;
    state.set_rsp(rsp.wrapping_add(width.bytes()));
    Ok(value)
}

/// A fixed, conservative CPU identity: a 64-bit part with SSE2/SSE3 and
/// popcnt, no AVX, so guest feature dispatch stays inside the instruction
/// subset the interpreter implements.
fn cpuid(state: &mut CpuState) {
    let leaf = state.read_reg_w(Reg::Rax, Width::W32) as u32;
    let (eax, ebx, ecx, edx): (u32, u32, u32, u32) = match leaf {
        0 => (7, u32::from_le_bytes(*b"Genu"), u32::from_le_bytes(*b"ntel"), u32::from_le_bytes(*b"ineI")),
        1 => {
            let ecx = (1 << 0) | (1 << 9) | (1 << 23); // SSE3, SSSE3, POPCNT
            let edx = (1 << 0) // FPU
                | (1 << 4) // TSC
                | (1 << 8) // CX8
                | (1 << 15) // CMOV
                | (1 << 23) // MMX
                | (1 << 24) // FXSR
                | (1 << 25) // SSE
                | (1 << 26); // SSE2
            (0x0003_06a9, 0, ecx, edx)
        }
        0x8000_0000 => (0x8000_0001, 0, 0, 0),
        0x8000_0001 => (0, 0, 0, 1 << 29), // long mode
        _ => (0, 0, 0, 0),
    };
    state.write_reg_w(Reg::Rax, Width::W32, eax as u64);
    state.write_reg_w(Reg::Rbx, Width::W32, ebx as u64);
    state.write_reg_w(Reg::Rcx, Width::W32, ecx as u64);
    state.write_reg_w(Reg::Rdx, Width::W32, edx as u64);
}
