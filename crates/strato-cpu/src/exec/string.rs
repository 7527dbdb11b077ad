//! String instructions (movs/stos/lods/scas/cmps) with REP/REPNE.
//!
//! A repeated string instruction runs to completion within one step; the
//! scheduler only preempts at syscalls, so there is no need to resume a
//! partially executed REP.

use strato_mmu::Mmu;
use strato_x86::{Rep, Reg, StringOp, Width};

use super::{read_mem, write_mem};
use crate::exec::arith;
use crate::fault::Fault;
use crate::state::CpuState;

pub(super) fn string(
    state: &mut CpuState,
    mmu: &mut Mmu,
    op: StringOp,
    width: Width,
    rep: Rep,
) -> Result<(), Fault> {
    match rep {
        Rep::None => {
            one(state, mmu, op, width)?;
            Ok(())
        }
        Rep::RepE | Rep::RepNe => {
            // With no REP-sensitive semantics (movs/stos/lods) the prefix
            // only means "repeat RCX times".
            let conditional = matches!(op, StringOp::Scas | StringOp::Cmps);
            while state.read_reg(Reg::Rcx) != 0 {
                one(state, mmu, op, width)?;
                let rcx = state.read_reg(Reg::Rcx).wrapping_sub(1);
                state.write_reg(Reg::Rcx, rcx);
                if conditional {
                    let stop = match rep {
                        Rep::RepE => !state.flags.zf,
                        Rep::RepNe => state.flags.zf,
                        Rep::None => unreachable!(),
                    };
                    if stop {
                        break;
                    }
                }
            }
            Ok(())
        }
    }
}

/// One iteration, advancing RSI/RDI by the element size in the direction the
/// DF flag dictates.
fn one(state: &mut CpuState, mmu: &mut Mmu, op: StringOp, width: Width) -> Result<(), Fault> {
    let step = if state.flags.df {
        (width.bytes() as i64).wrapping_neg()
    } else {
        width.bytes() as i64
    };
    match op {
        StringOp::Movs => {
            let src = state.read_reg(Reg::Rsi);
            let dst = state.read_reg(Reg::Rdi);
            let v = read_mem(mmu, src, width)?;
            write_mem(mmu, dst, width, v)?;
            state.write_reg(Reg::Rsi, src.wrapping_add_signed(step));
            state.write_reg(Reg::Rdi, dst.wrapping_add_signed(step));
        }
        StringOp::Stos => {
            let dst = state.read_reg(Reg::Rdi);
            write_mem(mmu, dst, width, state.read_reg_w(Reg::Rax, width))?;
            state.write_reg(Reg::Rdi, dst.wrapping_add_signed(step));
        }
        StringOp::Lods => {
            let src = state.read_reg(Reg::Rsi);
            let v = read_mem(mmu, src, width)?;
            state.write_reg_w(Reg::Rax, width, v);
            state.write_reg(Reg::Rsi, src.wrapping_add_signed(step));
        }
        StringOp::Scas => {
            let dst = state.read_reg(Reg::Rdi);
            let v = read_mem(mmu, dst, width)?;
            let acc = state.read_reg_w(Reg::Rax, width);
            arith::sub_flags(state, width, acc, v);
            state.write_reg(Reg::Rdi, dst.wrapping_add_signed(step));
        }
        StringOp::Cmps => {
            let src = state.read_reg(Reg::Rsi);
            let dst = state.read_reg(Reg::Rdi);
            let a = read_mem(mmu, src, width)?;
            let b = read_mem(mmu, dst, width)?;
            arith::sub_flags(state, width, a, b);
            state.write_reg(Reg::Rsi, src.wrapping_add_signed(step));
            state.write_reg(Reg::Rdi, dst.wrapping_add_signed(step));
        }
    }
    Ok(())
}
