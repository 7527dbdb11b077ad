//! Guest ISA model for the x86-64 interpreter.
//!
//! The decoder lowers its backend's output into the types here; the CPU
//! dispatches on them with an exhaustive match. This crate is the stable
//! interface between decoding and execution, so the decoder backend can be
//! swapped without touching the interpreter.

mod inst;
mod reg;

pub use inst::{
    AluOp, BitOp, CountOp, ExtOp, Inst, InstKind, MemRef, Operand, Rep, ShiftOp, SseInst, SseOp,
    SseOperand, StringOp, UnaryOp, X87Inst, X87Op, X87Operand,
};
pub use reg::{Cond, Reg, Seg, Width};

/// Longest legal x86 instruction, in bytes.
pub const MAX_INST_LEN: usize = 15;
