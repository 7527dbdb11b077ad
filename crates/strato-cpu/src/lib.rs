//! CPU state and the instruction interpreter.
//!
//! The interpreter is a dense match over the decoded instruction model:
//! `exec::step` executes exactly one instruction against a [`CpuState`] and
//! the guest MMU and reports how control continues. The decode cache keeps
//! lazily disassembled sections plus call/jmp target caches, mirroring the
//! lookup protocol the execution loop relies on.

pub mod cache;
pub mod exec;
mod fault;
mod fpu;
mod state;

pub use cache::{CacheStats, CodeCache, Loc};
pub use exec::{step, StepExit};
pub use fault::Fault;
pub use state::{CpuState, Flags, FpuState};
