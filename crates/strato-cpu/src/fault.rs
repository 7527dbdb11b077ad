//! Fatal guest faults.

use strato_mmu::MemFault;
use thiserror::Error;

/// A fault that aborts the emulated process. Guest-observable errors never
/// take this path; they are encoded as negative errno values in RAX.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Fault {
    #[error(transparent)]
    Mem(#[from] MemFault),
    #[error("integer division fault at {rip:#x}")]
    DivideError { rip: u64 },
    #[error("invalid opcode at {rip:#x}: {bytes:02x?}")]
    InvalidOpcode { rip: u64, bytes: Vec<u8> },
    #[error("unsupported instruction at {rip:#x}: {what}")]
    Unsupported { rip: u64, what: &'static str },
    #[error("hlt executed in user code at {rip:#x}")]
    Hlt { rip: u64 },
    #[error("ud2 executed at {rip:#x}")]
    Ud2 { rip: u64 },
    #[error("{addr:#x} is not an instruction boundary")]
    NotInstructionBoundary { addr: u64 },
}
