//! The emulated Linux kernel: threads, the cooperative scheduler, the
//! syscall dispatcher, the host translation layer, the file table, System V
//! shared memory, and the ELF loader / process builder.
//!
//! The kernel owns everything except the MMU, which the machine threads
//! through every call, keeping the ownership graph acyclic: one context
//! object instead of back-references.

pub mod exec;
pub mod fs;
pub mod host;
pub mod sched;
pub mod shm;
pub mod sys;
pub mod thread;
pub mod time;

use strato_mmu::{MemFault, Mmu};
use thiserror::Error;

pub use sched::Scheduler;
pub use sys::SyscallOutcome;
pub use thread::{Blocker, Thread, ThreadState, Tid};
pub use time::PreciseTime;

/// Emulator-level tuning knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Emit a log line per syscall (observability only; never changes
    /// behavior).
    pub log_syscalls: bool,
    /// Emit a trace line per executed instruction once this many have
    /// retired. Expensive; None disables it.
    pub log_instructions_after: Option<u64>,
    /// Allow the System V shared-memory family.
    pub enable_shm: bool,
    /// Core count reported to the guest.
    pub nb_cores: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log_syscalls: false,
            log_instructions_after: None,
            enable_shm: true,
            nb_cores: 1,
        }
    }
}

/// A fatal kernel-side fault (spec: these abort the whole emulated process).
#[derive(Debug, Error)]
pub enum SysFault {
    #[error(transparent)]
    Mem(#[from] MemFault),
    #[error("unhandled syscall {nr} ({name}) with args {args:x?}", name = strato_abi::nr::name(*nr))]
    UnknownSyscall { nr: u64, args: [u64; 6] },
    #[error("clone flags {flags:#x} diverge from the pthread profile: {detail}")]
    CloneFlags { flags: u64, detail: String },
    #[error("futex op {op} is not supported")]
    FutexOp { op: i32 },
}

/// The kernel context object.
pub struct Kernel {
    pub sched: Scheduler,
    pub files: fs::FileTable,
    pub shm: shm::SharedMemory,
    pub config: Config,
}

impl Kernel {
    pub fn new(config: Config) -> Kernel {
        let pid = host::getpid();
        Kernel {
            sched: Scheduler::new(pid),
            files: fs::FileTable::new(pid),
            shm: shm::SharedMemory::new(),
            config,
        }
    }

    /// Service the syscall the thread `tid` just executed; its saved CPU
    /// state carries the ABI registers.
    pub fn dispatch(&mut self, mmu: &mut Mmu, tid: Tid) -> Result<SyscallOutcome, SysFault> {
        sys::dispatch(self, mmu, tid)
    }

    /// Panic path: terminate everything and render the post-mortem dump.
    pub fn panic_dump(&self, mmu: &Mmu) -> String {
        let mut out = String::new();
        out.push_str(&self.sched.dump_threads());
        out.push_str(&self.sched.dump_blockers());
        out.push_str("memory regions:\n");
        out.push_str(&mmu.dump_regions());
        out
    }
}
