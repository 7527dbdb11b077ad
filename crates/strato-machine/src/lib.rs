//! The runnable machine: MMU + kernel + CPU + decode cache, and the
//! decode/execute/schedule loop that drives them.
//!
//! One host thread runs every guest thread. The scheduler picks a thread,
//! its saved state is copied into the CPU, and the loop fetches decoded
//! instructions from the cache until the thread blocks, yields, or exits.
//! Syscalls operate on the thread's saved state, so the copy-out happens
//! before dispatch and the copy-in after.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, trace};

use strato_abi::nr;
use strato_cpu::{step, CodeCache, CpuState, Fault, Loc, StepExit};
use strato_kernel::exec::LoadError;
use strato_kernel::sched::Pick;
use strato_kernel::{Config, Kernel, SysFault, SyscallOutcome, Tid};
use strato_mmu::Mmu;
use strato_x86::{InstKind, Reg};

/// How often the cooperative interrupt flag is polled while a thread runs,
/// in retired instructions.
const INTERRUPT_POLL_MASK: u64 = 0xffff;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Cpu(#[from] Fault),
    #[error(transparent)]
    Sys(#[from] SysFault),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("all threads blocked with nothing to wake them (deadlock)")]
    Deadlock,
    #[error("interrupted")]
    Interrupted,
}

pub struct Machine {
    mmu: Mmu,
    kernel: Kernel,
    cpu: CpuState,
    cache: CodeCache,
    interrupt: Arc<AtomicBool>,
}

impl Machine {
    pub fn new(config: Config) -> Machine {
        Machine {
            mmu: Mmu::new(),
            kernel: Kernel::new(config),
            cpu: CpuState::new(),
            cache: CodeCache::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag polled at syscall entry and once per bounded number of retired
    /// instructions; setting it triggers a clean panic dump.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    /// Load an ELF program and set up its main thread.
    pub fn load(
        &mut self,
        program_path: &str,
        args: &[String],
        envs: &[String],
    ) -> Result<(), MachineError> {
        strato_kernel::exec::exec(&mut self.kernel, &mut self.mmu, program_path, args, envs)?;
        Ok(())
    }

    /// Run until every guest thread terminated; returns the process exit
    /// status. Fatal faults dump state and surface as errors.
    pub fn run(&mut self) -> Result<i32, MachineError> {
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                self.dump("interrupted");
                return Err(MachineError::Interrupted);
            }
            match self
                .kernel
                .sched
                .pick_next(&mut self.mmu, &self.kernel.files)
            {
                Err(fault) => {
                    self.dump("scheduler fault");
                    return Err(MachineError::Cpu(Fault::Mem(fault)));
                }
                Ok(Pick::Finished(status)) => {
                    self.report_stats();
                    return Ok(status);
                }
                Ok(Pick::Deadlock) => {
                    self.dump("deadlock");
                    return Err(MachineError::Deadlock);
                }
                Ok(Pick::Run(tid)) => {
                    if let Err(err) = self.run_thread(tid) {
                        self.dump("guest fault");
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Run one thread until it blocks, yields, or terminates.
    fn run_thread(&mut self, tid: Tid) -> Result<(), MachineError> {
        // Context switch in: the thread's saved state becomes the CPU state.
        self.cpu = self.kernel.sched.thread(tid).saved.clone();
        let mut hint: Option<Loc> = None;
        let mut retired: u64 = 0;
        // Whether the thread's saved state still needs the CPU copied back
        // when we leave the loop (false once a syscall path owns it).
        let mut copy_back = true;

        let result = loop {
            if retired & INTERRUPT_POLL_MASK == 0
                && retired != 0
                && self.interrupt.load(Ordering::Relaxed)
            {
                self.kernel.sched.yield_current();
                break Ok(());
            }

            let loc = match hint.take() {
                Some(loc) => loc,
                None => match self.cache.lookup(&self.mmu, self.cpu.rip, None) {
                    Ok(loc) => loc,
                    Err(fault) => break Err(MachineError::Cpu(fault)),
                },
            };
            let inst = *self.cache.inst(loc);

            if let Some(after) = self.kernel.config.log_instructions_after {
                if self.cpu.tsc >= after {
                    trace!(tid, rip = inst.addr, kind = ?inst.kind, "exec");
                }
            }

            match step(&mut self.cpu, &mut self.mmu, &inst) {
                Ok(StepExit::Continue) => {
                    retired += 1;
                    self.cpu.tsc += 1;
                    hint = self.cache.next(loc);
                }
                Ok(StepExit::Branch) => {
                    retired += 1;
                    self.cpu.tsc += 1;
                    let target = self.cpu.rip;
                    let lookup = match inst.kind {
                        InstKind::CallRel { .. } | InstKind::CallInd { .. } => {
                            self.cache.lookup_call(&self.mmu, target)
                        }
                        _ => self.cache.lookup_jmp(&self.mmu, target),
                    };
                    match lookup {
                        Ok(loc) => hint = Some(loc),
                        Err(fault) => break Err(MachineError::Cpu(fault)),
                    }
                }
                Ok(StepExit::Syscall) => {
                    retired += 1;
                    self.cpu.tsc += 1;
                    self.kernel.sched.note_retired(retired);
                    retired = 0;

                    // Peek the number before dispatch so mapping changes can
                    // invalidate stale decoded code afterwards.
                    let sys_nr = self.cpu.read_reg(Reg::Rax);
                    let arg0 = self.cpu.read_reg(Reg::Rdi);
                    let arg1 = self.cpu.read_reg(Reg::Rsi);

                    self.kernel.sched.thread_mut(tid).saved = self.cpu.clone();
                    let outcome = self.kernel.dispatch(&mut self.mmu, tid)?;
                    self.invalidate_after_syscall(sys_nr, arg0, arg1, tid);
                    match outcome {
                        SyscallOutcome::Completed => {
                            self.cpu = self.kernel.sched.thread(tid).saved.clone();
                            hint = None;
                        }
                        SyscallOutcome::Blocked | SyscallOutcome::Exited => {
                            // The saved state (with RAX handling) is owned by
                            // the kernel now; leaving the CPU copy alone.
                            copy_back = false;
                            break Ok(());
                        }
                        SyscallOutcome::Yielded => {
                            self.kernel.sched.yield_current();
                            copy_back = false;
                            break Ok(());
                        }
                    }
                }
                Err(fault) => break Err(MachineError::Cpu(fault)),
            }
        };

        // Context switch out. On a fault the state still lands in the thread
        // so the dump shows where it stopped.
        self.kernel.sched.note_retired(retired);
        if copy_back {
            self.kernel.sched.thread_mut(tid).saved = self.cpu.clone();
        }
        result
    }

    /// Mapping syscalls can pull executable bytes out from under cached
    /// sections; drop anything overlapping the touched range.
    fn invalidate_after_syscall(&mut self, sys_nr: u64, arg0: u64, arg1: u64, tid: Tid) {
        match sys_nr {
            nr::MPROTECT | nr::MUNMAP => {
                self.cache.invalidate_range(arg0, arg0.saturating_add(arg1));
            }
            nr::MMAP => {
                let base = self.kernel.sched.thread(tid).saved.read_reg(Reg::Rax);
                if (base as i64) > 0 {
                    self.cache.invalidate_range(base, base.saturating_add(arg1));
                }
            }
            _ => {}
        }
    }

    fn report_stats(&self) {
        let stats = self.cache.stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            "decode cache totals"
        );
        for thread in self.kernel.sched.threads() {
            debug!(
                tid = thread.tid,
                instructions = thread.stats.instructions,
                syscalls = thread.stats.syscalls,
                "thread retired"
            );
        }
    }

    /// Post-mortem dump: registers, stack window, regions, blockers.
    fn dump(&self, reason: &str) {
        error!(reason, "emulator panic");
        let c = &self.cpu;
        eprintln!("emulator panic: {reason}");
        eprintln!(
            "rip {:#018x}  flags [{}{}{}{}{}]",
            c.rip,
            if c.flags.cf { 'C' } else { ' ' },
            if c.flags.zf { 'Z' } else { ' ' },
            if c.flags.of { 'O' } else { ' ' },
            if c.flags.sf { 'S' } else { ' ' },
            if c.flags.pf { 'P' } else { ' ' },
        );
        eprintln!(
            "rax {:#018x}  rbx {:#018x}  rcx {:#018x}  rdx {:#018x}",
            c.read_reg(Reg::Rax),
            c.read_reg(Reg::Rbx),
            c.read_reg(Reg::Rcx),
            c.read_reg(Reg::Rdx),
        );
        eprintln!(
            "rsi {:#018x}  rdi {:#018x}  rbp {:#018x}  rsp {:#018x}",
            c.read_reg(Reg::Rsi),
            c.read_reg(Reg::Rdi),
            c.read_reg(Reg::Rbp),
            c.read_reg(Reg::Rsp),
        );
        eprintln!(
            "r8  {:#018x}  r9  {:#018x}  r10 {:#018x}  r11 {:#018x}",
            c.read_reg(Reg::R8),
            c.read_reg(Reg::R9),
            c.read_reg(Reg::R10),
            c.read_reg(Reg::R11),
        );
        eprintln!(
            "r12 {:#018x}  r13 {:#018x}  r14 {:#018x}  r15 {:#018x}",
            c.read_reg(Reg::R12),
            c.read_reg(Reg::R13),
            c.read_reg(Reg::R14),
            c.read_reg(Reg::R15),
        );
        let rsp = c.rsp();
        eprint!("stack:");
        for i in 0..8 {
            if let Ok(word) = self.mmu.read64(rsp + i * 8) {
                eprint!(" {word:#x}");
            }
        }
        eprintln!();
        eprintln!("{}", self.kernel.panic_dump(&self.mmu));
    }
}
