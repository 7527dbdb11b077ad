//! The cooperative scheduler.
//!
//! One host thread multiplexes every guest thread. A thread runs until it
//! blocks, yields, or terminates; the ready queue is FIFO and futex wake
//! order follows wait order. Kernel time advances as instructions retire and
//! fast-forwards to the earliest deadline when nothing is runnable.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;

use strato_abi::clone::robust;
use strato_mmu::{MemFault, Mmu};
use strato_x86::Reg;
use tracing::{debug, trace};

use crate::fs::FileTable;
use crate::thread::{Blocker, Thread, ThreadState, Tid};
use crate::time::{PreciseTime, NANOS_PER_INSTRUCTION};

/// Outcome of asking for the next thread to run.
#[derive(Debug, PartialEq, Eq)]
pub enum Pick {
    Run(Tid),
    /// Every thread is terminated; the process exit status.
    Finished(i32),
    /// Nothing runnable and nothing timed: the guest deadlocked.
    Deadlock,
}

pub struct Scheduler {
    threads: BTreeMap<Tid, Thread>,
    ready: VecDeque<Tid>,
    futex_waiters: HashMap<u64, VecDeque<Tid>>,
    current: Option<Tid>,
    main_tid: Option<Tid>,
    next_tid: Tid,
    pid: i32,
    instructions_retired: u64,
    skew: PreciseTime,
    group_exit: Option<i32>,
}

impl Scheduler {
    pub fn new(pid: i32) -> Scheduler {
        Scheduler {
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            futex_waiters: HashMap::new(),
            current: None,
            main_tid: None,
            next_tid: pid,
            pid,
            instructions_retired: 0,
            skew: PreciseTime::ZERO,
            group_exit: None,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Synthetic kernel time: retired instructions at the nominal rate plus
    /// any fast-forward accumulated while all threads were parked.
    pub fn kernel_time(&self) -> PreciseTime {
        PreciseTime::from_nanos(self.instructions_retired * NANOS_PER_INSTRUCTION).add(self.skew)
    }

    /// Account `n` retired instructions to kernel time and to the current
    /// thread's statistics.
    pub fn note_retired(&mut self, n: u64) {
        self.instructions_retired += n;
        if let Some(tid) = self.current {
            if let Some(t) = self.threads.get_mut(&tid) {
                t.stats.instructions += n;
            }
        }
    }

    /// Create a new Runnable thread (not yet queued).
    pub fn allocate_thread(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        if self.main_tid.is_none() {
            self.main_tid = Some(tid);
        }
        self.threads.insert(tid, Thread::new(self.pid, tid));
        tid
    }

    pub fn add_ready(&mut self, tid: Tid) {
        self.ready.push_back(tid);
    }

    pub fn thread(&self, tid: Tid) -> &Thread {
        &self.threads[&tid]
    }

    pub fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid).expect("unknown tid")
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// Pick the next thread to run. Wakes I/O-ready and timer-expired
    /// blockers first; fast-forwards kernel time when only timed blockers
    /// remain.
    pub fn pick_next(&mut self, mmu: &mut Mmu, files: &FileTable) -> Result<Pick, MemFault> {
        self.current = None;
        self.wake_io_ready(mmu, files)?;
        self.wake_expired(mmu)?;

        if let Some(tid) = self.pop_ready() {
            self.current = Some(tid);
            return Ok(Pick::Run(tid));
        }

        if self.threads.values().all(Thread::is_terminated) {
            return Ok(Pick::Finished(self.exit_status()));
        }

        // Nothing runnable. If a timed blocker exists, jump kernel time to
        // the earliest deadline and try again.
        let earliest = self
            .threads
            .values()
            .filter(|t| !t.is_terminated())
            .filter_map(|t| t.blocker.as_ref().and_then(Blocker::deadline))
            .min();
        if let Some(deadline) = earliest {
            let now = self.kernel_time();
            if deadline > now {
                let skip = PreciseTime::from_nanos(deadline.as_nanos() - now.as_nanos());
                trace!(?skip, "all threads parked, fast-forwarding kernel time");
                self.skew = self.skew.add(skip);
            }
            self.wake_expired(mmu)?;
            if let Some(tid) = self.pop_ready() {
                self.current = Some(tid);
                return Ok(Pick::Run(tid));
            }
        }

        Ok(Pick::Deadlock)
    }

    fn pop_ready(&mut self) -> Option<Tid> {
        while let Some(tid) = self.ready.pop_front() {
            if self.threads.get(&tid).is_some_and(Thread::is_runnable) {
                return Some(tid);
            }
        }
        None
    }

    /// Move the current thread to the back of the ready queue.
    pub fn yield_current(&mut self) {
        if let Some(tid) = self.current {
            self.ready.push_back(tid);
        }
    }

    /// Park the current thread on a blocker.
    pub fn block_current(&mut self, blocker: Blocker) {
        let tid = self.current.expect("no current thread to block");
        if let Blocker::FutexWait { uaddr, .. } | Blocker::FutexWaitBitset { uaddr, .. } = blocker
        {
            self.futex_waiters.entry(uaddr).or_default().push_back(tid);
        }
        let t = self.thread_mut(tid);
        t.state = ThreadState::Blocked;
        t.blocker = Some(blocker);
    }

    /// Wake up to `n` futex waiters on `uaddr` whose bitset intersects
    /// `mask`; returns the number woken. Wake order is wait order.
    pub fn wake(&mut self, uaddr: u64, n: u32, mask: u32) -> u32 {
        let Some(mut queue) = self.futex_waiters.remove(&uaddr) else {
            return 0;
        };
        let mut woken = 0;
        let mut remaining = VecDeque::new();
        while let Some(tid) = queue.pop_front() {
            if woken >= n {
                remaining.push_back(tid);
                continue;
            }
            let Some(t) = self.threads.get_mut(&tid) else {
                continue;
            };
            let matches = match &t.blocker {
                Some(Blocker::FutexWait { .. }) => true,
                Some(Blocker::FutexWaitBitset { bitset, .. }) => bitset & mask != 0,
                _ => false,
            };
            if !matches {
                remaining.push_back(tid);
                continue;
            }
            t.blocker = None;
            t.state = ThreadState::Runnable;
            t.saved.write_reg(Reg::Rax, 0);
            self.ready.push_back(tid);
            woken += 1;
        }
        if !remaining.is_empty() {
            self.futex_waiters.insert(uaddr, remaining);
        }
        woken
    }

    /// Wake every timer whose deadline has passed. Futex timeouts return
    /// -ETIMEDOUT; sleeps and the wait-style blockers return 0 after
    /// clearing their output buffers the way the real calls do.
    fn wake_expired(&mut self, mmu: &mut Mmu) -> Result<(), MemFault> {
        let now = self.kernel_time();
        let expired: Vec<Tid> = self
            .threads
            .values()
            .filter(|t| !t.is_terminated())
            .filter(|t| {
                t.blocker
                    .as_ref()
                    .and_then(Blocker::deadline)
                    .is_some_and(|d| d <= now)
            })
            .map(|t| t.tid)
            .collect();
        for tid in expired {
            let blocker = self.thread_mut(tid).blocker.take().expect("timed blocker");
            let rax: u64 = match &blocker {
                Blocker::FutexWait { uaddr, .. } | Blocker::FutexWaitBitset { uaddr, .. } => {
                    self.remove_futex_waiter(*uaddr, tid);
                    (-(strato_abi::Errno::ETIMEDOUT.0 as i64)) as u64
                }
                Blocker::Sleep { .. } => 0,
                Blocker::Poll { fds_ptr, nfds, .. } => {
                    // Timeout: every revents field reads back zero.
                    for i in 0..*nfds {
                        mmu.write16(fds_ptr + i * 8 + 6, 0)?;
                    }
                    0
                }
                Blocker::Select {
                    nfds,
                    read_ptr,
                    write_ptr,
                    except_ptr,
                    ..
                } => {
                    let bytes = strato_abi::poll::fd_set_bytes(*nfds as usize) as u64;
                    for ptr in [*read_ptr, *write_ptr, *except_ptr] {
                        if ptr != 0 {
                            for off in 0..bytes {
                                mmu.write8(ptr + off, 0)?;
                            }
                        }
                    }
                    0
                }
                Blocker::EpollWait { .. } => 0,
                Blocker::Join { .. } => 0,
            };
            trace!(tid, rax, "timed blocker expired");
            let t = self.thread_mut(tid);
            t.state = ThreadState::Runnable;
            t.saved.write_reg(Reg::Rax, rax);
            self.ready.push_back(tid);
        }
        Ok(())
    }

    /// Re-evaluate poll/select/epoll blockers against file readiness.
    fn wake_io_ready(&mut self, mmu: &mut Mmu, files: &FileTable) -> Result<(), MemFault> {
        let waiting: Vec<Tid> = self
            .threads
            .values()
            .filter(|t| {
                matches!(
                    t.blocker,
                    Some(Blocker::Poll { .. })
                        | Some(Blocker::Select { .. })
                        | Some(Blocker::EpollWait { .. })
                )
            })
            .map(|t| t.tid)
            .collect();
        for tid in waiting {
            let blocker = self.thread(tid).blocker.clone().expect("io blocker");
            let ready: Option<u64> = match blocker {
                Blocker::Poll { fds_ptr, nfds, .. } => {
                    crate::sys::wait::poll_ready_count(mmu, files, fds_ptr, nfds)?
                }
                Blocker::Select {
                    nfds,
                    read_ptr,
                    write_ptr,
                    except_ptr,
                    ..
                } => crate::sys::wait::select_ready_count(
                    mmu, files, nfds, read_ptr, write_ptr, except_ptr,
                )?,
                Blocker::EpollWait {
                    epfd,
                    events_ptr,
                    max_events,
                    ..
                } => crate::sys::wait::epoll_ready_count(mmu, files, epfd, events_ptr, max_events)?,
                _ => None,
            };
            if let Some(rax) = ready {
                let t = self.thread_mut(tid);
                t.blocker = None;
                t.state = ThreadState::Runnable;
                t.saved.write_reg(Reg::Rax, rax);
                self.ready.push_back(tid);
            }
        }
        Ok(())
    }

    fn remove_futex_waiter(&mut self, uaddr: u64, tid: Tid) {
        if let Some(queue) = self.futex_waiters.get_mut(&uaddr) {
            queue.retain(|t| *t != tid);
            if queue.is_empty() {
                self.futex_waiters.remove(&uaddr);
            }
        }
    }

    /// Terminate one thread: run the clear_child_tid protocol, walk the
    /// robust list, wake joiners, and drop the thread from every queue.
    pub fn terminate(&mut self, tid: Tid, status: i32, mmu: &mut Mmu) {
        debug!(tid, status, "thread terminated");
        let (taken, clear_tid, robust_head) = {
            let t = self.thread_mut(tid);
            t.state = ThreadState::Terminated(status);
            (t.blocker.take(), t.clear_child_tid, t.robust_list)
        };
        if let Some(Blocker::FutexWait { uaddr, .. } | Blocker::FutexWaitBitset { uaddr, .. }) =
            taken
        {
            self.remove_futex_waiter(uaddr, tid);
        }
        self.ready.retain(|t| *t != tid);

        if robust_head != 0 {
            self.walk_robust_list(tid, robust_head, mmu);
        }
        if clear_tid != 0 {
            // Best effort: the address may have been unmapped already.
            if mmu.write32(clear_tid, 0).is_ok() {
                self.wake(clear_tid, 1, u32::MAX);
            }
        }

        // Wake anyone joined on this thread.
        let joiners: Vec<Tid> = self
            .threads
            .values()
            .filter(|t| matches!(t.blocker, Some(Blocker::Join { tid: j }) if j == tid))
            .map(|t| t.tid)
            .collect();
        for joiner in joiners {
            let t = self.thread_mut(joiner);
            t.blocker = None;
            t.state = ThreadState::Runnable;
            t.saved.write_reg(Reg::Rax, 0);
            self.ready.push_back(joiner);
        }
    }

    /// Mark every owned robust futex as OWNER_DIED and wake one waiter each,
    /// the way the kernel cleans up after a dying thread.
    fn walk_robust_list(&mut self, tid: Tid, head: u64, mmu: &mut Mmu) {
        let Ok(futex_offset) = mmu.read64(head + 8) else {
            return;
        };
        let mut entry = match mmu.read64(head) {
            Ok(e) => e,
            Err(_) => return,
        };
        let mut seen = 0usize;
        while entry != head && entry != 0 && seen < robust::LIST_LIMIT {
            let lock_addr = entry.wrapping_add(futex_offset);
            if let Ok(word) = mmu.read32(lock_addr) {
                if word & robust::FUTEX_TID_MASK == tid as u32 {
                    let new = (word & !robust::FUTEX_TID_MASK) | robust::FUTEX_OWNER_DIED;
                    if mmu.write32(lock_addr, new).is_ok() {
                        self.wake(lock_addr, 1, u32::MAX);
                    }
                }
            }
            entry = match mmu.read64(entry) {
                Ok(next) => next,
                Err(_) => break,
            };
            seen += 1;
        }
    }

    /// exit_group: every thread terminates; futex waiters are not woken.
    pub fn terminate_all(&mut self, status: i32) {
        debug!(status, "exit_group");
        self.group_exit = Some(status);
        for t in self.threads.values_mut() {
            if !t.is_terminated() {
                t.state = ThreadState::Terminated(status);
                t.blocker = None;
            }
        }
        self.ready.clear();
        self.futex_waiters.clear();
    }

    /// Process exit status: the exit_group status if one was set, else the
    /// main thread's.
    pub fn exit_status(&self) -> i32 {
        if let Some(status) = self.group_exit {
            return status;
        }
        self.main_tid
            .and_then(|tid| self.threads.get(&tid))
            .and_then(|t| match t.state {
                ThreadState::Terminated(status) => Some(status),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn dump_threads(&self) -> String {
        let mut out = String::from("threads:\n");
        for t in self.threads.values() {
            let _ = writeln!(
                out,
                "  [{}:{}] {:?} rip={:#x} instructions={} syscalls={}",
                t.pid, t.tid, t.state, t.saved.rip, t.stats.instructions, t.stats.syscalls,
            );
        }
        out
    }

    pub fn dump_blockers(&self) -> String {
        let mut out = String::from("blockers:\n");
        for t in self.threads.values() {
            if let Some(blocker) = &t.blocker {
                let _ = writeln!(out, "  [{}] {:?}", t.tid, blocker);
            }
        }
        out
    }
}
