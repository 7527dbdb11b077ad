//! Syscall dispatch.
//!
//! The ABI registers of the calling thread's saved state carry the number
//! (RAX) and six arguments (RDI, RSI, RDX, R10, R8, R9). Handlers either
//! complete synchronously (result encoded into RAX, negative errno on
//! failure), block the caller on a scheduler blocker, yield, or terminate.
//! Unknown numbers are fatal with a diagnostic.

mod file;
mod mem;
mod proc;
mod task;
mod time;
pub(crate) mod wait;

use strato_abi::{encode_result, nr, Errno, SysResult};
use strato_mmu::Mmu;
use strato_x86::Reg;
use tracing::{debug, warn};

use crate::fs::FileTable;
use crate::sched::Scheduler;
use crate::shm::SharedMemory;
use crate::thread::Tid;
use crate::{Config, Kernel, SysFault};

/// How the dispatched syscall left the calling thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Result already written to RAX; the thread keeps running.
    Completed,
    /// The thread was parked on a blocker; RAX is written on wake.
    Blocked,
    /// The calling thread (or the whole group) terminated.
    Exited,
    /// sched_yield: requeue the caller at the back of the ready queue.
    Yielded,
}

pub(crate) enum Control {
    Ret(SysResult),
    Block,
    Exit,
    Yield,
}

pub(crate) fn ret(res: SysResult) -> Result<Control, SysFault> {
    Ok(Control::Ret(res))
}

/// Everything a handler may touch, borrowed disjointly from the kernel.
pub(crate) struct SysCtx<'a> {
    pub sched: &'a mut Scheduler,
    pub files: &'a mut FileTable,
    pub shm: &'a mut SharedMemory,
    pub config: &'a Config,
    pub mmu: &'a mut Mmu,
    pub tid: Tid,
}

impl SysCtx<'_> {
    pub(crate) fn read_str(&self, ptr: u64) -> Result<String, SysFault> {
        Ok(self.mmu.read_cstring(ptr)?)
    }

    /// Copy a host-produced buffer into guest memory, truncating to `max`.
    pub(crate) fn write_back(&mut self, ptr: u64, bytes: &[u8], max: usize) -> Result<u64, SysFault> {
        let n = bytes.len().min(max);
        self.mmu.copy_to_mmu(ptr, &bytes[..n])?;
        Ok(n as u64)
    }
}

pub(crate) fn dispatch(
    kernel: &mut Kernel,
    mmu: &mut Mmu,
    tid: Tid,
) -> Result<SyscallOutcome, SysFault> {
    let (nr, args) = {
        let t = kernel.sched.thread_mut(tid);
        t.stats.syscalls += 1;
        let regs = &t.saved;
        (
            regs.read_reg(Reg::Rax),
            [
                regs.read_reg(Reg::Rdi),
                regs.read_reg(Reg::Rsi),
                regs.read_reg(Reg::Rdx),
                regs.read_reg(Reg::R10),
                regs.read_reg(Reg::R8),
                regs.read_reg(Reg::R9),
            ],
        )
    };

    let mut ctx = SysCtx {
        sched: &mut kernel.sched,
        files: &mut kernel.files,
        shm: &mut kernel.shm,
        config: &kernel.config,
        mmu,
        tid,
    };
    let control = handle(&mut ctx, nr, args)?;

    let outcome = match control {
        Control::Ret(res) => {
            if kernel.config.log_syscalls {
                debug!(target: "strato::sys", tid, "{}({:#x}, {:#x}, {:#x}, ...) = {:?}",
                    strato_abi::nr::name(nr), args[0], args[1], args[2], res);
            }
            let rax = encode_result(res);
            kernel.sched.thread_mut(tid).saved.write_reg(Reg::Rax, rax);
            SyscallOutcome::Completed
        }
        Control::Block => {
            if kernel.config.log_syscalls {
                debug!(target: "strato::sys", tid, "{}(...) = pending", strato_abi::nr::name(nr));
            }
            SyscallOutcome::Blocked
        }
        Control::Exit => SyscallOutcome::Exited,
        Control::Yield => {
            kernel.sched.thread_mut(tid).saved.write_reg(Reg::Rax, 0);
            SyscallOutcome::Yielded
        }
    };
    Ok(outcome)
}

fn handle(ctx: &mut SysCtx<'_>, number: u64, a: [u64; 6]) -> Result<Control, SysFault> {
    match number {
        nr::READ => file::read(ctx, a[0] as i32, a[1], a[2]),
        nr::WRITE => file::write(ctx, a[0] as i32, a[1], a[2]),
        nr::OPEN => file::open(ctx, a[0], a[1] as i32, a[2] as u32),
        nr::CLOSE => ret(ctx.files.close(a[0] as i32)),
        nr::STAT => file::stat(ctx, a[0], a[1]),
        nr::FSTAT => file::fstat(ctx, a[0] as i32, a[1]),
        nr::LSTAT => file::lstat(ctx, a[0], a[1]),
        nr::POLL => wait::poll(ctx, a[0], a[1], a[2] as i32),
        nr::LSEEK => ret(ctx.files.lseek(a[0] as i32, a[1] as i64, a[2] as i32)),
        nr::MMAP => mem::mmap(ctx, a[0], a[1], a[2] as i32, a[3] as i32, a[4] as i32, a[5] as i64),
        nr::MPROTECT => mem::mprotect(ctx, a[0], a[1], a[2] as i32),
        nr::MUNMAP => mem::munmap(ctx, a[0], a[1]),
        nr::BRK => mem::brk(ctx, a[0]),
        nr::RT_SIGACTION | nr::RT_SIGPROCMASK => ret(Ok(0)),
        nr::IOCTL => file::ioctl(ctx, a[0] as i32, a[1], a[2]),
        nr::PREAD64 => file::pread(ctx, a[0] as i32, a[1], a[2], a[3] as i64),
        nr::PWRITE64 => file::pwrite(ctx, a[0] as i32, a[1], a[2], a[3] as i64),
        nr::READV => file::readv(ctx, a[0] as i32, a[1], a[2]),
        nr::WRITEV => file::writev(ctx, a[0] as i32, a[1], a[2]),
        nr::ACCESS => file::access(ctx, a[0], a[1] as i32),
        nr::PIPE => file::pipe(ctx, a[0], 0),
        nr::SELECT => wait::select(ctx, a[0], a[1], a[2], a[3], a[4]),
        nr::SCHED_YIELD => Ok(Control::Yield),
        nr::MREMAP => not_supported("mremap"),
        nr::MSYNC => ret(Ok(0)),
        nr::MINCORE => mem::mincore(ctx, a[0], a[1], a[2]),
        nr::MADVISE => ret(Ok(0)),
        nr::SHMGET => mem::shmget(ctx, a[0] as i32, a[1], a[2] as i32),
        nr::SHMAT => mem::shmat(ctx, a[0] as i32, a[1]),
        nr::SHMCTL => mem::shmctl(ctx, a[0] as i32, a[1] as i32),
        nr::DUP => ret(ctx.files.dup(a[0] as i32).map(|fd| fd as u64)),
        nr::DUP2 => ret(ctx.files.dup2(a[0] as i32, a[1] as i32).map(|fd| fd as u64)),
        nr::NANOSLEEP => time::nanosleep(ctx, a[0], a[1]),
        nr::SETITIMER => ret(Ok(0)),
        nr::GETPID => ret(Ok(ctx.sched.pid() as u64)),
        nr::SOCKET | nr::CONNECT | nr::SENDTO | nr::RECVFROM | nr::SENDMSG | nr::RECVMSG
        | nr::SHUTDOWN | nr::BIND | nr::LISTEN | nr::GETSOCKNAME | nr::GETPEERNAME
        | nr::SOCKETPAIR | nr::SETSOCKOPT | nr::GETSOCKOPT => not_supported("sockets"),
        nr::CLONE => task::clone(ctx, a[0], a[1], a[2], a[3], a[4]),
        nr::EXECVE => not_supported("execve"),
        nr::EXIT => task::exit(ctx, a[0] as i32),
        nr::KILL => not_supported("kill"),
        nr::UNAME => proc::uname(ctx, a[0]),
        nr::SHMDT => mem::shmdt(ctx, a[0]),
        nr::FCNTL => ret(ctx.files.fcntl(a[0] as i32, a[1] as i32, a[2] as i32)),
        nr::FLOCK => ret(Ok(0)),
        nr::FSYNC | nr::FDATASYNC => not_supported("fsync"),
        nr::TRUNCATE => file::truncate(ctx, a[0], a[1] as i64),
        nr::FTRUNCATE => file::ftruncate(ctx, a[0] as i32, a[1] as i64),
        nr::GETCWD => proc::getcwd(ctx, a[0], a[1]),
        nr::CHDIR => file::chdir(ctx, a[0]),
        nr::RENAME => file::rename(ctx, a[0], a[1]),
        nr::MKDIR => file::mkdir(ctx, a[0], a[1] as u32),
        nr::UNLINK => file::unlink(ctx, a[0]),
        nr::READLINK => file::readlink(ctx, a[0], a[1], a[2]),
        nr::CHMOD | nr::FCHMOD | nr::CHOWN | nr::FCHOWN => not_supported("chmod/chown"),
        nr::UMASK => ret(Ok(0o22)),
        nr::GETTIMEOFDAY => time::gettimeofday(ctx, a[0]),
        nr::GETRLIMIT => proc::getrlimit(ctx, a[0] as i32, a[1]),
        nr::GETRUSAGE => proc::getrusage(ctx, a[1]),
        nr::SYSINFO => proc::sysinfo(ctx, a[0]),
        nr::TIMES => time::times(ctx, a[0]),
        nr::GETUID => ret(Ok(crate::host::getuid() as u64)),
        nr::GETGID => ret(Ok(crate::host::getgid() as u64)),
        nr::GETEUID => ret(Ok(crate::host::geteuid() as u64)),
        nr::GETEGID => ret(Ok(crate::host::getegid() as u64)),
        nr::GETPPID => ret(Ok(crate::host::getppid() as u64)),
        nr::GETPGRP => ret(Ok(crate::host::getpgrp() as u64)),
        nr::GETGROUPS => proc::getgroups(ctx, a[0], a[1]),
        nr::GETRESUID => proc::getresuid(ctx, a[0], a[1], a[2]),
        nr::GETRESGID => proc::getresgid(ctx, a[0], a[1], a[2]),
        nr::RT_SIGTIMEDWAIT => not_supported("rt_sigtimedwait"),
        nr::SIGALTSTACK => ret(Ok(0)),
        nr::UTIME | nr::UTIMENSAT => ret(Ok(0)),
        nr::STATFS => file::statfs(ctx, a[0], a[1]),
        nr::FSTATFS => file::fstatfs(ctx, a[0] as i32, a[1]),
        nr::SETPRIORITY => ret(Ok(0)),
        nr::SCHED_GETPARAM => proc::sched_getparam(ctx, a[1]),
        nr::SCHED_SETSCHEDULER => ret(Ok(0)),
        nr::SCHED_GETSCHEDULER => ret(Ok(0)),
        nr::MLOCK | nr::MUNLOCK => ret(Ok(0)),
        nr::PRCTL => proc::prctl(ctx, a[0] as i32),
        nr::ARCH_PRCTL => task::arch_prctl(ctx, a[0] as i32, a[1]),
        nr::GETTID => ret(Ok(ctx.tid as u64)),
        nr::GETXATTR => file::getxattr(ctx, a[0], a[1], a[2], a[3], false),
        nr::LGETXATTR => file::getxattr(ctx, a[0], a[1], a[2], a[3], true),
        nr::LISTXATTR => not_supported("listxattr"),
        nr::TIME => time::time(ctx, a[0]),
        nr::FUTEX => task::futex(ctx, a[0], a[1] as i32, a[2] as u32, a[3], a[4], a[5] as u32),
        nr::SCHED_SETAFFINITY => not_supported("sched_setaffinity"),
        nr::SCHED_GETAFFINITY => proc::sched_getaffinity(ctx, a[0] as i32, a[1], a[2]),
        nr::GETDENTS64 => file::getdents64(ctx, a[0] as i32, a[1], a[2]),
        nr::SET_TID_ADDRESS => task::set_tid_address(ctx, a[0]),
        nr::FADVISE64 => ret(Ok(0)),
        nr::CLOCK_GETTIME => time::clock_gettime(ctx, a[0] as i32, a[1]),
        nr::CLOCK_GETRES => time::clock_getres(ctx, a[0] as i32, a[1]),
        nr::CLOCK_NANOSLEEP => time::clock_nanosleep(ctx, a[0] as i32, a[1] as i32, a[2], a[3]),
        nr::EXIT_GROUP => task::exit_group(ctx, a[0] as i32),
        nr::EPOLL_WAIT => wait::epoll_wait(ctx, a[0] as i32, a[1], a[2] as i32, a[3] as i32),
        nr::EPOLL_CTL => file::epoll_ctl(ctx, a[0] as i32, a[1] as i32, a[2] as i32, a[3]),
        nr::TGKILL => task::tgkill(ctx, a[0] as i32, a[1] as i32, a[2] as i32),
        nr::MBIND => not_supported("mbind"),
        nr::WAITID => not_supported("waitid"),
        nr::INOTIFY_INIT | nr::INOTIFY_ADD_WATCH | nr::INOTIFY_INIT1 => not_supported("inotify"),
        nr::OPENAT => file::openat(ctx, a[0] as i32, a[1], a[2] as i32, a[3] as u32),
        nr::NEWFSTATAT => file::fstatat(ctx, a[0] as i32, a[1], a[2], a[3] as i32),
        nr::UNLINKAT => file::unlinkat(ctx, a[0] as i32, a[1], a[2] as i32),
        nr::LINKAT => not_supported("linkat"),
        nr::READLINKAT => file::readlinkat(ctx, a[0] as i32, a[1], a[2], a[3]),
        nr::FACCESSAT => file::faccessat(ctx, a[0] as i32, a[1], a[2] as i32),
        nr::PSELECT6 => wait::pselect6(ctx, a[0], a[1], a[2], a[3], a[4]),
        nr::PPOLL => wait::ppoll(ctx, a[0], a[1], a[2]),
        nr::SET_ROBUST_LIST => task::set_robust_list(ctx, a[0], a[1]),
        nr::GET_ROBUST_LIST => task::get_robust_list(ctx, a[0] as i32, a[1], a[2]),
        nr::FALLOCATE => ret(Ok(0)),
        nr::EVENTFD2 => file::eventfd2(ctx, a[0] as u32, a[1] as i32),
        nr::EPOLL_CREATE1 => ret(Ok(ctx.files.epoll_create() as u64)),
        nr::DUP3 => ret(ctx.files.dup2(a[0] as i32, a[1] as i32).map(|fd| fd as u64)),
        nr::PIPE2 => file::pipe(ctx, a[0], a[1] as i32),
        nr::PRLIMIT64 => proc::prlimit64(ctx, a[0] as i32, a[1] as i32, a[2], a[3]),
        nr::SCHED_SETATTR | nr::SCHED_GETATTR => ret(Ok(0)),
        nr::GETRANDOM => proc::getrandom(ctx, a[0], a[1]),
        nr::MEMFD_CREATE => file::memfd_create(ctx, a[0]),
        nr::STATX => file::statx(ctx, a[0] as i32, a[1], a[2] as i32, a[3] as u32, a[4]),
        nr::CLONE3 => task::clone3(ctx, a[0], a[1]),
        _ => Err(SysFault::UnknownSyscall { nr: number, args: a }),
    }
}

fn not_supported(what: &str) -> Result<Control, SysFault> {
    warn!("{what} not implemented");
    ret(Err(Errno::ENOTSUP))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_mmu::{MapFlags, Prot};

    fn setup() -> (Kernel, Mmu, Tid) {
        let mut kernel = Kernel::new(Config::default());
        let mut mmu = Mmu::new();
        mmu.mmap(
            0x10_0000,
            0x4000,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .unwrap();
        let tid = kernel.sched.allocate_thread();
        kernel.sched.add_ready(tid);
        let pick = kernel.sched.pick_next(&mut mmu, &kernel.files).unwrap();
        assert_eq!(pick, crate::sched::Pick::Run(tid));
        (kernel, mmu, tid)
    }

    fn set_args(kernel: &mut Kernel, tid: Tid, number: u64, args: [u64; 6]) {
        let regs = &mut kernel.sched.thread_mut(tid).saved;
        regs.write_reg(Reg::Rax, number);
        regs.write_reg(Reg::Rdi, args[0]);
        regs.write_reg(Reg::Rsi, args[1]);
        regs.write_reg(Reg::Rdx, args[2]);
        regs.write_reg(Reg::R10, args[3]);
        regs.write_reg(Reg::R8, args[4]);
        regs.write_reg(Reg::R9, args[5]);
    }

    fn rax(kernel: &Kernel, tid: Tid) -> i64 {
        kernel.sched.thread(tid).saved.read_reg(Reg::Rax) as i64
    }

    #[test]
    fn bad_fd_read_returns_negative_errno_in_rax() {
        let (mut kernel, mut mmu, tid) = setup();
        set_args(&mut kernel, tid, nr::READ, [99, 0x10_0000, 16, 0, 0, 0]);
        let outcome = kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(outcome, SyscallOutcome::Completed);
        assert_eq!(rax(&kernel, tid), -(Errno::EBADF.0 as i64));
    }

    #[test]
    fn futex_wait_with_changed_value_is_eagain() {
        let (mut kernel, mut mmu, tid) = setup();
        mmu.write32(0x10_0100, 7).unwrap();
        set_args(&mut kernel, tid, nr::FUTEX, [0x10_0100, 0, 0, 0, 0, 0]);
        let outcome = kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(outcome, SyscallOutcome::Completed);
        assert_eq!(rax(&kernel, tid), -(Errno::EAGAIN.0 as i64));
    }

    #[test]
    fn futex_wait_with_matching_value_blocks() {
        let (mut kernel, mut mmu, tid) = setup();
        mmu.write32(0x10_0100, 7).unwrap();
        set_args(&mut kernel, tid, nr::FUTEX, [0x10_0100, 0, 7, 0, 0, 0]);
        let outcome = kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(outcome, SyscallOutcome::Blocked);
        // A wake makes it runnable again with RAX = 0.
        assert_eq!(kernel.sched.wake(0x10_0100, 1, u32::MAX), 1);
        assert_eq!(rax(&kernel, tid), 0);
    }

    #[test]
    fn futex_wake_reports_zero_without_waiters() {
        let (mut kernel, mut mmu, tid) = setup();
        set_args(&mut kernel, tid, nr::FUTEX, [0x10_0100, 1, 10, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), 0);
    }

    #[test]
    fn unknown_syscall_is_a_fatal_fault() {
        let (mut kernel, mut mmu, tid) = setup();
        set_args(&mut kernel, tid, 0x7777, [1, 2, 3, 4, 5, 6]);
        match kernel.dispatch(&mut mmu, tid) {
            Err(SysFault::UnknownSyscall { nr, args }) => {
                assert_eq!(nr, 0x7777);
                assert_eq!(args, [1, 2, 3, 4, 5, 6]);
            }
            other => panic!("expected a fatal fault, got {other:?}"),
        }
    }

    #[test]
    fn clone_with_fork_style_flags_is_a_fatal_diagnostic() {
        let (mut kernel, mut mmu, tid) = setup();
        // SIGCHLD-only, the fork() profile.
        set_args(&mut kernel, tid, nr::CLONE, [17, 0, 0, 0, 0, 0]);
        match kernel.dispatch(&mut mmu, tid) {
            Err(SysFault::CloneFlags { detail, .. }) => {
                assert!(detail.contains("expected"), "detail: {detail}");
            }
            other => panic!("expected a clone-flags fault, got {other:?}"),
        }
    }

    #[test]
    fn set_tid_address_records_and_returns_tid() {
        let (mut kernel, mut mmu, tid) = setup();
        set_args(&mut kernel, tid, nr::SET_TID_ADDRESS, [0x10_0200, 0, 0, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), tid as i64);
        assert_eq!(kernel.sched.thread(tid).clear_child_tid, 0x10_0200);
    }

    #[test]
    fn arch_prctl_set_fs_lands_in_the_saved_state() {
        let (mut kernel, mut mmu, tid) = setup();
        set_args(&mut kernel, tid, nr::ARCH_PRCTL, [0x1002, 0x10_0800, 0, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), 0);
        assert_eq!(kernel.sched.thread(tid).saved.fs_base, 0x10_0800);
    }

    #[test]
    fn sched_getaffinity_rejects_foreign_pids() {
        let (mut kernel, mut mmu, tid) = setup();
        set_args(&mut kernel, tid, nr::SCHED_GETAFFINITY, [1, 8, 0x10_0300, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), -(Errno::EPERM.0 as i64));
    }

    #[test]
    fn exit_terminates_only_the_calling_thread() {
        let (mut kernel, mut mmu, tid) = setup();
        let other = kernel.sched.allocate_thread();
        kernel.sched.add_ready(other);
        set_args(&mut kernel, tid, nr::EXIT, [5, 0, 0, 0, 0, 0]);
        let outcome = kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(outcome, SyscallOutcome::Exited);
        assert!(kernel.sched.thread(tid).is_terminated());
        assert!(!kernel.sched.thread(other).is_terminated());
    }

    #[test]
    fn absurd_mmap_length_returns_enomem_to_the_guest() {
        let (mut kernel, mut mmu, tid) = setup();
        // mmap(NULL, u64::MAX, RW, PRIVATE|ANON, -1, 0)
        set_args(
            &mut kernel,
            tid,
            nr::MMAP,
            [0, u64::MAX, 3, 0x22, u64::MAX, 0],
        );
        let outcome = kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(outcome, SyscallOutcome::Completed);
        assert_eq!(rax(&kernel, tid), -(Errno::ENOMEM.0 as i64));
    }

    #[test]
    fn wrapping_munmap_and_mprotect_return_einval_to_the_guest() {
        let (mut kernel, mut mmu, tid) = setup();
        let addr = 0xFFFF_FFFF_FFFF_F000u64;

        set_args(&mut kernel, tid, nr::MUNMAP, [addr, 0x2000, 0, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), -(Errno::EINVAL.0 as i64));

        set_args(&mut kernel, tid, nr::MPROTECT, [addr, 0x2000, 1, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), -(Errno::EINVAL.0 as i64));

        set_args(&mut kernel, tid, nr::MINCORE, [addr, 0x2000, 0x10_0000, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), -(Errno::ENOMEM.0 as i64));
    }

    #[test]
    fn unsupported_family_reports_enotsup() {
        let (mut kernel, mut mmu, tid) = setup();
        set_args(&mut kernel, tid, nr::EXECVE, [0, 0, 0, 0, 0, 0]);
        kernel.dispatch(&mut mmu, tid).unwrap();
        assert_eq!(rax(&kernel, tid), -(Errno::ENOTSUP.0 as i64));
    }
}
