//! Syscall numbers from the Linux x86-64 syscall table.

pub const READ: u64 = 0;
pub const WRITE: u64 = 1;
pub const OPEN: u64 = 2;
pub const CLOSE: u64 = 3;
pub const STAT: u64 = 4;
pub const FSTAT: u64 = 5;
pub const LSTAT: u64 = 6;
pub const POLL: u64 = 7;
pub const LSEEK: u64 = 8;
pub const MMAP: u64 = 9;
pub const MPROTECT: u64 = 10;
pub const MUNMAP: u64 = 11;
pub const BRK: u64 = 12;
pub const RT_SIGACTION: u64 = 13;
pub const RT_SIGPROCMASK: u64 = 14;
pub const IOCTL: u64 = 16;
pub const PREAD64: u64 = 17;
pub const PWRITE64: u64 = 18;
pub const READV: u64 = 19;
pub const WRITEV: u64 = 20;
pub const ACCESS: u64 = 21;
pub const PIPE: u64 = 22;
pub const SELECT: u64 = 23;
pub const SCHED_YIELD: u64 = 24;
pub const MREMAP: u64 = 25;
pub const MSYNC: u64 = 26;
pub const MINCORE: u64 = 27;
pub const MADVISE: u64 = 28;
pub const SHMGET: u64 = 29;
pub const SHMAT: u64 = 30;
pub const SHMCTL: u64 = 31;
pub const DUP: u64 = 32;
pub const DUP2: u64 = 33;
pub const NANOSLEEP: u64 = 35;
pub const SETITIMER: u64 = 38;
pub const GETPID: u64 = 39;
pub const SOCKET: u64 = 41;
pub const CONNECT: u64 = 42;
pub const SENDTO: u64 = 44;
pub const RECVFROM: u64 = 45;
pub const SENDMSG: u64 = 46;
pub const RECVMSG: u64 = 47;
pub const SHUTDOWN: u64 = 48;
pub const BIND: u64 = 49;
pub const LISTEN: u64 = 50;
pub const GETSOCKNAME: u64 = 51;
pub const GETPEERNAME: u64 = 52;
pub const SOCKETPAIR: u64 = 53;
pub const SETSOCKOPT: u64 = 54;
pub const GETSOCKOPT: u64 = 55;
pub const CLONE: u64 = 56;
pub const EXECVE: u64 = 59;
pub const EXIT: u64 = 60;
pub const KILL: u64 = 62;
pub const UNAME: u64 = 63;
pub const SHMDT: u64 = 67;
pub const FCNTL: u64 = 72;
pub const FLOCK: u64 = 73;
pub const FSYNC: u64 = 74;
pub const FDATASYNC: u64 = 75;
pub const TRUNCATE: u64 = 76;
pub const FTRUNCATE: u64 = 77;
pub const GETCWD: u64 = 79;
pub const CHDIR: u64 = 80;
pub const RENAME: u64 = 82;
pub const MKDIR: u64 = 83;
pub const UNLINK: u64 = 87;
pub const READLINK: u64 = 89;
pub const CHMOD: u64 = 90;
pub const FCHMOD: u64 = 91;
pub const CHOWN: u64 = 92;
pub const FCHOWN: u64 = 93;
pub const UMASK: u64 = 95;
pub const GETTIMEOFDAY: u64 = 96;
pub const GETRLIMIT: u64 = 97;
pub const GETRUSAGE: u64 = 98;
pub const SYSINFO: u64 = 99;
pub const TIMES: u64 = 100;
pub const GETUID: u64 = 102;
pub const GETGID: u64 = 104;
pub const GETEUID: u64 = 107;
pub const GETEGID: u64 = 108;
pub const GETPPID: u64 = 110;
pub const GETPGRP: u64 = 111;
pub const GETGROUPS: u64 = 115;
pub const GETRESUID: u64 = 118;
pub const GETRESGID: u64 = 120;
pub const RT_SIGTIMEDWAIT: u64 = 128;
pub const SIGALTSTACK: u64 = 131;
pub const UTIME: u64 = 132;
pub const STATFS: u64 = 137;
pub const FSTATFS: u64 = 138;
pub const SETPRIORITY: u64 = 141;
pub const SCHED_GETPARAM: u64 = 143;
pub const SCHED_SETSCHEDULER: u64 = 144;
pub const SCHED_GETSCHEDULER: u64 = 145;
pub const MLOCK: u64 = 149;
pub const MUNLOCK: u64 = 150;
pub const PRCTL: u64 = 157;
pub const ARCH_PRCTL: u64 = 158;
pub const GETTID: u64 = 186;
pub const GETXATTR: u64 = 191;
pub const LGETXATTR: u64 = 192;
pub const LISTXATTR: u64 = 194;
pub const TIME: u64 = 201;
pub const FUTEX: u64 = 202;
pub const SCHED_SETAFFINITY: u64 = 203;
pub const SCHED_GETAFFINITY: u64 = 204;
pub const GETDENTS64: u64 = 217;
pub const SET_TID_ADDRESS: u64 = 218;
pub const FADVISE64: u64 = 221;
pub const CLOCK_GETTIME: u64 = 228;
pub const CLOCK_GETRES: u64 = 229;
pub const CLOCK_NANOSLEEP: u64 = 230;
pub const EXIT_GROUP: u64 = 231;
pub const EPOLL_WAIT: u64 = 232;
pub const EPOLL_CTL: u64 = 233;
pub const TGKILL: u64 = 234;
pub const MBIND: u64 = 237;
pub const WAITID: u64 = 247;
pub const INOTIFY_INIT: u64 = 253;
pub const INOTIFY_ADD_WATCH: u64 = 254;
pub const OPENAT: u64 = 257;
pub const NEWFSTATAT: u64 = 262;
pub const UNLINKAT: u64 = 263;
pub const LINKAT: u64 = 265;
pub const READLINKAT: u64 = 267;
pub const FACCESSAT: u64 = 269;
pub const PSELECT6: u64 = 270;
pub const PPOLL: u64 = 271;
pub const SET_ROBUST_LIST: u64 = 273;
pub const GET_ROBUST_LIST: u64 = 274;
pub const UTIMENSAT: u64 = 280;
pub const FALLOCATE: u64 = 285;
pub const EVENTFD2: u64 = 290;
pub const EPOLL_CREATE1: u64 = 291;
pub const DUP3: u64 = 292;
pub const PIPE2: u64 = 293;
pub const INOTIFY_INIT1: u64 = 294;
pub const PRLIMIT64: u64 = 302;
pub const SCHED_SETATTR: u64 = 314;
pub const SCHED_GETATTR: u64 = 315;
pub const GETRANDOM: u64 = 318;
pub const MEMFD_CREATE: u64 = 319;
pub const STATX: u64 = 332;
pub const CLONE3: u64 = 435;

/// Printable name for diagnostics; unknown numbers render as the raw value.
pub fn name(nr: u64) -> &'static str {
    match nr {
        READ => "read",
        WRITE => "write",
        OPEN => "open",
        CLOSE => "close",
        STAT => "stat",
        FSTAT => "fstat",
        LSTAT => "lstat",
        POLL => "poll",
        LSEEK => "lseek",
        MMAP => "mmap",
        MPROTECT => "mprotect",
        MUNMAP => "munmap",
        BRK => "brk",
        RT_SIGACTION => "rt_sigaction",
        RT_SIGPROCMASK => "rt_sigprocmask",
        IOCTL => "ioctl",
        PREAD64 => "pread64",
        PWRITE64 => "pwrite64",
        READV => "readv",
        WRITEV => "writev",
        ACCESS => "access",
        PIPE => "pipe",
        SELECT => "select",
        SCHED_YIELD => "sched_yield",
        MREMAP => "mremap",
        MSYNC => "msync",
        MINCORE => "mincore",
        MADVISE => "madvise",
        SHMGET => "shmget",
        SHMAT => "shmat",
        SHMCTL => "shmctl",
        DUP => "dup",
        DUP2 => "dup2",
        NANOSLEEP => "nanosleep",
        SETITIMER => "setitimer",
        GETPID => "getpid",
        SOCKET => "socket",
        CONNECT => "connect",
        SENDTO => "sendto",
        RECVFROM => "recvfrom",
        SENDMSG => "sendmsg",
        RECVMSG => "recvmsg",
        SHUTDOWN => "shutdown",
        BIND => "bind",
        LISTEN => "listen",
        GETSOCKNAME => "getsockname",
        GETPEERNAME => "getpeername",
        SOCKETPAIR => "socketpair",
        SETSOCKOPT => "setsockopt",
        GETSOCKOPT => "getsockopt",
        CLONE => "clone",
        EXECVE => "execve",
        EXIT => "exit",
        KILL => "kill",
        UNAME => "uname",
        SHMDT => "shmdt",
        FCNTL => "fcntl",
        FLOCK => "flock",
        FSYNC => "fsync",
        FDATASYNC => "fdatasync",
        TRUNCATE => "truncate",
        FTRUNCATE => "ftruncate",
        GETCWD => "getcwd",
        CHDIR => "chdir",
        RENAME => "rename",
        MKDIR => "mkdir",
        UNLINK => "unlink",
        READLINK => "readlink",
        CHMOD => "chmod",
        FCHMOD => "fchmod",
        CHOWN => "chown",
        FCHOWN => "fchown",
        UMASK => "umask",
        GETTIMEOFDAY => "gettimeofday",
        GETRLIMIT => "getrlimit",
        GETRUSAGE => "getrusage",
        SYSINFO => "sysinfo",
        TIMES => "times",
        GETUID => "getuid",
        GETGID => "getgid",
        GETEUID => "geteuid",
        GETEGID => "getegid",
        GETPPID => "getppid",
        GETPGRP => "getpgrp",
        GETGROUPS => "getgroups",
        GETRESUID => "getresuid",
        GETRESGID => "getresgid",
        RT_SIGTIMEDWAIT => "rt_sigtimedwait",
        SIGALTSTACK => "sigaltstack",
        UTIME => "utime",
        STATFS => "statfs",
        FSTATFS => "fstatfs",
        SETPRIORITY => "setpriority",
        SCHED_GETPARAM => "sched_getparam",
        SCHED_SETSCHEDULER => "sched_setscheduler",
        SCHED_GETSCHEDULER => "sched_getscheduler",
        MLOCK => "mlock",
        MUNLOCK => "munlock",
        PRCTL => "prctl",
        ARCH_PRCTL => "arch_prctl",
        GETTID => "gettid",
        GETXATTR => "getxattr",
        LGETXATTR => "lgetxattr",
        LISTXATTR => "listxattr",
        TIME => "time",
        FUTEX => "futex",
        SCHED_SETAFFINITY => "sched_setaffinity",
        SCHED_GETAFFINITY => "sched_getaffinity",
        GETDENTS64 => "getdents64",
        SET_TID_ADDRESS => "set_tid_address",
        FADVISE64 => "fadvise64",
        CLOCK_GETTIME => "clock_gettime",
        CLOCK_GETRES => "clock_getres",
        CLOCK_NANOSLEEP => "clock_nanosleep",
        EXIT_GROUP => "exit_group",
        EPOLL_WAIT => "epoll_wait",
        EPOLL_CTL => "epoll_ctl",
        TGKILL => "tgkill",
        MBIND => "mbind",
        WAITID => "waitid",
        INOTIFY_INIT => "inotify_init",
        INOTIFY_ADD_WATCH => "inotify_add_watch",
        OPENAT => "openat",
        NEWFSTATAT => "newfstatat",
        UNLINKAT => "unlinkat",
        LINKAT => "linkat",
        READLINKAT => "readlinkat",
        FACCESSAT => "faccessat",
        PSELECT6 => "pselect6",
        PPOLL => "ppoll",
        SET_ROBUST_LIST => "set_robust_list",
        GET_ROBUST_LIST => "get_robust_list",
        UTIMENSAT => "utimensat",
        FALLOCATE => "fallocate",
        EVENTFD2 => "eventfd2",
        EPOLL_CREATE1 => "epoll_create1",
        DUP3 => "dup3",
        PIPE2 => "pipe2",
        INOTIFY_INIT1 => "inotify_init1",
        PRLIMIT64 => "prlimit64",
        SCHED_SETATTR => "sched_setattr",
        SCHED_GETATTR => "sched_getattr",
        GETRANDOM => "getrandom",
        MEMFD_CREATE => "memfd_create",
        STATX => "statx",
        CLONE3 => "clone3",
        _ => "?",
    }
}
