//! clone(2) flag words and the clone3 argument block.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by clone/clone3. The low byte is the exit signal and is
    /// masked off before these bits are interpreted.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const VM = 0x0000_0100;
        const FS = 0x0000_0200;
        const FILES = 0x0000_0400;
        const SIGHAND = 0x0000_0800;
        const PIDFD = 0x0000_1000;
        const PTRACE = 0x0000_2000;
        const VFORK = 0x0000_4000;
        const PARENT = 0x0000_8000;
        const THREAD = 0x0001_0000;
        const NEWNS = 0x0002_0000;
        const SYSVSEM = 0x0004_0000;
        const SETTLS = 0x0008_0000;
        const PARENT_SETTID = 0x0010_0000;
        const CHILD_CLEARTID = 0x0020_0000;
        const DETACHED = 0x0040_0000;
        const UNTRACED = 0x0080_0000;
        const CHILD_SETTID = 0x0100_0000;
        const NEWCGROUP = 0x0200_0000;
        const NEWUTS = 0x0400_0000;
        const NEWIPC = 0x0800_0000;
        const NEWUSER = 0x1000_0000;
        const NEWPID = 0x2000_0000;
        const NEWNET = 0x4000_0000;
        const IO = 0x8000_0000;
        const CLEAR_SIGHAND = 0x1_0000_0000;
    }
}

/// Mask for the exit-signal byte carried in the clone flag word.
pub const CSIGNAL: u64 = 0xff;

/// The flag profile pthread_create uses (CLONE_SYSVSEM is tolerated on
/// top). Anything else is a fatal diagnostic; the emulator only supports
/// thread-style clones.
pub const PTHREAD_PROFILE: CloneFlags = CloneFlags::VM
    .union(CloneFlags::FS)
    .union(CloneFlags::FILES)
    .union(CloneFlags::SIGHAND)
    .union(CloneFlags::THREAD)
    .union(CloneFlags::SETTLS)
    .union(CloneFlags::PARENT_SETTID)
    .union(CloneFlags::CHILD_CLEARTID);

/// The fixed-layout head of `struct clone_args` (clone3). Later kernels
/// append fields; the size argument tells us how much the guest provided.
#[derive(Clone, Copy, Debug, Default)]
pub struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
}

impl CloneArgs {
    /// Minimum size a guest must pass for clone3 (CLONE_ARGS_SIZE_VER0).
    pub const SIZE_VER0: u64 = 64;

    /// Decode from the raw quadwords read out of guest memory.
    pub fn from_words(words: [u64; 8]) -> CloneArgs {
        CloneArgs {
            flags: words[0],
            pidfd: words[1],
            child_tid: words[2],
            parent_tid: words[3],
            exit_signal: words[4],
            stack: words[5],
            stack_size: words[6],
            tls: words[7],
        }
    }
}

/// Robust-list constants used during thread teardown.
pub mod robust {
    /// Bit set in a robust futex word when its owner dies.
    pub const FUTEX_OWNER_DIED: u32 = 0x4000_0000;
    /// Mask extracting the owner tid from a robust futex word.
    pub const FUTEX_TID_MASK: u32 = 0x3fff_ffff;
    /// Upper bound on list traversal, matching the kernel's ROBUST_LIST_LIMIT.
    pub const LIST_LIMIT: usize = 2048;
}
