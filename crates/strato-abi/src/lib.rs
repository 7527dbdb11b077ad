//! Linux x86-64 ABI surface shared by the kernel emulation and the loader.
//!
//! One crate owns the numbers: syscall numbers, errno values, the constant
//! vocabularies of futex/clone/poll/epoll, auxiliary-vector keys, and the few
//! guest-memory struct layouts the emulator parses itself. Everything here is
//! bit-exact against the Linux x86-64 ABI; the syscall dispatcher matches
//! these numbers directly against guest RAX.

pub mod auxv;
pub mod clone;
pub mod errno;
pub mod futex;
pub mod nr;
pub mod poll;
pub mod types;

pub use errno::Errno;

/// Result type of a syscall handler: either a value for RAX or a guest errno.
///
/// The dispatcher encodes `Err(e)` as `-e` in RAX; handlers never see Rust
/// errors for guest-observable failures.
pub type SysResult = Result<u64, Errno>;

/// Encode a handler result into the RAX return-value convention.
pub fn encode_result(res: SysResult) -> u64 {
    match res {
        Ok(v) => v,
        Err(e) => (-(e.0 as i64)) as u64,
    }
}
