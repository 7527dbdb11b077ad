//! Thin host wrappers.
//!
//! Syscalls in the "trivially delegated" category land here: the dispatcher
//! copies guest arguments out, we make the host call through `libc`, and the
//! resulting bytes are copied back into guest memory verbatim (host and
//! guest share the x86-64 struct layouts). Host errno becomes guest errno at
//! this boundary and nowhere else.

use std::ffi::CString;
use std::mem::{size_of, MaybeUninit};

use strato_abi::Errno;

pub type HostResult<T> = Result<T, Errno>;

fn errno() -> Errno {
    Errno::from_host(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
}

fn check_i64(ret: i64) -> HostResult<u64> {
    if ret < 0 {
        Err(errno())
    } else {
        Ok(ret as u64)
    }
}

fn check_i32(ret: i32) -> HostResult<u64> {
    check_i64(ret as i64)
}

fn cstring(s: &str) -> HostResult<CString> {
    CString::new(s).map_err(|_| Errno::EINVAL)
}

/// View a plain-old-data host struct as bytes for copying into the guest.
fn struct_bytes<T>(v: &T) -> Vec<u8> {
    let ptr = v as *const T as *const u8;
    unsafe { std::slice::from_raw_parts(ptr, size_of::<T>()) }.to_vec()
}

pub fn getpid() -> i32 {
    unsafe { libc::getpid() }
}

pub fn getppid() -> i32 {
    unsafe { libc::getppid() }
}

pub fn getuid() -> u32 {
    unsafe { libc::getuid() }
}

pub fn geteuid() -> u32 {
    unsafe { libc::geteuid() }
}

pub fn getgid() -> u32 {
    unsafe { libc::getgid() }
}

pub fn getegid() -> u32 {
    unsafe { libc::getegid() }
}

pub fn getpgrp() -> i32 {
    unsafe { libc::getpgrp() }
}

pub fn getgroups() -> HostResult<Vec<u32>> {
    let mut groups = vec![0u32; 64];
    let n = unsafe { libc::getgroups(groups.len() as i32, groups.as_mut_ptr()) };
    check_i32(n)?;
    groups.truncate(n as usize);
    Ok(groups)
}

pub fn uname() -> HostResult<Vec<u8>> {
    let mut buf = MaybeUninit::<libc::utsname>::zeroed();
    check_i32(unsafe { libc::uname(buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn sysinfo() -> HostResult<Vec<u8>> {
    let mut buf = MaybeUninit::<libc::sysinfo>::zeroed();
    check_i32(unsafe { libc::sysinfo(buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn getcwd() -> HostResult<Vec<u8>> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let ret = unsafe { libc::getcwd(buf.as_mut_ptr() as *mut i8, buf.len()) };
    if ret.is_null() {
        return Err(errno());
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    buf.truncate(len + 1);
    Ok(buf)
}

pub fn chdir(path: &str) -> HostResult<u64> {
    let path = cstring(path)?;
    check_i32(unsafe { libc::chdir(path.as_ptr()) })
}

pub fn readlink(path: &str, bufsize: usize) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let mut buf = vec![0u8; bufsize.min(libc::PATH_MAX as usize)];
    let n = unsafe { libc::readlink(path.as_ptr(), buf.as_mut_ptr() as *mut i8, buf.len()) };
    check_i64(n as i64)?;
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn open(path: &str, flags: i32, mode: u32) -> HostResult<i32> {
    let path = cstring(path)?;
    let fd = unsafe { libc::open(path.as_ptr(), flags, mode) };
    check_i32(fd)?;
    Ok(fd)
}

pub fn openat(dirfd: i32, path: &str, flags: i32, mode: u32) -> HostResult<i32> {
    let path = cstring(path)?;
    let fd = unsafe { libc::openat(dirfd, path.as_ptr(), flags, mode) };
    check_i32(fd)?;
    Ok(fd)
}

pub fn close(fd: i32) -> HostResult<u64> {
    check_i32(unsafe { libc::close(fd) })
}

pub fn dup(fd: i32) -> HostResult<i32> {
    let new = unsafe { libc::dup(fd) };
    check_i32(new)?;
    Ok(new)
}

pub fn read(fd: i32, count: usize) -> HostResult<Vec<u8>> {
    let mut buf = vec![0u8; count];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    check_i64(n as i64)?;
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn write(fd: i32, bytes: &[u8]) -> HostResult<u64> {
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    check_i64(n as i64)
}

pub fn pread(fd: i32, count: usize, offset: i64) -> HostResult<Vec<u8>> {
    let mut buf = vec![0u8; count];
    let n =
        unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset) };
    check_i64(n as i64)?;
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn pwrite(fd: i32, bytes: &[u8], offset: i64) -> HostResult<u64> {
    let n = unsafe {
        libc::pwrite(fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), offset)
    };
    check_i64(n as i64)
}

pub fn lseek(fd: i32, offset: i64, whence: i32) -> HostResult<u64> {
    check_i64(unsafe { libc::lseek(fd, offset, whence) })
}

pub fn fstat(fd: i32) -> HostResult<Vec<u8>> {
    let mut buf = MaybeUninit::<libc::stat>::zeroed();
    check_i32(unsafe { libc::fstat(fd, buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn stat(path: &str) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let mut buf = MaybeUninit::<libc::stat>::zeroed();
    check_i32(unsafe { libc::stat(path.as_ptr(), buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn lstat(path: &str) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let mut buf = MaybeUninit::<libc::stat>::zeroed();
    check_i32(unsafe { libc::lstat(path.as_ptr(), buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn fstatat(dirfd: i32, path: &str, flags: i32) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let mut buf = MaybeUninit::<libc::stat>::zeroed();
    check_i32(unsafe { libc::fstatat(dirfd, path.as_ptr(), buf.as_mut_ptr(), flags) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn statx(dirfd: i32, path: &str, flags: i32, mask: u32) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let mut buf = MaybeUninit::<libc::statx>::zeroed();
    check_i32(unsafe { libc::statx(dirfd, path.as_ptr(), flags, mask, buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn statfs(path: &str) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let mut buf = MaybeUninit::<libc::statfs>::zeroed();
    check_i32(unsafe { libc::statfs(path.as_ptr(), buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn fstatfs(fd: i32) -> HostResult<Vec<u8>> {
    let mut buf = MaybeUninit::<libc::statfs>::zeroed();
    check_i32(unsafe { libc::fstatfs(fd, buf.as_mut_ptr()) })?;
    Ok(struct_bytes(&unsafe { buf.assume_init() }))
}

pub fn access(path: &str, mode: i32) -> HostResult<u64> {
    let path = cstring(path)?;
    check_i32(unsafe { libc::access(path.as_ptr(), mode) })
}

pub fn faccessat(dirfd: i32, path: &str, mode: i32) -> HostResult<u64> {
    let path = cstring(path)?;
    check_i32(unsafe { libc::faccessat(dirfd, path.as_ptr(), mode, 0) })
}

pub fn unlink(path: &str) -> HostResult<u64> {
    let path = cstring(path)?;
    check_i32(unsafe { libc::unlink(path.as_ptr()) })
}

pub fn unlinkat(dirfd: i32, path: &str, flags: i32) -> HostResult<u64> {
    let path = cstring(path)?;
    check_i32(unsafe { libc::unlinkat(dirfd, path.as_ptr(), flags) })
}

pub fn rename(old: &str, new: &str) -> HostResult<u64> {
    let old = cstring(old)?;
    let new = cstring(new)?;
    check_i32(unsafe { libc::rename(old.as_ptr(), new.as_ptr()) })
}

pub fn mkdir(path: &str, mode: u32) -> HostResult<u64> {
    let path = cstring(path)?;
    check_i32(unsafe { libc::mkdir(path.as_ptr(), mode) })
}

pub fn truncate(path: &str, length: i64) -> HostResult<u64> {
    let path = cstring(path)?;
    check_i32(unsafe { libc::truncate(path.as_ptr(), length) })
}

pub fn ftruncate(fd: i32, length: i64) -> HostResult<u64> {
    check_i32(unsafe { libc::ftruncate(fd, length) })
}

pub fn getdents64(fd: i32, count: usize) -> HostResult<Vec<u8>> {
    let mut buf = vec![0u8; count];
    let n = unsafe {
        libc::syscall(
            libc::SYS_getdents64,
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    check_i64(n)?;
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn clock_gettime(clockid: i32) -> HostResult<(u64, u64)> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    check_i32(unsafe { libc::clock_gettime(clockid, &mut ts) })?;
    Ok((ts.tv_sec as u64, ts.tv_nsec as u64))
}

pub fn clock_getres(clockid: i32) -> HostResult<(u64, u64)> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    check_i32(unsafe { libc::clock_getres(clockid, &mut ts) })?;
    Ok((ts.tv_sec as u64, ts.tv_nsec as u64))
}

pub fn getrandom(len: usize) -> HostResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let n = unsafe { libc::getrandom(buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    check_i64(n as i64)?;
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn getrlimit(resource: i32) -> HostResult<(u64, u64)> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    check_i32(unsafe { libc::getrlimit(resource as u32, &mut lim) })?;
    Ok((lim.rlim_cur, lim.rlim_max))
}

pub fn getxattr(path: &str, name: &str, size: usize) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let name = cstring(name)?;
    let mut buf = vec![0u8; size.max(1)];
    let n = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            size,
        )
    };
    check_i64(n as i64)?;
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn lgetxattr(path: &str, name: &str, size: usize) -> HostResult<Vec<u8>> {
    let path = cstring(path)?;
    let name = cstring(name)?;
    let mut buf = vec![0u8; size.max(1)];
    let n = unsafe {
        libc::lgetxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            size,
        )
    };
    check_i64(n as i64)?;
    buf.truncate(n as usize);
    Ok(buf)
}

/// Non-blocking readiness query for a host fd, used by the poll/select
/// emulation for stdio and regular files.
pub fn poll_one(fd: i32, events: i16) -> i16 {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 0) };
    if n <= 0 {
        0
    } else {
        pfd.revents
    }
}

/// Terminal ioctls for the passthrough stdio descriptors.
pub fn ioctl_passthrough(fd: i32, request: u64) -> HostResult<Vec<u8>> {
    match request {
        r if r == libc::TIOCGWINSZ => {
            let mut ws = MaybeUninit::<libc::winsize>::zeroed();
            check_i32(unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, ws.as_mut_ptr()) })?;
            Ok(struct_bytes(&unsafe { ws.assume_init() }))
        }
        r if r == libc::TCGETS => {
            let mut tio = MaybeUninit::<libc::termios>::zeroed();
            check_i32(unsafe { libc::ioctl(fd, libc::TCGETS, tio.as_mut_ptr()) })?;
            Ok(struct_bytes(&unsafe { tio.assume_init() }))
        }
        _ => Err(Errno::ENOTTY),
    }
}
