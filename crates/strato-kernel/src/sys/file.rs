//! File, descriptor, and metadata syscalls.

use strato_abi::Errno;

use super::{ret, Control, SysCtx};
use crate::{host, SysFault};

/// Upper bound on one transfer; keeps a hostile count from ballooning host
/// allocations.
const MAX_IO: u64 = 0x1000_0000;

pub(super) fn read(ctx: &mut SysCtx<'_>, fd: i32, buf: u64, count: u64) -> Result<Control, SysFault> {
    let count = count.min(MAX_IO) as usize;
    match ctx.files.read(fd, count) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(bytes.len() as u64))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn write(ctx: &mut SysCtx<'_>, fd: i32, buf: u64, count: u64) -> Result<Control, SysFault> {
    let bytes = ctx.mmu.copy_from_mmu(buf, count.min(MAX_IO))?;
    ret(ctx.files.write(fd, &bytes))
}

pub(super) fn open(ctx: &mut SysCtx<'_>, path: u64, flags: i32, mode: u32) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    ret(ctx.files.open(&path, flags, mode).map(|fd| fd as u64))
}

pub(super) fn openat(
    ctx: &mut SysCtx<'_>,
    dirfd: i32,
    path: u64,
    flags: i32,
    mode: u32,
) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    ret(ctx.files.openat(dirfd, &path, flags, mode).map(|fd| fd as u64))
}

pub(super) fn stat(ctx: &mut SysCtx<'_>, path: u64, statbuf: u64) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let resolved = ctx.files.resolve_path(&path);
    match host::stat(&resolved) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(statbuf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn lstat(ctx: &mut SysCtx<'_>, path: u64, statbuf: u64) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let resolved = ctx.files.resolve_path(&path);
    match host::lstat(&resolved) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(statbuf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn fstat(ctx: &mut SysCtx<'_>, fd: i32, statbuf: u64) -> Result<Control, SysFault> {
    match ctx.files.fstat(fd) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(statbuf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn fstatat(
    ctx: &mut SysCtx<'_>,
    dirfd: i32,
    path: u64,
    statbuf: u64,
    flags: i32,
) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    if path.is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
        return fstat(ctx, dirfd, statbuf);
    }
    let dirfd = if path.starts_with('/') || dirfd == libc::AT_FDCWD {
        libc::AT_FDCWD
    } else {
        match ctx.files.host_fd(dirfd) {
            Ok(fd) => fd,
            Err(e) => return ret(Err(e)),
        }
    };
    let resolved = ctx.files.resolve_path(&path);
    match host::fstatat(dirfd, &resolved, flags) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(statbuf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn statx(
    ctx: &mut SysCtx<'_>,
    dirfd: i32,
    path: u64,
    flags: i32,
    mask: u32,
    statxbuf: u64,
) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let dirfd = if path.starts_with('/') || dirfd == libc::AT_FDCWD {
        libc::AT_FDCWD
    } else {
        match ctx.files.host_fd(dirfd) {
            Ok(fd) => fd,
            Err(e) => return ret(Err(e)),
        }
    };
    let resolved = ctx.files.resolve_path(&path);
    match host::statx(dirfd, &resolved, flags, mask) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(statxbuf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn statfs(ctx: &mut SysCtx<'_>, path: u64, buf: u64) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    match host::statfs(&path) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn fstatfs(ctx: &mut SysCtx<'_>, fd: i32, buf: u64) -> Result<Control, SysFault> {
    let host_fd = match ctx.files.host_fd(fd) {
        Ok(fd) => fd,
        Err(e) => return ret(Err(e)),
    };
    match host::fstatfs(host_fd) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn ioctl(ctx: &mut SysCtx<'_>, fd: i32, request: u64, argp: u64) -> Result<Control, SysFault> {
    match ctx.files.ioctl(fd, request) {
        Ok(bytes) => {
            if argp != 0 {
                ctx.mmu.copy_to_mmu(argp, &bytes)?;
            }
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn pread(
    ctx: &mut SysCtx<'_>,
    fd: i32,
    buf: u64,
    count: u64,
    offset: i64,
) -> Result<Control, SysFault> {
    match ctx.files.pread(fd, count.min(MAX_IO) as usize, offset) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(bytes.len() as u64))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn pwrite(
    ctx: &mut SysCtx<'_>,
    fd: i32,
    buf: u64,
    count: u64,
    offset: i64,
) -> Result<Control, SysFault> {
    let bytes = ctx.mmu.copy_from_mmu(buf, count.min(MAX_IO))?;
    ret(ctx.files.pwrite(fd, &bytes, offset))
}

fn read_iovecs(ctx: &SysCtx<'_>, iov: u64, iovcnt: u64) -> Result<Vec<(u64, u64)>, SysFault> {
    let mut out = Vec::new();
    for i in 0..iovcnt.min(1024) {
        let base = ctx.mmu.read64(iov + i * 16)?;
        let len = ctx.mmu.read64(iov + i * 16 + 8)?;
        out.push((base, len));
    }
    Ok(out)
}

pub(super) fn readv(ctx: &mut SysCtx<'_>, fd: i32, iov: u64, iovcnt: u64) -> Result<Control, SysFault> {
    let iovecs = read_iovecs(ctx, iov, iovcnt)?;
    let mut total = 0u64;
    for (base, len) in iovecs {
        match ctx.files.read(fd, len.min(MAX_IO) as usize) {
            Ok(bytes) => {
                ctx.mmu.copy_to_mmu(base, &bytes)?;
                total += bytes.len() as u64;
                if (bytes.len() as u64) < len {
                    break;
                }
            }
            Err(e) => {
                if total == 0 {
                    return ret(Err(e));
                }
                break;
            }
        }
    }
    ret(Ok(total))
}

pub(super) fn writev(ctx: &mut SysCtx<'_>, fd: i32, iov: u64, iovcnt: u64) -> Result<Control, SysFault> {
    let iovecs = read_iovecs(ctx, iov, iovcnt)?;
    let mut total = 0u64;
    for (base, len) in iovecs {
        if len == 0 {
            continue;
        }
        let bytes = ctx.mmu.copy_from_mmu(base, len.min(MAX_IO))?;
        match ctx.files.write(fd, &bytes) {
            Ok(n) => {
                total += n;
                if n < bytes.len() as u64 {
                    break;
                }
            }
            Err(e) => {
                if total == 0 {
                    return ret(Err(e));
                }
                break;
            }
        }
    }
    ret(Ok(total))
}

pub(super) fn access(ctx: &mut SysCtx<'_>, path: u64, mode: i32) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let resolved = ctx.files.resolve_path(&path);
    ret(host::access(&resolved, mode))
}

pub(super) fn faccessat(
    ctx: &mut SysCtx<'_>,
    dirfd: i32,
    path: u64,
    mode: i32,
) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let dirfd = if path.starts_with('/') || dirfd == libc::AT_FDCWD {
        libc::AT_FDCWD
    } else {
        match ctx.files.host_fd(dirfd) {
            Ok(fd) => fd,
            Err(e) => return ret(Err(e)),
        }
    };
    ret(host::faccessat(dirfd, &path, mode))
}

pub(super) fn pipe(ctx: &mut SysCtx<'_>, fds_ptr: u64, _flags: i32) -> Result<Control, SysFault> {
    let (r, w) = ctx.files.pipe();
    ctx.mmu.write32(fds_ptr, r as u32)?;
    ctx.mmu.write32(fds_ptr + 4, w as u32)?;
    ret(Ok(0))
}

pub(super) fn eventfd2(ctx: &mut SysCtx<'_>, initval: u32, flags: i32) -> Result<Control, SysFault> {
    let semaphore = flags & 1 != 0; // EFD_SEMAPHORE
    ret(Ok(ctx.files.eventfd(initval, semaphore) as u64))
}

pub(super) fn memfd_create(ctx: &mut SysCtx<'_>, name: u64) -> Result<Control, SysFault> {
    let name = ctx.read_str(name)?;
    ret(Ok(ctx.files.memfd_create(name) as u64))
}

pub(super) fn epoll_ctl(
    ctx: &mut SysCtx<'_>,
    epfd: i32,
    op: i32,
    fd: i32,
    event_ptr: u64,
) -> Result<Control, SysFault> {
    let (events, data) = if event_ptr != 0 {
        let mut raw = [0u8; 12];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = ctx.mmu.read8(event_ptr + i as u64)?;
        }
        let ev = strato_abi::types::EpollEvent::from_bytes(raw);
        (ev.events, ev.data)
    } else {
        (0, 0)
    };
    ret(ctx.files.epoll_ctl(epfd, op, fd, events, data))
}

pub(super) fn getdents64(ctx: &mut SysCtx<'_>, fd: i32, dirp: u64, count: u64) -> Result<Control, SysFault> {
    match ctx.files.getdents64(fd, count.min(MAX_IO) as usize) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(dirp, &bytes)?;
            ret(Ok(bytes.len() as u64))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn readlink(ctx: &mut SysCtx<'_>, path: u64, buf: u64, bufsize: u64) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let resolved = ctx.files.resolve_path(&path);
    // /proc/self/exe resolves internally; everything else asks the host.
    if resolved != path {
        let n = ctx.write_back(buf, resolved.as_bytes(), bufsize as usize)?;
        return ret(Ok(n));
    }
    match host::readlink(&resolved, bufsize as usize) {
        Ok(bytes) => {
            let n = ctx.write_back(buf, &bytes, bufsize as usize)?;
            ret(Ok(n))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn readlinkat(
    ctx: &mut SysCtx<'_>,
    dirfd: i32,
    path: u64,
    buf: u64,
    bufsize: u64,
) -> Result<Control, SysFault> {
    let p = ctx.mmu.read_cstring(path)?;
    if p.starts_with('/') || dirfd == libc::AT_FDCWD {
        return readlink(ctx, path, buf, bufsize);
    }
    ret(Err(Errno::EINVAL))
}

pub(super) fn chdir(ctx: &mut SysCtx<'_>, path: u64) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    ret(host::chdir(&path))
}

pub(super) fn rename(ctx: &mut SysCtx<'_>, old: u64, new: u64) -> Result<Control, SysFault> {
    let old = ctx.read_str(old)?;
    let new = ctx.read_str(new)?;
    ret(host::rename(&old, &new))
}

pub(super) fn mkdir(ctx: &mut SysCtx<'_>, path: u64, mode: u32) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    ret(host::mkdir(&path, mode))
}

pub(super) fn unlink(ctx: &mut SysCtx<'_>, path: u64) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    ret(host::unlink(&path))
}

pub(super) fn unlinkat(ctx: &mut SysCtx<'_>, dirfd: i32, path: u64, flags: i32) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let dirfd = if path.starts_with('/') || dirfd == libc::AT_FDCWD {
        libc::AT_FDCWD
    } else {
        match ctx.files.host_fd(dirfd) {
            Ok(fd) => fd,
            Err(e) => return ret(Err(e)),
        }
    };
    ret(host::unlinkat(dirfd, &path, flags))
}

pub(super) fn truncate(ctx: &mut SysCtx<'_>, path: u64, length: i64) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    ret(host::truncate(&path, length))
}

pub(super) fn ftruncate(ctx: &mut SysCtx<'_>, fd: i32, length: i64) -> Result<Control, SysFault> {
    let host_fd = match ctx.files.host_fd(fd) {
        Ok(fd) => fd,
        Err(e) => return ret(Err(e)),
    };
    ret(host::ftruncate(host_fd, length))
}

pub(super) fn getxattr(
    ctx: &mut SysCtx<'_>,
    path: u64,
    name: u64,
    value: u64,
    size: u64,
    no_follow: bool,
) -> Result<Control, SysFault> {
    let path = ctx.read_str(path)?;
    let name = ctx.read_str(name)?;
    let result = if no_follow {
        host::lgetxattr(&path, &name, size as usize)
    } else {
        host::getxattr(&path, &name, size as usize)
    };
    match result {
        Ok(bytes) => {
            if size != 0 {
                ctx.mmu.copy_to_mmu(value, &bytes)?;
            }
            ret(Ok(bytes.len() as u64))
        }
        Err(e) => ret(Err(e)),
    }
}
