//! Process identity, limits, and scheduling-policy stubs.

use strato_abi::Errno;
use tracing::warn;

use super::{ret, Control, SysCtx};
use crate::{host, SysFault};

pub(super) fn uname(ctx: &mut SysCtx<'_>, buf: u64) -> Result<Control, SysFault> {
    match host::uname() {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn sysinfo(ctx: &mut SysCtx<'_>, buf: u64) -> Result<Control, SysFault> {
    match host::sysinfo() {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn getcwd(ctx: &mut SysCtx<'_>, buf: u64, size: u64) -> Result<Control, SysFault> {
    match host::getcwd() {
        Ok(bytes) => {
            if bytes.len() as u64 > size {
                return ret(Err(Errno::ERANGE));
            }
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(bytes.len() as u64))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn getgroups(ctx: &mut SysCtx<'_>, size: u64, list: u64) -> Result<Control, SysFault> {
    match host::getgroups() {
        Ok(groups) => {
            if size == 0 {
                return ret(Ok(groups.len() as u64));
            }
            if (size as usize) < groups.len() {
                return ret(Err(Errno::EINVAL));
            }
            for (i, gid) in groups.iter().enumerate() {
                ctx.mmu.write32(list + i as u64 * 4, *gid)?;
            }
            ret(Ok(groups.len() as u64))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn getresuid(ctx: &mut SysCtx<'_>, r: u64, e: u64, s: u64) -> Result<Control, SysFault> {
    let uid = host::getuid();
    let euid = host::geteuid();
    ctx.mmu.write32(r, uid)?;
    ctx.mmu.write32(e, euid)?;
    ctx.mmu.write32(s, uid)?;
    ret(Ok(0))
}

pub(super) fn getresgid(ctx: &mut SysCtx<'_>, r: u64, e: u64, s: u64) -> Result<Control, SysFault> {
    let gid = host::getgid();
    let egid = host::getegid();
    ctx.mmu.write32(r, gid)?;
    ctx.mmu.write32(e, egid)?;
    ctx.mmu.write32(s, gid)?;
    ret(Ok(0))
}

pub(super) fn getrlimit(ctx: &mut SysCtx<'_>, resource: i32, rlim: u64) -> Result<Control, SysFault> {
    match host::getrlimit(resource) {
        Ok((cur, max)) => {
            ctx.mmu.write64(rlim, cur)?;
            ctx.mmu.write64(rlim + 8, max)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn prlimit64(
    ctx: &mut SysCtx<'_>,
    pid: i32,
    resource: i32,
    new_limit: u64,
    old_limit: u64,
) -> Result<Control, SysFault> {
    if pid != 0 && pid != ctx.sched.pid() {
        return ret(Err(Errno::EPERM));
    }
    if old_limit != 0 {
        match host::getrlimit(resource) {
            Ok((cur, max)) => {
                ctx.mmu.write64(old_limit, cur)?;
                ctx.mmu.write64(old_limit + 8, max)?;
            }
            Err(e) => return ret(Err(e)),
        }
    }
    if new_limit != 0 {
        // Accepted and ignored; the emulator does not enforce rlimits.
        warn!("prlimit64: ignoring new limit for resource {resource}");
    }
    ret(Ok(0))
}

pub(super) fn getrusage(ctx: &mut SysCtx<'_>, buf: u64) -> Result<Control, SysFault> {
    // A zeroed rusage keeps time-accounting callers happy without inventing
    // host numbers for guest work.
    let zero = [0u8; std::mem::size_of::<libc::rusage>()];
    ctx.mmu.copy_to_mmu(buf, &zero)?;
    ret(Ok(0))
}

pub(super) fn sched_getparam(ctx: &mut SysCtx<'_>, param: u64) -> Result<Control, SysFault> {
    ctx.mmu.write32(param, 0)?;
    ret(Ok(0))
}

pub(super) fn sched_getaffinity(
    ctx: &mut SysCtx<'_>,
    pid: i32,
    cpusetsize: u64,
    mask: u64,
) -> Result<Control, SysFault> {
    if pid != 0 {
        // Other processes are invisible from inside the emulator.
        return ret(Err(Errno::EPERM));
    }
    let cores = ctx.config.nb_cores.max(1).min(64);
    let bits: u64 = if cores == 64 { u64::MAX } else { (1 << cores) - 1 };
    let buf = vec![0u8; cpusetsize as usize];
    ctx.mmu.copy_to_mmu(mask, &buf)?;
    let word = bits.to_le_bytes();
    let n = (cpusetsize as usize).min(8);
    ctx.mmu.copy_to_mmu(mask, &word[..n])?;
    ret(Ok(1))
}

pub(super) fn prctl(_ctx: &mut SysCtx<'_>, option: i32) -> Result<Control, SysFault> {
    match option {
        libc::PR_SET_NAME => ret(Ok(0)),
        _ => {
            warn!("prctl option {option} not implemented");
            ret(Err(Errno::ENOTSUP))
        }
    }
}

pub(super) fn getrandom(ctx: &mut SysCtx<'_>, buf: u64, buflen: u64) -> Result<Control, SysFault> {
    match host::getrandom(buflen.min(1024 * 1024) as usize) {
        Ok(bytes) => {
            ctx.mmu.copy_to_mmu(buf, &bytes)?;
            ret(Ok(bytes.len() as u64))
        }
        Err(e) => ret(Err(e)),
    }
}
