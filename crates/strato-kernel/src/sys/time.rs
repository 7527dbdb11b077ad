//! Clocks and sleeping.
//!
//! Wall-clock reads are delegated to the host; sleeping is a scheduler
//! blocker whose deadline lives on the emulated kernel clock.

use strato_abi::Errno;

use super::{ret, Control, SysCtx};
use crate::thread::Blocker;
use crate::time::{read_timespec, write_timeval, PreciseTime};
use crate::SysFault;

pub(super) fn clock_gettime(ctx: &mut SysCtx<'_>, clockid: i32, tp: u64) -> Result<Control, SysFault> {
    match crate::host::clock_gettime(clockid) {
        Ok((sec, nsec)) => {
            ctx.mmu.write64(tp, sec)?;
            ctx.mmu.write64(tp + 8, nsec)?;
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn clock_getres(ctx: &mut SysCtx<'_>, clockid: i32, res: u64) -> Result<Control, SysFault> {
    match crate::host::clock_getres(clockid) {
        Ok((sec, nsec)) => {
            if res != 0 {
                ctx.mmu.write64(res, sec)?;
                ctx.mmu.write64(res + 8, nsec)?;
            }
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

pub(super) fn gettimeofday(ctx: &mut SysCtx<'_>, tv: u64) -> Result<Control, SysFault> {
    match crate::host::clock_gettime(libc::CLOCK_REALTIME) {
        Ok((sec, nsec)) => {
            if tv != 0 {
                write_timeval(
                    ctx.mmu,
                    tv,
                    PreciseTime {
                        seconds: sec,
                        nanoseconds: nsec,
                    },
                )?;
            }
            ret(Ok(0))
        }
        Err(e) => ret(Err(e)),
    }
}

/// time(2) runs on the emulated clock.
pub(super) fn time(ctx: &mut SysCtx<'_>, tloc: u64) -> Result<Control, SysFault> {
    let t = ctx.sched.kernel_time().seconds;
    if tloc != 0 {
        ctx.mmu.write64(tloc, t)?;
    }
    ret(Ok(t))
}

pub(super) fn times(ctx: &mut SysCtx<'_>, buf: u64) -> Result<Control, SysFault> {
    if buf != 0 {
        for i in 0..4 {
            ctx.mmu.write64(buf + i * 8, 0)?;
        }
    }
    // Clock ticks at the traditional 100 Hz.
    ret(Ok(ctx.sched.kernel_time().seconds * 100))
}

pub(super) fn nanosleep(ctx: &mut SysCtx<'_>, req: u64, _rem: u64) -> Result<Control, SysFault> {
    sleep_relative(ctx, req)
}

pub(super) fn clock_nanosleep(
    ctx: &mut SysCtx<'_>,
    _clockid: i32,
    flags: i32,
    req: u64,
    _rem: u64,
) -> Result<Control, SysFault> {
    if flags != 0 {
        // TIMER_ABSTIME would need the host clock mapped onto kernel time.
        return ret(Err(Errno::ENOTSUP));
    }
    sleep_relative(ctx, req)
}

fn sleep_relative(ctx: &mut SysCtx<'_>, req: u64) -> Result<Control, SysFault> {
    let Some(ts) = read_timespec(ctx.mmu, req)? else {
        return ret(Err(Errno::EFAULT));
    };
    if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&ts.tv_nsec) {
        return ret(Err(Errno::EINVAL));
    }
    let duration = PreciseTime::from_timespec(ts);
    if duration == PreciseTime::ZERO {
        return ret(Ok(0));
    }
    let wake_at = ctx.sched.kernel_time().add(duration);
    ctx.sched.block_current(Blocker::Sleep { wake_at });
    Ok(Control::Block)
}
