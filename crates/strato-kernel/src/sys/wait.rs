//! poll/select/epoll: immediate evaluation and the blocking paths.
//!
//! The readiness evaluators are shared with the scheduler, which re-runs
//! them every time it picks a thread so a parked waiter wakes as soon as a
//! descriptor becomes ready.

use strato_abi::poll::{fd_set_bytes, POLLIN, POLLOUT};
use strato_abi::types::{EpollEvent, Pollfd};
use strato_abi::Errno;
use strato_mmu::{MemFault, Mmu};

use super::{ret, Control, SysCtx};
use crate::fs::FileTable;
use crate::thread::Blocker;
use crate::time::{read_timespec, PreciseTime};
use crate::SysFault;

fn read_pollfds(mmu: &Mmu, fds_ptr: u64, nfds: u64) -> Result<Vec<Pollfd>, MemFault> {
    let mut out = Vec::with_capacity(nfds as usize);
    for i in 0..nfds {
        let mut raw = [0u8; 8];
        for (j, b) in raw.iter_mut().enumerate() {
            *b = mmu.read8(fds_ptr + i * Pollfd::SIZE + j as u64)?;
        }
        out.push(Pollfd::from_bytes(raw));
    }
    Ok(out)
}

fn evaluate_pollfds(files: &FileTable, fds: &mut [Pollfd]) -> u64 {
    let mut ready = 0;
    for pfd in fds.iter_mut() {
        pfd.revents = if pfd.fd < 0 {
            0
        } else {
            files.poll_ready(pfd.fd, pfd.events)
        };
        if pfd.revents != 0 {
            ready += 1;
        }
    }
    ready
}

fn write_pollfds(mmu: &mut Mmu, fds_ptr: u64, fds: &[Pollfd]) -> Result<(), MemFault> {
    for (i, pfd) in fds.iter().enumerate() {
        mmu.copy_to_mmu(fds_ptr + i as u64 * Pollfd::SIZE, &pfd.to_bytes())?;
    }
    Ok(())
}

/// Scheduler-side readiness check for a parked poll: writes revents and
/// reports the count only when something is ready.
pub(crate) fn poll_ready_count(
    mmu: &mut Mmu,
    files: &FileTable,
    fds_ptr: u64,
    nfds: u64,
) -> Result<Option<u64>, MemFault> {
    let mut fds = read_pollfds(mmu, fds_ptr, nfds)?;
    let ready = evaluate_pollfds(files, &mut fds);
    if ready == 0 {
        return Ok(None);
    }
    write_pollfds(mmu, fds_ptr, &fds)?;
    Ok(Some(ready))
}

pub(super) fn poll(
    ctx: &mut SysCtx<'_>,
    fds_ptr: u64,
    nfds: u64,
    timeout_ms: i32,
) -> Result<Control, SysFault> {
    let mut fds = read_pollfds(ctx.mmu, fds_ptr, nfds)?;
    let ready = evaluate_pollfds(ctx.files, &mut fds);
    if ready > 0 || timeout_ms == 0 {
        write_pollfds(ctx.mmu, fds_ptr, &fds)?;
        return ret(Ok(ready));
    }
    let deadline = (timeout_ms > 0)
        .then(|| ctx.sched.kernel_time().add(PreciseTime::from_millis(timeout_ms as u64)));
    ctx.sched.block_current(Blocker::Poll {
        fds_ptr,
        nfds,
        deadline,
    });
    Ok(Control::Block)
}

pub(super) fn ppoll(
    ctx: &mut SysCtx<'_>,
    fds_ptr: u64,
    nfds: u64,
    timeout_ptr: u64,
) -> Result<Control, SysFault> {
    let timeout_ms = match read_timespec(ctx.mmu, timeout_ptr)? {
        None => -1,
        Some(ts) => {
            let total = ts.tv_sec.max(0) as u64 * 1_000 + ts.tv_nsec.max(0) as u64 / 1_000_000;
            total.min(i32::MAX as u64) as i32
        }
    };
    poll(ctx, fds_ptr, nfds, timeout_ms)
}

struct FdSets {
    read: Vec<u8>,
    write: Vec<u8>,
    except: Vec<u8>,
}

fn read_fd_set(mmu: &Mmu, ptr: u64, bytes: usize) -> Result<Vec<u8>, MemFault> {
    if ptr == 0 {
        return Ok(vec![0; bytes]);
    }
    Ok(mmu.copy_from_mmu(ptr, bytes as u64)?)
}

fn read_fd_sets(
    mmu: &Mmu,
    nfds: u64,
    read_ptr: u64,
    write_ptr: u64,
    except_ptr: u64,
) -> Result<FdSets, MemFault> {
    let bytes = fd_set_bytes(nfds as usize);
    Ok(FdSets {
        read: read_fd_set(mmu, read_ptr, bytes)?,
        write: read_fd_set(mmu, write_ptr, bytes)?,
        except: read_fd_set(mmu, except_ptr, bytes)?,
    })
}

fn bit(set: &[u8], fd: usize) -> bool {
    set.get(fd / 8).is_some_and(|b| b & (1 << (fd % 8)) != 0)
}

fn set_bit(set: &mut [u8], fd: usize) {
    if let Some(b) = set.get_mut(fd / 8) {
        *b |= 1 << (fd % 8);
    }
}

/// Evaluate select readiness; returns the output sets and the ready count.
fn evaluate_select(files: &FileTable, nfds: u64, sets: &FdSets) -> (FdSets, u64) {
    let bytes = fd_set_bytes(nfds as usize);
    let mut out = FdSets {
        read: vec![0; bytes],
        write: vec![0; bytes],
        except: vec![0; bytes],
    };
    let mut count = 0;
    for fd in 0..nfds as usize {
        if bit(&sets.read, fd) && files.poll_ready(fd as i32, POLLIN) != 0 {
            set_bit(&mut out.read, fd);
            count += 1;
        }
        if bit(&sets.write, fd) && files.poll_ready(fd as i32, POLLOUT) != 0 {
            set_bit(&mut out.write, fd);
            count += 1;
        }
        // Exceptional conditions never fire in the emulated file table.
        let _ = bit(&sets.except, fd);
    }
    (out, count)
}

fn write_fd_sets(
    mmu: &mut Mmu,
    out: &FdSets,
    read_ptr: u64,
    write_ptr: u64,
    except_ptr: u64,
) -> Result<(), MemFault> {
    for (ptr, set) in [
        (read_ptr, &out.read),
        (write_ptr, &out.write),
        (except_ptr, &out.except),
    ] {
        if ptr != 0 {
            mmu.copy_to_mmu(ptr, set)?;
        }
    }
    Ok(())
}

/// Scheduler-side readiness check for a parked select.
pub(crate) fn select_ready_count(
    mmu: &mut Mmu,
    files: &FileTable,
    nfds: u64,
    read_ptr: u64,
    write_ptr: u64,
    except_ptr: u64,
) -> Result<Option<u64>, MemFault> {
    let sets = read_fd_sets(mmu, nfds, read_ptr, write_ptr, except_ptr)?;
    let (out, count) = evaluate_select(files, nfds, &sets);
    if count == 0 {
        return Ok(None);
    }
    write_fd_sets(mmu, &out, read_ptr, write_ptr, except_ptr)?;
    Ok(Some(count))
}

fn select_common(
    ctx: &mut SysCtx<'_>,
    nfds: u64,
    read_ptr: u64,
    write_ptr: u64,
    except_ptr: u64,
    deadline: Option<PreciseTime>,
    immediate: bool,
) -> Result<Control, SysFault> {
    if nfds > 1024 {
        return ret(Err(Errno::EINVAL));
    }
    let sets = read_fd_sets(ctx.mmu, nfds, read_ptr, write_ptr, except_ptr)?;
    let (out, count) = evaluate_select(ctx.files, nfds, &sets);
    if count > 0 || immediate {
        write_fd_sets(ctx.mmu, &out, read_ptr, write_ptr, except_ptr)?;
        return ret(Ok(count));
    }
    ctx.sched.block_current(Blocker::Select {
        nfds,
        read_ptr,
        write_ptr,
        except_ptr,
        deadline,
    });
    Ok(Control::Block)
}

pub(super) fn select(
    ctx: &mut SysCtx<'_>,
    nfds: u64,
    read_ptr: u64,
    write_ptr: u64,
    except_ptr: u64,
    timeout_ptr: u64,
) -> Result<Control, SysFault> {
    // select takes a struct timeval.
    let (deadline, immediate) = if timeout_ptr == 0 {
        (None, false)
    } else {
        let sec = ctx.mmu.read64(timeout_ptr)?;
        let usec = ctx.mmu.read64(timeout_ptr + 8)?;
        let duration = PreciseTime {
            seconds: sec,
            nanoseconds: usec.saturating_mul(1_000).min(999_999_999),
        };
        if duration == PreciseTime::ZERO {
            (None, true)
        } else {
            (Some(ctx.sched.kernel_time().add(duration)), false)
        }
    };
    select_common(ctx, nfds, read_ptr, write_ptr, except_ptr, deadline, immediate)
}

pub(super) fn pselect6(
    ctx: &mut SysCtx<'_>,
    nfds: u64,
    read_ptr: u64,
    write_ptr: u64,
    except_ptr: u64,
    timeout_ptr: u64,
) -> Result<Control, SysFault> {
    let (deadline, immediate) = match read_timespec(ctx.mmu, timeout_ptr)? {
        None => (None, false),
        Some(ts) => {
            let duration = PreciseTime::from_timespec(ts);
            if duration == PreciseTime::ZERO {
                (None, true)
            } else {
                (Some(ctx.sched.kernel_time().add(duration)), false)
            }
        }
    };
    select_common(ctx, nfds, read_ptr, write_ptr, except_ptr, deadline, immediate)
}

/// Scheduler-side readiness check for a parked epoll_wait.
pub(crate) fn epoll_ready_count(
    mmu: &mut Mmu,
    files: &FileTable,
    epfd: i32,
    events_ptr: u64,
    max_events: u32,
) -> Result<Option<u64>, MemFault> {
    let Ok(events) = files.epoll_ready_events(epfd) else {
        return Ok(Some((-(Errno::EBADF.0 as i64)) as u64));
    };
    if events.is_empty() {
        return Ok(None);
    }
    let n = events.len().min(max_events as usize);
    for (i, ev) in events[..n].iter().enumerate() {
        mmu.copy_to_mmu(events_ptr + i as u64 * EpollEvent::SIZE, &ev.to_bytes())?;
    }
    Ok(Some(n as u64))
}

pub(super) fn epoll_wait(
    ctx: &mut SysCtx<'_>,
    epfd: i32,
    events_ptr: u64,
    max_events: i32,
    timeout_ms: i32,
) -> Result<Control, SysFault> {
    if events_ptr == 0 {
        return ret(Err(Errno::EFAULT));
    }
    if max_events <= 0 {
        return ret(Err(Errno::EINVAL));
    }
    let events = match ctx.files.epoll_ready_events(epfd) {
        Ok(events) => events,
        Err(e) => return ret(Err(e)),
    };
    if !events.is_empty() || timeout_ms == 0 {
        let n = events.len().min(max_events as usize);
        for (i, ev) in events[..n].iter().enumerate() {
            ctx.mmu
                .copy_to_mmu(events_ptr + i as u64 * EpollEvent::SIZE, &ev.to_bytes())?;
        }
        return ret(Ok(n as u64));
    }
    let deadline = (timeout_ms > 0)
        .then(|| ctx.sched.kernel_time().add(PreciseTime::from_millis(timeout_ms as u64)));
    ctx.sched.block_current(Blocker::EpollWait {
        epfd,
        events_ptr,
        max_events: max_events as u32,
        deadline,
    });
    Ok(Control::Block)
}
