//! Threading syscalls: clone, exit, futex, TID bookkeeping.

use strato_abi::clone::{CloneArgs, CloneFlags, CSIGNAL};
use strato_abi::{futex, Errno};
use strato_x86::Reg;
use tracing::warn;

use super::{ret, Control, SysCtx};
use crate::thread::Blocker;
use crate::time::{read_timespec, PreciseTime};
use crate::SysFault;

const ARCH_SET_GS: i32 = 0x1001;
const ARCH_SET_FS: i32 = 0x1002;
const ARCH_GET_FS: i32 = 0x1003;
const ARCH_GET_GS: i32 = 0x1004;

/// The clone flag profile pthread_create uses is the only one supported;
/// anything else is a fatal diagnostic naming each divergent flag.
fn check_clone_flags(raw: u64) -> Result<CloneFlags, SysFault> {
    let masked = raw & !CSIGNAL;
    let flags = CloneFlags::from_bits_truncate(masked);
    let required = strato_abi::clone::PTHREAD_PROFILE;
    let allowed = required | CloneFlags::SYSVSEM;

    let mut problems = Vec::new();
    if flags.bits() != masked {
        problems.push(format!(
            "unknown flag bits {:#x}",
            masked & !CloneFlags::all().bits()
        ));
    }
    for missing in required.iter() {
        if !flags.contains(missing) {
            problems.push(format!("expected {missing:?}"));
        }
    }
    for extra in flags.iter() {
        if !allowed.contains(extra) {
            problems.push(format!("unexpected {extra:?}"));
        }
    }
    if problems.is_empty() {
        Ok(flags)
    } else {
        Err(SysFault::CloneFlags {
            flags: raw,
            detail: problems.join(", "),
        })
    }
}

pub(super) fn clone(
    ctx: &mut SysCtx<'_>,
    flags: u64,
    stack: u64,
    parent_tid: u64,
    child_tid: u64,
    tls: u64,
) -> Result<Control, SysFault> {
    let flags = check_clone_flags(flags)?;

    let new_tid = ctx.sched.allocate_thread();
    let parent_state = ctx.sched.thread(ctx.tid).saved.clone();
    {
        let child = ctx.sched.thread_mut(new_tid);
        child.saved = parent_state;
        child.saved.write_reg(Reg::Rax, 0);
        child.saved.set_rsp(stack);
        child.saved.fs_base = tls;
        if flags.contains(CloneFlags::CHILD_CLEARTID) {
            child.clear_child_tid = child_tid;
        }
    }
    ctx.mmu
        .set_region_name(stack, &format!("stack of thread {new_tid}"));
    if flags.contains(CloneFlags::PARENT_SETTID) && parent_tid != 0 {
        ctx.mmu.write32(parent_tid, new_tid as u32)?;
    }
    if flags.contains(CloneFlags::CHILD_SETTID) && child_tid != 0 {
        ctx.mmu.write32(child_tid, new_tid as u32)?;
    }
    ctx.sched.add_ready(new_tid);
    ret(Ok(new_tid as u64))
}

pub(super) fn clone3(ctx: &mut SysCtx<'_>, args_ptr: u64, size: u64) -> Result<Control, SysFault> {
    if size < CloneArgs::SIZE_VER0 {
        return ret(Err(Errno::EINVAL));
    }
    let mut words = [0u64; 8];
    for (i, word) in words.iter_mut().enumerate() {
        *word = ctx.mmu.read64(args_ptr + i as u64 * 8)?;
    }
    let args = CloneArgs::from_words(words);
    clone(
        ctx,
        args.flags | (args.exit_signal & CSIGNAL),
        args.stack + args.stack_size,
        args.parent_tid,
        args.child_tid,
        args.tls,
    )
}

pub(super) fn exit(ctx: &mut SysCtx<'_>, status: i32) -> Result<Control, SysFault> {
    ctx.sched.terminate(ctx.tid, status, ctx.mmu);
    Ok(Control::Exit)
}

pub(super) fn exit_group(ctx: &mut SysCtx<'_>, status: i32) -> Result<Control, SysFault> {
    ctx.sched.terminate_all(status);
    Ok(Control::Exit)
}

pub(super) fn set_tid_address(ctx: &mut SysCtx<'_>, ptr: u64) -> Result<Control, SysFault> {
    let tid = ctx.tid;
    ctx.sched.thread_mut(tid).clear_child_tid = ptr;
    ret(Ok(tid as u64))
}

pub(super) fn set_robust_list(ctx: &mut SysCtx<'_>, head: u64, len: u64) -> Result<Control, SysFault> {
    // sizeof(struct robust_list_head)
    if len != 24 {
        return ret(Err(Errno::EINVAL));
    }
    let tid = ctx.tid;
    ctx.sched.thread_mut(tid).robust_list = head;
    ret(Ok(0))
}

pub(super) fn get_robust_list(
    ctx: &mut SysCtx<'_>,
    tid: i32,
    head_ptr: u64,
    len_ptr: u64,
) -> Result<Control, SysFault> {
    let tid = if tid == 0 { ctx.tid } else { tid };
    let head = ctx.sched.thread(tid).robust_list;
    ctx.mmu.write64(head_ptr, head)?;
    ctx.mmu.write64(len_ptr, 24)?;
    ret(Ok(0))
}

pub(super) fn tgkill(ctx: &mut SysCtx<'_>, tgid: i32, tid: i32, sig: i32) -> Result<Control, SysFault> {
    if tgid != ctx.sched.pid() {
        return ret(Err(Errno::ESRCH));
    }
    if sig == 0 {
        return ret(Ok(0));
    }
    // No signal machinery: delivery degrades to terminating the target with
    // the conventional 128+sig status.
    warn!(tid, sig, "tgkill terminates the target thread");
    ctx.sched.terminate(tid, 128 + sig, ctx.mmu);
    if tid == ctx.tid {
        Ok(Control::Exit)
    } else {
        ret(Ok(0))
    }
}

pub(super) fn arch_prctl(ctx: &mut SysCtx<'_>, code: i32, addr: u64) -> Result<Control, SysFault> {
    let tid = ctx.tid;
    match code {
        ARCH_SET_FS => {
            ctx.sched.thread_mut(tid).saved.fs_base = addr;
            ret(Ok(0))
        }
        ARCH_SET_GS => {
            ctx.sched.thread_mut(tid).saved.gs_base = addr;
            ret(Ok(0))
        }
        ARCH_GET_FS => {
            let base = ctx.sched.thread(tid).saved.fs_base;
            ctx.mmu.write64(addr, base)?;
            ret(Ok(0))
        }
        ARCH_GET_GS => {
            let base = ctx.sched.thread(tid).saved.gs_base;
            ctx.mmu.write64(addr, base)?;
            ret(Ok(0))
        }
        _ => ret(Err(Errno::EINVAL)),
    }
}

/// Deadline for a futex wait: a relative timespec against kernel time, no
/// deadline when the pointer is null.
fn futex_deadline(ctx: &SysCtx<'_>, timeout_ptr: u64) -> Result<Option<PreciseTime>, SysFault> {
    let Some(ts) = read_timespec(ctx.mmu, timeout_ptr)? else {
        return Ok(None);
    };
    Ok(Some(
        ctx.sched.kernel_time().add(PreciseTime::from_timespec(ts)),
    ))
}

pub(super) fn futex(
    ctx: &mut SysCtx<'_>,
    uaddr: u64,
    op: i32,
    val: u32,
    timeout_or_val2: u64,
    uaddr2: u64,
    val3: u32,
) -> Result<Control, SysFault> {
    match futex::unmasked(op) {
        futex::WAIT => {
            let loaded = ctx.mmu.read32(uaddr)?;
            if loaded != val {
                return ret(Err(Errno::EAGAIN));
            }
            let deadline = futex_deadline(ctx, timeout_or_val2)?;
            ctx.sched.block_current(Blocker::FutexWait {
                uaddr,
                expected: val,
                deadline,
            });
            Ok(Control::Block)
        }
        futex::WAKE => ret(Ok(ctx.sched.wake(uaddr, val, u32::MAX) as u64)),
        futex::WAKE_OP => {
            let val2 = timeout_or_val2 as u32;
            let program = futex::WakeOp::decode(val3);
            let old = ctx.mmu.read32(uaddr2)?;
            ctx.mmu.write32(uaddr2, program.apply(old))?;
            let mut woken = ctx.sched.wake(uaddr, val, u32::MAX);
            if program.compare(old) {
                woken += ctx.sched.wake(uaddr2, val2, u32::MAX);
            }
            ret(Ok(woken as u64))
        }
        futex::UNLOCK_PI => {
            warn!("futex_unlock_pi returns bogus ENOSYS value");
            ret(Err(Errno::ENOSYS))
        }
        futex::WAIT_BITSET if val3 == futex::BITSET_MATCH_ANY => {
            let loaded = ctx.mmu.read32(uaddr)?;
            if loaded != val {
                return ret(Err(Errno::EAGAIN));
            }
            let deadline = futex_deadline(ctx, timeout_or_val2)?;
            ctx.sched.block_current(Blocker::FutexWaitBitset {
                uaddr,
                expected: val,
                bitset: val3,
                deadline,
            });
            Ok(Control::Block)
        }
        other => Err(SysFault::FutexOp { op: other }),
    }
}
