//! Minimal kernel-process surface.
//!
//! The scheduler exports a small seam to the process layer: VCPU
//! acquisition and group kill, a handle table for user-visible wait queues,
//! and the sleep entry point. There is exactly one process in this runtime,
//! so the table is process-global.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use conquer_once::spin::OnceCell;

use crate::clock::When;
use crate::errno::{Errno, KResult};
use crate::kernel::kernel;
use crate::sched::mtx::Mtx;
use crate::sched::vcpu::{self, Vcpu, VcpuAcquireAttr, Vid};
use crate::sched::vcpu_signal;
use crate::sched::waitqueue::{WaitQueue, WakeupFlags};
use crate::signal::{SigNo, SigSet, SIGKILL};

/// The only wait-queue policy currently defined.
pub const WQ_POLICY_FIFO: i32 = 0;

struct UserWqs {
    next: i32,
    map: BTreeMap<i32, WaitQueue>,
}

static USER_WQS: OnceCell<Mtx<UserWqs>> = OnceCell::uninit();

fn user_wqs() -> &'static Mtx<UserWqs> {
    USER_WQS.get_or_init(|| {
        Mtx::new(UserWqs {
            next: 0,
            map: BTreeMap::new(),
        })
    })
}

/// Creates a user wait queue and returns its handle.
pub fn wq_create(policy: i32) -> KResult<i32> {
    if policy != WQ_POLICY_FIFO {
        return Err(Errno::Inval);
    }
    let mut g = user_wqs().lock();
    let od = g.next;
    g.next += 1;
    g.map.insert(od, WaitQueue::new());
    Ok(od)
}

fn resolve(od: i32) -> KResult<WaitQueue> {
    let g = user_wqs().lock();
    g.map.get(&od).cloned().ok_or(Errno::BadF)
}

/// Disposes a user wait queue; `EBUSY` while VCPUs still wait on it.
pub fn wq_dispose(od: i32) -> KResult<()> {
    let mut g = user_wqs().lock();
    let wq = g.map.get(&od).cloned().ok_or(Errno::BadF)?;
    wq.deinit()?;
    g.map.remove(&od);
    Ok(())
}

pub fn wq_wait(od: i32) -> KResult<()> {
    resolve(od)?.wait(None)
}

pub fn wq_timedwait(od: i32, when: When, rem: Option<&mut Duration>) -> KResult<()> {
    resolve(od)?.timedwait(None, when, rem)
}

pub fn wq_wakeup(od: i32, flags: WakeupFlags) -> KResult<()> {
    resolve(od)?.wake(flags | WakeupFlags::CSW);
    Ok(())
}

/// Wakes `wake_od`, then enters a timed wait on `wait_od`, all inside one
/// preemption-disabled region so the wake cannot race the wait entry.
pub fn wq_wakeup_then_timedwait(wake_od: i32, wait_od: i32, when: When) -> KResult<()> {
    let wake_q = resolve(wake_od)?;
    let wait_q = resolve(wait_od)?;
    let vp = vcpu::current();
    let deadline = crate::clock::deadline_of(when);

    let mut s = crate::sched::lock();
    wake_q.wake_locked(
        &mut s,
        WakeupFlags::ONE,
        crate::sched::waitqueue::Wres::Wakeup,
    );
    match wait_q.prim_timedwait_locked(s, &vp, None, deadline, None) {
        crate::sched::waitqueue::Wres::Wakeup => Ok(()),
        crate::sched::waitqueue::Wres::Signal => Err(Errno::Intr),
        crate::sched::waitqueue::Wres::Timeout => Err(Errno::TimedOut),
    }
}

/// Acquires a VCPU on behalf of the process layer.
pub fn acquire_vcpu(attr: VcpuAcquireAttr) -> KResult<Arc<Vcpu>> {
    vcpu::acquire(attr)
}

/// Looks up a live VCPU by id.
pub fn vcpu_by_id(id: Vid) -> KResult<Arc<Vcpu>> {
    kernel().registry.lock().get(&id).cloned().ok_or(Errno::Srch)
}

/// Every currently registered VCPU.
pub fn all_vcpus() -> Vec<Arc<Vcpu>> {
    kernel().registry.lock().values().cloned().collect()
}

/// Every registered VCPU of the given group.
pub fn vcpus_in_group(groupid: Vid) -> Vec<Arc<Vcpu>> {
    kernel()
        .registry
        .lock()
        .values()
        .filter(|vp| vp.group_id() == groupid)
        .cloned()
        .collect()
}

/// Sends `signo` to every VCPU of a group; returns how many were hit.
pub fn sigsend_group(groupid: Vid, signo: SigNo) -> KResult<usize> {
    let targets = vcpus_in_group(groupid);
    if targets.is_empty() {
        return Err(Errno::Srch);
    }
    for vp in targets.iter() {
        vcpu_signal::sigsend(vp, signo)?;
    }
    Ok(targets.len())
}

/// Force-terminates every VCPU of a group, as process exit does.
pub fn kill_group(groupid: Vid) -> usize {
    sigsend_group(groupid, SIGKILL).unwrap_or(0)
}

/// `clock_nanosleep`: blocks for the given time span. Interruptions report
/// `EINTR` with the remaining time in `rem`.
pub fn nanosleep(when: When, rem: Option<&mut Duration>) -> KResult<()> {
    let k = kernel();
    match k.sleep_wq.timedwait(Some(SigSet::ALL), when, rem) {
        Err(Errno::TimedOut) => Ok(()),
        Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}
