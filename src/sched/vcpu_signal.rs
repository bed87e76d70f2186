//! Per-VCPU signal delivery.
//!
//! Sending a signal sets its bit in the target's pending set. A kill or
//! relinquish request additionally forces a resume so the target picks the
//! request up right away. If the signal is in the target's current wait set,
//! the wait is interrupted with a *signal* wake.

use std::sync::Arc;

use crate::clock::{self, When};
use crate::errno::{Errno, KResult};
use crate::signal::{sig_in_range, SigInfo, SigNo, SigSet, SIGKILL, SIGSET_NONMASKABLE, SIGVPRQ};

use super::vcpu::{self, Vcpu, VcpuCell};
use super::waitqueue::{WaitQueue, WakeupFlags, Wres};

fn sigsend_flags(vp: &Arc<Vcpu>, flags: WakeupFlags, signo: SigNo) -> KResult<()> {
    if !sig_in_range(signo) {
        return Err(Errno::Inval);
    }

    let mut s = super::lock();
    vp.sched.lock().pending_sigs.insert(signo);

    if signo == SIGKILL || signo == SIGVPRQ {
        // Force a resume so the target acts on the request right away.
        vcpu::resume_locked(&mut s, vp, true);
    }

    let (wake, wq) = {
        let c = vp.sched.lock();
        (c.wait_sigs.has(signo), c.waiting_on.clone())
    };
    if wake {
        if let Some(wq) = wq {
            wq.wakeone_locked(&mut s, vp, flags, Wres::Signal);
        }
    }
    Ok(())
}

/// Sends `signo` to `vp`, allowing a cooperative switch to it.
pub fn sigsend(vp: &Arc<Vcpu>, signo: SigNo) -> KResult<()> {
    sigsend_flags(vp, WakeupFlags::CSW, signo)
}

/// Variant for interrupt context: the woken VCPU is made ready but the
/// switch is left to the next quantum decision.
pub fn sigsend_irq(vp: &Arc<Vcpu>, signo: SigNo) -> KResult<()> {
    sigsend_flags(vp, WakeupFlags::empty(), signo)
}

pub fn sigpending(vp: &Arc<Vcpu>) -> SigSet {
    vp.sched.lock().pending_sigs
}

/// Whether a kill request is pending against `vp`.
pub fn aborting(vp: &Arc<Vcpu>) -> bool {
    vp.sched.lock().pending_sigs.has(SIGKILL)
}

/// How [`set_sigmask`] combines the given set with the current mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaskOp {
    Set,
    Block,
    Unblock,
}

/// Atomically updates the calling VCPU's signal mask and returns the old
/// one. Non-maskable signals cannot be blocked.
pub fn set_sigmask(vp: &Arc<Vcpu>, op: SigmaskOp, mask: SigSet) -> KResult<SigSet> {
    let _s = super::lock();
    let mut c = vp.sched.lock();
    let old = c.sigmask;
    c.sigmask = match op {
        SigmaskOp::Set => mask,
        SigmaskOp::Block => old.union(mask),
        SigmaskOp::Unblock => old.difference(mask),
    };
    Ok(old)
}

/// Consumes the lowest pending signal that is a member of `set`. A kill
/// request is reported but never consumed.
pub(crate) fn consume_best_pending(c: &mut VcpuCell, set: SigSet) -> Option<SigNo> {
    let avail = c.pending_sigs.intersect(set);
    let signo = avail.lowest()?;
    if signo != SIGKILL {
        c.pending_sigs.remove(signo);
    }
    Some(signo)
}

/// Waits on `wq` until a signal in `set` is pending and consumes it.
/// Plain wakeups are treated as spurious and re-enter the wait.
pub fn sigwait(wq: &WaitQueue, set: SigSet) -> KResult<SigInfo> {
    let vp = vcpu::current();

    loop {
        vcpu::do_pending_deferred_suspend(&vp);
        let s = super::lock();
        let mask = vp
            .sched
            .lock()
            .sigmask
            .difference(set)
            .difference(SIGSET_NONMASKABLE);
        match wq.prim_wait_locked(s, &vp, Some(mask)) {
            Wres::Signal => {
                let _s = super::lock();
                let mut c = vp.sched.lock();
                return match consume_best_pending(&mut c, set) {
                    Some(signo) => Ok(SigInfo { signo }),
                    None => Err(Errno::Intr),
                };
            }
            _ => continue,
        }
    }
}

/// As [`sigwait`] with a deadline. The deadline is resolved to an absolute
/// tick up front so spurious wakeups do not stretch the wait.
pub fn sigtimedwait(wq: &WaitQueue, set: SigSet, when: When) -> KResult<SigInfo> {
    let vp = vcpu::current();
    let deadline = clock::deadline_of(when);

    loop {
        vcpu::do_pending_deferred_suspend(&vp);
        let s = super::lock();
        let mask = vp
            .sched
            .lock()
            .sigmask
            .difference(set)
            .difference(SIGSET_NONMASKABLE);
        match wq.prim_timedwait_locked(s, &vp, Some(mask), deadline, None) {
            Wres::Wakeup => continue, // spurious
            Wres::Signal => {
                let _s = super::lock();
                let mut c = vp.sched.lock();
                return match consume_best_pending(&mut c, set) {
                    Some(signo) => Ok(SigInfo { signo }),
                    None => Err(Errno::Intr),
                };
            }
            Wres::Timeout => return Err(Errno::TimedOut),
        }
    }
}
