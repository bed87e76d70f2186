//! Wait queues.
//!
//! A wait queue is a FIFO of blocked VCPUs and the sole primitive every
//! other blocking construct (mutex, condition variable, dispatcher worker
//! waits, sleeps) is built on. The primitive wait enqueues the caller,
//! gives up the virtual CPU and parks the backing thread until a wake,
//! signal or timeout edge releases it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{self, Ticks, When, TICKS_INFINITY, TICKS_PER_QUARTER_SECOND};
use crate::errno::{Errno, KResult};
use crate::signal::{SigSet, SIGSET_NONMASKABLE};

use super::vcpu::{self, Vcpu, VcpuKind, VcpuState};
use super::{SchedGuard, SchedState, SCHED_PRI_HIGHEST};

bitflags::bitflags! {
    /// Wakeup behavior. The empty set wakes all waiters without a
    /// cooperative switch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeupFlags: u8 {
        /// Wake at most one waiter instead of all.
        const ONE = 0x01;
        /// Allow a cooperative context switch to the woken VCPU.
        const CSW = 0x02;
        /// Wakeup runs in interrupt context; the switch is deferred.
        const IRQ = 0x04;
    }
}

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Wres {
    Wakeup = 1,
    Signal = 2,
    Timeout = 3,
}

/// FIFO wait queue. Cloning yields another handle to the same queue; the
/// queue contents are only ever mutated under the scheduler lock.
#[derive(Clone)]
pub struct WaitQueue {
    q: Arc<spin::Mutex<VecDeque<Arc<Vcpu>>>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> WaitQueue {
        WaitQueue {
            q: Arc::new(spin::Mutex::new(VecDeque::new())),
        }
    }

    /// Fails with `EBUSY` while VCPUs are still blocked on the queue.
    pub fn deinit(&self) -> KResult<()> {
        let _s = super::lock();
        if self.q.lock().is_empty() {
            Ok(())
        } else {
            Err(Errno::Busy)
        }
    }

    pub fn waiter_count(&self) -> usize {
        let _s = super::lock();
        self.q.lock().len()
    }

    pub(crate) fn contains_count(&self, vp: &Arc<Vcpu>) -> usize {
        self.q.lock().iter().filter(|x| Arc::ptr_eq(x, vp)).count()
    }

    /// The primitive wait. Expects the scheduler lock; consumes it before
    /// parking. If the caller already has a pending signal outside the
    /// effective mask, returns `Signal` without blocking.
    ///
    /// The mask is taken verbatim: internal waits (the kernel mutex) may
    /// mask everything. `None` selects the caller's signal mask with the
    /// non-maskable set forced open; public wait surfaces are expected to
    /// keep the non-maskable signals open as well.
    pub(crate) fn prim_wait_locked(
        &self,
        mut s: SchedGuard,
        vp: &Arc<Vcpu>,
        mask: Option<SigSet>,
    ) -> Wres {
        let old_mask;
        let the_mask;
        {
            let c = vp.sched.lock();
            debug_assert!(c.state != VcpuState::Waiting, "nested wait");
            old_mask = c.sigmask;
            the_mask = match mask {
                Some(m) => m,
                None => old_mask.difference(SIGSET_NONMASKABLE),
            };
            if c.pending_sigs.intersects(the_mask.complement()) {
                return Wres::Signal;
            }
        }

        if vp.sched.lock().on_ready_queue {
            s.remove_vcpu_locked(vp);
        }
        {
            let mut c = vp.sched.lock();
            c.sigmask = the_mask;
            c.wait_sigs = the_mask.complement();
            c.state = VcpuState::Waiting;
            c.waiting_on = Some(self.clone());
            c.wait_start_time = clock::now();
            c.wakeup_reason = None;
        }
        self.q.lock().push_back(vp.clone());
        s.reschedule_away_from(vp);
        drop(s);

        vp.gate.block();
        vcpu::check_urgent(vp);

        let mut c = vp.sched.lock();
        c.sigmask = old_mask;
        c.wait_sigs = SigSet::EMPTY;
        c.wakeup_reason.take().unwrap_or(Wres::Wakeup)
    }

    /// Primitive wait with an absolute deadline. A deadline already in the
    /// past reports `Timeout` without blocking. `rem` receives the unslept
    /// time on return when supplied.
    pub(crate) fn prim_timedwait_locked(
        &self,
        mut s: SchedGuard,
        vp: &Arc<Vcpu>,
        mask: Option<SigSet>,
        deadline: Ticks,
        rem: Option<&mut Duration>,
    ) -> Wres {
        let mut armed = false;
        if deadline < TICKS_INFINITY {
            let now = clock::now();
            if deadline <= now {
                if let Some(rem) = rem {
                    *rem = Duration::ZERO;
                }
                return Wres::Timeout;
            }
            let mut c = vp.sched.lock();
            s.arm_timeout_locked(vp, &mut c, deadline);
            armed = true;
        }

        let res = self.prim_wait_locked(s, vp, mask);

        if armed {
            let mut s = super::lock();
            let mut c = vp.sched.lock();
            s.cancel_timeout_locked(vp, &mut c);
        }
        if let Some(rem) = rem {
            let now = clock::now();
            *rem = if now < deadline {
                clock::duration_from_ticks(deadline - now)
            } else {
                Duration::ZERO
            };
        }
        res
    }

    /// Blocks until explicitly woken. `mask` overrides the caller's signal
    /// mask for the duration of the wait; `None` keeps it, which for most
    /// VCPUs means only non-maskable signals interrupt.
    pub fn wait(&self, mask: Option<SigSet>) -> KResult<()> {
        let vp = vcpu::current();
        vcpu::do_pending_deferred_suspend(&vp);
        let mask = mask.map(|m| m.difference(SIGSET_NONMASKABLE));
        let s = super::lock();
        match self.prim_wait_locked(s, &vp, mask) {
            Wres::Wakeup => Ok(()),
            _ => Err(Errno::Intr),
        }
    }

    /// As [`wait`](Self::wait) with a deadline.
    pub fn timedwait(
        &self,
        mask: Option<SigSet>,
        when: When,
        rem: Option<&mut Duration>,
    ) -> KResult<()> {
        let vp = vcpu::current();
        vcpu::do_pending_deferred_suspend(&vp);
        let mask = mask.map(|m| m.difference(SIGSET_NONMASKABLE));
        let deadline = clock::deadline_of(when);
        let s = super::lock();
        match self.prim_timedwait_locked(s, &vp, mask, deadline, rem) {
            Wres::Wakeup => Ok(()),
            Wres::Signal => Err(Errno::Intr),
            Wres::Timeout => Err(Errno::TimedOut),
        }
    }

    /// Wakes `vp` if it is blocked on this queue. Returns whether the VCPU
    /// was made ready. A VCPU woken while suspended stays parked and is
    /// re-enqueued by the matching resume.
    pub(crate) fn wakeone_locked(
        &self,
        s: &mut SchedState,
        vp: &Arc<Vcpu>,
        flags: WakeupFlags,
        reason: Wres,
    ) -> bool {
        let boosted;
        {
            let mut c = vp.sched.lock();
            if c.state != VcpuState::Waiting {
                return false;
            }

            {
                let mut q = self.q.lock();
                if let Some(i) = q.iter().position(|x| Arc::ptr_eq(x, vp)) {
                    q.remove(i);
                }
            }
            s.cancel_timeout_locked(vp, &mut c);
            c.waiting_on = None;
            c.wakeup_reason = Some(reason);

            if c.suspension_count != 0 {
                // Stays parked; resume will re-enqueue it.
                c.state = VcpuState::Ready;
                return false;
            }

            let waited = clock::now().saturating_sub(c.wait_start_time);
            let quarters = (waited / TICKS_PER_QUARTER_SECOND).min(SCHED_PRI_HIGHEST as u64) as u8;
            boosted = c
                .effective_priority
                .saturating_add(quarters)
                .min(SCHED_PRI_HIGHEST);
        }

        if vp.kind() == VcpuKind::Adopted {
            vp.sched.lock().state = VcpuState::Running;
            vp.gate.open();
            return true;
        }

        s.add_vcpu_locked(vp, boosted);
        vp.gate.open();
        if flags.contains(WakeupFlags::CSW) && !flags.contains(WakeupFlags::IRQ) {
            s.maybe_switch_to(vp);
        }
        true
    }

    /// Public wrapper around [`wakeone_locked`](Self::wakeone_locked).
    pub fn wakeone(&self, vp: &Arc<Vcpu>, flags: WakeupFlags, reason: Wres) -> bool {
        let mut s = super::lock();
        self.wakeone_locked(&mut s, vp, flags, reason)
    }

    pub(crate) fn wake_locked(&self, s: &mut SchedState, flags: WakeupFlags, reason: Wres) {
        let waiters: Vec<Arc<Vcpu>> = self.q.lock().iter().cloned().collect();
        let mut candidate: Option<Arc<Vcpu>> = None;

        for vp in waiters {
            let is_ready = self.wakeone_locked(s, &vp, WakeupFlags::empty(), reason);
            if candidate.is_none() && is_ready {
                candidate = Some(vp);
            }
            if flags.contains(WakeupFlags::ONE) {
                break;
            }
        }

        if flags.contains(WakeupFlags::CSW) && !flags.contains(WakeupFlags::IRQ) {
            if let Some(c) = candidate {
                s.maybe_switch_to(&c);
            }
        }
    }

    /// Wakes one or all waiters with reason `Wakeup`.
    pub fn wake(&self, flags: WakeupFlags) {
        let mut s = super::lock();
        self.wake_locked(&mut s, flags, Wres::Wakeup);
    }
}
