//! Kernel condition variable.
//!
//! Waiting releases the associated mutex and enters the condition's wait
//! queue atomically with respect to the scheduler lock, so a wake between
//! unlock and wait entry cannot be lost.

use crate::clock::Ticks;
use crate::errno::{Errno, KResult};

use super::mtx::{Mtx, MtxGuard};
use super::waitqueue::{WaitQueue, WakeupFlags, Wres};

pub struct Cnd {
    wq: WaitQueue,
}

impl Default for Cnd {
    fn default() -> Self {
        Self::new()
    }
}

impl Cnd {
    pub fn new() -> Cnd {
        Cnd {
            wq: WaitQueue::new(),
        }
    }

    pub fn deinit(&self) -> KResult<()> {
        self.wq.deinit()
    }

    /// Wakes one waiter. No cooperative switch: the caller usually still
    /// holds the associated mutex, so the woken VCPU could not make progress
    /// anyway.
    pub fn signal(&self) {
        let mut s = super::lock();
        self.wq.wake_locked(&mut s, WakeupFlags::ONE, Wres::Wakeup);
    }

    /// Wakes all waiters.
    pub fn broadcast(&self) {
        let mut s = super::lock();
        self.wq
            .wake_locked(&mut s, WakeupFlags::empty(), Wres::Wakeup);
    }

    /// Releases the guard's mutex, blocks until signaled, then relocks.
    /// `Err(EINTR)` reports a signal-interrupted wait; the mutex is held
    /// again either way.
    pub fn wait<'a, T>(&self, guard: MtxGuard<'a, T>) -> (MtxGuard<'a, T>, KResult<()>) {
        let mtx = guard.mtx;
        let res = Mtx::unlock_then_wait(guard, &self.wq);
        let guard = mtx.lock();
        let r = match res {
            Wres::Signal => Err(Errno::Intr),
            _ => Ok(()),
        };
        (guard, r)
    }

    /// As [`wait`](Self::wait) with an absolute tick deadline.
    pub fn timedwait<'a, T>(
        &self,
        guard: MtxGuard<'a, T>,
        deadline: Ticks,
    ) -> (MtxGuard<'a, T>, KResult<()>) {
        let mtx = guard.mtx;
        let res = Mtx::unlock_then_timedwait(guard, &self.wq, deadline);
        let guard = mtx.lock();
        let r = match res {
            Wres::Signal => Err(Errno::Intr),
            Wres::Timeout => Err(Errno::TimedOut),
            Wres::Wakeup => Ok(()),
        };
        (guard, r)
    }
}
