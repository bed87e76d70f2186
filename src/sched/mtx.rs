//! Kernel mutex, built on a wait queue.
//!
//! `Mtx<T>` is a sleeping lock: contended lockers block on the mutex's wait
//! queue and are woken one at a time on unlock. The guard hands out access
//! to the protected data RAII-style. Locking is not reentrant.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::signal::SigSet;

use super::vcpu;
use super::waitqueue::{WaitQueue, WakeupFlags, Wres};

/// Distinguishes locker threads; VCPU ids are not stable across relinquish.
fn lock_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

pub struct Mtx<T> {
    wq: WaitQueue,
    /// Low 32 bits of the owner's lock token; 0 means unlocked.
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mtx<T> {}
unsafe impl<T: Send> Sync for Mtx<T> {}

pub struct MtxGuard<'a, T> {
    pub(crate) mtx: &'a Mtx<T>,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Mtx<T> {
    pub fn new(value: T) -> Mtx<T> {
        Mtx {
            wq: WaitQueue::new(),
            owner: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    fn token() -> u32 {
        let t = (lock_token() & 0xffff_ffff) as u32;
        if t == 0 {
            1
        } else {
            t
        }
    }

    /// Acquires the mutex, blocking on its wait queue while contended. Only
    /// non-maskable signals interrupt the underlying wait; interruptions
    /// simply retry.
    pub fn lock(&self) -> MtxGuard<'_, T> {
        let vp = vcpu::current();
        let me = Self::token();

        loop {
            vcpu::do_pending_deferred_suspend(&vp);
            let s = super::lock();
            if self.owner.load(Ordering::Relaxed) == 0 {
                self.owner.store(me, Ordering::Relaxed);
                drop(s);
                return MtxGuard {
                    mtx: self,
                    _not_send: PhantomData,
                };
            }
            let _ = self.wq.prim_wait_locked(s, &vp, Some(SigSet::ALL));
        }
    }

    pub fn try_lock(&self) -> Option<MtxGuard<'_, T>> {
        let _s = super::lock();
        if self.owner.load(Ordering::Relaxed) == 0 {
            self.owner.store(Self::token(), Ordering::Relaxed);
            Some(MtxGuard {
                mtx: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    fn unlock(&self) {
        let mut s = super::lock();
        self.owner.store(0, Ordering::Relaxed);
        self.wq
            .wake_locked(&mut s, WakeupFlags::ONE, Wres::Wakeup);
    }

    /// Releases the mutex and enters the given wait queue in one critical
    /// region, closing the lost-wakeup window of condition variables.
    /// Relocking is the caller's business.
    pub(crate) fn unlock_then_wait(guard: MtxGuard<'_, T>, wq: &WaitQueue) -> Wres {
        let mtx = guard.mtx;
        core::mem::forget(guard);

        let vp = vcpu::current();
        let mut s = super::lock();
        mtx.owner.store(0, Ordering::Relaxed);
        mtx.wq.wake_locked(&mut s, WakeupFlags::ONE, Wres::Wakeup);
        wq.prim_wait_locked(s, &vp, None)
    }

    /// Timed variant of [`unlock_then_wait`](Self::unlock_then_wait) with an
    /// absolute tick deadline.
    pub(crate) fn unlock_then_timedwait(
        guard: MtxGuard<'_, T>,
        wq: &WaitQueue,
        deadline: crate::clock::Ticks,
    ) -> Wres {
        let mtx = guard.mtx;
        core::mem::forget(guard);

        let vp = vcpu::current();
        let mut s = super::lock();
        mtx.owner.store(0, Ordering::Relaxed);
        mtx.wq.wake_locked(&mut s, WakeupFlags::ONE, Wres::Wakeup);
        wq.prim_timedwait_locked(s, &vp, None, deadline, None)
    }
}

impl<'a, T> Deref for MtxGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the mutex.
        unsafe { &*self.mtx.data.get() }
    }
}

impl<'a, T> DerefMut for MtxGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above.
        unsafe { &mut *self.mtx.data.get() }
    }
}

impl<'a, T> Drop for MtxGuard<'a, T> {
    fn drop(&mut self) {
        self.mtx.unlock();
    }
}
