//! Dispatch workers.
//!
//! A worker is a VCPU plus a local FIFO work queue and the set of signals
//! it listens for during its waits. Workers pull due timers ahead of queued
//! items, steal work from each other when idle, relinquish themselves after
//! a period of idleness above the minimum concurrency, and park in a
//! dedicated sub-loop while their dispatcher is suspended.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::clock::{self, Ticks, When, TICKS_INFINITY};
use crate::errno::{Errno, KResult};
use crate::sched::vcpu::{self, SchedParams, Vcpu};
use crate::sched::vcpu_signal;
use crate::sched::waitqueue::WaitQueue;
use crate::signal::{SigSet, SIGDISP};

use super::item::{DispatchItem, ItemFlags, ItemKind, ItemState};
use super::{DispatchAttr, DispatchGuard, DispatchInner, Dispatcher, DispatcherState};

/// How long an idle worker waits before offering to relinquish itself.
const RELINQUISH_IDLE_WAIT: Duration = Duration::from_secs(2);

pub(crate) struct WorkerQ {
    pub queue: VecDeque<Arc<DispatchItem>>,
    pub work_count: usize,
    /// Signals this worker listens for while waiting; always includes the
    /// dispatcher wakeup signal.
    pub hotsigs: SigSet,
    pub current_item: Option<Arc<DispatchItem>>,
    pub current_timer: Option<Box<super::timer::DispatchTimer>>,
    /// Whether the worker may retire itself when idle.
    pub allow_relinquish: bool,
    /// Raised by the worker once it has parked for a dispatcher suspension.
    pub is_suspended: bool,
}

pub(crate) struct Worker {
    vcpu: spin::Mutex<Option<Arc<Vcpu>>>,
    pub(crate) wq: WaitQueue,
    pub(crate) q: spin::Mutex<WorkerQ>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<(Weak<Dispatcher>, Weak<Worker>)>> =
        const { RefCell::new(None) };
}

impl Worker {
    /// Instantiates a worker and acquires a VCPU for it. The VCPU starts in
    /// the dispatcher's group with the dispatcher's scheduling parameters.
    pub(crate) fn create(d: &Arc<Dispatcher>, attr: &DispatchAttr) -> KResult<Arc<Worker>> {
        let w = Arc::new(Worker {
            vcpu: spin::Mutex::new(None),
            wq: WaitQueue::new(),
            q: spin::Mutex::new(WorkerQ {
                queue: VecDeque::new(),
                work_count: 0,
                hotsigs: SigSet::of(SIGDISP),
                current_item: None,
                current_timer: None,
                allow_relinquish: true,
                is_suspended: false,
            }),
        });

        let d2 = d.clone();
        let w2 = w.clone();
        let vp = vcpu::acquire(vcpu::VcpuAcquireAttr {
            func: Box::new(move || worker_main(d2, w2)),
            kernel_stack_size: 0,
            user_stack_size: 0,
            is_user: false,
            groupid: d.group_id(),
            params: SchedParams {
                qos: attr.qos,
                priority: attr.priority,
            },
            data: 0,
        })?;
        *w.vcpu.lock() = Some(vp.clone());
        vcpu::resume(&vp, false);

        log::debug!("dispatcher '{}' acquired worker vcpu {}", d.name(), vp.id());
        Ok(w)
    }

    pub(crate) fn vcpu(&self) -> Option<Arc<Vcpu>> {
        self.vcpu.lock().clone()
    }

    /// Pokes the worker out of its signal wait.
    pub(crate) fn wakeup(&self) {
        if let Some(vp) = self.vcpu() {
            let _ = vcpu_signal::sigsend(&vp, SIGDISP);
        }
    }

    /// Appends an item to the local queue, optionally waking the worker.
    pub(crate) fn submit(&self, item: Arc<DispatchItem>, wake: bool) {
        {
            let mut q = self.q.lock();
            q.queue.push_back(item);
            q.work_count += 1;
        }
        if wake {
            self.wakeup();
        }
    }

    /// Removes `item` from the local queue and retires it. `false` when the
    /// item is queued elsewhere.
    pub(crate) fn withdraw_item(
        &self,
        d: &Dispatcher,
        g: &mut DispatchInner,
        item: &Arc<DispatchItem>,
    ) -> bool {
        let removed = {
            let mut q = self.q.lock();
            match q.queue.iter().position(|i| Arc::ptr_eq(i, item)) {
                Some(pos) => {
                    q.queue.remove(pos);
                    q.work_count -= 1;
                    true
                }
                None => false,
            }
        };
        if removed {
            d.retire_item_locked(g, item);
        }
        removed
    }

    /// Retires every item still sitting on the local queue.
    pub(crate) fn drain(&self, d: &Dispatcher, g: &mut DispatchInner) {
        loop {
            let item = {
                let mut q = self.q.lock();
                let item = q.queue.pop_front();
                if item.is_some() {
                    q.work_count -= 1;
                }
                item
            };
            let Some(item) = item else { break };
            d.retire_item_locked(g, &item);
        }
    }
}

/// Dispatcher owning the calling worker, if any.
pub fn current_queue() -> Option<Arc<Dispatcher>> {
    CURRENT_WORKER.with(|c| c.borrow().as_ref().and_then(|(d, _)| d.upgrade()))
}

/// Item the calling worker is executing. Safe without the dispatcher lock:
/// the slot cannot change while the item function itself is on the stack.
pub fn current_item() -> Option<Arc<DispatchItem>> {
    CURRENT_WORKER.with(|c| {
        c.borrow()
            .as_ref()
            .and_then(|(_, w)| w.upgrade())
            .and_then(|w| w.q.lock().current_item.clone())
    })
}

/// Whether cancellation has been requested for the calling worker's current
/// item. Item functions poll this to honor cooperative cancellation.
pub fn current_item_cancelled() -> bool {
    current_item().map(|i| i.cancel_requested()).unwrap_or(false)
}

pub(crate) fn current_worker_and_item() -> Option<(Arc<Dispatcher>, Arc<DispatchItem>)> {
    let (d, w) = CURRENT_WORKER.with(|c| c.borrow().clone())?;
    let d = d.upgrade()?;
    let item = w.upgrade()?.q.lock().current_item.clone()?;
    Some((d, item))
}

/// One unit handed from `get_next_work` to the execution half of the loop.
struct WorkUnit {
    item: Arc<DispatchItem>,
    is_timer: bool,
}

/// Parks the worker while its dispatcher is suspending or suspended.
fn wait_for_resume<'a>(
    d: &'a Arc<Dispatcher>,
    w: &Arc<Worker>,
    mut g: DispatchGuard<'a>,
) -> DispatchGuard<'a> {
    w.q.lock().is_suspended = true;
    d.cond.broadcast();

    while g.state == DispatcherState::Suspending || g.state == DispatcherState::Suspended {
        let hot = w.q.lock().hotsigs;
        drop(g);
        let _ = vcpu_signal::sigtimedwait(&w.wq, hot, When::At(TICKS_INFINITY));
        g = d.mtx.lock();
    }

    w.q.lock().is_suspended = false;
    g
}

/// Whether an idle worker is free to retire itself. Keeps one worker alive
/// while signal monitors or timers are armed.
fn should_relinquish(g: &DispatchInner, w: &Arc<Worker>) -> bool {
    let q = w.q.lock();
    if !q.allow_relinquish {
        return false;
    }
    let has_armed_sigs = !q.hotsigs.difference(SigSet::of(SIGDISP)).is_empty();
    let has_armed_timers = !g.timers.is_empty();

    if !has_armed_sigs && !has_armed_timers && g.worker_count > g.attr.min_concurrency {
        return true;
    }
    if (has_armed_sigs || has_armed_timers)
        && g.worker_count > g.attr.min_concurrency
        && g.worker_count > 1
    {
        return true;
    }
    false
}

/// Finds the next unit of work for `w`, in order: due timers, the local
/// queue, work stolen from a sibling. Blocks on the worker's hot signals
/// when nothing is available. `None` tells the worker to relinquish itself.
fn get_next_work<'a>(
    d: &'a Arc<Dispatcher>,
    w: &Arc<Worker>,
    mut g: DispatchGuard<'a>,
) -> (DispatchGuard<'a>, Option<WorkUnit>) {
    let mut may_relinquish = false;
    {
        let mut q = w.q.lock();
        q.current_item = None;
        q.current_timer = None;
    }

    loop {
        // Timers have deadlines; queued items do not. Serve due timers first.
        let now = clock::now();
        if g.timers.first().map(|t| t.deadline <= now).unwrap_or(false) {
            let t = g.timers.remove(0);
            let item = t.item.clone().expect("queued timer without an item");
            let mut q = w.q.lock();
            q.current_item = Some(item.clone());
            q.current_timer = Some(t);
            return (g, Some(WorkUnit { item, is_timer: true }));
        }

        let item = {
            let mut q = w.q.lock();
            let item = q.queue.pop_front();
            if item.is_some() {
                q.work_count -= 1;
            }
            item
        };
        let item = item.or_else(|| d.steal_work_item(&mut g));
        if let Some(item) = item {
            w.q.lock().current_item = Some(item.clone());
            return (g, Some(WorkUnit { item, is_timer: false }));
        }

        let local_count = w.q.lock().work_count;
        if g.state >= DispatcherState::Terminating && local_count == 0 {
            return (g, None);
        }
        if may_relinquish {
            return (g, None);
        }

        // Compute the wait deadline: next timer if armed, else the idle
        // relinquish timeout, else forever.
        let deadline: Ticks = if let Some(t) = g.timers.first() {
            t.deadline
        } else if w.q.lock().allow_relinquish {
            clock::deadline_of(When::In(RELINQUISH_IDLE_WAIT))
        } else {
            TICKS_INFINITY
        };
        let hot = w.q.lock().hotsigs;

        drop(g);
        let res = vcpu_signal::sigtimedwait(&w.wq, hot, When::At(deadline));
        g = d.mtx.lock();

        if res == Err(Errno::TimedOut) && should_relinquish(&g, w) {
            may_relinquish = true;
        }
        if g.state == DispatcherState::Suspending || g.state == DispatcherState::Suspended {
            g = wait_for_resume(d, w, g);
        }
        if let Ok(info) = res {
            if info.signo != SIGDISP {
                d.submit_items_for_signal_locked(&mut g, info.signo, w);
            }
        }
    }
}

/// The worker run loop; entry closure of every worker VCPU.
pub(crate) fn worker_main(d: Arc<Dispatcher>, w: Arc<Worker>) {
    CURRENT_WORKER.with(|c| {
        *c.borrow_mut() = Some((Arc::downgrade(&d), Arc::downgrade(&w)));
    });

    let mut g = d.mtx.lock();
    loop {
        let (g2, unit) = get_next_work(&d, &w, g);
        g = g2;
        let Some(unit) = unit else { break };

        unit.item.set_state(ItemState::Executing);
        drop(g);

        unit.item.run();

        g = d.mtx.lock();
        match unit.item.kind() {
            ItemKind::UserItem | ItemKind::ConvItem | ItemKind::None => {
                d.retire_item_locked(&mut g, &unit.item);
            }
            ItemKind::UserSignal => {
                let flags = unit.item.flags();
                if flags.contains(ItemFlags::REPEATING) && !flags.contains(ItemFlags::CANCELLED) {
                    d.rearm_signal_item_locked(&mut g, &unit.item);
                } else {
                    d.retire_signal_item_locked(&mut g, &unit.item);
                }
            }
            ItemKind::UserTimer | ItemKind::ConvTimer => {
                let timer = w.q.lock().current_timer.take();
                if let Some(timer) = timer {
                    let flags = unit.item.flags();
                    if flags.contains(ItemFlags::REPEATING)
                        && !flags.contains(ItemFlags::CANCELLED)
                    {
                        d.rearm_timer_locked(&mut g, timer);
                    } else {
                        d.retire_timer_locked(&mut g, timer);
                    }
                } else if unit.is_timer {
                    log::warn!("timer item finished without its timer record");
                }
            }
        }
        w.q.lock().current_item = None;
    }

    relinquish_worker(&d, &w, g);
}

/// Takes the worker out of its dispatcher. Consumes the guard; the caller's
/// VCPU relinquishes itself by returning from the worker entry closure.
fn relinquish_worker(d: &Arc<Dispatcher>, w: &Arc<Worker>, mut g: DispatchGuard<'_>) {
    if let Some(pos) = g.workers.iter().position(|x| Arc::ptr_eq(x, w)) {
        g.workers.remove(pos);
        g.worker_count -= 1;
    }
    *w.vcpu.lock() = None;
    CURRENT_WORKER.with(|c| *c.borrow_mut() = None);
    d.cond.broadcast();
    drop(g);
    log::debug!("dispatcher '{}' worker retiring", d.name());
}
