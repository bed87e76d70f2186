//! Dispatchers.
//!
//! A dispatcher multiplexes submitted work items, timers and signal
//! monitors over a pool of worker VCPUs. Concurrency is elastic between a
//! minimum and maximum worker count: submission grows the pool, idle
//! workers relinquish themselves. A serial dispatcher is simply one with a
//! maximum concurrency of one.
//!
//! All dispatcher state lives behind one kernel mutex; workers drop it only
//! around their signal waits and while running an item function.

pub mod item;
pub mod signal;
pub mod timer;
pub mod worker;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::errno::{Errno, KResult};
use crate::kernel::kernel;
use crate::sched::cnd::Cnd;
use crate::sched::mtx::{Mtx, MtxGuard};
use crate::sched::vcpu::{self, SchedParams, Vid};
use crate::sched::{Qos, QOS_PRI_HIGHEST, QOS_PRI_LOWEST};

use item::{ItemFlags, ItemKind};
use signal::SigTrap;
use timer::DispatchTimer;
use worker::Worker;

pub use item::{DispatchItem, ItemState};
pub use worker::{current_item, current_item_cancelled, current_queue};

pub const DISPATCH_MAX_NAME_LENGTH: usize = 7;

const MAX_CONV_ITEM_CACHE_COUNT: usize = 8;
pub(crate) const MAX_TIMER_CACHE_COUNT: usize = 4;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubmitFlags: u8 {
        /// The submitter intends to await the item.
        const AWAITABLE = 0x01;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TerminateFlags: u8 {
        /// Retire all pending items without running them.
        const CANCEL_ALL = 0x01;
        /// Block until every worker has relinquished itself.
        const AWAIT_ALL = 0x02;
    }
}

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatcherState {
    Active,
    Suspending,
    Suspended,
    Terminating,
    Terminated,
}

/// Construction attributes.
#[derive(Debug, Clone)]
pub struct DispatchAttr {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub qos: Qos,
    pub priority: i8,
    /// Display name, capped at [`DISPATCH_MAX_NAME_LENGTH`] characters.
    pub name: String,
}

impl Default for DispatchAttr {
    fn default() -> Self {
        DispatchAttr {
            min_concurrency: 1,
            max_concurrency: 1,
            qos: Qos::Utility,
            priority: 0,
            name: String::new(),
        }
    }
}

/// Concurrency figures reported by [`Dispatcher::concurrency_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyInfo {
    pub minimum: usize,
    pub maximum: usize,
    pub current: usize,
}

/// Why worker capacity is being (re)examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CapacityReason {
    WorkItem,
    SignalItem,
    Timer,
}

pub(crate) struct DispatchInner {
    pub attr: DispatchAttr,
    pub workers: VecDeque<Arc<Worker>>,
    pub worker_count: usize,
    /// Finished awaitable items parked until awaited.
    pub zombies: VecDeque<Arc<DispatchItem>>,
    pub item_cache: Vec<Arc<DispatchItem>>,
    /// Shared timer queue, ascending by deadline, FIFO among equals.
    pub timers: Vec<Box<DispatchTimer>>,
    pub timer_cache: Vec<Box<DispatchTimer>>,
    /// Lazily allocated, one trap per possible signal number.
    pub sigtraps: Option<Vec<SigTrap>>,
    pub alloced_sigs: crate::signal::SigSet,
    pub state: DispatcherState,
    pub suspension_count: i32,
}

pub struct Dispatcher {
    pub(crate) mtx: Mtx<DispatchInner>,
    pub(crate) cond: Cnd,
    name: String,
    groupid: Vid,
}

pub(crate) type DispatchGuard<'a> = MtxGuard<'a, DispatchInner>;

impl Dispatcher {
    /// Creates a dispatcher and pre-acquires its minimum worker complement.
    pub fn create(attr: DispatchAttr) -> KResult<Arc<Dispatcher>> {
        if attr.min_concurrency < 1
            || attr.min_concurrency > attr.max_concurrency
            || attr.max_concurrency > i8::MAX as usize
        {
            return Err(Errno::Inval);
        }
        if attr.qos < Qos::Background || attr.qos > Qos::Realtime {
            return Err(Errno::Inval);
        }
        if attr.priority < QOS_PRI_LOWEST || attr.priority > QOS_PRI_HIGHEST {
            return Err(Errno::Inval);
        }

        let mut name: String = attr.name.chars().take(DISPATCH_MAX_NAME_LENGTH).collect();
        if name.is_empty() {
            name = String::from("kd");
        }

        let groupid = kernel().alloc_groupid();
        let min = attr.min_concurrency;
        let d = Arc::new(Dispatcher {
            mtx: Mtx::new(DispatchInner {
                attr,
                workers: VecDeque::new(),
                worker_count: 0,
                zombies: VecDeque::new(),
                item_cache: Vec::new(),
                timers: Vec::new(),
                timer_cache: Vec::new(),
                sigtraps: None,
                alloced_sigs: crate::signal::SigSet::EMPTY,
                state: DispatcherState::Active,
                suspension_count: 0,
            }),
            cond: Cnd::new(),
            name,
            groupid,
        });

        {
            let mut g = d.mtx.lock();
            for _ in 0..min {
                d.acquire_worker(&mut g)?;
            }
        }

        log::info!("dispatcher '{}' created (group {})", d.name, groupid);
        Ok(d)
    }

    /// Releases a terminated dispatcher's cached resources. Fails with
    /// `EBUSY` while the dispatcher has not terminated or unawaited zombie
    /// items remain.
    pub fn destroy(&self) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state < DispatcherState::Terminated || !g.zombies.is_empty() {
            return Err(Errno::Busy);
        }
        g.timer_cache.clear();
        g.item_cache.clear();
        g.sigtraps = None;
        g.workers.clear();
        g.timers.clear();
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group id of this dispatcher's workers; the target for group-scoped
    /// signal delivery.
    pub fn signal_target(&self) -> Vid {
        self.groupid
    }

    pub(crate) fn group_id(&self) -> Vid {
        self.groupid
    }

    // -- Workers ----------------------------------------------------------

    pub(crate) fn acquire_worker(self: &Arc<Self>, g: &mut DispatchInner) -> KResult<()> {
        let worker = Worker::create(self, &g.attr)?;
        g.workers.push_back(worker);
        g.worker_count += 1;
        Ok(())
    }

    pub(crate) fn wakeup_all_workers(&self, g: &DispatchInner) {
        for w in g.workers.iter() {
            w.wakeup();
        }
    }

    /// Grows the worker pool toward the minimum, or toward the maximum when
    /// new work arrives. Failing to add one more worker is only fatal when
    /// there are none at all.
    pub(crate) fn ensure_worker_capacity(
        self: &Arc<Self>,
        g: &mut DispatchInner,
        reason: CapacityReason,
    ) -> KResult<()> {
        let grow = g.worker_count < g.attr.min_concurrency
            || (reason == CapacityReason::WorkItem && g.worker_count < g.attr.max_concurrency);

        if grow {
            if let Err(err) = self.acquire_worker(g) {
                if g.worker_count == 0 {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Takes the head item of the busiest worker's queue, for rebalancing.
    pub(crate) fn steal_work_item(&self, g: &mut DispatchInner) -> Option<Arc<DispatchItem>> {
        let mut busiest: Option<Arc<Worker>> = None;
        let mut busiest_count = 0usize;
        for w in g.workers.iter() {
            let count = w.q.lock().work_count;
            if count > busiest_count {
                busiest_count = count;
                busiest = Some(w.clone());
            }
        }

        let victim = busiest?;
        let mut q = victim.q.lock();
        let item = q.queue.pop_front();
        if item.is_some() {
            q.work_count -= 1;
        }
        item
    }

    // -- Submission -------------------------------------------------------

    /// Hands `item` to the least loaded worker. The item's kind and flags
    /// must already be set; the cancelled flag is cleared here.
    pub(crate) fn submit_locked(
        self: &Arc<Self>,
        g: &mut DispatchInner,
        item: &Arc<DispatchItem>,
    ) -> KResult<()> {
        let state = item.state();
        if state == ItemState::Scheduled || state == ItemState::Executing {
            return Err(Errno::Busy);
        }

        self.ensure_worker_capacity(g, CapacityReason::WorkItem)?;

        let mut best: Option<Arc<Worker>> = None;
        let mut best_count = usize::MAX;
        for w in g.workers.iter() {
            let count = w.q.lock().work_count;
            if count <= best_count {
                best_count = count;
                best = Some(w.clone());
            }
        }
        let Some(best) = best else {
            return Err(Errno::NoMem);
        };

        item.set_state(ItemState::Scheduled);
        item.clear_flags(ItemFlags::CANCELLED);
        best.submit(item.clone(), true);
        Ok(())
    }

    /// Submits a user item for asynchronous execution.
    pub fn submit(self: &Arc<Self>, flags: SubmitFlags, item: &Arc<DispatchItem>) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }
        item.set_kind(ItemKind::UserItem);
        item.set_flags(if flags.contains(SubmitFlags::AWAITABLE) {
            ItemFlags::AWAITABLE
        } else {
            ItemFlags::empty()
        });
        self.submit_locked(&mut g, item)
    }

    /// Submits a user item and blocks until it has finished.
    pub fn submit_sync(self: &Arc<Self>, item: &Arc<DispatchItem>) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }
        item.set_kind(ItemKind::UserItem);
        item.set_flags(ItemFlags::AWAITABLE);
        self.submit_locked(&mut g, item)?;
        let (_g, res) = self.await_locked(g, item);
        res
    }

    // -- Awaiting ---------------------------------------------------------

    fn await_locked<'a>(
        &self,
        mut g: DispatchGuard<'a>,
        item: &Arc<DispatchItem>,
    ) -> (DispatchGuard<'a>, KResult<()>) {
        while !item.state().is_done() {
            let (g2, res) = self.cond.wait(g);
            g = g2;
            if let Err(e) = res {
                return (g, Err(e));
            }
        }
        if let Some(pos) = g.zombies.iter().position(|z| Arc::ptr_eq(z, item)) {
            g.zombies.remove(pos);
        }
        (g, Ok(()))
    }

    /// Blocks until `item` has finished or been cancelled and reclaims it
    /// from the zombie list.
    pub fn await_item(&self, item: &Arc<DispatchItem>) -> KResult<()> {
        let g = self.mtx.lock();
        let (_g, res) = self.await_locked(g, item);
        res
    }

    // -- Retiring ---------------------------------------------------------

    pub(crate) fn zombify_item_locked(&self, g: &mut DispatchInner, item: &Arc<DispatchItem>) {
        g.zombies.push_back(item.clone());
        self.cond.broadcast();
    }

    /// Settles a finished or withdrawn item: cancelled or finished state,
    /// then zombie list, item cache, or retire callback.
    pub(crate) fn retire_item_locked(&self, g: &mut DispatchInner, item: &Arc<DispatchItem>) {
        if item.flags().contains(ItemFlags::CANCELLED) {
            item.set_state(ItemState::Cancelled);
        } else {
            item.set_state(ItemState::Finished);
        }

        if item.flags().contains(ItemFlags::AWAITABLE) {
            self.zombify_item_locked(g, item);
        } else if item.flags().contains(ItemFlags::CACHEABLE) {
            self.cache_item_locked(g, item);
        } else {
            item.call_retire();
        }
    }

    // -- Conv-item cache --------------------------------------------------

    pub(crate) fn acquire_cached_conv_item(&self, g: &mut DispatchInner) -> Arc<DispatchItem> {
        match g.item_cache.pop() {
            Some(item) => item,
            None => DispatchItem::new_conv(),
        }
    }

    pub(crate) fn cache_item_locked(&self, g: &mut DispatchInner, item: &Arc<DispatchItem>) {
        if g.item_cache.len() < MAX_CONV_ITEM_CACHE_COUNT {
            item.reset_cached();
            g.item_cache.push(item.clone());
        }
    }

    // -- Convenience API --------------------------------------------------

    /// Runs a closure on the dispatcher, fire-and-forget.
    pub fn run_async(self: &Arc<Self>, func: impl FnOnce() + Send + 'static) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }

        let item = self.acquire_cached_conv_item(&mut g);
        let mut func = Some(func);
        item.set_conv(
            Box::new(move || {
                if let Some(f) = func.take() {
                    f();
                }
                0
            }),
            ItemKind::ConvItem,
            ItemFlags::CACHEABLE,
        );

        if let Err(err) = self.submit_locked(&mut g, &item) {
            self.cache_item_locked(&mut g, &item);
            return Err(err);
        }
        Ok(())
    }

    /// Runs a closure on the dispatcher and returns its result.
    pub fn run_sync(self: &Arc<Self>, func: impl FnOnce() -> i32 + Send + 'static) -> KResult<i32> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }

        let item = self.acquire_cached_conv_item(&mut g);
        let mut func = Some(func);
        item.set_conv(
            Box::new(move || func.take().map(|f| f()).unwrap_or(0)),
            ItemKind::ConvItem,
            ItemFlags::CACHEABLE | ItemFlags::AWAITABLE,
        );

        if let Err(err) = self.submit_locked(&mut g, &item) {
            self.cache_item_locked(&mut g, &item);
            return Err(err);
        }
        let (mut g, res) = self.await_locked(g, &item);
        let value = item.result();
        if item.state().is_done() {
            self.cache_item_locked(&mut g, &item);
        }
        drop(g);
        res.map(|_| value)
    }

    // -- Cancellation -----------------------------------------------------

    pub(crate) fn do_cancel_item_locked(&self, g: &mut DispatchInner, item: &Arc<DispatchItem>) {
        match item.state() {
            ItemState::Scheduled => {
                item.add_flags(ItemFlags::CANCELLED);
                match item.kind() {
                    ItemKind::UserItem | ItemKind::ConvItem => {
                        let workers: Vec<Arc<Worker>> = g.workers.iter().cloned().collect();
                        for w in workers {
                            if w.withdraw_item(self, g, item) {
                                break;
                            }
                        }
                    }
                    ItemKind::UserTimer | ItemKind::ConvTimer => {
                        self.withdraw_timer_for_item_locked(g, item);
                    }
                    ItemKind::UserSignal => {
                        self.withdraw_signal_item_locked(g, item);
                    }
                    ItemKind::None => {}
                }
            }
            ItemState::Executing => {
                // Cooperative: the running function observes the flag.
                item.add_flags(ItemFlags::CANCELLED);
            }
            _ => {}
        }
    }

    /// Cancels one item. Pending items are retired synchronously; an
    /// executing one only gets its cancel flag raised.
    pub fn cancel_item(&self, item: &Arc<DispatchItem>) {
        let mut g = self.mtx.lock();
        self.do_cancel_item_locked(&mut g, item);
    }

    /// Cancels the first item carrying `tag`: the caller's executing item
    /// first, then the timer queue, then the worker queues.
    pub fn cancel_by_tag(&self, tag: u64) {
        if tag == 0 {
            return;
        }
        let mut g = self.mtx.lock();

        if let Some((owner, item)) = worker::current_worker_and_item() {
            if std::ptr::eq(Arc::as_ptr(&owner), self) && item.tag() == tag {
                self.do_cancel_item_locked(&mut g, &item);
                return;
            }
        }

        let found = self
            .find_timer_item_by_tag_locked(&g, tag)
            .or_else(|| {
                g.workers.iter().find_map(|w| {
                    w.q.lock()
                        .queue
                        .iter()
                        .find(|i| i.tag() == tag)
                        .cloned()
                })
            });
        if let Some(item) = found {
            self.do_cancel_item_locked(&mut g, &item);
        }
    }

    /// Whether `item` ended in the cancelled state.
    pub fn item_cancelled(&self, item: &Arc<DispatchItem>) -> bool {
        let _g = self.mtx.lock();
        item.state() == ItemState::Cancelled
    }

    // -- Scheduling parameters -------------------------------------------

    fn apply_sched_params_locked(&self, g: &mut DispatchInner, qos: Qos, priority: i8) {
        g.attr.qos = qos;
        g.attr.priority = priority;
        let params = SchedParams { qos, priority };
        for w in g.workers.iter() {
            if let Some(vp) = w.vcpu() {
                let _ = vcpu::set_sched_params(&vp, params);
            }
        }
    }

    pub fn qos(&self) -> Qos {
        self.mtx.lock().attr.qos
    }

    pub fn set_qos(&self, qos: Qos) -> KResult<()> {
        if qos < Qos::Background || qos > Qos::Realtime {
            return Err(Errno::Inval);
        }
        let mut g = self.mtx.lock();
        let priority = g.attr.priority;
        self.apply_sched_params_locked(&mut g, qos, priority);
        Ok(())
    }

    pub fn priority(&self) -> i8 {
        self.mtx.lock().attr.priority
    }

    pub fn set_priority(&self, priority: i8) -> KResult<()> {
        if !(QOS_PRI_LOWEST..=QOS_PRI_HIGHEST).contains(&priority) {
            return Err(Errno::Inval);
        }
        let mut g = self.mtx.lock();
        let qos = g.attr.qos;
        self.apply_sched_params_locked(&mut g, qos, priority);
        Ok(())
    }

    pub fn concurrency_info(&self) -> ConcurrencyInfo {
        let g = self.mtx.lock();
        ConcurrencyInfo {
            minimum: g.attr.min_concurrency,
            maximum: g.attr.max_concurrency,
            current: g.worker_count,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.mtx.lock().state
    }

    // -- Suspend / resume / terminate ------------------------------------

    /// Suspends the dispatcher. The first suspension blocks until every
    /// worker has parked in its suspend loop.
    pub fn suspend(&self) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }

        g.suspension_count += 1;
        if g.suspension_count != 1 {
            return Ok(());
        }
        if g.state == DispatcherState::Active {
            g.state = DispatcherState::Suspending;
        }
        self.wakeup_all_workers(&g);

        loop {
            let all_parked = g.workers.iter().all(|w| w.q.lock().is_suspended);
            if all_parked {
                g.state = DispatcherState::Suspended;
                break;
            }
            let (g2, res) = self.cond.wait(g);
            g = g2;
            res?;
        }
        log::debug!("dispatcher '{}' suspended", self.name);
        Ok(())
    }

    /// Undoes one suspension; the dispatcher resumes work when the count
    /// reaches zero. Resuming an active dispatcher is a no-op.
    pub fn resume(&self) {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating || g.suspension_count == 0 {
            return;
        }
        g.suspension_count -= 1;
        if g.suspension_count == 0 {
            g.state = DispatcherState::Active;
            self.wakeup_all_workers(&g);
            log::debug!("dispatcher '{}' resumed", self.name);
        }
    }

    /// Moves the dispatcher into the terminating state. Pending timers are
    /// always drained; pending work items only with `CANCEL_ALL`. With
    /// `AWAIT_ALL` the call blocks until the dispatcher has terminated.
    pub fn terminate(&self, flags: TerminateFlags) -> KResult<()> {
        let mut awaitable = false;
        {
            let mut g = self.mtx.lock();
            if g.state < DispatcherState::Terminating {
                g.state = DispatcherState::Terminating;
                awaitable = true;

                if flags.contains(TerminateFlags::CANCEL_ALL) {
                    let workers: Vec<Arc<Worker>> = g.workers.iter().cloned().collect();
                    for w in workers {
                        w.drain(self, &mut g);
                    }
                }
                self.drain_timers_locked(&mut g);
                self.wakeup_all_workers(&g);
                log::info!("dispatcher '{}' terminating", self.name);
            }
        }

        if awaitable && flags.contains(TerminateFlags::AWAIT_ALL) {
            self.await_termination()?;
        }
        Ok(())
    }

    /// Blocks until the last worker has relinquished itself, then marks the
    /// dispatcher terminated. `ESRCH` when termination was never requested.
    pub fn await_termination(&self) -> KResult<()> {
        let mut g = self.mtx.lock();
        match g.state {
            DispatcherState::Active
            | DispatcherState::Suspending
            | DispatcherState::Suspended => Err(Errno::Srch),
            DispatcherState::Terminating => {
                while g.worker_count > 0 {
                    let (g2, res) = self.cond.wait(g);
                    g = g2;
                    res?;
                }
                g.state = DispatcherState::Terminated;
                log::info!("dispatcher '{}' terminated", self.name);
                Ok(())
            }
            DispatcherState::Terminated => Ok(()),
        }
    }
}
