//! Dispatcher timers.
//!
//! A timer pairs a dispatch item with an absolute deadline and an optional
//! repeat interval. All timers of a dispatcher share one queue sorted by
//! deadline (FIFO among equals); whichever worker wakes up first executes
//! the due head. Retired timer records are kept in a small cache.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{self, Ticks, When, TICKS_INFINITY};
use crate::errno::{Errno, KResult};

use super::item::{DispatchItem, ItemFlags, ItemKind, ItemState};
use super::{DispatchInner, Dispatcher, DispatcherState, MAX_TIMER_CACHE_COUNT};

/// Timer record; lives on the shared timer queue or in the timer cache.
pub(crate) struct DispatchTimer {
    pub item: Option<Arc<DispatchItem>>,
    /// Absolute tick at which the timer fires next.
    pub deadline: Ticks,
    /// Ticks between firings; `TICKS_INFINITY` for one-shot timers.
    pub interval: Ticks,
}

impl Dispatcher {
    fn acquire_cached_timer(&self, g: &mut DispatchInner) -> Box<DispatchTimer> {
        match g.timer_cache.pop() {
            Some(t) => t,
            None => Box::new(DispatchTimer {
                item: None,
                deadline: TICKS_INFINITY,
                interval: TICKS_INFINITY,
            }),
        }
    }

    fn cache_timer_locked(&self, g: &mut DispatchInner, mut timer: Box<DispatchTimer>) {
        timer.item = None;
        if g.timer_cache.len() < MAX_TIMER_CACHE_COUNT {
            g.timer_cache.push(timer);
        }
    }

    /// Retires both the timer record and its item.
    pub(crate) fn retire_timer_locked(&self, g: &mut DispatchInner, mut timer: Box<DispatchTimer>) {
        if let Some(item) = timer.item.take() {
            self.retire_item_locked(g, &item);
        }
        self.cache_timer_locked(g, timer);
    }

    /// Retires every queued timer. Runs unconditionally at termination.
    pub(crate) fn drain_timers_locked(&self, g: &mut DispatchInner) {
        while !g.timers.is_empty() {
            let t = g.timers.remove(0);
            self.retire_timer_locked(g, t);
        }
    }

    /// Removes the timer driving `item` from the queue and retires it.
    pub(crate) fn withdraw_timer_for_item_locked(
        &self,
        g: &mut DispatchInner,
        item: &Arc<DispatchItem>,
    ) {
        let pos = g.timers.iter().position(|t| {
            t.item
                .as_ref()
                .map(|i| Arc::ptr_eq(i, item))
                .unwrap_or(false)
        });
        if let Some(pos) = pos {
            let t = g.timers.remove(pos);
            self.retire_timer_locked(g, t);
        }
    }

    pub(crate) fn find_timer_item_by_tag_locked(
        &self,
        g: &DispatchInner,
        tag: u64,
    ) -> Option<Arc<DispatchItem>> {
        g.timers
            .iter()
            .filter_map(|t| t.item.clone())
            .find(|i| i.tag() == tag)
    }

    /// Inserts at the sorted position; equal deadlines keep arrival order.
    fn queue_timer_locked(&self, g: &mut DispatchInner, timer: Box<DispatchTimer>) {
        let pos = g
            .timers
            .iter()
            .position(|t| t.deadline > timer.deadline)
            .unwrap_or(g.timers.len());
        g.timers.insert(pos, timer);
    }

    /// Arms a timer for `item`. The item's kind and flags must already be
    /// set. Ensures at least one worker exists to serve the deadline.
    pub(crate) fn arm_timer_locked(
        self: &Arc<Self>,
        g: &mut DispatchInner,
        when: When,
        interval: Option<Duration>,
        item: &Arc<DispatchItem>,
    ) -> KResult<()> {
        if g.worker_count == 0 {
            self.acquire_worker(g)?;
        }

        let mut timer = self.acquire_cached_timer(g);
        item.set_state(ItemState::Scheduled);
        item.clear_flags(ItemFlags::CANCELLED);
        timer.item = Some(item.clone());
        timer.deadline = clock::deadline_of(when);
        timer.interval = interval
            .map(clock::ticks_from_duration)
            .unwrap_or(TICKS_INFINITY);

        self.queue_timer_locked(g, timer);

        // Any worker may pick the timer up; wake them all.
        self.wakeup_all_workers(g);
        Ok(())
    }

    /// Re-queues a repeating timer at the next deadline that is still in
    /// the future, skipping missed firings. Zero and infinite intervals do
    /// not loop.
    pub(crate) fn rearm_timer_locked(&self, g: &mut DispatchInner, mut timer: Box<DispatchTimer>) {
        let now = clock::now();
        loop {
            timer.deadline = timer.deadline.saturating_add(timer.interval);
            if timer.deadline > now || timer.interval == 0 || timer.interval == TICKS_INFINITY {
                break;
            }
        }

        if let Some(item) = timer.item.as_ref() {
            item.set_state(ItemState::Scheduled);
            item.clear_flags(ItemFlags::CANCELLED);
        }
        self.queue_timer_locked(g, timer);
        // No wakeup: the caller is a worker, so at least one is awake.
    }

    // -- Timer API --------------------------------------------------------

    /// Schedules a user item to run once at `when`.
    pub fn submit_after(
        self: &Arc<Self>,
        when: When,
        item: &Arc<DispatchItem>,
    ) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }
        let state = item.state();
        if state == ItemState::Scheduled || state == ItemState::Executing {
            return Err(Errno::Busy);
        }
        item.set_kind(ItemKind::UserTimer);
        item.set_flags(ItemFlags::empty());
        self.arm_timer_locked(&mut g, when, None, item)
    }

    /// Schedules a user item to run at `when` and then every `interval`.
    pub fn submit_repeating(
        self: &Arc<Self>,
        when: When,
        interval: Duration,
        item: &Arc<DispatchItem>,
    ) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }
        let state = item.state();
        if state == ItemState::Scheduled || state == ItemState::Executing {
            return Err(Errno::Busy);
        }
        item.set_kind(ItemKind::UserTimer);
        item.set_flags(ItemFlags::REPEATING);
        self.arm_timer_locked(&mut g, when, Some(interval), item)
    }

    /// Runs a closure once at `when`.
    pub fn run_after(
        self: &Arc<Self>,
        when: When,
        func: impl FnOnce() + Send + 'static,
    ) -> KResult<()> {
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
            ItemKind::ConvTimer,
            ItemFlags::CACHEABLE,
        );

        if let Err(err) = self.arm_timer_locked(&mut g, when, None, &item) {
            self.cache_item_locked(&mut g, &item);
            return Err(err);
        }
        Ok(())
    }

    /// Runs a closure at `when` and then every `interval` until cancelled
    /// or the dispatcher terminates.
    pub fn run_repeating(
        self: &Arc<Self>,
        when: When,
        interval: Duration,
        func: impl FnMut() + Send + 'static,
    ) -> KResult<()> {
        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }

        let item = self.acquire_cached_conv_item(&mut g);
        let mut func = func;
        item.set_conv(
            Box::new(move || {
                func();
                0
            }),
            ItemKind::ConvTimer,
            ItemFlags::CACHEABLE | ItemFlags::REPEATING,
        );

        if let Err(err) = self.arm_timer_locked(&mut g, when, Some(interval), &item) {
            self.cache_item_locked(&mut g, &item);
            return Err(err);
        }
        Ok(())
    }
}
