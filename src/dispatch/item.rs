//! Dispatch items.
//!
//! An item is a value-semantics invocation record: one closure, one state
//! machine, at most one container at a time (worker queue, timer queue,
//! signal-trap list, zombie list, cache, or idle in user hands).
//!
//! Permissible state transitions:
//! `Idle -> Scheduled`, `Scheduled -> Executing | Cancelled`,
//! `Executing -> Finished | Cancelled`, `Finished | Cancelled -> Scheduled`.
//! Cancellation of a scheduled or executing item goes through the cancelled
//! flag first; an executing item has to observe the request itself before
//! the cancelled state is reached.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::signal::SigNo;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ItemFlags: u8 {
        /// The item may be awaited; it parks on the zombie list when done.
        const AWAITABLE = 0x01;
        /// Cancellation requested; takes effect when execution settles.
        const CANCELLED = 0x20;
        /// Dispatcher-owned; returns to the item cache when done.
        const CACHEABLE = 0x40;
        /// Auto-resubmitted after execution unless cancelled.
        const REPEATING = 0x80;
    }
}

/// Externally visible item lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ItemState {
    Idle = 0,
    Scheduled = 1,
    Executing = 2,
    Finished = 3,
    Cancelled = 4,
}

impl ItemState {
    pub fn is_done(self) -> bool {
        self >= ItemState::Finished
    }

    const fn from_raw(raw: u8) -> ItemState {
        match raw {
            0 => ItemState::Idle,
            1 => ItemState::Scheduled,
            2 => ItemState::Executing,
            3 => ItemState::Finished,
            _ => ItemState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ItemKind {
    None = 0,
    UserItem = 1,
    UserSignal = 2,
    UserTimer = 3,
    ConvItem = 4,
    ConvTimer = 5,
}

impl ItemKind {
    const fn from_raw(raw: u8) -> ItemKind {
        match raw {
            1 => ItemKind::UserItem,
            2 => ItemKind::UserSignal,
            3 => ItemKind::UserTimer,
            4 => ItemKind::ConvItem,
            5 => ItemKind::ConvTimer,
            _ => ItemKind::None,
        }
    }
}

type UserFn = Box<dyn FnMut(&DispatchItem) + Send>;
type ConvFn = Box<dyn FnMut() -> i32 + Send>;
type RetireFn = Box<dyn FnMut(&DispatchItem) + Send>;

pub(crate) enum ItemWork {
    None,
    /// User-supplied item function; receives the item for cancel queries.
    User(UserFn),
    /// Convenience-API closure; its return value lands in the result slot.
    Conv(ConvFn),
}

/// One unit of dispatchable work.
pub struct DispatchItem {
    work: spin::Mutex<ItemWork>,
    retire_fn: spin::Mutex<Option<RetireFn>>,
    state: AtomicU8,
    flags: AtomicU8,
    kind: AtomicU8,
    /// Monitored signal number for signal items.
    signo: AtomicU32,
    /// Optional user tag for tag-based cancellation; 0 means untagged.
    tag: AtomicU64,
    result: AtomicI32,
}

impl DispatchItem {
    /// Creates an item around a work function. The function may run multiple
    /// times when the item is resubmitted or repeating.
    pub fn new(func: impl FnMut(&DispatchItem) + Send + 'static) -> Arc<DispatchItem> {
        Arc::new(DispatchItem {
            work: spin::Mutex::new(ItemWork::User(Box::new(func))),
            retire_fn: spin::Mutex::new(None),
            state: AtomicU8::new(ItemState::Idle as u8),
            flags: AtomicU8::new(0),
            kind: AtomicU8::new(ItemKind::None as u8),
            signo: AtomicU32::new(0),
            tag: AtomicU64::new(0),
            result: AtomicI32::new(0),
        })
    }

    /// As [`new`](Self::new) with a retire callback that runs when the
    /// dispatcher is done with the item. The callback runs with the
    /// dispatcher locked and must not call back into it.
    pub fn with_retire(
        func: impl FnMut(&DispatchItem) + Send + 'static,
        retire: impl FnMut(&DispatchItem) + Send + 'static,
    ) -> Arc<DispatchItem> {
        let item = DispatchItem::new(func);
        *item.retire_fn.lock() = Some(Box::new(retire));
        item
    }

    pub(crate) fn new_conv() -> Arc<DispatchItem> {
        Arc::new(DispatchItem {
            work: spin::Mutex::new(ItemWork::None),
            retire_fn: spin::Mutex::new(None),
            state: AtomicU8::new(ItemState::Idle as u8),
            flags: AtomicU8::new(0),
            kind: AtomicU8::new(ItemKind::None as u8),
            signo: AtomicU32::new(0),
            tag: AtomicU64::new(0),
            result: AtomicI32::new(0),
        })
    }

    pub fn state(&self) -> ItemState {
        ItemState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ItemState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the item ended up cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == ItemState::Cancelled
    }

    /// Whether cancellation has been requested or concluded. Executing item
    /// functions poll this.
    pub fn cancel_requested(&self) -> bool {
        self.state() == ItemState::Cancelled || self.flags().contains(ItemFlags::CANCELLED)
    }

    pub fn set_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Release);
    }

    pub fn tag(&self) -> u64 {
        self.tag.load(Ordering::Acquire)
    }

    /// Result of the most recent convenience-API run.
    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    pub(crate) fn flags(&self) -> ItemFlags {
        ItemFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: ItemFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn add_flags(&self, flags: ItemFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ItemFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn kind(&self) -> ItemKind {
        ItemKind::from_raw(self.kind.load(Ordering::Acquire))
    }

    pub(crate) fn set_kind(&self, kind: ItemKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub(crate) fn signo(&self) -> SigNo {
        self.signo.load(Ordering::Acquire)
    }

    pub(crate) fn set_signo(&self, signo: SigNo) {
        self.signo.store(signo, Ordering::Release);
    }

    pub(crate) fn set_conv(&self, func: ConvFn, kind: ItemKind, flags: ItemFlags) {
        *self.work.lock() = ItemWork::Conv(func);
        *self.retire_fn.lock() = None;
        self.set_kind(kind);
        self.set_flags(flags);
        self.result.store(0, Ordering::Release);
        self.set_state(ItemState::Idle);
    }

    /// Clears everything before the item re-enters the conv cache.
    pub(crate) fn reset_cached(&self) {
        *self.work.lock() = ItemWork::None;
        *self.retire_fn.lock() = None;
        self.set_kind(ItemKind::None);
        self.set_flags(ItemFlags::empty());
        self.set_signo(0);
        self.set_tag(0);
        self.set_state(ItemState::Idle);
    }

    /// Runs the item function. A panicking function is contained here so it
    /// cannot take its worker down with it.
    pub(crate) fn run(self: &Arc<Self>) {
        let mut work = self.work.lock();
        let res = match &mut *work {
            ItemWork::None => Ok(()),
            ItemWork::User(f) => panic::catch_unwind(AssertUnwindSafe(|| f(self))),
            ItemWork::Conv(f) => panic::catch_unwind(AssertUnwindSafe(|| {
                let r = f();
                self.result.store(r, Ordering::Release);
            })),
        };
        if res.is_err() {
            log::error!("dispatch item function panicked");
        }
    }

    pub(crate) fn call_retire(self: &Arc<Self>) {
        let mut retire = self.retire_fn.lock();
        if let Some(f) = retire.as_mut() {
            f(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        let item = DispatchItem::new(|_| {});
        assert_eq!(item.state(), ItemState::Idle);
        item.set_state(ItemState::Scheduled);
        assert_eq!(item.state(), ItemState::Scheduled);
        assert!(!item.state().is_done());
        item.set_state(ItemState::Cancelled);
        assert!(item.state().is_done());
        assert!(item.is_cancelled());
    }

    #[test]
    fn cancel_request_is_visible_before_completion() {
        let item = DispatchItem::new(|_| {});
        item.set_state(ItemState::Executing);
        assert!(!item.cancel_requested());
        item.add_flags(ItemFlags::CANCELLED);
        assert!(item.cancel_requested());
    }

    #[test]
    fn conv_run_stores_the_result() {
        let item = DispatchItem::new_conv();
        item.set_conv(Box::new(|| 17), ItemKind::ConvItem, ItemFlags::CACHEABLE);
        item.run();
        assert_eq!(item.result(), 17);
    }

    #[test]
    fn reset_clears_identity() {
        let item = DispatchItem::new_conv();
        item.set_conv(Box::new(|| 1), ItemKind::ConvTimer, ItemFlags::REPEATING);
        item.set_tag(9);
        item.reset_cached();
        assert_eq!(item.kind(), ItemKind::None);
        assert_eq!(item.tag(), 0);
        assert_eq!(item.state(), ItemState::Idle);
    }
}
