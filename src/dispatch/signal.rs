//! Dispatcher signal monitors.
//!
//! A signal trap holds the monitor items registered for one signal number.
//! While at least one monitor is armed, the signal's bit is part of every
//! worker's hot-signal set; a worker that wakes up on the signal schedules
//! every registered monitor onto its own queue.

use std::sync::Arc;

use crate::errno::{Errno, KResult};
use crate::sched::vcpu_signal;
use crate::signal::{sig_in_range, SigNo, SIGMAX, SIGSET_NOSENDMON, SIGUSRMAX, SIGUSRMIN};

use super::item::{DispatchItem, ItemFlags, ItemKind, ItemState};
use super::worker::Worker;
use super::{CapacityReason, DispatchInner, Dispatcher, DispatcherState};

/// Registered monitors for one signal number.
#[derive(Default)]
pub(crate) struct SigTrap {
    pub monitors: Vec<Arc<DispatchItem>>,
    pub count: usize,
}

impl Dispatcher {
    /// Adds or removes `signo` in every worker's hot-signal set and pokes
    /// the workers so the change takes effect.
    fn enable_signal_locked(&self, g: &mut DispatchInner, signo: SigNo, enable: bool) {
        for w in g.workers.iter() {
            let mut q = w.q.lock();
            if enable {
                q.hotsigs.insert(signo);
            } else {
                q.hotsigs.remove(signo);
            }
        }
        self.wakeup_all_workers(g);
    }

    /// Removes a pending monitor item from its trap and retires it.
    pub(crate) fn withdraw_signal_item_locked(
        &self,
        g: &mut DispatchInner,
        item: &Arc<DispatchItem>,
    ) {
        let signo = item.signo();
        if signo == 0 {
            return;
        }
        let removed = match g.sigtraps.as_mut() {
            Some(traps) => {
                let trap = &mut traps[(signo - 1) as usize];
                match trap.monitors.iter().position(|m| Arc::ptr_eq(m, item)) {
                    Some(pos) => {
                        trap.monitors.remove(pos);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };

        if removed {
            self.retire_item_locked(g, item);
            let trap = &mut g.sigtraps.as_mut().expect("trap table vanished")[(signo - 1) as usize];
            trap.count -= 1;
            if trap.count == 0 {
                self.enable_signal_locked(g, signo, false);
            }
        }
    }

    /// Retires a monitor item that has finished executing.
    pub(crate) fn retire_signal_item_locked(
        &self,
        g: &mut DispatchInner,
        item: &Arc<DispatchItem>,
    ) {
        let signo = item.signo();
        self.retire_item_locked(g, item);

        if signo != 0 {
            if let Some(traps) = g.sigtraps.as_mut() {
                let trap = &mut traps[(signo - 1) as usize];
                trap.count -= 1;
                if trap.count == 0 {
                    self.enable_signal_locked(g, signo, false);
                }
            }
        }
    }

    /// Puts a repeating monitor item back into its trap so the next signal
    /// arrival schedules it again.
    pub(crate) fn rearm_signal_item_locked(&self, g: &mut DispatchInner, item: &Arc<DispatchItem>) {
        let signo = item.signo();
        if let Some(traps) = g.sigtraps.as_mut() {
            item.set_state(ItemState::Idle);
            traps[(signo - 1) as usize].monitors.push(item.clone());
        }
    }

    /// Schedules every monitor of `signo` onto the receiving worker.
    pub(crate) fn submit_items_for_signal_locked(
        &self,
        g: &mut DispatchInner,
        signo: SigNo,
        worker: &Arc<Worker>,
    ) {
        let Some(traps) = g.sigtraps.as_mut() else {
            return;
        };
        let trap = &mut traps[(signo - 1) as usize];
        while !trap.monitors.is_empty() {
            let item = trap.monitors.remove(0);
            item.set_state(ItemState::Scheduled);
            item.clear_flags(ItemFlags::CANCELLED);
            // The receiving worker is awake already; no wakeup needed.
            worker.submit(item, false);
        }
    }

    /// Registers `item` to run whenever `signo` arrives. Repeating monitors
    /// re-arm after each execution until cancelled.
    pub fn monitor_signal(
        self: &Arc<Self>,
        signo: SigNo,
        item: &Arc<DispatchItem>,
        repeating: bool,
    ) -> KResult<()> {
        if !sig_in_range(signo) || SIGSET_NOSENDMON.has(signo) {
            return Err(Errno::Inval);
        }

        let mut g = self.mtx.lock();
        if g.state >= DispatcherState::Terminating {
            return Err(Errno::Terminated);
        }

        self.ensure_worker_capacity(&mut g, CapacityReason::SignalItem)?;

        if g.sigtraps.is_none() {
            let mut traps = Vec::with_capacity(SIGMAX as usize);
            traps.resize_with(SIGMAX as usize, SigTrap::default);
            g.sigtraps = Some(traps);
        }

        item.set_kind(ItemKind::UserSignal);
        item.set_signo(signo);
        item.set_flags(if repeating {
            ItemFlags::REPEATING
        } else {
            ItemFlags::empty()
        });
        item.set_state(ItemState::Idle);

        let trap = &mut g.sigtraps.as_mut().expect("just allocated")[(signo - 1) as usize];
        trap.monitors.push(item.clone());
        trap.count += 1;
        let first = trap.count == 1;

        if first {
            self.enable_signal_locked(&mut g, signo, true);
        }
        Ok(())
    }

    /// Allocates a user signal for this dispatcher. A non-positive request
    /// picks the highest-numbered free signal.
    pub fn alloc_signal(&self, signo: i32) -> KResult<SigNo> {
        let mut g = self.mtx.lock();

        if signo <= 0 {
            for i in (SIGUSRMIN..=SIGUSRMAX).rev() {
                if !g.alloced_sigs.has(i) {
                    g.alloced_sigs.insert(i);
                    return Ok(i);
                }
            }
            return Err(Errno::Busy);
        }

        let signo = signo as SigNo;
        if !(SIGUSRMIN..=SIGUSRMAX).contains(&signo) {
            return Err(Errno::Inval);
        }
        if g.alloced_sigs.has(signo) {
            return Err(Errno::Busy);
        }
        g.alloced_sigs.insert(signo);
        Ok(signo)
    }

    pub fn free_signal(&self, signo: SigNo) {
        let mut g = self.mtx.lock();
        if (SIGUSRMIN..=SIGUSRMAX).contains(&signo) {
            g.alloced_sigs.remove(signo);
        }
    }

    /// Sends `signo` to the dispatcher's workers. A serial dispatcher
    /// targets its single worker; otherwise every worker is signaled so any
    /// of them may wake up and handle it.
    pub fn send_signal(&self, signo: SigNo) -> KResult<()> {
        if !sig_in_range(signo) || SIGSET_NOSENDMON.has(signo) {
            return Err(Errno::Inval);
        }

        let g = self.mtx.lock();
        if g.attr.max_concurrency == 1 {
            if let Some(w) = g.workers.front() {
                if let Some(vp) = w.vcpu() {
                    vcpu_signal::sigsend(&vp, signo)?;
                }
            }
        } else {
            for w in g.workers.iter() {
                if let Some(vp) = w.vcpu() {
                    vcpu_signal::sigsend(&vp, signo)?;
                }
            }
        }
        Ok(())
    }
}
