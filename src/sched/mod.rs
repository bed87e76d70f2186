//! The virtual-processor scheduler.
//!
//! A single virtual CPU is multiplexed over all VCPUs. The scheduler keeps
//! one FIFO ready queue per absolute priority plus a population bitmap for
//! O(1) highest-priority lookup, a deadline-sorted timeout queue, and the
//! `running`/`scheduled` slots that model the CPU. All of this state lives
//! behind one global lock which realizes the preemption-disable region:
//! functions suffixed `_locked` expect the caller to hold it.

pub mod cnd;
pub mod mtx;
pub mod quantum;
pub mod vcpu;
pub mod vcpu_pool;
pub mod vcpu_signal;
pub mod waitqueue;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Ticks, When, TICKS_INFINITY};
use crate::kernel::kernel;
use crate::signal::SigSet;
use vcpu::{Vcpu, VcpuCell, VcpuKind, VcpuState};

/// Number of priorities within one QoS band.
pub const QOS_PRI_COUNT: usize = 16;
pub const QOS_PRI_LOWEST: i8 = -8;
pub const QOS_PRI_HIGHEST: i8 = 7;
pub const QOS_PRI_DEFAULT: i8 = 0;

/// Quality-of-service categories, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Qos {
    Idle = 0,
    Background = 1,
    Utility = 2,
    Interactive = 3,
    Urgent = 4,
    Realtime = 5,
}

pub const QOS_COUNT: usize = 6;

impl Qos {
    pub const fn from_raw(raw: u8) -> Option<Qos> {
        match raw {
            0 => Some(Qos::Idle),
            1 => Some(Qos::Background),
            2 => Some(Qos::Utility),
            3 => Some(Qos::Interactive),
            4 => Some(Qos::Urgent),
            5 => Some(Qos::Realtime),
            _ => None,
        }
    }
}

/// Absolute scheduler priorities. The idle band collapses to one priority.
pub const SCHED_PRI_COUNT: usize = (QOS_COUNT - 1) * QOS_PRI_COUNT + 1;
pub const SCHED_PRI_LOWEST: u8 = 0;
pub const SCHED_PRI_HIGHEST: u8 = (SCHED_PRI_COUNT - 1) as u8;

const PRI_POP_BYTE_COUNT: usize = (SCHED_PRI_COUNT + 7) / 8;

/// Quantum length in ticks, keyed by QoS.
const QUANTUM_LENGTH: [i32; QOS_COUNT] = [2, 2, 4, 4, 6, 8];

pub(crate) fn qos_quantum(qos: Qos) -> i32 {
    QUANTUM_LENGTH[qos as usize]
}

/// Per-priority ready FIFOs plus the population bitmap.
pub(crate) struct ReadyQueue {
    priority: [VecDeque<Arc<Vcpu>>; SCHED_PRI_COUNT],
    populated: [u8; PRI_POP_BYTE_COUNT],
}

impl ReadyQueue {
    fn new() -> ReadyQueue {
        ReadyQueue {
            priority: std::array::from_fn(|_| VecDeque::new()),
            populated: [0; PRI_POP_BYTE_COUNT],
        }
    }

    pub(crate) fn insert(&mut self, vp: Arc<Vcpu>, pri: u8) {
        let pri = pri as usize;
        self.priority[pri].push_back(vp);
        self.populated[pri >> 3] |= 1 << (pri & 7);
    }

    pub(crate) fn remove(&mut self, vp: &Arc<Vcpu>, pri: u8) -> bool {
        let pri = pri as usize;
        let q = &mut self.priority[pri];
        let found = match q.iter().position(|x| Arc::ptr_eq(x, vp)) {
            Some(i) => {
                q.remove(i);
                true
            }
            None => false,
        };
        if q.is_empty() {
            self.populated[pri >> 3] &= !(1 << (pri & 7));
        }
        found
    }

    /// Head of the highest-priority non-empty FIFO. Scans the population
    /// bitmap from the most significant byte down.
    pub(crate) fn highest(&self) -> Option<Arc<Vcpu>> {
        for i in (0..PRI_POP_BYTE_COUNT).rev() {
            let pop = self.populated[i];
            if pop != 0 {
                let bit = 7 - pop.leading_zeros() as usize;
                return self.priority[(i << 3) + bit].front().cloned();
            }
        }
        None
    }

    #[cfg(test)]
    fn is_marked(&self, pri: usize) -> bool {
        self.populated[pri >> 3] & (1 << (pri & 7)) != 0
    }
}

/// State protected by the global scheduler lock.
pub(crate) struct SchedState {
    pub running: Arc<Vcpu>,
    pub scheduled: Option<Arc<Vcpu>>,
    pub ready: ReadyQueue,
    /// Armed wait timeouts, ascending by deadline; ties keep arrival order.
    pub timeouts: Vec<(Ticks, Arc<Vcpu>)>,
    pub boot_vp: Arc<Vcpu>,
    pub idle_vp: Arc<Vcpu>,
}

impl SchedState {
    /// Builds the scheduler around the boot and idle VCPUs. The boot VCPU
    /// starts out in the running slot; the idle VCPU sits on the lowest
    /// ready FIFO. Runs before the kernel singleton is published, so it must
    /// not call back into it.
    pub(crate) fn new(boot: Arc<Vcpu>, idle: Arc<Vcpu>) -> SchedState {
        let mut ready = ReadyQueue::new();
        {
            let mut c = boot.sched.lock();
            c.state = VcpuState::Running;
            c.quantum_countdown = qos_quantum(c.qos);
        }
        {
            let mut c = idle.sched.lock();
            c.state = VcpuState::Ready;
            c.on_ready_queue = true;
            c.quantum_countdown = qos_quantum(c.qos);
        }
        ready.insert(idle.clone(), SCHED_PRI_LOWEST);

        SchedState {
            running: boot.clone(),
            scheduled: None,
            ready,
            timeouts: Vec::new(),
            boot_vp: boot,
            idle_vp: idle,
        }
    }

    /// Adds `vp` to the ready queue at the given effective priority and
    /// resets its quantum. The caller supplies the priority so transient
    /// boosts can be applied without disturbing the base priority.
    pub(crate) fn add_vcpu_locked(&mut self, vp: &Arc<Vcpu>, pri: u8) {
        let pri = pri.min(SCHED_PRI_HIGHEST);
        {
            let mut c = vp.sched.lock();
            debug_assert!(!c.on_ready_queue);
            if c.suspension_count != 0 {
                // A deferred suspend is in flight. Leave the VCPU off the
                // ready queue; the matching resume re-enqueues it.
                c.state = VcpuState::Ready;
                return;
            }
            c.state = VcpuState::Ready;
            c.effective_priority = pri;
            c.quantum_countdown = qos_quantum(c.qos);
            c.wait_start_time = kernel().clock.now();
            c.on_ready_queue = true;
        }
        self.ready.insert(vp.clone(), pri);
    }

    /// Takes `vp` off the ready queue.
    pub(crate) fn remove_vcpu_locked(&mut self, vp: &Arc<Vcpu>) {
        let pri = {
            let mut c = vp.sched.lock();
            c.on_ready_queue = false;
            c.effective_priority
        };
        self.ready.remove(vp, pri);
    }

    pub(crate) fn highest_priority_ready(&self) -> Option<Arc<Vcpu>> {
        self.ready.highest()
    }

    /// Unconditional switch: `vp` must be ready and on the ready queue. The
    /// caller is expected to have parked the outgoing running VCPU on a wait
    /// queue, the finalizer queue, or back onto the ready queue.
    pub(crate) fn switch_to(&mut self, vp: &Arc<Vcpu>) {
        self.remove_vcpu_locked(vp);
        vp.sched.lock().state = VcpuState::Running;
        self.scheduled = Some(vp.clone());
        self.running = vp.clone();
        log::trace!("switch to vcpu {}", vp.id());
    }

    /// Voluntary switch: only taken if `vp` is itself the best ready VCPU
    /// and at least as important as the current one.
    pub(crate) fn maybe_switch_to(&mut self, vp: &Arc<Vcpu>) {
        let (state, susp, vp_eff) = {
            let c = vp.sched.lock();
            (c.state, c.suspension_count, c.effective_priority)
        };
        if state != VcpuState::Ready || susp != 0 {
            return;
        }
        let Some(best) = self.highest_priority_ready() else {
            return;
        };
        if !Arc::ptr_eq(&best, vp) {
            return;
        }

        let run = self.running.clone();
        let (run_state, run_eff, run_base) = {
            let c = run.sched.lock();
            (c.state, c.effective_priority, c.sched_priority)
        };
        if vp_eff >= run_eff && run_state == VcpuState::Running && run.kind() != VcpuKind::Adopted {
            self.add_vcpu_locked(&run, run_base);
            self.switch_to(vp);
        }
    }

    /// Picks a new running VCPU after `vp` stops being runnable. No-op when
    /// `vp` does not occupy the running slot (e.g. adopted threads).
    pub(crate) fn reschedule_away_from(&mut self, vp: &Arc<Vcpu>) {
        if !Arc::ptr_eq(&self.running, vp) {
            return;
        }
        if let Some(next) = self.highest_priority_ready() {
            self.switch_to(&next);
        } else {
            log::warn!("no ready vcpu to schedule; keeping stale running slot");
        }
    }

    /// Arms a wait timeout for `vp`. Insert position preserves FIFO order
    /// among equal deadlines.
    pub(crate) fn arm_timeout_locked(
        &mut self,
        vp: &Arc<Vcpu>,
        cell: &mut VcpuCell,
        deadline: Ticks,
    ) {
        cell.timeout.deadline = deadline;
        cell.timeout.valid = true;
        let pos = self
            .timeouts
            .iter()
            .position(|(d, _)| *d > deadline)
            .unwrap_or(self.timeouts.len());
        self.timeouts.insert(pos, (deadline, vp.clone()));
    }

    /// Cancels an armed timeout; does nothing when none is armed.
    pub(crate) fn cancel_timeout_locked(&mut self, vp: &Arc<Vcpu>, cell: &mut VcpuCell) {
        if cell.timeout.valid {
            self.timeouts.retain(|(_, v)| !Arc::ptr_eq(v, vp));
            cell.timeout.deadline = TICKS_INFINITY;
            cell.timeout.valid = false;
        }
    }
}

/// Guard of the scheduler lock; holding one is the preemption-disabled state.
pub(crate) type SchedGuard = spin::MutexGuard<'static, SchedState>;

/// Acquires the scheduler lock (the preemption-disable region).
pub(crate) fn lock() -> SchedGuard {
    kernel().sched.lock()
}

/// Id of the VCPU currently occupying the virtual CPU.
pub fn running_vcpu_id() -> vcpu::Vid {
    lock().running.id()
}

const FINALIZE_NOW_THRESHOLD: usize = 4;

/// Queues the calling VCPU for finalization and gives up the CPU for good.
/// The boot VCPU's chore loop destroys it.
pub(crate) fn terminate_current(vp: &Arc<Vcpu>) {
    let k = kernel();
    let mut s = lock();
    {
        let mut c = vp.sched.lock();
        c.state = VcpuState::Terminating;
        c.waiting_on = None;
    }
    s.reschedule_away_from(vp);
    k.finalizer.push(vp.clone());

    if k.finalizer.len() >= FINALIZE_NOW_THRESHOLD {
        let boot = s.boot_vp.clone();
        k.sched_wq
            .wakeone_locked(&mut s, &boot, waitqueue::WakeupFlags::CSW, waitqueue::Wres::Wakeup);
    }
    drop(s);
    log::debug!("vcpu queued for finalization");
}

/// Chore loop of the boot VCPU: waits for terminated VCPUs and releases
/// their resources. Does not return.
pub(crate) fn run_chores() -> ! {
    let k = kernel();
    log::info!("scheduler chore loop running");

    loop {
        while k.finalizer.is_empty() {
            let _ = k.sched_wq.timedwait(
                Some(SigSet::ALL),
                When::In(Duration::from_secs(1)),
                None,
            );
            if !k.finalizer.is_empty() {
                break;
            }
        }

        while let Some(vp) = k.finalizer.pop() {
            log::debug!("finalizing vcpu (group {})", vp.group_id());
            drop(vp);
        }
    }
}

/// Verifies the scheduler's structural invariants. Intended for tests; takes
/// the scheduler lock and panics on the first violation.
pub fn audit() {
    let k = kernel();
    let s = lock();

    for pri in 0..SCHED_PRI_COUNT {
        let q = &s.ready.priority[pri];
        let marked = s.ready.populated[pri >> 3] & (1 << (pri & 7)) != 0;
        assert_eq!(
            marked,
            !q.is_empty(),
            "population bit {} disagrees with FIFO occupancy",
            pri
        );
        for vp in q.iter() {
            let c = vp.sched.lock();
            assert_eq!(c.state, VcpuState::Ready, "queued vcpu {} not ready", vp.id());
            assert!(c.on_ready_queue);
            assert_eq!(
                c.effective_priority as usize, pri,
                "vcpu {} queued at wrong priority",
                vp.id()
            );
        }
    }

    // No VCPU may sit on more than one ready FIFO.
    let mut seen: Vec<*const Vcpu> = Vec::new();
    for pri in 0..SCHED_PRI_COUNT {
        for vp in s.ready.priority[pri].iter() {
            let p = Arc::as_ptr(vp);
            assert!(!seen.contains(&p), "vcpu {} on two ready FIFOs", vp.id());
            seen.push(p);
        }
    }

    for w in s.timeouts.windows(2) {
        assert!(w[0].0 <= w[1].0, "timeout queue out of order");
    }
    for (_, vp) in s.timeouts.iter() {
        assert!(vp.sched.lock().timeout.valid, "stale timeout entry");
    }

    let registry = k.registry.lock();
    for vp in registry.values() {
        let (state, wq) = {
            let c = vp.sched.lock();
            (c.state, c.waiting_on.clone())
        };
        if state == VcpuState::Waiting {
            let wq = wq.expect("waiting vcpu without a wait queue");
            assert_eq!(
                wq.contains_count(vp),
                1,
                "waiting vcpu {} not exactly once on its queue",
                vp.id()
            );
        }
    }
}
