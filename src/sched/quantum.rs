//! Quantum tick handler.
//!
//! Runs on every tick of the clock thread, standing in for the hardware
//! quantum interrupt: expire wait timeouts, flag urgent signal delivery for
//! user-mode VCPUs, and age the running VCPU's quantum, preempting it when a
//! more important VCPU is ready.

use crate::signal::SIGSET_URGENT;

use super::lock;
use super::vcpu::{VcpuKind, VcpuState};
use super::waitqueue::{WakeupFlags, Wres};

pub(crate) fn tick_irq() {
    let k = crate::kernel::kernel();
    let now = k.clock.now();
    let mut s = lock();

    // Expired wait timeouts wake their VCPUs with a timeout reason.
    loop {
        let Some((deadline, vp)) = s.timeouts.first().cloned() else {
            break;
        };
        if deadline > now {
            break;
        }
        s.timeouts.remove(0);
        let wq = {
            let mut c = vp.sched.lock();
            c.timeout.valid = false;
            c.timeout.deadline = crate::clock::TICKS_INFINITY;
            c.waiting_on.clone()
        };
        if let Some(wq) = wq {
            wq.wakeone_locked(&mut s, &vp, WakeupFlags::empty(), Wres::Timeout);
        }
    }

    let run = s.running.clone();

    // Redirect a user-mode VCPU with urgent pending signals into the urgent
    // delivery path, unless an earlier injection is still outstanding. The
    // syscall return path consumes the flag.
    {
        let mut c = run.sched.lock();
        if run.is_user() && c.pending_sigs.intersects(SIGSET_URGENT) && !c.in_sigurgent {
            c.in_sigurgent = true;
            return;
        }

        c.quantum_countdown = c.quantum_countdown.saturating_sub(1);
        if c.quantum_countdown > 0 {
            return;
        }

        // Quantum expired: lower the effective priority one step, floored at
        // the bottom of the range. No refill here; the countdown is reset
        // when the VCPU is next enqueued.
        c.effective_priority = c.effective_priority.saturating_sub(1);
    }

    let run_eff = run.sched.lock().effective_priority;
    let Some(rdy) = s.highest_priority_ready() else {
        return;
    };
    if rdy.sched.lock().effective_priority <= run_eff {
        // Nothing more important around; keep running.
        return;
    }

    // Preempt: requeue the current VCPU at its base priority and put the
    // winner into the running slot.
    s.remove_vcpu_locked(&rdy);
    {
        let (requeue, base) = {
            let c = run.sched.lock();
            (
                c.state == VcpuState::Running && run.kind() != VcpuKind::Adopted,
                c.sched_priority,
            )
        };
        if requeue {
            s.add_vcpu_locked(&run, base);
        }
    }
    rdy.sched.lock().state = VcpuState::Running;
    s.scheduled = Some(rdy.clone());
    log::trace!("quantum preemption: vcpu {} -> vcpu {}", run.id(), rdy.id());
    s.running = rdy;
}
