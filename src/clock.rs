//! Monotonic tick clock and the quantum-interrupt thread.
//!
//! All scheduler deadlines are expressed in monotonic ticks. A dedicated
//! clock thread advances the tick counter and invokes the scheduler's tick
//! handler, playing the role of the hardware quantum interrupt.

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub type Ticks = u64;

/// Tick frequency of the quantum interrupt.
pub const TICK_HZ: u64 = 1000;
pub const NANOS_PER_TICK: u64 = 1_000_000_000 / TICK_HZ;
pub const TICKS_PER_QUARTER_SECOND: Ticks = TICK_HZ / 4;

/// Deadline value meaning "never".
pub const TICKS_INFINITY: Ticks = u64::MAX;

/// A point in time for timed waits and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    /// Relative to the current tick.
    In(Duration),
    /// Absolute monotonic tick deadline.
    At(Ticks),
}

pub(crate) struct MonotonicClock {
    origin: Instant,
    ticks: AtomicU64,
}

impl MonotonicClock {
    pub(crate) fn new() -> MonotonicClock {
        MonotonicClock {
            origin: Instant::now(),
            ticks: AtomicU64::new(0),
        }
    }

    /// Current tick as observed by the last quantum interrupt.
    pub(crate) fn now(&self) -> Ticks {
        self.ticks.load(Ordering::Acquire)
    }

    /// Recomputes the tick counter from wall time. Called only by the clock
    /// thread; immune to scheduling drift of the thread itself.
    pub(crate) fn advance(&self) -> Ticks {
        let t = ticks_from_duration(self.origin.elapsed());
        self.ticks.store(t, Ordering::Release);
        t
    }
}

/// Converts a duration to ticks, rounding away from zero so that a wait never
/// returns early.
pub fn ticks_from_duration(d: Duration) -> Ticks {
    let nanos = d.as_nanos();
    let t = (nanos + (NANOS_PER_TICK as u128 - 1)) / NANOS_PER_TICK as u128;
    if t > TICKS_INFINITY as u128 {
        TICKS_INFINITY
    } else {
        t as Ticks
    }
}

pub fn duration_from_ticks(t: Ticks) -> Duration {
    if t == TICKS_INFINITY {
        Duration::MAX
    } else {
        Duration::from_nanos(t.saturating_mul(NANOS_PER_TICK))
    }
}

/// Current monotonic tick.
pub fn now() -> Ticks {
    crate::kernel::kernel().clock.now()
}

/// Resolution of the monotonic clock.
pub fn resolution() -> Duration {
    Duration::from_nanos(NANOS_PER_TICK)
}

/// Resolves a [`When`] to an absolute tick deadline.
pub fn deadline_of(when: When) -> Ticks {
    match when {
        When::At(t) => t,
        When::In(d) => {
            if d == Duration::MAX {
                TICKS_INFINITY
            } else {
                now().saturating_add(ticks_from_duration(d))
            }
        }
    }
}

/// Spawns the quantum-interrupt thread. Called once at kernel init.
pub(crate) fn start_tick_thread() {
    std::thread::Builder::new()
        .name("vpsched-clock".into())
        .spawn(|| {
            let period = Duration::from_nanos(NANOS_PER_TICK);
            loop {
                std::thread::sleep(period);
                crate::kernel::kernel().clock.advance();
                crate::sched::quantum::tick_irq();
            }
        })
        .expect("failed to spawn the clock thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_conversion_rounds_away_from_zero() {
        assert_eq!(ticks_from_duration(Duration::from_nanos(1)), 1);
        assert_eq!(ticks_from_duration(Duration::from_millis(1)), 1);
        assert_eq!(ticks_from_duration(Duration::from_micros(1500)), 2);
        assert_eq!(ticks_from_duration(Duration::ZERO), 0);
    }

    #[test]
    fn infinite_duration_saturates() {
        assert_eq!(ticks_from_duration(Duration::MAX), TICKS_INFINITY);
        assert_eq!(duration_from_ticks(TICKS_INFINITY), Duration::MAX);
    }
}
