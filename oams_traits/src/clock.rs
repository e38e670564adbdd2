use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::TICK_MS;

/// Time source for the control plane.
///
/// Everything the core schedules — watchdog windows, retry backoffs,
/// pressure grace timers — compares against one monotone millisecond
/// counter. Implementations must never run backwards; resolution coarser
/// than a tick is fine because nothing is sampled faster than the tick.
pub trait Clock {
    /// Milliseconds elapsed since the clock's origin.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time, anchored when the clock is created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Tick-stepped clock for the simulator and the test suites.
///
/// Time moves only when the driver steps it, normally one coordinator
/// period per [`TickClock::tick`]. Clones share the counter, so a test
/// can keep a handle while the coordinator owns its own.
#[derive(Debug, Clone, Default)]
pub struct TickClock {
    elapsed_ms: Arc<AtomicU64>,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one coordinator period.
    pub fn tick(&self) {
        self.advance_ms(TICK_MS);
    }

    /// Advance an arbitrary number of milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.elapsed_ms.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u64 {
        self.elapsed_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_clock_steps_one_period_at_a_time() {
        let clock = TickClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.tick();
        assert_eq!(clock.now_ms(), TICK_MS);
        clock.advance_ms(100);
        assert_eq!(clock.now_ms(), TICK_MS + 100);
    }

    #[test]
    fn clones_share_the_counter() {
        let clock = TickClock::new();
        let handle = clock.clone();
        handle.tick();
        handle.tick();
        assert_eq!(clock.now_ms(), 2 * TICK_MS);
    }

    #[test]
    fn monotonic_clock_never_runs_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
