use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Time source for step pulses, valve open windows and worker loops.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Block the calling thread for `d`.
    fn sleep(&self, d: Duration);

    /// Spin until `d` has elapsed. Step half-periods are far below the
    /// scheduler quantum, so `sleep` overshoots them.
    fn busy_wait(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        let deadline = self.now() + d;
        while self.now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if !d.is_zero() {
            thread::sleep(d);
        }
    }
}

/// Simulated clock: sleeping and spinning move time forward instantly.
/// Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct TestClock {
    origin: Instant,
    nanos: Arc<AtomicU64>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, d: Duration) {
        let step = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(step)));
    }

    /// Simulated time since construction.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }

    fn busy_wait(&self, d: Duration) {
        self.advance(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_time_moves_only_when_waited_on() {
        let clock = TestClock::new();
        let shared = clock.clone();
        let t0 = clock.now();
        clock.sleep(Duration::from_millis(20));
        shared.busy_wait(Duration::from_micros(500));
        assert_eq!(clock.now() - t0, Duration::from_micros(20_500));
        assert_eq!(shared.elapsed(), clock.elapsed());
    }

    #[test]
    fn wall_clock_spin_covers_the_pulse() {
        let clock = MonotonicClock::new();
        let t0 = Instant::now();
        clock.busy_wait(Duration::from_micros(300));
        assert!(t0.elapsed() >= Duration::from_micros(300));
    }
}
