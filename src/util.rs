use fugit::{ExtU64, MillisDurationU64};
use std::time::{Duration, Instant};
use std::{thread, time};

pub fn sleep(millis: MillisDurationU64) {
    thread::sleep(time::Duration::from_millis(millis.to_millis()));
}

/// Converts a configuration value in seconds into a millisecond duration.
/// Negative and non-finite values clamp to zero.
pub fn secs(seconds: f64) -> MillisDurationU64 {
    if seconds.is_finite() && seconds > 0.0 {
        ((seconds * 1000.0).round() as u64).millis()
    } else {
        0_u64.millis()
    }
}

/// Time source for procedures that timestamp samples or wait for the
/// hardware to settle.
pub trait Clock {
    /// Time elapsed since the clock was started.
    fn now(&mut self) -> Duration;

    fn sleep(&mut self, millis: MillisDurationU64) {
        sleep(millis)
    }
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn start() -> Self {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&mut self) -> Duration {
        self.origin.elapsed()
    }
}

/// Simulated time: every reading advances by `step`, sleeping advances by
/// the requested amount and returns immediately.
#[derive(Debug, Clone)]
pub struct ManualClock {
    pub t: Duration,
    pub step: Duration,
}

impl ManualClock {
    pub fn new(step: Duration) -> Self {
        ManualClock { t: Duration::ZERO, step }
    }

    pub fn starting_at(t: Duration, step: Duration) -> Self {
        ManualClock { t, step }
    }
}

impl Clock for ManualClock {
    fn now(&mut self) -> Duration {
        let t = self.t;
        self.t += self.step;
        t
    }

    fn sleep(&mut self, millis: MillisDurationU64) {
        self.t += Duration::from_millis(millis.to_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_rounds_to_millis() {
        assert_eq!(secs(0.25).to_millis(), 250);
        assert_eq!(secs(1.2346).to_millis(), 1235);
        assert_eq!(secs(-3.0).to_millis(), 0);
        assert_eq!(secs(f64::NAN).to_millis(), 0);
    }

    #[test]
    fn monotonic_clock_advances() {
        let mut clock = MonotonicClock::start();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_sleeps_instantly() {
        let mut clock = ManualClock::new(Duration::from_millis(10));
        assert_eq!(clock.now(), Duration::ZERO);
        clock.sleep(2_000_u64.millis());
        assert_eq!(clock.now(), Duration::from_millis(2_010));
        assert_eq!(clock.now(), Duration::from_millis(2_020));
    }
}
