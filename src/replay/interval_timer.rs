//! Interval Timer
//!
//! Countdown between two logical time points, read through a clock so that
//! expirations behave the same live and under replay.

use crate::replay::clock::{TimePoint, TimeProvider};
use tracing::error;

#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalTimer {
    window: Option<(TimePoint, TimePoint)>,
}

impl IntervalTimer {
    /// Timer running from `init_time` until `target_time`.
    pub fn new(init_time: TimePoint, target_time: TimePoint) -> Self {
        Self {
            window: Some((init_time, target_time.max(init_time))),
        }
    }

    /// Timer starting at the clock's current time and lasting `duration_ms`.
    pub fn starting_now(clock: &dyn TimeProvider, duration_ms: u64) -> Self {
        let now = clock.now();
        Self::new(now, now.saturating_add(duration_ms))
    }

    pub fn valid(&self) -> bool {
        self.window.is_some()
    }

    pub fn init_time(&self) -> Option<TimePoint> {
        self.window.map(|(init, _)| init)
    }

    pub fn target_time(&self) -> Option<TimePoint> {
        self.window.map(|(_, target)| target)
    }

    /// Milliseconds left until the target, 0 once reached.
    pub fn time_left(&self, clock: &dyn TimeProvider) -> u64 {
        match self.window {
            Some((_, target)) => target.saturating_sub(clock.now()),
            None => {
                error!("Timer has not been initialized");
                0
            }
        }
    }

    /// Milliseconds elapsed since the timer started.
    pub fn elapsed(&self, clock: &dyn TimeProvider) -> u64 {
        match self.window {
            Some((init, _)) => clock.now().saturating_sub(init),
            None => {
                error!("Timer has not been initialized");
                0
            }
        }
    }

    pub fn expired(&self, clock: &dyn TimeProvider) -> bool {
        self.valid() && self.time_left(clock) == 0
    }

    /// Block until the target is reached.
    pub fn wait(&self, clock: &dyn TimeProvider) {
        if let Some((_, target)) = self.window {
            clock.wait_until(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::clock::VirtualTimeProvider;

    #[test]
    fn test_uninitialized_timer_reports_zero() {
        let clock = VirtualTimeProvider::new(0);
        let timer = IntervalTimer::default();
        assert!(!timer.valid());
        assert_eq!(timer.time_left(&clock), 0);
        assert_eq!(timer.elapsed(&clock), 0);
        assert!(!timer.expired(&clock));
    }

    #[test]
    fn test_timer_follows_clock_jumps() {
        let clock = VirtualTimeProvider::new(1_000);
        let timer = IntervalTimer::starting_now(&clock, 60_000);

        let left = timer.time_left(&clock);
        assert!(left <= 60_000 && left > 59_900, "left = {}", left);
        assert!(!timer.expired(&clock));

        clock.jump_to_time(31_000);
        let left = timer.time_left(&clock);
        assert!(left <= 30_000 && left > 29_900, "left = {}", left);
        assert!(timer.elapsed(&clock) >= 30_000);

        clock.jump_to_time(61_000);
        assert!(timer.expired(&clock));
        assert_eq!(timer.time_left(&clock), 0);
    }

    #[test]
    fn test_target_before_init_is_clamped() {
        let timer = IntervalTimer::new(500, 100);
        assert_eq!(timer.target_time(), Some(500));
    }
}
