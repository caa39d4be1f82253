//! Injected time capability. Production code uses [`SystemClock`]; tests
//! substitute [`TestClock`] and advance it explicitly instead of sleeping.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Monotonic + wall time, injected so the resilience components never call
/// `Instant::now()` / `Utc::now()` directly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock a test can move forward by hand. `now()` is derived from the
/// wall-clock field so both views stay consistent under `advance()`.
#[derive(Debug, Clone)]
pub struct TestClock {
    inner: Arc<Mutex<TestClockState>>,
}

#[derive(Debug)]
struct TestClockState {
    wall: DateTime<Utc>,
    anchor_instant: Instant,
    anchor_wall: DateTime<Utc>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestClockState {
                wall: start,
                anchor_instant: Instant::now(),
                anchor_wall: start,
            })),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut state = self.inner.lock().expect("clock mutex poisoned");
        state.wall += chrono::Duration::from_std(delta).expect("duration overflow");
    }

    pub fn set(&self, wall: DateTime<Utc>) {
        let mut state = self.inner.lock().expect("clock mutex poisoned");
        state.wall = wall;
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock().expect("clock mutex poisoned");
        let elapsed = state.wall - state.anchor_wall;
        let elapsed_std = elapsed.to_std().unwrap_or(Duration::ZERO);
        state.anchor_instant + elapsed_std
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.inner.lock().expect("clock mutex poisoned").wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_both_views() {
        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = TestClock::new(start);
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now();
        assert!(t1 >= t0 + Duration::from_secs(5));
        assert_eq!(clock.utc_now(), start + chrono::Duration::seconds(5));
    }
}
