//! Gate around a fragile async call: closed / open / half-open, with
//! self-healing through a bounded number of half-open probes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::ResilienceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    pub name: Option<String>,
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(1..=100).contains(&self.max_failures) {
            return Err(ResilienceError::Configuration(format!(
                "max_failures {} out of range [1, 100]",
                self.max_failures
            )));
        }
        let reset_secs = self.reset_timeout.as_secs();
        if !(1..=3600).contains(&reset_secs) {
            return Err(ResilienceError::Configuration(format!(
                "reset_timeout {reset_secs}s out of range [1, 3600]"
            )));
        }
        if !(1..=10).contains(&self.half_open_max_calls) {
            return Err(ResilienceError::Configuration(format!(
                "half_open_max_calls {} out of range [1, 10]",
                self.half_open_max_calls
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_changes: u64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    open_until: Option<std::time::Instant>,
    half_open_probes_in_flight: u32,
    half_open_probes_succeeded: u32,
    stats: CircuitStats,
}

/// Wraps a fragile call. Construct with [`CircuitBreaker::new`], invoke
/// through [`CircuitBreaker::call`]. Thread-safe; may be shared via `Arc`
/// and called concurrently.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    excluded: Option<Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            excluded: None,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                open_until: None,
                half_open_probes_in_flight: 0,
                half_open_probes_succeeded: 0,
                stats: CircuitStats::default(),
            }),
        })
    }

    pub fn with_excluded<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.excluded = Some(Arc::new(predicate));
        self
    }

    fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or("unnamed")
    }

    /// Runs `f`, gating it through the circuit state. Returns
    /// `CircuitOpen` without calling `f` at all if the circuit is open.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let permit = self.acquire().await?;
        let result = f().await;
        self.release(permit, &result).await;
        result
    }

    async fn acquire(&self) -> Result<(), ResilienceError> {
        let mut inner = self.inner.lock().await;
        inner.stats.total_calls += 1;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let now = self.clock.now();
                let until = inner.open_until.expect("open state always has a deadline");
                if now >= until {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probes_in_flight = 0;
                    inner.half_open_probes_succeeded = 0;
                    inner.stats.state_changes += 1;
                    log::info!("circuit '{}' reset_timeout elapsed, entering half-open", self.name());
                    inner.half_open_probes_in_flight += 1;
                    Ok(())
                } else {
                    inner.stats.rejected_calls += 1;
                    Err(ResilienceError::CircuitOpen {
                        remaining: until - now,
                        name: self.name().to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes_in_flight < self.config.half_open_max_calls {
                    inner.half_open_probes_in_flight += 1;
                    Ok(())
                } else {
                    inner.stats.rejected_calls += 1;
                    Err(ResilienceError::CircuitOpen {
                        remaining: Duration::from_secs(0),
                        name: self.name().to_string(),
                    })
                }
            }
        }
    }

    async fn release<T>(&self, _permit: (), result: &Result<T, ResilienceError>) {
        let mut inner = self.inner.lock().await;
        match result {
            Ok(_) => {
                inner.stats.successful_calls += 1;
                match inner.state {
                    CircuitState::Closed => inner.failure_count = 0,
                    CircuitState::HalfOpen => {
                        inner.half_open_probes_in_flight =
                            inner.half_open_probes_in_flight.saturating_sub(1);
                        inner.half_open_probes_succeeded += 1;
                        if inner.half_open_probes_succeeded >= self.config.half_open_max_calls {
                            inner.state = CircuitState::Closed;
                            inner.failure_count = 0;
                            inner.open_until = None;
                            inner.stats.state_changes += 1;
                            log::info!("circuit '{}' closed after successful probe", self.name());
                        }
                    }
                    CircuitState::Open => {}
                }
            }
            Err(err) => {
                let excluded = self
                    .excluded
                    .as_ref()
                    .map(|pred| pred(err))
                    .unwrap_or(false);
                if excluded {
                    if inner.state == CircuitState::HalfOpen {
                        inner.half_open_probes_in_flight =
                            inner.half_open_probes_in_flight.saturating_sub(1);
                    }
                    return;
                }
                inner.stats.failed_calls += 1;
                match inner.state {
                    CircuitState::Closed => {
                        inner.failure_count += 1;
                        if inner.failure_count >= self.config.max_failures {
                            inner.state = CircuitState::Open;
                            inner.open_until = Some(self.clock.now() + self.config.reset_timeout);
                            inner.stats.state_changes += 1;
                            log::warn!(
                                "circuit '{}' opening after {} failures",
                                self.name(),
                                inner.failure_count
                            );
                        }
                    }
                    CircuitState::HalfOpen => {
                        inner.half_open_probes_in_flight =
                            inner.half_open_probes_in_flight.saturating_sub(1);
                        inner.state = CircuitState::Open;
                        inner.open_until = Some(self.clock.now() + self.config.reset_timeout);
                        inner.stats.state_changes += 1;
                        log::warn!("circuit '{}' probe failed, re-opening", self.name());
                    }
                    CircuitState::Open => {}
                }
            }
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.open_until = None;
        inner.half_open_probes_in_flight = 0;
        inner.half_open_probes_succeeded = 0;
        inner.stats = CircuitStats::default();
    }

    pub async fn stats(&self) -> CircuitStatsSnapshot {
        let inner = self.inner.lock().await;
        CircuitStatsSnapshot {
            total_calls: inner.stats.total_calls,
            successful_calls: inner.stats.successful_calls,
            failed_calls: inner.stats.failed_calls,
            rejected_calls: inner.stats.rejected_calls,
            state_changes: inner.stats.state_changes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStatsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_changes: u64,
}

impl CircuitStatsSnapshot {
    pub fn is_consistent(&self) -> bool {
        self.successful_calls + self.failed_calls + self.rejected_calls == self.total_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn ok() -> Result<u32, ResilienceError> {
        Ok(1)
    }

    fn fail() -> Result<u32, ResilienceError> {
        Err(ResilienceError::ConnectionFailed {
            cause: "boom".into(),
        })
    }

    #[tokio::test]
    async fn opens_after_max_failures_and_half_opens_after_timeout() {
        let start = chrono::Utc::now();
        let clock = Arc::new(TestClock::new(start));
        let cb = CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                max_failures: 3,
                reset_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            clock.clone(),
        )
        .unwrap();

        for _ in 0..3 {
            let result = cb.call(|| async { fail() }).await;
            assert!(result.is_err());
        }
        let fourth = cb.call(|| async { fail() }).await;
        assert!(matches!(fourth, Err(ResilienceError::CircuitOpen { .. })));

        clock.advance(Duration::from_secs(5));
        let probe = cb.call(|| async { ok() }).await;
        assert!(probe.is_ok());

        let stats = cb.stats().await;
        assert_eq!(stats.state_changes, 2);
        assert!(stats.is_consistent());
    }

    #[tokio::test]
    async fn rejects_excluded_errors_without_counting_as_failure() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 1,
            ..Default::default()
        })
        .unwrap()
        .with_excluded(|e| matches!(e, ResilienceError::ProtocolError(_)));

        let result = cb
            .call(|| async { Err::<u32, _>(ResilienceError::ProtocolError("ignore me".into())) })
            .await;
        assert!(result.is_err());
        let stats = cb.stats().await;
        assert_eq!(stats.failed_calls, 0);
    }

    #[tokio::test]
    async fn stats_always_sum_to_total() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 2,
            reset_timeout: Duration::from_secs(60),
            ..Default::default()
        })
        .unwrap();
        let _ = cb.call(|| async { ok() }).await;
        let _ = cb.call(|| async { fail() }).await;
        let _ = cb.call(|| async { fail() }).await;
        let _ = cb.call(|| async { fail() }).await;
        let stats = cb.stats().await;
        assert!(stats.is_consistent());
    }
}
