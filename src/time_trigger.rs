//! Wall-clock boundary detection on a modulo, e.g. "every 30 minutes on
//! the minute". Used by the WebSocket manager to schedule proactive
//! reconnects without coupling it to a concrete clock source.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::{ResilienceError, Result};

pub const HARD_MIN_MODULO_SECONDS: u64 = 60;
pub const HARD_MAX_MODULO_SECONDS: u64 = 7 * 24 * 3600;

/// Parses strings like `"30m"`, `"4h"`, `"24h"`, `"7d"`, `"90s"`,
/// case-insensitive and whitespace-trimmed, into a second count. Hard
/// bounds: 60s..=7d.
pub fn parse_modulo(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ResilienceError::InvalidModulo("empty modulo string".into()));
    }
    let lower = trimmed.to_ascii_lowercase();
    let (digits, unit) = lower.split_at(
        lower
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ResilienceError::InvalidModulo(format!("no unit in '{input}'")))?,
    );
    if digits.is_empty() {
        return Err(ResilienceError::InvalidModulo(format!(
            "no numeric value in '{input}'"
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| ResilienceError::InvalidModulo(format!("bad numeric value in '{input}'")))?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => {
            return Err(ResilienceError::InvalidModulo(format!(
                "unrecognized unit '{other}' in '{input}'"
            )))
        }
    };
    let seconds = value
        .checked_mul(multiplier)
        .ok_or_else(|| ResilienceError::InvalidModulo(format!("modulo overflow in '{input}'")))?;
    if seconds < HARD_MIN_MODULO_SECONDS || seconds > HARD_MAX_MODULO_SECONDS {
        return Err(ResilienceError::InvalidModulo(format!(
            "modulo {seconds}s out of range [{HARD_MIN_MODULO_SECONDS}, {HARD_MAX_MODULO_SECONDS}]"
        )));
    }
    Ok(seconds)
}

/// Wakes on wall-clock instants where `epoch_seconds mod modulo == 0`.
#[derive(Clone)]
pub struct TimeTrigger {
    modulo_seconds: u64,
    clock: Arc<dyn Clock>,
}

impl TimeTrigger {
    pub fn new(modulo_seconds: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if modulo_seconds < HARD_MIN_MODULO_SECONDS || modulo_seconds > HARD_MAX_MODULO_SECONDS {
            return Err(ResilienceError::InvalidModulo(format!(
                "modulo {modulo_seconds}s out of range [{HARD_MIN_MODULO_SECONDS}, {HARD_MAX_MODULO_SECONDS}]"
            )));
        }
        Ok(Self {
            modulo_seconds,
            clock,
        })
    }

    pub fn from_str_modulo(modulo: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(parse_modulo(modulo)?, clock)
    }

    pub fn modulo_seconds(&self) -> u64 {
        self.modulo_seconds
    }

    fn epoch_seconds(now: DateTime<Utc>) -> i64 {
        now.timestamp()
    }

    /// Non-negative seconds until the next boundary; 0.0 exactly at one.
    pub fn seconds_until_next_boundary(&self) -> f64 {
        let now = self.clock.utc_now();
        let epoch = Self::epoch_seconds(now);
        let modulo = self.modulo_seconds as i64;
        let remainder = epoch.rem_euclid(modulo);
        let sub_second = now.timestamp_subsec_millis() as f64 / 1000.0;
        if remainder == 0 && sub_second == 0.0 {
            0.0
        } else {
            (modulo - remainder) as f64 - sub_second
        }
    }

    pub fn is_at_boundary(&self, margin: Duration) -> bool {
        self.seconds_until_next_boundary() <= margin.as_secs_f64()
    }

    /// True when approaching the boundary within `margin` but not yet
    /// past it (i.e. the deadline has not elapsed into the next cycle).
    pub fn should_trigger(&self, margin: Duration) -> bool {
        let remaining = self.seconds_until_next_boundary();
        remaining <= margin.as_secs_f64()
    }

    pub fn next_boundary(&self) -> DateTime<Utc> {
        let now = self.clock.utc_now();
        let secs = self.seconds_until_next_boundary();
        now + chrono::Duration::milliseconds((secs * 1000.0).round() as i64)
    }

    pub fn previous_boundary(&self) -> DateTime<Utc> {
        let next = self.next_boundary();
        next - chrono::Duration::seconds(self.modulo_seconds as i64)
    }

    /// Suspends until the boundary is reached, minus `margin`. No-op if
    /// the computed sleep is <= 0.
    pub async fn wait_for_next_boundary(&self, margin: Duration) {
        let remaining = self.seconds_until_next_boundary() - margin.as_secs_f64();
        if remaining > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    #[test]
    fn parses_units_case_insensitively() {
        assert_eq!(parse_modulo("30m").unwrap(), 1800);
        assert_eq!(parse_modulo("  30M  ").unwrap(), 1800);
        assert_eq!(parse_modulo("4h").unwrap(), 14_400);
        assert_eq!(parse_modulo("24h").unwrap(), 86_400);
        assert_eq!(parse_modulo("7d").unwrap(), 604_800);
        assert_eq!(parse_modulo("90s").unwrap(), 90);
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        assert!(parse_modulo("1s").is_err());
        assert!(parse_modulo("8d").is_err());
        assert!(parse_modulo("abc").is_err());
        assert!(parse_modulo("").is_err());
        assert!(parse_modulo("30x").is_err());
    }

    #[test]
    fn boundary_math_against_fixed_clock() {
        let start = DateTime::parse_from_rfc3339("2026-01-01T10:29:57Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(TestClock::new(start));
        let trigger = TimeTrigger::new(1800, clock.clone()).unwrap();
        // 10:29:57 -> next boundary at 10:30:00, 3s away.
        assert!((trigger.seconds_until_next_boundary() - 3.0).abs() < 1e-6);
        assert!(!trigger.is_at_boundary(Duration::from_secs(1)));
        clock.advance(Duration::from_secs(2));
        assert!(trigger.is_at_boundary(Duration::from_secs(1)));
    }

    #[test]
    fn exactly_on_boundary_is_zero() {
        let start = DateTime::parse_from_rfc3339("2026-01-01T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(TestClock::new(start));
        let trigger = TimeTrigger::new(1800, clock).unwrap();
        assert_eq!(trigger.seconds_until_next_boundary(), 0.0);
    }
}
