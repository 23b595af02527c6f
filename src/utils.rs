use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

/// Source of wall-clock time for ledgers and cache expiry.
///
/// Timestamps are unix seconds with millisecond precision so that a sorted
/// set score and a local ledger entry mean the same thing.
pub trait Clock: Send + Sync {
    /// Current unix time in seconds.
    fn now(&self) -> f64;

    /// Current time as a `DateTime<Utc>`
    fn utc_now(&self) -> DateTime<Utc> {
        let millis = (self.now() * 1000.0) as i64;
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Time units accepted in limit expressions such as `100/minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Second,
    Minute,
    Hour,
    Day,
}

impl Unit {
    /// Convert unit to seconds (duration)
    pub fn to_seconds(self) -> u64 {
        match self {
            Unit::Second => 1,
            Unit::Minute => 60,
            Unit::Hour => 3600,
            Unit::Day => 86400,
        }
    }
}

impl FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(Unit::Second),
            "m" | "min" | "minute" | "minutes" => Ok(Unit::Minute),
            "h" | "hour" | "hours" => Ok(Unit::Hour),
            "d" | "day" | "days" => Ok(Unit::Day),
            other => Err(format!("unknown time unit '{}'", other)),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Unit::Second => "second",
            Unit::Minute => "minute",
            Unit::Hour => "hour",
            Unit::Day => "day",
        };
        f.write_str(name)
    }
}

/// Unix timestamp (seconds) at which a full window starting now has elapsed.
pub fn calculate_reset(window_seconds: u64, clock: &dyn Clock) -> i64 {
    clock.now().floor() as i64 + window_seconds as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        assert_eq!(Unit::Second.to_seconds(), 1);
        assert_eq!(Unit::Minute.to_seconds(), 60);
        assert_eq!(Unit::Hour.to_seconds(), 3600);
        assert_eq!(Unit::Day.to_seconds(), 86400);
    }

    #[test]
    fn test_unit_parsing() {
        assert_eq!("minute".parse::<Unit>().unwrap(), Unit::Minute);
        assert_eq!("Seconds".parse::<Unit>().unwrap(), Unit::Second);
        assert_eq!("h".parse::<Unit>().unwrap(), Unit::Hour);
        assert!("fortnight".parse::<Unit>().is_err());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100.0);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), 101.5);
        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
        assert_eq!(clock.utc_now().timestamp(), 10);
    }

    #[test]
    fn test_calculate_reset() {
        let clock = ManualClock::new(1_000.7);
        assert_eq!(calculate_reset(60, &clock), 1_060);
    }

    #[test]
    fn test_system_clock_is_recent() {
        let now = SystemClock::new().now();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800.0);
    }
}
