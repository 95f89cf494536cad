//! Time sources.
//!
//! Every component that reads the wall clock takes an `Arc<dyn Clock>` so
//! tests can drive time explicitly with [`ManualClock`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a shared clock frozen at `start`.
    pub fn shared(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::new(start))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_delta(by);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Milliseconds since the unix epoch for the current wall clock time.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a std duration into a chrono delta, saturating on overflow.
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Milliseconds as a chrono delta.
pub fn millis(ms: u64) -> TimeDelta {
    TimeDelta::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Truncate to the start of the containing second.
pub fn start_of_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::seconds(1)).unwrap_or(t)
}

/// Start of the hour following `t` (13:25:07 becomes 14:00:00).
pub fn start_of_next_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    let hour = t.duration_trunc(TimeDelta::hours(1)).unwrap_or(t);
    hour + TimeDelta::hours(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), start + TimeDelta::milliseconds(1500));
    }

    #[test]
    fn test_start_of_next_hour() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 13, 25, 7).unwrap();
        assert_eq!(
            start_of_next_hour(t),
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap()
        );
        let exact = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        assert_eq!(
            start_of_next_hour(exact),
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_start_of_second() {
        let t = Utc.timestamp_millis_opt(1_700_000_000_987).unwrap();
        assert_eq!(start_of_second(t).timestamp_millis(), 1_700_000_000_000);
    }
}
