//! Daily quota reserve accounting.
//!
//! A queue is exhausted once its remaining upstream quota drops to the
//! reserved share of the daily limit. The reserve is a global percentage that
//! can be overridden per queue for a limited time; overrides expire lazily on
//! the next read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{Queue, SchedulerError};
use crate::util::{to_delta, Clock, QueueId};

/// Reserve currently applied to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReserve {
    /// Share of the daily limit kept in reserve.
    pub reserved_quota_as_percentage: u32,
    /// When a per-queue override reverts to the default.
    pub timeout: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct ReserveOverride {
    percentage: u32,
    expires_at: Option<DateTime<Utc>>,
}

/// Decides whether a queue's quota is exhausted.
pub struct QuotaLimit {
    default_percentage: u32,
    overrides: Mutex<HashMap<QueueId, ReserveOverride>>,
    clock: Arc<dyn Clock>,
}

impl QuotaLimit {
    /// Create a limit reserving `default_percentage` of every daily quota.
    pub fn new(default_percentage: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_percentage,
            overrides: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// The global default reserve.
    pub const fn default_percentage(&self) -> u32 {
        self.default_percentage
    }

    /// Reserve in effect for `queue_id`, dropping an expired override.
    pub fn get_reserve_for_queue(&self, queue_id: &str) -> QuotaReserve {
        let now = self.clock.now();
        let mut overrides = self.overrides.lock();
        match overrides.get(queue_id).copied() {
            Some(o) if o.expires_at.is_some_and(|at| now > at) => {
                overrides.remove(queue_id);
                tracing::debug!(queue_id, "reserve override expired");
                self.default_reserve()
            }
            Some(o) => QuotaReserve {
                reserved_quota_as_percentage: o.percentage,
                timeout: o.expires_at,
            },
            None => self.default_reserve(),
        }
    }

    /// Override the reserve of one queue, optionally for `timeout`.
    pub fn set_reserve_for_queue(
        &self,
        queue_id: &str,
        percentage: u32,
        timeout: Option<Duration>,
    ) -> Result<QuotaReserve, SchedulerError> {
        if percentage > 100 {
            return Err(SchedulerError::InvalidArgument(format!(
                "reserved quota must be within 0..=100, got {percentage}"
            )));
        }
        let expires_at = timeout.map(|t| self.clock.now() + to_delta(t));
        self.overrides.lock().insert(
            queue_id.to_owned(),
            ReserveOverride {
                percentage,
                expires_at,
            },
        );
        tracing::info!(queue_id, percentage, ?expires_at, "reserve override set");
        Ok(QuotaReserve {
            reserved_quota_as_percentage: percentage,
            timeout: expires_at,
        })
    }

    /// Number of daily calls held back for `queue`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn reserved_calls_for_queue(&self, queue: &Queue) -> i64 {
        let pct = self.get_reserve_for_queue(&queue.id).reserved_quota_as_percentage;
        (queue.quota_daily_limit as f64 * f64::from(pct) / 100.0).round() as i64
    }

    /// `remaining <= round(daily_limit * reserve / 100)`.
    pub fn check_exhausted(&self, queue: &Queue) -> bool {
        queue.quota_remaining <= self.reserved_calls_for_queue(queue)
    }

    const fn default_reserve(&self) -> QuotaReserve {
        QuotaReserve {
            reserved_quota_as_percentage: self.default_percentage,
            timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;
    use chrono::TimeZone;

    fn limit(pct: u32) -> (QuotaLimit, Arc<ManualClock>) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (QuotaLimit::new(pct, clock.clone()), clock)
    }

    fn queue(remaining: i64, daily: i64) -> Queue {
        let mut q = Queue::new("1_1_");
        q.quota_remaining = remaining;
        q.quota_daily_limit = daily;
        q
    }

    #[test]
    fn test_default_reserve() {
        let (limit, _) = limit(21);
        let r = limit.get_reserve_for_queue("1_1_");
        assert_eq!(r.reserved_quota_as_percentage, 21);
        assert_eq!(r.timeout, None);
    }

    #[test]
    fn test_exhausted_boundary() {
        let (limit, _) = limit(20);
        assert!(limit.check_exhausted(&queue(40, 200)));
        assert!(!limit.check_exhausted(&queue(41, 200)));
    }

    #[test]
    fn test_initial_sentinel_not_exhausted() {
        let (limit, _) = limit(20);
        assert!(!limit.check_exhausted(&Queue::new("x")));
    }

    #[test]
    fn test_override_expires_lazily() {
        let (limit, clock) = limit(21);
        let set = limit
            .set_reserve_for_queue("1_1_", 11, Some(Duration::from_millis(1000)))
            .unwrap();
        assert_eq!(set.reserved_quota_as_percentage, 11);
        assert_eq!(set.timeout, Some(clock.now() + chrono::TimeDelta::milliseconds(1000)));
        assert_eq!(limit.get_reserve_for_queue("1_1_").reserved_quota_as_percentage, 11);

        clock.advance(Duration::from_millis(1001));
        assert_eq!(limit.get_reserve_for_queue("1_1_").reserved_quota_as_percentage, 21);
    }

    #[test]
    fn test_override_changes_exhaustion() {
        let (limit, _) = limit(21);
        let q = queue(10, 200);
        assert!(limit.check_exhausted(&q));
        limit
            .set_reserve_for_queue("1_1_", 1, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(!limit.check_exhausted(&q));
    }

    #[test]
    fn test_rejects_percentage_over_100() {
        let (limit, _) = limit(20);
        assert!(limit.set_reserve_for_queue("1_1_", 101, None).is_err());
    }
}
