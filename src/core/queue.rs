//! Per-tenant task partitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::{QueueId, TaskId, TenantId};

/// Quota value a queue starts with: one call is allowed before the upstream
/// API has told us anything about the real quota.
pub const INITIAL_QUOTA: i64 = 1;

/// A per-tenant partition of tasks sharing one quota and rate budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    /// Queue key.
    pub id: QueueId,
    /// Member task ids in FIFO order.
    pub tasks: Vec<TaskId>,
    /// Tasks currently in the `started` state.
    pub tasks_active: u32,
    /// Last reported daily quota of the upstream API.
    pub quota_daily_limit: i64,
    /// Last reported remaining quota.
    pub quota_remaining: i64,
    /// Upstream timestamp (ms) of the last accepted quota report.
    pub quota_timestamp: i64,
    /// When an exhausted queue may be probed again.
    pub next_try_time: Option<DateTime<Utc>>,
    /// Last handed out request slot.
    pub last_request_time: Option<DateTime<Utc>>,
    /// Debounce flag for the rate-limit log line.
    pub rate_limit_exhausted_reported: bool,
}

impl Queue {
    /// Empty queue with the initial quota sentinel.
    pub fn new(id: impl Into<QueueId>) -> Self {
        Self {
            id: id.into(),
            tasks: Vec::new(),
            tasks_active: 0,
            quota_daily_limit: INITIAL_QUOTA,
            quota_remaining: INITIAL_QUOTA,
            quota_timestamp: 0,
            next_try_time: None,
            last_request_time: None,
            rate_limit_exhausted_reported: false,
        }
    }

    /// Derived key for a top-level task: `"{company}_{channel}_{shop}"`.
    pub fn derive_id(company_id: TenantId, channel_id: TenantId, shop: &str) -> QueueId {
        format!("{company_id}_{channel_id}_{shop}")
    }

    /// Short listing used by the admin surface.
    pub fn summary(&self) -> QueueSummary {
        QueueSummary {
            id: self.id.clone(),
            quota_remaining: self.quota_remaining,
            tasks_active: self.tasks_active,
            task_count: self.tasks.len(),
        }
    }
}

/// Compact queue representation for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    /// Queue key.
    pub id: QueueId,
    /// Last reported remaining quota.
    pub quota_remaining: i64,
    /// Tasks currently started.
    pub tasks_active: u32,
    /// Number of member tasks.
    pub task_count: usize,
}
