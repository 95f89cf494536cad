//! Admin request/response models served from the scheduler loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Queue, QueueSummary, QuotaReserve, Scheduler, SchedulerError};

/// Idle/busy worker counts as embedded in [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounts {
    /// Idle workers.
    pub num_idle: usize,
    /// Busy workers.
    pub num_busy: usize,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Worker counts.
    pub workers: PoolCounts,
    /// Queues in creation order.
    pub queue_count: usize,
    /// Entries of the queue index.
    pub queue_index_size: usize,
    /// Tasks across all queues.
    pub task_count: usize,
    /// Entries of the task index.
    pub task_index_size: usize,
}

/// Worker listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    /// Idle workers.
    pub idle: usize,
    /// Busy workers.
    pub busy: usize,
}

/// Health response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Persisted tasks are loaded.
    pub initialized: bool,
}

/// Current statistics.
pub fn stats(scheduler: &Scheduler) -> Stats {
    let queue = scheduler.task_queue();
    Stats {
        workers: PoolCounts {
            num_idle: scheduler.pool().num_idle(),
            num_busy: scheduler.pool().num_busy(),
        },
        queue_count: queue.num_queues(),
        queue_index_size: queue.queue_index_size(),
        task_count: queue.num_tasks(),
        task_index_size: queue.task_index_size(),
    }
}

/// Worker counts.
pub fn workers(scheduler: &Scheduler) -> WorkerCounts {
    WorkerCounts {
        idle: scheduler.pool().num_idle(),
        busy: scheduler.pool().num_busy(),
    }
}

/// All queues.
pub fn queues(scheduler: &Scheduler) -> Vec<QueueSummary> {
    scheduler.task_queue().queues()
}

/// Queues whose quota is exhausted.
pub fn exhausted_queues(scheduler: &Scheduler) -> Vec<QueueSummary> {
    scheduler.task_queue().exhausted_queues()
}

/// Full detail of one queue.
pub fn queue(scheduler: &Scheduler, id: &str) -> Result<Queue, SchedulerError> {
    scheduler
        .task_queue()
        .queue(id)
        .ok_or_else(|| SchedulerError::QueueNotFound(id.to_owned()))
}

/// Reserve in effect for a queue.
pub fn reserved_quota(scheduler: &Scheduler, id: &str) -> QuotaReserve {
    scheduler.task_queue().quota().get_reserve_for_queue(id)
}

/// Override the reserve of a queue, optionally for `timeout_ms`.
pub fn set_reserved_quota(
    scheduler: &Scheduler,
    id: &str,
    percentage: u32,
    timeout_ms: Option<u64>,
) -> Result<QuotaReserve, SchedulerError> {
    scheduler
        .task_queue()
        .quota()
        .set_reserve_for_queue(id, percentage, timeout_ms.map(Duration::from_millis))
}

/// Health payload.
pub fn health(scheduler: &Scheduler) -> Health {
    Health {
        ok: true,
        initialized: scheduler.task_queue().is_initialized(),
    }
}
