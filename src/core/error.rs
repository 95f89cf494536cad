//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::TaskState;
use crate::util::{QueueId, TaskId};

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task is not (or no longer) in the in-memory index.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// Enqueue named a parent that is not in the index.
    #[error("parent task #{0} has not been found")]
    ParentNotFound(TaskId),
    /// Lookup of an unknown queue.
    #[error("queue not found: {0}")]
    QueueNotFound(QueueId),
    /// Rejected at the API boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// State change not allowed by the task lifecycle.
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task identifier.
        id: TaskId,
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },
    /// `borrow` on a pool with no idle worker.
    #[error("no idle worker available")]
    NoIdleWorker,
    /// Persistence failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Worker channel failure.
    #[error("worker channel error: {0}")]
    Channel(#[from] ChannelError),
    /// Configuration rejected.
    #[error("config invalid: {0}")]
    Config(String),
}

impl SchedulerError {
    /// Not-found errors are usually benign races with timeouts or finished tasks.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound(_) | Self::QueueNotFound(_))
    }
}

/// Errors raised by [`TaskStore`](crate::core::TaskStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// Write addressed a row that does not exist.
    #[error("row not found: {0}")]
    RowNotFound(TaskId),
    /// File-system failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Row could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by [`WorkerChannel`](crate::core::WorkerChannel) implementations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The remote end is gone.
    #[error("worker channel closed")]
    Closed,
    /// The message could not be delivered.
    #[error("send failed: {0}")]
    Send(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
