//! Task model and the task lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{QueueId, TaskId, TenantId};

/// Lifecycle state of a task.
///
/// `Unset` means runnable and never started. `Done`, `Failed` and `Aborted`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Runnable, never started.
    #[default]
    Unset,
    /// Assigned to a worker and counted against the queue's concurrency cap.
    Started,
    /// Suspended task whose children finished; runnable again.
    Resumed,
    /// Waiting for children.
    Suspended,
    /// Finished unsuccessfully (or replaced by a retry).
    Failed,
    /// Finished successfully.
    Done,
    /// Stopped by the worker on purpose.
    Aborted,
}

impl TaskState {
    /// The string stored in the persistence layer, `None` for `Unset`.
    pub const fn as_db_str(self) -> Option<&'static str> {
        match self {
            Self::Unset => None,
            Self::Started => Some("started"),
            Self::Resumed => Some("resumed"),
            Self::Suspended => Some("suspended"),
            Self::Failed => Some("failed"),
            Self::Done => Some("done"),
            Self::Aborted => Some("aborted"),
        }
    }

    /// Terminal states never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Done | Self::Aborted)
    }

    /// Work remains to be done for the task (it may still spawn or await children).
    pub const fn is_in_progress(self) -> bool {
        !self.is_terminal()
    }

    /// Eligible for selection by `TaskQueue::get_task`.
    pub const fn is_selectable(self) -> bool {
        matches!(self, Self::Unset | Self::Resumed)
    }

    /// A task in this state may have live children.
    pub const fn may_have_children(self) -> bool {
        matches!(self, Self::Started | Self::Suspended | Self::Resumed)
    }

    /// Central transition table.
    ///
    /// `Started` is entered from a runnable state, `Suspended` only from
    /// `Started`, `Resumed` only from `Suspended`; any non-terminal state may
    /// finish. Terminal states are final.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Unset => false,
            Self::Started => self.is_selectable(),
            Self::Suspended => matches!(self, Self::Started),
            Self::Resumed => matches!(self, Self::Suspended),
            Self::Failed | Self::Done | Self::Aborted => !self.is_terminal(),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str().unwrap_or("unset"))
    }
}

/// A schedulable unit of work.
///
/// Values handed out by the engine are copies; mutating them has no effect on
/// the engine's canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Persisted identifier. Changes when the task is retried.
    pub id: TaskId,
    /// Parent task, if this task was spawned by another one.
    pub parent_task_id: Option<TaskId>,
    /// Tenant company.
    pub company_id: TenantId,
    /// Tenant sales channel.
    pub channel_id: TenantId,
    /// Operation tag interpreted by workers.
    pub operation: String,
    /// Opaque payload.
    pub operation_data: String,
    /// Lifecycle state.
    pub state: TaskState,
    /// Deadline for the current state; passing it times the task out.
    pub state_expires_at: Option<DateTime<Utc>>,
    /// Retries already consumed.
    pub retry: u32,
    /// Worker supplied marker used to continue a multi-step operation.
    pub suspension_point: Option<String>,
    /// Inputs changed after the task was first enqueued.
    pub modified: bool,
    /// Queue this task belongs to.
    pub queue_id: QueueId,
    /// Creation time of the current persisted row.
    pub created_at: DateTime<Utc>,
    /// TTL in milliseconds last used for the current state.
    pub ttl: u64,
    /// Last result recorded for the task.
    pub result: Option<String>,
    /// Id of the row this task replaced when it was retried.
    pub supersedes: Option<TaskId>,
}

impl Task {
    /// Whether the task timed out at `now`.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.state_expires_at.is_some_and(|at| now > at)
    }
}

/// Payload given to `enqueue`: a single value or a bulk list.
///
/// Each element becomes its own task. Strings are kept as-is, anything else
/// is stored as its JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationData {
    /// One task.
    One(Value),
    /// One task per element.
    Many(Vec<Value>),
}

impl OperationData {
    /// Normalized payload strings, one per task to create.
    pub fn items(&self) -> Vec<String> {
        match self {
            Self::One(v) => vec![normalize(v)],
            Self::Many(vs) => vs.iter().map(normalize).collect(),
        }
    }
}

fn normalize(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl From<Value> for OperationData {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::Many(items),
            other => Self::One(other),
        }
    }
}

impl From<&str> for OperationData {
    fn from(value: &str) -> Self {
        Self::One(Value::String(value.to_owned()))
    }
}

impl From<String> for OperationData {
    fn from(value: String) -> Self {
        Self::One(Value::String(value))
    }
}

impl From<Vec<String>> for OperationData {
    fn from(values: Vec<String>) -> Self {
        Self::Many(values.into_iter().map(Value::String).collect())
    }
}

/// Arguments for `TaskQueue::enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Tenant company.
    pub company_id: TenantId,
    /// Tenant sales channel.
    pub channel_id: TenantId,
    /// Operation tag.
    pub operation: String,
    /// Single or bulk payload.
    pub operation_data: OperationData,
    /// Parent task; must already be indexed.
    pub parent_task_id: Option<TaskId>,
    /// Retry counter stored on newly created rows.
    pub retry: u32,
    /// Explicit queue, overriding the derived key.
    pub queue_id: Option<QueueId>,
}

impl EnqueueRequest {
    /// Top-level request with no parent and a zero retry counter.
    pub fn new(
        company_id: TenantId,
        channel_id: TenantId,
        operation: impl Into<String>,
        operation_data: impl Into<OperationData>,
    ) -> Self {
        Self {
            company_id,
            channel_id,
            operation: operation.into(),
            operation_data: operation_data.into(),
            parent_task_id: None,
            retry: 0,
            queue_id: None,
        }
    }

    /// Make the new task(s) children of `parent`.
    #[must_use]
    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    /// Start the retry counter at `retry`.
    #[must_use]
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Place the task(s) on an explicit queue.
    #[must_use]
    pub fn with_queue(mut self, queue_id: impl Into<QueueId>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }
}

/// Outcome summary of one child, as reported to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildResult {
    /// Child id.
    pub id: TaskId,
    /// `false` only when the child failed.
    pub result: bool,
    /// Current state of the child.
    pub state: TaskState,
}
