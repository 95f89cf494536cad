//! Wire messages exchanged with workers.
//!
//! Numeric fields of worker requests are kept as raw JSON values and parsed
//! leniently (numbers or numeric strings) when the request is served.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::TaskId;

/// Outcome a worker reports for the task it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    /// Work finished.
    Succeeded,
    /// Work failed; may be retried.
    Failed,
    /// Waiting for children; `data` carries the suspension point.
    Suspended,
    /// Stopped on purpose.
    Aborted,
}

impl FromStr for TaskOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "suspended" => Ok(Self::Suspended),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown task result '{other}'")),
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
            Self::Aborted => "aborted",
        })
    }
}

/// Upstream API usage attached to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestsReport {
    /// Full quota snapshot read from the upstream API.
    #[serde(rename_all = "camelCase")]
    Quota {
        /// Remaining calls.
        quota_remaining: i64,
        /// Daily limit.
        quota_daily_limit: i64,
        /// Upstream timestamp (ms) of the snapshot.
        quota_timestamp: i64,
    },
    /// Number of calls made, when no snapshot was available.
    #[serde(rename_all = "camelCase")]
    Consumed {
        /// Calls made.
        requests_made: i64,
    },
}

/// One-shot result of a dispatched task.
///
/// `result` stays a string so that unknown codes reach the scheduler and can
/// be logged instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    /// Task the worker worked on.
    pub task_id: TaskId,
    /// `succeeded`, `failed`, `suspended` or `aborted`.
    pub result: String,
    /// Result text, failure reason or suspension point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Upstream API usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<RequestsReport>,
    /// Failure must not be retried.
    #[serde(default)]
    pub do_not_retry: bool,
}

impl TaskReport {
    /// Report with a known outcome and no extras.
    pub fn new(task_id: TaskId, outcome: TaskOutcome) -> Self {
        Self {
            task_id,
            result: outcome.to_string(),
            data: None,
            requests: None,
            do_not_retry: false,
        }
    }

    /// Attach data.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Attach API usage.
    #[must_use]
    pub fn with_requests(mut self, requests: RequestsReport) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Forbid retrying this failure.
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.do_not_retry = true;
        self
    }

    /// Parsed outcome.
    pub fn outcome(&self) -> Result<TaskOutcome, String> {
        self.result.parse()
    }

    /// `data` as text: strings verbatim, `null` as none, anything else as JSON.
    pub fn data_text(&self) -> Option<String> {
        match &self.data {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Query or command a worker sends while running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Enqueue one or more tasks.
    #[serde(rename_all = "camelCase")]
    Enqueue {
        /// Tenant company.
        #[serde(default)]
        company_id: Option<Value>,
        /// Tenant sales channel.
        #[serde(default)]
        channel_id: Option<Value>,
        /// Operation tag.
        #[serde(default)]
        operation: Option<Value>,
        /// Single value or array.
        #[serde(default)]
        operation_data: Option<Value>,
        /// Parent task.
        #[serde(default)]
        parent_task_id: Option<Value>,
        /// Initial retry counter.
        #[serde(default)]
        retry: Option<Value>,
    },
    /// Outcome summary of every child.
    #[serde(rename_all = "camelCase")]
    GetSubtaskResults {
        /// Parent task.
        #[serde(default)]
        task_id: Option<Value>,
    },
    /// Whether any child is unfinished.
    #[serde(rename_all = "camelCase")]
    HasWipSubtasks {
        /// Parent task.
        #[serde(default)]
        task_id: Option<Value>,
    },
    /// Next allowed request slot (ms since epoch).
    #[serde(rename_all = "camelCase")]
    GetTaskStartTime {
        /// Requesting task.
        #[serde(default)]
        task_id: Option<Value>,
    },
    /// Quota snapshot; never answered.
    #[serde(rename_all = "camelCase")]
    ReportQuota {
        /// Reporting task.
        #[serde(default)]
        task_id: Option<Value>,
        /// Remaining calls.
        #[serde(default)]
        quota_remaining: Option<Value>,
        /// Daily limit.
        #[serde(default)]
        quota_daily_limit: Option<Value>,
        /// Upstream timestamp (ms).
        #[serde(default)]
        quota_timestamp: Option<Value>,
    },
    /// Remove done and failed children; answers with the count.
    #[serde(rename_all = "camelCase")]
    DropAllCompletedChildren {
        /// Parent task.
        #[serde(default)]
        task_id: Option<Value>,
    },
    /// Acknowledge that modified inputs were picked up.
    #[serde(rename_all = "camelCase")]
    ClearModifiedFlag {
        /// Task.
        #[serde(default)]
        task_id: Option<Value>,
    },
}

impl WorkerRequest {
    /// Wire name of the operation.
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Enqueue { .. } => "enqueue",
            Self::GetSubtaskResults { .. } => "getSubtaskResults",
            Self::HasWipSubtasks { .. } => "hasWipSubtasks",
            Self::GetTaskStartTime { .. } => "getTaskStartTime",
            Self::ReportQuota { .. } => "reportQuota",
            Self::DropAllCompletedChildren { .. } => "dropAllCompletedChildren",
            Self::ClearModifiedFlag { .. } => "clearModifiedFlag",
        }
    }

    /// Request that takes a single task id.
    pub fn for_task(op: &str, task_id: TaskId) -> Option<Self> {
        let task_id = Some(Value::from(task_id));
        Some(match op {
            "getSubtaskResults" => Self::GetSubtaskResults { task_id },
            "hasWipSubtasks" => Self::HasWipSubtasks { task_id },
            "getTaskStartTime" => Self::GetTaskStartTime { task_id },
            "dropAllCompletedChildren" => Self::DropAllCompletedChildren { task_id },
            "clearModifiedFlag" => Self::ClearModifiedFlag { task_id },
            _ => return None,
        })
    }
}

/// `succeeded` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestResult {
    /// Served.
    Succeeded,
    /// Rejected; see `cause`.
    Failed,
}

/// Reply to a [`WorkerRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Whether the request was served.
    pub result: RequestResult,
    /// Payload of a served request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Reason of a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl RequestOutcome {
    /// Served, optionally with data.
    pub const fn succeeded(data: Option<Value>) -> Self {
        Self {
            result: RequestResult::Succeeded,
            data,
            cause: None,
        }
    }

    /// Rejected with `cause`.
    pub fn failed(cause: impl Into<String>) -> Self {
        Self {
            result: RequestResult::Failed,
            data: None,
            cause: Some(cause.into()),
        }
    }

    /// Whether the request was served.
    pub fn is_success(&self) -> bool {
        self.result == RequestResult::Succeeded
    }
}
