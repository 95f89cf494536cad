//! Persistence abstraction for tasks.
//!
//! Every write goes through an explicit [`StoreSession`]. Callers that need
//! several writes to land together (retry) open one session and commit it;
//! single writes use the provided one-shot methods on [`TaskStore`], which
//! open, write and commit their own session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{StoreError, TaskState};
use crate::util::{TaskId, TenantId};

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    /// Row id.
    pub id: TaskId,
    /// Parent row id.
    pub parent_id: Option<TaskId>,
    /// Tenant company.
    pub company_id: TenantId,
    /// Tenant sales channel.
    pub channel_id: TenantId,
    /// Operation tag.
    pub operation: String,
    /// Opaque payload.
    pub operation_data: String,
    /// Stored state.
    pub state: TaskState,
    /// Deadline of the stored state.
    pub state_expires_at: Option<DateTime<Utc>>,
    /// Suspension marker.
    pub suspension_point: Option<String>,
    /// Retry counter.
    pub retry: u32,
    /// Inputs changed after creation.
    pub modified: bool,
    /// Result text written on completion.
    pub result: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Values for a row to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskRow {
    /// Parent row id.
    pub parent_id: Option<TaskId>,
    /// Retry counter.
    pub retry: u32,
    /// Suspension marker.
    pub suspension_point: Option<String>,
    /// Tenant company.
    pub company_id: TenantId,
    /// Tenant sales channel.
    pub channel_id: TenantId,
    /// Operation tag.
    pub operation: String,
    /// Opaque payload.
    pub operation_data: String,
}

/// A state write. Unset optional fields are cleared in the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    /// New state.
    pub state: TaskState,
    /// Deadline for the new state.
    pub expires_at: Option<DateTime<Utc>>,
    /// Suspension marker.
    pub suspension_point: Option<String>,
    /// Result text.
    pub result: Option<String>,
}

impl StateUpdate {
    /// State change with no deadline, marker or result.
    pub const fn new(state: TaskState) -> Self {
        Self {
            state,
            expires_at: None,
            suspension_point: None,
            result: None,
        }
    }

    /// Attach a result text.
    #[must_use]
    pub fn with_result(mut self, result: Option<String>) -> Self {
        self.result = result;
        self
    }
}

/// One unit of work against the store.
#[async_trait]
pub trait StoreSession: Send {
    /// All rows that are not done, failed or aborted, oldest first.
    async fn load_unfinished_tasks(&mut self) -> Result<Vec<TaskRow>, StoreError>;

    /// Insert a row and return its id.
    async fn insert_task(&mut self, row: NewTaskRow) -> Result<TaskId, StoreError>;

    /// Overwrite state, deadline, marker and result of a row.
    async fn set_task_state(&mut self, id: TaskId, update: StateUpdate) -> Result<(), StoreError>;

    /// Flag a row as modified and reset its retry counter.
    async fn mark_modified(&mut self, id: TaskId) -> Result<(), StoreError>;

    /// Clear the modified flag.
    async fn clear_modified(&mut self, id: TaskId) -> Result<(), StoreError>;

    /// Make every write of this session durable.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every write of this session.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store of task rows.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Open a session.
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;

    /// Load unfinished rows in a read-only session.
    async fn load_unfinished_tasks(&self) -> Result<Vec<TaskRow>, StoreError> {
        let mut session = self.begin().await?;
        let rows = session.load_unfinished_tasks().await;
        settle(session, rows).await
    }

    /// Insert one row in its own session.
    async fn insert_task(&self, row: NewTaskRow) -> Result<TaskId, StoreError> {
        let mut session = self.begin().await?;
        let id = session.insert_task(row).await;
        settle(session, id).await
    }

    /// Write one state change in its own session.
    async fn set_task_state(&self, id: TaskId, update: StateUpdate) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let done = session.set_task_state(id, update).await;
        settle(session, done).await
    }

    /// Mark one row modified in its own session.
    async fn mark_modified(&self, id: TaskId) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let done = session.mark_modified(id).await;
        settle(session, done).await
    }

    /// Clear one row's modified flag in its own session.
    async fn clear_modified(&self, id: TaskId) -> Result<(), StoreError> {
        let mut session = self.begin().await?;
        let done = session.clear_modified(id).await;
        settle(session, done).await
    }
}

/// Commit on success, roll back on failure.
pub async fn settle<T: Send>(
    session: Box<dyn StoreSession>,
    outcome: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match outcome {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = session.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}
