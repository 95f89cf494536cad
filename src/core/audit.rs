//! Audit sink implementations.
//!
//! The engine emits one event per persisted lifecycle change (enqueue, start,
//! pause, resume, finish, retry, abort, purge). Sinks are optional and synchronous.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::{QueueId, TaskId};

/// Lifecycle change recorded by the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Task row created.
    Enqueue,
    /// Existing task matched a new enqueue and was flagged modified.
    Modify,
    /// Task handed to a worker.
    Start,
    /// Task suspended waiting for children.
    Pause,
    /// Suspended task made runnable again.
    Resume,
    /// Task finished successfully.
    Complete,
    /// Task finished unsuccessfully.
    Fail,
    /// Task replaced by a retry row.
    Retry,
    /// Task stopped by its worker.
    Abort,
    /// Queue emptied after its root task finished.
    Purge,
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: uuid::Uuid,
    /// Related task identifier.
    pub task_id: TaskId,
    /// Queue the task belongs to.
    pub queue_id: QueueId,
    /// Action taken.
    pub action: AuditAction,
    /// Event time.
    pub created_at: DateTime<Utc>,
    /// Additional context (result text, retry target, ...).
    pub payload: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev. Keeps the newest `max_events`.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events recorded for one task, oldest first.
    pub fn events_for(&self, task_id: TaskId) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if self.max_events == 0 {
            return;
        }
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Sink that forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::debug!(
            task_id = event.task_id,
            queue_id = %event.queue_id,
            action = ?event.action,
            payload = event.payload.as_deref().unwrap_or(""),
            "audit"
        );
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    task_id: TaskId,
    queue_id: impl Into<QueueId>,
    action: AuditAction,
    created_at: DateTime<Utc>,
    payload: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4(),
        task_id,
        queue_id: queue_id.into(),
        action,
        created_at,
        payload,
    }
}
