//! In-memory task store for development and testing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{NewTaskRow, StateUpdate, StoreError, StoreSession, TaskRow, TaskStore};
use crate::infra::store::{apply_writes, unfinished, PendingWrite};
use crate::util::{Clock, SystemClock, TaskId};

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<TaskId, TaskRow>,
    next_id: TaskId,
    fail_writes: usize,
    fail_commits: usize,
    commits: usize,
}

impl MemoryState {
    fn take_write_failure(&mut self) -> Result<(), StoreError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(StoreError::Backend("injected write failure".into()));
        }
        Ok(())
    }
}

/// Task store keeping rows in a map, with failure injection for tests.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    /// Empty store stamping rows with the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping rows with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            })),
            clock,
        }
    }

    /// Put a row in place as-is, bypassing sessions.
    pub fn seed(&self, row: TaskRow) {
        let mut state = self.state.lock();
        state.next_id = state.next_id.max(row.id + 1);
        state.rows.insert(row.id, row);
    }

    /// Snapshot of one row.
    pub fn row(&self, id: TaskId) -> Option<TaskRow> {
        self.state.lock().rows.get(&id).cloned()
    }

    /// Snapshot of all rows ordered by id.
    pub fn rows(&self) -> Vec<TaskRow> {
        self.state.lock().rows.values().cloned().collect()
    }

    /// Make the next `n` session writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().fail_writes = n;
    }

    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.state.lock().fail_commits = n;
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            writes: Vec::new(),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    writes: Vec<PendingWrite>,
}

impl MemorySession {
    fn buffer(&mut self, write: PendingWrite) -> Result<(), StoreError> {
        self.state.lock().take_write_failure()?;
        self.writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn load_unfinished_tasks(&mut self) -> Result<Vec<TaskRow>, StoreError> {
        Ok(unfinished(&self.state.lock().rows))
    }

    async fn insert_task(&mut self, row: NewTaskRow) -> Result<TaskId, StoreError> {
        let id = {
            let mut state = self.state.lock();
            state.take_write_failure()?;
            let id = state.next_id;
            state.next_id += 1;
            id
        };
        self.writes.push(PendingWrite::Insert(TaskRow {
            id,
            parent_id: row.parent_id,
            company_id: row.company_id,
            channel_id: row.channel_id,
            operation: row.operation,
            operation_data: row.operation_data,
            state: crate::core::TaskState::Unset,
            state_expires_at: None,
            suspension_point: row.suspension_point,
            retry: row.retry,
            modified: false,
            result: None,
            created_at: self.clock.now(),
        }));
        Ok(id)
    }

    async fn set_task_state(&mut self, id: TaskId, update: StateUpdate) -> Result<(), StoreError> {
        self.buffer(PendingWrite::SetState(id, update))
    }

    async fn mark_modified(&mut self, id: TaskId) -> Result<(), StoreError> {
        self.buffer(PendingWrite::MarkModified(id))
    }

    async fn clear_modified(&mut self, id: TaskId) -> Result<(), StoreError> {
        self.buffer(PendingWrite::ClearModified(id))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { state, writes, .. } = *self;
        let mut state = state.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(StoreError::Backend("injected commit failure".into()));
        }
        apply_writes(&mut state.rows, writes)?;
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        tracing::debug!(discarded = self.writes.len(), "memory session rolled back");
        Ok(())
    }
}
