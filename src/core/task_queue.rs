//! The scheduling engine: task index, per-tenant queues and the task lifecycle.
//!
//! Tasks live in a flat arena keyed by id, with a secondary `parent -> children`
//! index maintained on every insert and removal. Every task is a member of
//! exactly one queue. All getters hand out clones.
//!
//! In-memory state is changed before the matching store write. When a write
//! fails the error is returned to the caller; `start_task` and `retry_task`
//! additionally undo their in-memory effects.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;

use crate::config::ManagerConfig;
use crate::core::{
    build_audit_event, settle, AuditAction, AuditSink, ChildResult, EnqueueRequest, NewTaskRow,
    Queue, QueueSummary, QuotaLimit, SchedulerError, StateUpdate, StoreError, Task, TaskRow,
    TaskState, TaskStore,
};
use crate::util::{millis, start_of_next_hour, start_of_second, Clock, QueueId, TaskId, TenantId};

/// In-memory task index and selection policy backed by a [`TaskStore`].
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    quota: QuotaLimit,
    rate_limit_per_second: u32,
    root_operation: String,
    quota_dump_period: i64,
    tasks: HashMap<TaskId, Task>,
    children: HashMap<TaskId, BTreeSet<TaskId>>,
    queues: HashMap<QueueId, Queue>,
    queue_order: Vec<QueueId>,
    audit: Option<Arc<dyn AuditSink>>,
    initialized: bool,
}

impl TaskQueue {
    /// Create an empty engine.
    pub fn new(config: &ManagerConfig, store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            quota: QuotaLimit::new(config.daily_quota_reserve, Arc::clone(&clock)),
            store,
            clock,
            rate_limit_per_second: config.rate_limit_per_second.max(1),
            root_operation: config.root_operation.clone(),
            quota_dump_period: i64::from(config.quota_dump_period.max(1)),
            tasks: HashMap::new(),
            children: HashMap::new(),
            queues: HashMap::new(),
            queue_order: Vec::new(),
            audit: None,
            initialized: false,
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Quota reserve policy shared with the admin surface.
    pub const fn quota(&self) -> &QuotaLimit {
        &self.quota
    }

    /// Whether [`load`](Self::load) already ran.
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Index every unfinished row from the store. Runs once; later calls return `Ok(0)`.
    ///
    /// Rows whose parent is not loaded are logged and skipped. Rows already in
    /// `started` count against their queue's concurrency cap.
    pub async fn load(&mut self) -> Result<usize, SchedulerError> {
        if self.initialized {
            return Ok(0);
        }
        let rows = self.store.load_unfinished_tasks().await?;
        tracing::info!(rows = rows.len(), "loading unfinished tasks");
        let mut loaded = 0;
        for row in rows {
            let id = row.id;
            match self.task_from_row(row) {
                Ok(task) => {
                    let started = task.state == TaskState::Started;
                    let queue_id = task.queue_id.clone();
                    self.add_task(task);
                    if started {
                        self.ensure_queue(&queue_id).tasks_active += 1;
                    }
                    loaded += 1;
                }
                Err(e) => tracing::error!(task_id = id, error = %e, "unable to add task to queue"),
            }
        }
        self.initialized = true;
        Ok(loaded)
    }

    fn task_from_row(&self, row: TaskRow) -> Result<Task, SchedulerError> {
        let queue_id = self.resolve_queue_id(
            None,
            row.parent_id,
            row.company_id,
            row.channel_id,
            &row.operation,
            &row.operation_data,
        )?;
        Ok(Task {
            id: row.id,
            parent_task_id: row.parent_id,
            company_id: row.company_id,
            channel_id: row.channel_id,
            operation: row.operation,
            operation_data: row.operation_data,
            state: row.state,
            state_expires_at: row.state_expires_at,
            retry: row.retry,
            suspension_point: row.suspension_point,
            modified: row.modified,
            queue_id,
            created_at: row.created_at,
            ttl: 0,
            result: row.result,
            supersedes: None,
        })
    }

    /// Create one task per payload element, or flag matching tasks as modified.
    ///
    /// Returns the ids in payload order; a deduplicated element yields the id
    /// of the task it matched.
    pub async fn enqueue(&mut self, request: EnqueueRequest) -> Result<Vec<TaskId>, SchedulerError> {
        tracing::debug!(
            company_id = request.company_id,
            channel_id = request.channel_id,
            operation = %request.operation,
            parent_task_id = ?request.parent_task_id,
            "enqueue"
        );
        if request.operation.is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "operation must be a non-empty string".into(),
            ));
        }
        if let Some(parent) = request.parent_task_id {
            if !self.tasks.contains_key(&parent) {
                tracing::debug!(parent_task_id = parent, "parent task has not been found");
                return Err(SchedulerError::ParentNotFound(parent));
            }
        }

        let mut ids = Vec::new();
        for data in request.operation_data.items() {
            let queue_id = self.resolve_queue_id(
                request.queue_id.as_ref(),
                request.parent_task_id,
                request.company_id,
                request.channel_id,
                &request.operation,
                &data,
            )?;
            self.ensure_queue(&queue_id);

            if let Some(existing) = self.find_duplicate(&queue_id, &request, &data) {
                tracing::debug!(
                    task_id = existing,
                    operation = %request.operation,
                    "task has already been enqueued"
                );
                if let Some(task) = self.tasks.get_mut(&existing) {
                    task.modified = true;
                    task.retry = 0;
                }
                self.store.mark_modified(existing).await?;
                self.record(existing, &queue_id, AuditAction::Modify, None);
                ids.push(existing);
                continue;
            }

            let id = self
                .store
                .insert_task(NewTaskRow {
                    parent_id: request.parent_task_id,
                    retry: request.retry,
                    suspension_point: None,
                    company_id: request.company_id,
                    channel_id: request.channel_id,
                    operation: request.operation.clone(),
                    operation_data: data.clone(),
                })
                .await?;
            self.add_task(Task {
                id,
                parent_task_id: request.parent_task_id,
                company_id: request.company_id,
                channel_id: request.channel_id,
                operation: request.operation.clone(),
                operation_data: data,
                state: TaskState::Unset,
                state_expires_at: None,
                retry: request.retry,
                suspension_point: None,
                modified: false,
                queue_id: queue_id.clone(),
                created_at: self.clock.now(),
                ttl: 0,
                result: None,
                supersedes: None,
            });
            self.record(id, &queue_id, AuditAction::Enqueue, None);
            ids.push(id);
        }
        Ok(ids)
    }

    fn find_duplicate(&self, queue_id: &str, request: &EnqueueRequest, data: &str) -> Option<TaskId> {
        let queue = self.queues.get(queue_id)?;
        queue.tasks.iter().copied().find(|id| {
            self.tasks.get(id).is_some_and(|t| {
                t.company_id == request.company_id
                    && t.channel_id == request.channel_id
                    && t.operation == request.operation
                    && t.operation_data == data
                    && request
                        .parent_task_id
                        .is_none_or(|parent| t.parent_task_id == Some(parent))
            })
        })
    }

    /// Explicit queue, else the parent's queue, else the derived tenant key.
    fn resolve_queue_id(
        &self,
        explicit: Option<&QueueId>,
        parent: Option<TaskId>,
        company_id: TenantId,
        channel_id: TenantId,
        operation: &str,
        data: &str,
    ) -> Result<QueueId, SchedulerError> {
        if let Some(id) = explicit {
            return Ok(id.clone());
        }
        if let Some(parent) = parent {
            return self
                .tasks
                .get(&parent)
                .map(|p| p.queue_id.clone())
                .ok_or(SchedulerError::ParentNotFound(parent));
        }
        let shop = if operation == self.root_operation { data } else { "" };
        Ok(Queue::derive_id(company_id, channel_id, shop))
    }

    fn ensure_queue(&mut self, queue_id: &str) -> &mut Queue {
        if !self.queues.contains_key(queue_id) {
            self.queue_order.push(queue_id.to_owned());
        }
        self.queues
            .entry(queue_id.to_owned())
            .or_insert_with(|| Queue::new(queue_id))
    }

    fn add_task(&mut self, task: Task) {
        let queue = self.ensure_queue(&task.queue_id);
        queue.tasks.push(task.id);
        tracing::debug!(task_id = task.id, queue_id = %queue.id, "task queued");
        if let Some(parent) = task.parent_task_id {
            self.children.entry(parent).or_default().insert(task.id);
        }
        self.tasks.insert(task.id, task);
    }

    fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        if let Some(queue) = self.queues.get_mut(&task.queue_id) {
            queue.tasks.retain(|t| *t != id);
        }
        if let Some(parent) = task.parent_task_id {
            self.unlink_child(parent, id);
        }
        tracing::debug!(task_id = id, queue_id = %task.queue_id, "task removed from queue");
        Some(task)
    }

    fn unlink_child(&mut self, parent: TaskId, child: TaskId) {
        if let Some(set) = self.children.get_mut(&parent) {
            set.remove(&child);
            if set.is_empty() {
                self.children.remove(&parent);
            }
        }
    }

    /// Empty a queue, dropping its tasks from the index and zeroing its active count.
    fn purge_queue(&mut self, queue_id: &str) {
        let Some(queue) = self.queues.get_mut(queue_id) else {
            return;
        };
        let ids = std::mem::take(&mut queue.tasks);
        queue.tasks_active = 0;
        for id in &ids {
            if let Some(task) = self.tasks.remove(id) {
                if let Some(parent) = task.parent_task_id {
                    self.unlink_child(parent, *id);
                }
            }
            self.children.remove(id);
        }
        tracing::debug!(queue_id, purged = ids.len(), "queue purged");
    }

    /// Pick the next runnable task.
    ///
    /// Queues are scanned in creation order. Empty queues, queues with
    /// exhausted quota before their next try time, and queues at their
    /// concurrency cap are skipped. Within a queue the first `unset` or
    /// `resumed` task wins. Picking from an exhausted queue pushes its next
    /// try time to the following hour.
    pub fn get_task(&mut self) -> Option<Task> {
        let now = start_of_second(self.clock.now());
        let rate = self.rate_limit_per_second;
        for queue_id in &self.queue_order {
            let Some(queue) = self.queues.get_mut(queue_id) else {
                continue;
            };
            if queue.tasks.is_empty() {
                continue;
            }
            let exhausted = self.quota.check_exhausted(queue);
            if exhausted && queue.next_try_time.is_some_and(|at| now < at) {
                continue;
            }
            if queue.tasks_active >= rate {
                if !queue.rate_limit_exhausted_reported {
                    queue.rate_limit_exhausted_reported = true;
                    tracing::debug!(queue_id = %queue.id, "rate limit exhausted");
                }
                continue;
            }
            queue.rate_limit_exhausted_reported = false;

            let found = queue
                .tasks
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .find(|t| t.state.is_selectable());
            if let Some(task) = found {
                if exhausted {
                    tracing::info!(queue_id = %queue.id, "probing whether quota has been relaxed");
                    queue.next_try_time = Some(start_of_next_hour(queue.next_try_time.unwrap_or(now)));
                }
                return Some(task.clone());
            }
        }
        None
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, SchedulerError> {
        self.tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))
    }

    fn check_transition(&self, id: TaskId, to: TaskState) -> Result<TaskState, SchedulerError> {
        let from = self.tasks.get(&id).ok_or(SchedulerError::TaskNotFound(id))?.state;
        if from.can_transition_to(to) {
            Ok(from)
        } else {
            Err(SchedulerError::InvalidTransition { id, from, to })
        }
    }

    /// Decrement the queue's active count when a task leaves `started`.
    fn leave_running(&mut self, queue_id: &str, from: TaskState) {
        if from != TaskState::Started {
            return;
        }
        if let Some(queue) = self.queues.get_mut(queue_id) {
            queue.tasks_active = queue.tasks_active.saturating_sub(1);
        }
    }

    /// Change state in memory and return the matching store write.
    fn apply_state(
        &mut self,
        id: TaskId,
        state: TaskState,
        ttl_ms: Option<u64>,
        suspension_point: Option<String>,
        result: Option<String>,
    ) -> Result<StateUpdate, SchedulerError> {
        let now = self.clock.now();
        let task = self.task_mut(id)?;
        task.state = state;
        if let Some(point) = suspension_point {
            task.suspension_point = Some(point);
        }
        match ttl_ms {
            Some(ttl) => {
                task.state_expires_at = Some(now + millis(ttl));
                task.ttl = ttl;
            }
            None => task.state_expires_at = None,
        }
        if result.is_some() {
            task.result.clone_from(&result);
        }
        Ok(StateUpdate {
            state,
            expires_at: task.state_expires_at,
            suspension_point: task.suspension_point.clone(),
            result,
        })
    }

    /// Hand a task to a worker for `ttl_ms`.
    pub async fn start_task(&mut self, id: TaskId, ttl_ms: u64) -> Result<(), SchedulerError> {
        let from = self.check_transition(id, TaskState::Started)?;
        let (queue_id, expires_at, ttl) = {
            let task = self.task_mut(id)?;
            (task.queue_id.clone(), task.state_expires_at, task.ttl)
        };
        self.ensure_queue(&queue_id).tasks_active += 1;
        let update = self.apply_state(id, TaskState::Started, Some(ttl_ms), None, None)?;
        if let Err(e) = self.store.set_task_state(id, update).await {
            if let Some(queue) = self.queues.get_mut(&queue_id) {
                queue.tasks_active = queue.tasks_active.saturating_sub(1);
            }
            if let Some(task) = self.tasks.get_mut(&id) {
                task.state = from;
                task.state_expires_at = expires_at;
                task.ttl = ttl;
            }
            return Err(e.into());
        }
        self.record(id, &queue_id, AuditAction::Start, None);
        Ok(())
    }

    /// Replace a task by a fresh runnable row with an incremented retry counter.
    ///
    /// The old row is marked failed with `reason` and the new row inserted in
    /// one store session. On success the returned id names a new task whose
    /// `supersedes` is the old id; the old id is gone from the index. If the
    /// session fails nothing is persisted and the task is put back runnable
    /// under its old id with its retry counter unchanged.
    pub async fn retry_task(&mut self, id: TaskId, reason: &str) -> Result<TaskId, SchedulerError> {
        tracing::debug!(task_id = id, reason, "retry task");
        let from = self.check_transition(id, TaskState::Failed)?;
        let queue_id = self.task_mut(id)?.queue_id.clone();
        self.leave_running(&queue_id, from);
        let Some(old) = self.remove_task(id) else {
            return Err(SchedulerError::TaskNotFound(id));
        };

        let row = NewTaskRow {
            parent_id: old.parent_task_id,
            retry: old.retry + 1,
            suspension_point: None,
            company_id: old.company_id,
            channel_id: old.channel_id,
            operation: old.operation.clone(),
            operation_data: old.operation_data.clone(),
        };
        let update = StateUpdate::new(TaskState::Failed).with_result(Some(reason.to_owned()));
        match self.replace_rows(id, update, row).await {
            Ok(new_id) => {
                let retry = old.retry + 1;
                let replacement = Task {
                    id: new_id,
                    state: TaskState::Unset,
                    state_expires_at: None,
                    retry,
                    suspension_point: None,
                    modified: false,
                    created_at: self.clock.now(),
                    result: None,
                    supersedes: Some(id),
                    ..old
                };
                self.add_task(replacement);
                tracing::debug!(task_id = id, new_task_id = new_id, retry, "retried task replaced");
                self.record(id, &queue_id, AuditAction::Retry, Some(format!("replaced by #{new_id}")));
                Ok(new_id)
            }
            Err(e) => {
                tracing::error!(task_id = id, error = %e, "retry transaction failed, task kept runnable");
                self.add_task(Task {
                    state: TaskState::Unset,
                    state_expires_at: None,
                    ..old
                });
                Err(e.into())
            }
        }
    }

    async fn replace_rows(
        &self,
        old_id: TaskId,
        update: StateUpdate,
        row: NewTaskRow,
    ) -> Result<TaskId, StoreError> {
        let mut session = self.store.begin().await?;
        let outcome = match session.set_task_state(old_id, update).await {
            Ok(()) => session.insert_task(row).await,
            Err(e) => Err(e),
        };
        settle(session, outcome).await
    }

    /// Suspend a started task until its children finish.
    pub async fn pause_task(
        &mut self,
        id: TaskId,
        suspension_point: Option<String>,
        ttl_ms: u64,
    ) -> Result<(), SchedulerError> {
        let from = self.check_transition(id, TaskState::Suspended)?;
        let queue_id = self.task_mut(id)?.queue_id.clone();
        self.leave_running(&queue_id, from);
        let update = self.apply_state(id, TaskState::Suspended, Some(ttl_ms), suspension_point, None)?;
        self.store.set_task_state(id, update).await?;
        self.record(id, &queue_id, AuditAction::Pause, None);
        Ok(())
    }

    /// Make a suspended task runnable again. Resuming a task that is already
    /// `resumed` is logged and ignored.
    pub async fn resume_task(&mut self, id: TaskId, ttl_ms: u64) -> Result<(), SchedulerError> {
        let task = self.tasks.get(&id).ok_or(SchedulerError::TaskNotFound(id))?;
        if task.state == TaskState::Resumed {
            tracing::error!(
                task_id = id,
                "task is already resumed but should have been suspended, doing nothing"
            );
            return Ok(());
        }
        let queue_id = task.queue_id.clone();
        self.check_transition(id, TaskState::Resumed)?;
        let update = self.apply_state(id, TaskState::Resumed, Some(ttl_ms), None, None)?;
        self.store.set_task_state(id, update).await?;
        self.record(id, &queue_id, AuditAction::Resume, None);
        Ok(())
    }

    /// Finish a task as done or failed.
    ///
    /// Children stay indexed for their parent unless `force_delete` is set;
    /// top-level tasks are removed, purging the queue for the root operation.
    pub async fn finish_task(
        &mut self,
        id: TaskId,
        result: Option<String>,
        succeeded: bool,
        force_delete: bool,
    ) -> Result<(), SchedulerError> {
        tracing::debug!(task_id = id, succeeded, "finish task");
        let to = if succeeded { TaskState::Done } else { TaskState::Failed };
        let from = self.check_transition(id, to)?;
        let (queue_id, parent) = {
            let task = self.task_mut(id)?;
            (task.queue_id.clone(), task.parent_task_id)
        };
        self.leave_running(&queue_id, from);
        let update = self.apply_state(id, to, None, None, result.clone())?;
        self.store.set_task_state(id, update).await?;
        let action = if succeeded { AuditAction::Complete } else { AuditAction::Fail };
        self.record(id, &queue_id, action, result);

        if let (Some(parent), false) = (parent, force_delete) {
            tracing::debug!(task_id = id, parent_task_id = parent, "keep task until its parent is done");
            return Ok(());
        }
        self.remove_task_with_purging(id, succeeded).await;
        Ok(())
    }

    /// Stop a task on behalf of its worker. Children stay indexed for their parent.
    pub async fn abort_task(&mut self, id: TaskId, result: Option<String>) -> Result<(), SchedulerError> {
        tracing::debug!(task_id = id, "abort task");
        let from = self.check_transition(id, TaskState::Aborted)?;
        let (queue_id, parent) = {
            let task = self.task_mut(id)?;
            (task.queue_id.clone(), task.parent_task_id)
        };
        self.leave_running(&queue_id, from);
        let update = self.apply_state(id, TaskState::Aborted, None, None, result.clone())?;
        self.store.set_task_state(id, update).await?;
        self.record(id, &queue_id, AuditAction::Abort, result);

        if let Some(parent) = parent {
            tracing::debug!(task_id = id, parent_task_id = parent, "keep task until its parent is done");
            return Ok(());
        }
        self.remove_task_with_purging(id, true).await;
        Ok(())
    }

    /// Remove a task; a finished root task takes its whole queue with it.
    ///
    /// When the root task failed, every other unfinished task of the queue is
    /// marked failed in the store (in parallel, errors logged) after the purge.
    async fn remove_task_with_purging(&mut self, id: TaskId, succeeded: bool) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        if task.parent_task_id.is_some() {
            self.remove_task(id);
            return;
        }
        if task.operation != self.root_operation {
            tracing::warn!(task_id = id, operation = %task.operation, "removing top-level task that is not the root operation");
            self.remove_task(id);
            return;
        }

        let queue_id = task.queue_id.clone();
        tracing::info!(task_id = id, queue_id = %queue_id, "root task finished, purging queue");
        let orphans: Vec<TaskId> = if succeeded {
            Vec::new()
        } else {
            self.queues
                .get(&queue_id)
                .map(|q| {
                    q.tasks
                        .iter()
                        .copied()
                        .filter(|t| *t != id)
                        .filter(|t| self.tasks.get(t).is_some_and(|t| !t.state.is_terminal()))
                        .collect()
                })
                .unwrap_or_default()
        };
        self.purge_queue(&queue_id);
        self.record(id, &queue_id, AuditAction::Purge, None);
        if orphans.is_empty() {
            return;
        }

        let update = StateUpdate::new(TaskState::Failed)
            .with_result(Some(format!("Parent {} failed", self.root_operation)));
        let store = Arc::clone(&self.store);
        let writes = orphans.iter().map(|orphan| store.set_task_state(*orphan, update.clone()));
        for (orphan, outcome) in orphans.iter().zip(join_all(writes).await) {
            if let Err(e) = outcome {
                tracing::error!(task_id = orphan, error = %e, "unable to fail task of purged queue");
            }
        }
    }

    fn update_next_try_time(&mut self, queue_id: &str) {
        let next = start_of_next_hour(self.clock.now());
        let reserved = self.queues.get(queue_id).map(|q| self.quota.reserved_calls_for_queue(q));
        if let Some(queue) = self.queues.get_mut(queue_id) {
            queue.next_try_time = Some(next);
            tracing::info!(
                queue_id,
                next_try_time = %next.format("%H:%M:%S"),
                quota_remaining = queue.quota_remaining,
                quota_daily_limit = queue.quota_daily_limit,
                reserved = reserved.unwrap_or_default(),
                "quota exhausted"
            );
        }
    }

    /// Subtract `requests` calls from the quota of the task's queue.
    ///
    /// Negative counts are ignored; the remaining quota saturates at `i64::MIN`.
    pub fn consume_quota(&mut self, id: TaskId, requests: i64) {
        if requests < 0 {
            tracing::warn!(task_id = id, requests, "negative request count ignored");
            return;
        }
        let Some(queue_id) = self.tasks.get(&id).map(|t| t.queue_id.clone()) else {
            tracing::error!(task_id = id, "unable to consume quota: task not found");
            return;
        };
        let period = self.quota_dump_period;
        let queue = self.ensure_queue(&queue_id);
        queue.quota_remaining = queue.quota_remaining.saturating_sub(requests);
        if queue.quota_remaining % period == 0 {
            tracing::info!(queue_id = %queue_id, quota_remaining = queue.quota_remaining, "remaining quota");
        }
        if self.queues.get(&queue_id).is_some_and(|q| self.quota.check_exhausted(q)) {
            self.update_next_try_time(&queue_id);
        }
    }

    /// Store a quota snapshot for the task's queue unless a newer one was
    /// already accepted.
    pub fn set_quota(&mut self, id: TaskId, daily_limit: i64, remaining: i64, timestamp_ms: i64) {
        let Some(queue_id) = self.tasks.get(&id).map(|t| t.queue_id.clone()) else {
            tracing::error!(task_id = id, remaining, "unable to set quota: task not found");
            return;
        };
        let Some(queue) = self.queues.get_mut(&queue_id) else {
            tracing::error!(task_id = id, queue_id = %queue_id, "unable to set quota: queue not found");
            return;
        };
        if timestamp_ms < queue.quota_timestamp {
            tracing::debug!(
                task_id = id,
                from = queue.quota_remaining,
                to = remaining,
                timestamp_ms,
                accepted_ms = queue.quota_timestamp,
                "stale quota report ignored"
            );
            return;
        }
        let period = self.quota_dump_period;
        let old_remainder = queue.quota_remaining % period;
        queue.quota_remaining = remaining;
        queue.quota_timestamp = timestamp_ms;
        queue.quota_daily_limit = daily_limit;
        let new_remainder = remaining % period;
        if new_remainder == 0 || old_remainder > new_remainder {
            tracing::info!(queue_id = %queue_id, quota_remaining = remaining, "remaining quota");
        }
        if self.queues.get(&queue_id).is_some_and(|q| self.quota.check_exhausted(q)) {
            self.update_next_try_time(&queue_id);
        }
    }

    /// Next request slot for the task's queue, spaced by `ceil(1000 / rate)` ms.
    ///
    /// The task's deadline is pushed back by the same delay when the slot lies
    /// in the future.
    pub fn get_task_start_time(&mut self, id: TaskId) -> Result<DateTime<Utc>, SchedulerError> {
        let now = self.clock.now();
        let delay = millis(1000_u64.div_ceil(u64::from(self.rate_limit_per_second)));
        let (queue_id, ttl) = {
            let task = self.tasks.get(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            (task.queue_id.clone(), task.ttl)
        };
        let queue = self.ensure_queue(&queue_id);
        let previous = queue.last_request_time;
        let (slot, expires_at) = match previous {
            Some(last) if last + delay >= now => (last + delay, now + millis(ttl) + delay),
            _ => (now, now + millis(ttl)),
        };
        queue.last_request_time = Some(slot);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state_expires_at = Some(expires_at);
        }
        tracing::debug!(
            task_id = id,
            queue_id = %queue_id,
            in_ms = (slot - now).num_milliseconds(),
            previous = ?previous,
            "scheduled start time"
        );
        Ok(slot)
    }

    /// Copy of one task.
    pub fn get_task_by_id(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).cloned()
    }

    fn children_of(&self, id: TaskId) -> impl Iterator<Item = &Task> {
        self.children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|c| self.tasks.get(c))
    }

    /// Whether any child of `id` is still unfinished.
    pub fn has_task_child_in_progress(&self, id: TaskId) -> bool {
        self.children_of(id).any(|t| t.state.is_in_progress())
    }

    /// Unfinished children of `id`.
    pub fn get_all_wip_children(&self, id: TaskId) -> Vec<Task> {
        self.children_of(id)
            .filter(|t| t.state.is_in_progress())
            .cloned()
            .collect()
    }

    /// Failed children of `id`.
    pub fn get_failed_children(&self, id: TaskId) -> Vec<Task> {
        self.children_of(id)
            .filter(|t| t.state == TaskState::Failed)
            .cloned()
            .collect()
    }

    /// Outcome summary of every indexed child of `id`.
    pub fn get_all_children_results(&self, id: TaskId) -> Vec<ChildResult> {
        self.children_of(id)
            .map(|t| ChildResult {
                id: t.id,
                result: t.state != TaskState::Failed,
                state: t.state,
            })
            .collect()
    }

    /// Remove the done and failed children of `id`. Returns how many were removed.
    pub fn drop_all_completed_children(&mut self, id: TaskId) -> usize {
        let completed: Vec<TaskId> = self
            .children_of(id)
            .filter(|t| matches!(t.state, TaskState::Done | TaskState::Failed))
            .map(|t| t.id)
            .collect();
        for child in &completed {
            self.remove_task(*child);
        }
        completed.len()
    }

    /// All suspended tasks.
    pub fn get_all_suspended_tasks(&self) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Suspended)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }

    /// Tasks whose state deadline has passed.
    pub fn get_timed_out_tasks(&self) -> Vec<Task> {
        let now = self.clock.now();
        let mut out: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.is_timed_out(now))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }

    /// Clear the modified flag in memory and in the store.
    pub async fn clear_modified_flag(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        self.task_mut(id)?.modified = false;
        self.store.clear_modified(id).await?;
        Ok(())
    }

    /// Copy of one queue.
    pub fn queue(&self, id: &str) -> Option<Queue> {
        self.queues.get(id).cloned()
    }

    /// Summaries of all queues in creation order.
    pub fn queues(&self) -> Vec<QueueSummary> {
        self.queue_order
            .iter()
            .filter_map(|id| self.queues.get(id))
            .map(Queue::summary)
            .collect()
    }

    /// Summaries of queues whose quota is currently exhausted.
    pub fn exhausted_queues(&self) -> Vec<QueueSummary> {
        self.queue_order
            .iter()
            .filter_map(|id| self.queues.get(id))
            .filter(|q| self.quota.check_exhausted(q))
            .map(Queue::summary)
            .collect()
    }

    /// Number of queues.
    pub fn num_queues(&self) -> usize {
        self.queue_order.len()
    }

    /// Number of entries in the queue index.
    pub fn queue_index_size(&self) -> usize {
        self.queues.len()
    }

    /// Number of tasks across all queues.
    pub fn num_tasks(&self) -> usize {
        self.queues.values().map(|q| q.tasks.len()).sum()
    }

    /// Number of entries in the task index.
    pub fn task_index_size(&self) -> usize {
        self.tasks.len()
    }

    fn record(&self, task_id: TaskId, queue_id: &str, action: AuditAction, payload: Option<String>) {
        if let Some(sink) = self.audit.as_ref() {
            sink.record(build_audit_event(task_id, queue_id, action, self.clock.now(), payload));
        }
    }
}
