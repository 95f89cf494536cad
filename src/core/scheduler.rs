//! Orchestrator tying the engine to the worker pool.
//!
//! A single task owns the [`Scheduler`]; ticks, worker results, worker
//! requests and admin queries are all processed on it one at a time, so
//! engine state needs no locking. The next tick is armed only after the
//! previous one finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::ManagerConfig;
use crate::core::{
    ChannelError, EnqueueRequest, OperationData, SchedulerError, Task, TaskQueue, TaskState,
    WorkerChannel, WorkerPool,
};
use crate::runtime::api;
use crate::runtime::protocol::{RequestOutcome, RequestsReport, TaskOutcome, TaskReport, WorkerRequest};
use crate::runtime::{AdminQuery, SchedulerEvent, SchedulerHandle, Spawn};
use crate::util::{parse_int, parse_opt_int, TaskId, WorkerId};

/// Scheduling loop state.
pub struct Scheduler {
    config: ManagerConfig,
    queue: TaskQueue,
    pool: WorkerPool,
    assigned_workers: HashMap<TaskId, WorkerId>,
    worker_tasks: HashMap<WorkerId, TaskId>,
    run_counter: u64,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events: Option<mpsc::UnboundedReceiver<SchedulerEvent>>,
}

impl Scheduler {
    /// Create a scheduler around an engine.
    pub fn new(config: ManagerConfig, queue: TaskQueue) -> Self {
        tracing::info!(
            daily_quota_reserve = config.daily_quota_reserve,
            rate_limit_per_second = config.rate_limit_per_second,
            "scheduler created"
        );
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            config,
            queue,
            pool: WorkerPool::new(),
            assigned_workers: HashMap::new(),
            worker_tasks: HashMap::new(),
            run_counter: 0,
            events_tx,
            events: Some(events),
        }
    }

    /// Handle for transports and admin callers.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.events_tx.clone())
    }

    /// Configuration in use.
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The engine.
    pub const fn task_queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// The engine, mutably.
    pub fn task_queue_mut(&mut self) -> &mut TaskQueue {
        &mut self.queue
    }

    /// The worker pool.
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Worker currently running `task_id`.
    pub fn assigned_worker(&self, task_id: TaskId) -> Option<WorkerId> {
        self.assigned_workers.get(&task_id).copied()
    }

    /// Task currently run by `worker_id`.
    pub fn worker_task(&self, worker_id: WorkerId) -> Option<TaskId> {
        self.worker_tasks.get(&worker_id).copied()
    }

    /// Register a connected worker.
    pub fn add_worker(&mut self, worker: Arc<dyn WorkerChannel>) {
        tracing::info!(worker_id = %worker.id(), "worker connected");
        self.pool.add(worker);
    }

    /// Load persisted tasks and resume suspended tasks whose children all finished.
    pub async fn init(&mut self) -> Result<(), SchedulerError> {
        if self.queue.is_initialized() {
            return Ok(());
        }
        let loaded = self.queue.load().await?;
        tracing::info!(loaded, "tasks loaded");
        let suspended = self.queue.get_all_suspended_tasks();
        if suspended.is_empty() {
            return Ok(());
        }
        tracing::info!(count = suspended.len(), "recheck suspended tasks");
        for task in suspended {
            if let Err(e) = self.check_parent_is_done(task.id).await {
                tracing::warn!(task_id = task.id, error = %e, "unable to recheck suspended task");
            }
        }
        Ok(())
    }

    /// Spawn the event loop and return a handle to it.
    pub fn spawn<S: Spawn>(self, spawner: &S) -> SchedulerHandle {
        let handle = self.handle();
        spawner.spawn(self.run());
        handle
    }

    /// Process events and ticks until shutdown.
    pub async fn run(mut self) {
        if let Err(e) = self.init().await {
            tracing::error!(error = %e, "scheduler init failed");
        }
        let Some(mut events) = self.events.take() else {
            tracing::error!("scheduler event loop already running");
            return;
        };
        let interval = self.config.check_interval();
        let tick = tokio::time::sleep(interval);
        tokio::pin!(tick);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                () = &mut tick => {
                    self.run_tasks().await;
                    tick.as_mut().reset(tokio::time::Instant::now() + interval);
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Handle every event already queued, without waiting. Returns how many were handled.
    pub async fn process_pending(&mut self) -> usize {
        let Some(mut events) = self.events.take() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            handled += 1;
            if !self.handle_event(event).await {
                break;
            }
        }
        self.events = Some(events);
        handled
    }

    /// Apply one event. Returns `false` on shutdown.
    pub async fn handle_event(&mut self, event: SchedulerEvent) -> bool {
        match event {
            SchedulerEvent::Connected(worker) => self.add_worker(worker),
            SchedulerEvent::Result { worker_id, report } => {
                self.handle_task_result(worker_id, report).await;
            }
            SchedulerEvent::Disconnected { worker_id, cause } => {
                self.handle_worker_disconnected(worker_id, &cause).await;
            }
            SchedulerEvent::Request {
                worker_id,
                request,
                reply,
            } => {
                let outcome = self.handle_request(worker_id, request).await;
                if let (Some(reply), Some(outcome)) = (reply, outcome) {
                    let _ = reply.send(outcome);
                }
            }
            SchedulerEvent::Admin(query) => self.handle_admin(query),
            SchedulerEvent::Shutdown => return false,
        }
        true
    }

    fn handle_admin(&mut self, query: AdminQuery) {
        match query {
            AdminQuery::Stats(reply) => {
                let _ = reply.send(api::stats(self));
            }
            AdminQuery::Workers(reply) => {
                let _ = reply.send(api::workers(self));
            }
            AdminQuery::Queues(reply) => {
                let _ = reply.send(api::queues(self));
            }
            AdminQuery::ExhaustedQueues(reply) => {
                let _ = reply.send(api::exhausted_queues(self));
            }
            AdminQuery::Queue { id, reply } => {
                let _ = reply.send(api::queue(self, &id));
            }
            AdminQuery::ReservedQuota { id, reply } => {
                let _ = reply.send(api::reserved_quota(self, &id));
            }
            AdminQuery::SetReservedQuota {
                id,
                percentage,
                timeout_ms,
                reply,
            } => {
                let _ = reply.send(api::set_reserved_quota(self, &id, percentage, timeout_ms));
            }
            AdminQuery::Health(reply) => {
                let _ = reply.send(api::health(self));
            }
        }
    }

    /// One scheduling pass: cancel timed out tasks, then start one task per idle worker.
    ///
    /// Returns the number of tasks dispatched.
    pub async fn run_tasks(&mut self) -> usize {
        let run_id = self.run_counter;
        self.run_counter += 1;
        let started = Instant::now();
        tracing::info!(run_id, "start scheduling");

        self.cancel_timed_out_tasks().await;
        tracing::info!(run_id, "timed out tasks cancelled");

        let available = self.pool.num_idle();
        let mut scheduled = 0;
        for _ in 0..available {
            let Some(task) = self.queue.get_task() else {
                break;
            };
            if self.start_task_on_worker(task).await {
                scheduled += 1;
            }
        }
        tracing::info!(run_id, scheduled, "tasks scheduled");
        tracing::info!(run_id, ms = started.elapsed().as_millis(), "finishing");
        scheduled
    }

    async fn start_task_on_worker(&mut self, task: Task) -> bool {
        let worker = match self.pool.borrow() {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, "no worker for task");
                return false;
            }
        };
        let worker_id = worker.id();
        let resume = task.state == TaskState::Resumed;
        tracing::debug!(task_id = task.id, %worker_id, resume, "start task");

        if let Err(e) = self
            .queue
            .start_task(task.id, self.config.task_execution_timeout_ms)
            .await
        {
            tracing::error!(task_id = task.id, error = %e, "unable to start task");
            self.pool.return_worker(worker_id);
            self.fail_logged(task.id, "Unable to schedule".into()).await;
            return false;
        }
        let Some(updated) = self.queue.get_task_by_id(task.id) else {
            self.pool.return_worker(worker_id);
            return false;
        };

        self.assigned_workers.insert(updated.id, worker_id);
        self.worker_tasks.insert(worker_id, updated.id);
        let dispatched = if resume {
            worker.resume(&updated).await
        } else {
            worker.start(&updated).await
        };
        if let Err(e) = dispatched {
            tracing::error!(task_id = updated.id, %worker_id, error = %e, "unable to assign task to worker");
            self.assigned_workers.remove(&updated.id);
            self.worker_tasks.remove(&worker_id);
            if matches!(e, ChannelError::Closed) {
                self.pool.remove(worker_id);
            } else {
                self.pool.return_worker(worker_id);
            }
            self.fail_logged(updated.id, format!("Unable to dispatch: {e}")).await;
            return false;
        }
        true
    }

    async fn fail_logged(&mut self, id: TaskId, reason: String) {
        if let Err(e) = self.handle_task_failed(id, reason, true, true).await {
            tracing::error!(task_id = id, error = %e, "unable to fail task");
        }
    }

    /// Fail every timed out task, one at a time, and terminate its worker.
    pub async fn cancel_timed_out_tasks(&mut self) {
        for task in self.queue.get_timed_out_tasks() {
            tracing::debug!(task_id = task.id, state = %task.state, "task has timed out");
            self.fail_logged(task.id, "Timed out".into()).await;
            if let Some(worker_id) = self.assigned_workers.remove(&task.id) {
                self.worker_tasks.remove(&worker_id);
                if let Some(worker) = self.pool.remove(worker_id) {
                    worker.terminate();
                }
            }
        }
    }

    /// Resume `parent` once none of its children is in progress.
    pub async fn check_parent_is_done(&mut self, parent: TaskId) -> Result<(), SchedulerError> {
        tracing::debug!(parent_task_id = parent, "check parent is done");
        if self.queue.has_task_child_in_progress(parent) {
            tracing::debug!(parent_task_id = parent, "there is a child task in progress");
            return Ok(());
        }
        self.queue
            .resume_task(parent, self.config.task_execution_timeout_ms)
            .await
    }

    /// [`check_parent_is_done`](Self::check_parent_is_done) for a child that
    /// just left the running set. A parent that is not suspended yet (or
    /// already gone) is expected here, so only other errors are surfaced.
    async fn recheck_parent(&mut self, parent: TaskId) {
        match self.check_parent_is_done(parent).await {
            Ok(()) => {}
            Err(e @ SchedulerError::InvalidTransition { .. }) => {
                tracing::debug!(parent_task_id = parent, error = %e, "parent not waiting for children");
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(parent_task_id = parent, error = %e, "parent already gone");
            }
            Err(e) => tracing::error!(parent_task_id = parent, error = %e, "unable to resume parent"),
        }
    }

    async fn handle_task_succeeded(&mut self, id: TaskId, result: Option<String>) -> Result<(), SchedulerError> {
        let Some(task) = self.queue.get_task_by_id(id) else {
            tracing::debug!(task_id = id, "unable to finish task, task not found");
            return Ok(());
        };
        self.queue.finish_task(id, result, true, false).await?;
        if let Some(parent) = task.parent_task_id {
            self.recheck_parent(parent).await;
        }
        Ok(())
    }

    /// Central failure path.
    ///
    /// Retries while `retry_allowed` and the retry budget lasts, otherwise
    /// finishes the task as failed (removing it outright when the parent is
    /// not re-checked). Then re-checks the parent and fails every unfinished
    /// child of a task that could have spawned some.
    pub fn handle_task_failed(
        &mut self,
        id: TaskId,
        reason: String,
        retry_allowed: bool,
        check_parent: bool,
    ) -> BoxFuture<'_, Result<(), SchedulerError>> {
        Box::pin(async move {
            let Some(task) = self.queue.get_task_by_id(id) else {
                tracing::debug!(task_id = id, "unable to fail task, task not found");
                return Ok(());
            };
            tracing::debug!(task_id = id, reason = %reason, "handle task failure");

            let can_retry = retry_allowed && task.retry < self.config.max_retry_count;
            let outcome = if can_retry {
                self.queue.retry_task(id, &reason).await.map(|_| ())
            } else {
                self.queue
                    .finish_task(id, Some(reason.clone()), false, !check_parent)
                    .await
            };
            if let Err(e) = &outcome {
                tracing::error!(task_id = id, error = %e, "unable to record task failure");
            }

            if check_parent {
                if let Some(parent) = task.parent_task_id {
                    self.recheck_parent(parent).await;
                }
            }
            if task.state.may_have_children() {
                self.fail_task_children(id, format!("Parent failure: {reason}"))
                    .await?;
            }
            outcome
        })
    }

    async fn fail_task_children(&mut self, parent: TaskId, reason: String) -> Result<(), SchedulerError> {
        let children = self.queue.get_all_wip_children(parent);
        if children.is_empty() {
            tracing::debug!(task_id = parent, "task has no children");
            return Ok(());
        }
        tracing::debug!(task_id = parent, count = children.len(), "fail children");
        for child in children {
            tracing::debug!(task_id = child.id, state = %child.state, "fail child");
            if let Err(e) = self.handle_task_failed(child.id, reason.clone(), false, false).await {
                tracing::error!(task_id = child.id, error = %e, "unable to fail child");
            }
        }
        let dropped = self.queue.drop_all_completed_children(parent);
        tracing::debug!(task_id = parent, dropped, "dropped completed children");
        Ok(())
    }

    async fn handle_task_suspended(&mut self, id: TaskId, point: Option<String>) -> Result<(), SchedulerError> {
        if self.queue.get_task_by_id(id).is_none() {
            tracing::debug!(task_id = id, "unable to suspend task, task not found");
            return Ok(());
        }
        self.queue
            .pause_task(id, point, self.config.task_suspension_timeout_ms)
            .await
    }

    async fn handle_task_aborted(&mut self, id: TaskId, result: Option<String>) -> Result<(), SchedulerError> {
        let Some(task) = self.queue.get_task_by_id(id) else {
            tracing::debug!(task_id = id, "unable to abort task, task not found");
            return Ok(());
        };
        self.queue.abort_task(id, result).await?;
        if let Some(parent) = task.parent_task_id {
            self.recheck_parent(parent).await;
        }
        Ok(())
    }

    /// Route a worker's result to the matching lifecycle transition.
    ///
    /// The result applies to the task dispatched to `worker_id`. The worker
    /// goes back to the pool first; quota usage is applied before routing.
    pub async fn handle_task_result(&mut self, worker_id: WorkerId, report: TaskReport) {
        let Some(task_id) = self.worker_tasks.remove(&worker_id) else {
            tracing::error!(%worker_id, task_id = report.task_id, "can't find task by worker id");
            self.pool.return_worker(worker_id);
            return;
        };
        tracing::debug!(task_id, result = %report.result, "worker completed task");
        if report.task_id != task_id {
            tracing::warn!(task_id, reported = report.task_id, "result names another task");
        }
        self.pool.return_worker(worker_id);

        match report.requests {
            Some(RequestsReport::Quota {
                quota_remaining,
                quota_daily_limit,
                quota_timestamp,
            }) => {
                tracing::debug!(task_id, quota_remaining, "set quota");
                self.queue
                    .set_quota(task_id, quota_daily_limit, quota_remaining, quota_timestamp);
            }
            Some(RequestsReport::Consumed { requests_made }) => {
                tracing::debug!(task_id, requests_made, "decrease quota");
                self.queue.consume_quota(task_id, requests_made);
            }
            None => {}
        }

        let data = report.data_text();
        let outcome = match report.outcome() {
            Ok(TaskOutcome::Succeeded) => self.handle_task_succeeded(task_id, data).await,
            Ok(TaskOutcome::Failed) => {
                let reason = data.unwrap_or_else(|| "Failed".into());
                self.handle_task_failed(task_id, reason, !report.do_not_retry, true)
                    .await
            }
            Ok(TaskOutcome::Suspended) => self.handle_task_suspended(task_id, data).await,
            Ok(TaskOutcome::Aborted) => self.handle_task_aborted(task_id, data).await,
            Err(e) => {
                tracing::error!(task_id, error = %e, "unknown task result");
                Ok(())
            }
        };
        match outcome {
            Err(e) if e.is_not_found() => tracing::debug!(task_id, error = %e, "task result raced"),
            Err(e) => tracing::error!(task_id, error = %e, "unable to apply task result"),
            Ok(()) => {}
        }

        if self.assigned_workers.remove(&task_id).is_none() {
            tracing::error!(task_id, %worker_id, "can't find worker between assigned workers");
        }
    }

    /// Forget a gone worker and fail the task it was running.
    pub async fn handle_worker_disconnected(&mut self, worker_id: WorkerId, cause: &str) {
        tracing::info!(%worker_id, cause, "worker disconnected");
        self.pool.remove(worker_id);
        let Some(task_id) = self.worker_tasks.remove(&worker_id) else {
            return;
        };
        tracing::debug!(task_id, %worker_id, "worker was working on task");
        self.assigned_workers.remove(&task_id);
        if let Err(e) = self
            .handle_task_failed(task_id, format!("Worker disconnected ({cause})"), true, true)
            .await
        {
            tracing::error!(task_id, error = %e, "error while handling task failure");
        }
    }

    /// Serve a worker request. `reportQuota` never produces a reply.
    pub async fn handle_request(&mut self, worker_id: WorkerId, request: WorkerRequest) -> Option<RequestOutcome> {
        let op = request.op();
        tracing::debug!(%worker_id, op, "worker request");
        let outcome = match request {
            WorkerRequest::ReportQuota {
                task_id,
                quota_remaining,
                quota_daily_limit,
                quota_timestamp,
            } => {
                self.report_quota(
                    task_id.as_ref(),
                    quota_remaining.as_ref(),
                    quota_daily_limit.as_ref(),
                    quota_timestamp.as_ref(),
                );
                return None;
            }
            WorkerRequest::Enqueue {
                company_id,
                channel_id,
                operation,
                operation_data,
                parent_task_id,
                retry,
            } => {
                self.serve_enqueue(
                    company_id.as_ref(),
                    channel_id.as_ref(),
                    operation,
                    operation_data,
                    parent_task_id.as_ref(),
                    retry.as_ref(),
                )
                .await
            }
            WorkerRequest::GetSubtaskResults { task_id } => parse_int(task_id.as_ref(), "Task ID")
                .map(|id| RequestOutcome::succeeded(serde_json::to_value(self.queue.get_all_children_results(id)).ok())),
            WorkerRequest::HasWipSubtasks { task_id } => parse_int(task_id.as_ref(), "Task ID").map(|id| {
                tracing::debug!(task_id = id, "check if task has at least one child in progress");
                RequestOutcome::succeeded(Some(self.queue.has_task_child_in_progress(id).into()))
            }),
            WorkerRequest::GetTaskStartTime { task_id } => parse_int(task_id.as_ref(), "Task ID").and_then(|id| {
                self.queue
                    .get_task_start_time(id)
                    .map(|at| RequestOutcome::succeeded(Some(at.timestamp_millis().into())))
                    .map_err(|e| e.to_string())
            }),
            WorkerRequest::DropAllCompletedChildren { task_id } => parse_int(task_id.as_ref(), "Task ID")
                .map(|id| RequestOutcome::succeeded(Some(self.queue.drop_all_completed_children(id).into()))),
            WorkerRequest::ClearModifiedFlag { task_id } => match parse_int(task_id.as_ref(), "Task ID") {
                Ok(id) => self
                    .queue
                    .clear_modified_flag(id)
                    .await
                    .map(|()| RequestOutcome::succeeded(None))
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            },
        };
        Some(outcome.unwrap_or_else(|cause| {
            tracing::error!(%worker_id, op, cause = %cause, "unable to perform operation");
            RequestOutcome::failed(cause)
        }))
    }

    fn report_quota(
        &mut self,
        task_id: Option<&serde_json::Value>,
        remaining: Option<&serde_json::Value>,
        daily_limit: Option<&serde_json::Value>,
        timestamp: Option<&serde_json::Value>,
    ) {
        let parsed = parse_int(task_id, "Task ID").and_then(|id| {
            Ok((
                id,
                parse_int(remaining, "quotaRemaining")?,
                parse_int(daily_limit, "quotaDailyLimit")?,
                parse_int(timestamp, "quotaTimestamp")?,
            ))
        });
        match parsed {
            Ok((id, remaining, daily_limit, timestamp)) => {
                self.queue.set_quota(id, daily_limit, remaining, timestamp);
            }
            Err(e) => tracing::info!(error = %e, "quota report ignored"),
        }
    }

    async fn serve_enqueue(
        &mut self,
        company_id: Option<&serde_json::Value>,
        channel_id: Option<&serde_json::Value>,
        operation: Option<serde_json::Value>,
        operation_data: Option<serde_json::Value>,
        parent_task_id: Option<&serde_json::Value>,
        retry: Option<&serde_json::Value>,
    ) -> Result<RequestOutcome, String> {
        let company_id = parse_int(company_id, "Company ID")?;
        let channel_id = parse_int(channel_id, "Channel ID")?;
        if !self.config.accepts_channel(channel_id) {
            return Err(format!("Channel ID is unknown: {channel_id}"));
        }
        let Some(serde_json::Value::String(operation)) = operation else {
            return Err("Operation should be provided.".into());
        };
        let parent = parse_opt_int(parent_task_id, "Parent task ID")?;
        if let Some(parent) = parent {
            if self.queue.get_task_by_id(parent).is_none() {
                return Err(format!("Parent task #{parent} doesn't exist"));
            }
        }
        let retry = parse_opt_int(retry, "Retry count")?.unwrap_or(0);
        let retry = u32::try_from(retry).map_err(|_| format!("Retry count is not a number: {retry}"))?;

        let mut request = EnqueueRequest::new(
            company_id,
            channel_id,
            operation,
            OperationData::from(operation_data.unwrap_or(serde_json::Value::Null)),
        )
        .with_retry(retry);
        request.parent_task_id = parent;
        let ids = self.queue.enqueue(request).await.map_err(|e| e.to_string())?;
        tracing::debug!(?ids, "operation(s) enqueued");
        Ok(RequestOutcome::succeeded(Some(ids.into())))
    }
}
