//! Client interface of the scheduler loop.
//!
//! Everything reaching the scheduler (worker connections, results, requests,
//! admin queries) travels as a [`SchedulerEvent`] over one channel, so the loop
//! handles them strictly one at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::core::{ChannelError, Queue, QueueSummary, QuotaReserve, SchedulerError, WorkerChannel};
use crate::runtime::api::{Health, Stats, WorkerCounts};
use crate::runtime::protocol::{RequestOutcome, TaskReport, WorkerRequest};
use crate::util::WorkerId;

/// Admin query with its reply slot.
#[derive(Debug)]
pub enum AdminQuery {
    /// Scheduler statistics.
    Stats(oneshot::Sender<Stats>),
    /// Worker counts.
    Workers(oneshot::Sender<WorkerCounts>),
    /// All queues.
    Queues(oneshot::Sender<Vec<QueueSummary>>),
    /// Exhausted queues.
    ExhaustedQueues(oneshot::Sender<Vec<QueueSummary>>),
    /// One queue.
    Queue {
        /// Queue key.
        id: String,
        /// Reply.
        reply: oneshot::Sender<Result<Queue, SchedulerError>>,
    },
    /// Reserve of one queue.
    ReservedQuota {
        /// Queue key.
        id: String,
        /// Reply.
        reply: oneshot::Sender<QuotaReserve>,
    },
    /// Override the reserve of one queue.
    SetReservedQuota {
        /// Queue key.
        id: String,
        /// Reserve in percent.
        percentage: u32,
        /// Override lifetime.
        timeout_ms: Option<u64>,
        /// Reply.
        reply: oneshot::Sender<Result<QuotaReserve, SchedulerError>>,
    },
    /// Health check.
    Health(oneshot::Sender<Health>),
}

/// Input of the scheduler loop.
pub enum SchedulerEvent {
    /// A worker connected.
    Connected(Arc<dyn WorkerChannel>),
    /// A worker reported the result of its task.
    Result {
        /// Reporting worker.
        worker_id: WorkerId,
        /// Result.
        report: TaskReport,
    },
    /// A worker's connection is gone.
    Disconnected {
        /// Gone worker.
        worker_id: WorkerId,
        /// Transport cause.
        cause: String,
    },
    /// A worker request; `reply` is `None` for fire-and-forget notifications.
    Request {
        /// Requesting worker.
        worker_id: WorkerId,
        /// Request.
        request: WorkerRequest,
        /// Reply slot.
        reply: Option<oneshot::Sender<RequestOutcome>>,
    },
    /// Admin query.
    Admin(AdminQuery),
    /// Stop the loop.
    Shutdown,
}

impl std::fmt::Debug for SchedulerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(worker) => f.debug_tuple("Connected").field(&worker.id()).finish(),
            Self::Result { worker_id, report } => f
                .debug_struct("Result")
                .field("worker_id", worker_id)
                .field("report", report)
                .finish(),
            Self::Disconnected { worker_id, cause } => f
                .debug_struct("Disconnected")
                .field("worker_id", worker_id)
                .field("cause", cause)
                .finish(),
            Self::Request {
                worker_id, request, ..
            } => f
                .debug_struct("Request")
                .field("worker_id", worker_id)
                .field("request", request)
                .finish(),
            Self::Admin(query) => f.debug_tuple("Admin").field(query).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable sender side of the scheduler loop.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: SchedulerEvent) -> Result<(), ChannelError> {
        self.tx.send(event).map_err(|_| ChannelError::Closed)
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> AdminQuery) -> Result<T, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerEvent::Admin(build(reply)))?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Whether the loop is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Register a connected worker.
    pub fn connect(&self, worker: Arc<dyn WorkerChannel>) -> Result<(), ChannelError> {
        tracing::debug!(worker_id = %worker.id(), "connect worker");
        self.send(SchedulerEvent::Connected(worker))
    }

    /// Deliver a task result.
    pub fn report_result(&self, worker_id: WorkerId, report: TaskReport) -> Result<(), ChannelError> {
        self.send(SchedulerEvent::Result { worker_id, report })
    }

    /// Report a lost worker.
    pub fn report_disconnect(&self, worker_id: WorkerId, cause: impl Into<String>) -> Result<(), ChannelError> {
        self.send(SchedulerEvent::Disconnected {
            worker_id,
            cause: cause.into(),
        })
    }

    /// Send a request and wait for its reply. `reportQuota` yields `None`.
    pub async fn request(
        &self,
        worker_id: WorkerId,
        request: WorkerRequest,
    ) -> Result<Option<RequestOutcome>, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerEvent::Request {
            worker_id,
            request,
            reply: Some(reply),
        })?;
        Ok(rx.await.ok())
    }

    /// Send a request without waiting for a reply.
    pub fn notify(&self, worker_id: WorkerId, request: WorkerRequest) -> Result<(), ChannelError> {
        self.send(SchedulerEvent::Request {
            worker_id,
            request,
            reply: None,
        })
    }

    /// Scheduler statistics.
    pub async fn stats(&self) -> Result<Stats, ChannelError> {
        self.ask(AdminQuery::Stats).await
    }

    /// Worker counts.
    pub async fn workers(&self) -> Result<WorkerCounts, ChannelError> {
        self.ask(AdminQuery::Workers).await
    }

    /// All queues.
    pub async fn queues(&self) -> Result<Vec<QueueSummary>, ChannelError> {
        self.ask(AdminQuery::Queues).await
    }

    /// Exhausted queues.
    pub async fn exhausted_queues(&self) -> Result<Vec<QueueSummary>, ChannelError> {
        self.ask(AdminQuery::ExhaustedQueues).await
    }

    /// One queue.
    pub async fn queue(&self, id: impl Into<String>) -> Result<Queue, SchedulerError> {
        let id = id.into();
        self.ask(|reply| AdminQuery::Queue { id, reply }).await?
    }

    /// Reserve of one queue.
    pub async fn reserved_quota(&self, id: impl Into<String>) -> Result<QuotaReserve, ChannelError> {
        let id = id.into();
        self.ask(|reply| AdminQuery::ReservedQuota { id, reply }).await
    }

    /// Override the reserve of one queue.
    pub async fn set_reserved_quota(
        &self,
        id: impl Into<String>,
        percentage: u32,
        timeout_ms: Option<u64>,
    ) -> Result<QuotaReserve, SchedulerError> {
        let id = id.into();
        self.ask(|reply| AdminQuery::SetReservedQuota {
            id,
            percentage,
            timeout_ms,
            reply,
        })
        .await?
    }

    /// Health check.
    pub async fn health(&self) -> Result<Health, ChannelError> {
        self.ask(AdminQuery::Health).await
    }

    /// Stop the loop after the events already queued.
    pub fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("scheduler shutdown requested");
        self.send(SchedulerEvent::Shutdown)
    }
}
