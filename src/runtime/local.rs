//! In-process worker transport.
//!
//! A [`LocalWorker`] runs inside the scheduler's process and talks to it over
//! tokio channels. It is used by embedded deployments and by tests; remote
//! transports implement [`WorkerChannel`] the same way.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{ChannelError, Task, WorkerChannel};
use crate::runtime::protocol::{RequestOutcome, TaskReport, WorkerRequest};
use crate::runtime::SchedulerHandle;
use crate::util::{new_worker_id, WorkerId};

/// Command sent from the scheduler to a local worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Run a fresh task.
    Start(Task),
    /// Continue a resumed task.
    Resume(Task),
    /// Stop.
    Terminate,
}

/// Scheduler side of a local worker.
pub struct LocalWorkerChannel {
    id: WorkerId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    handle: SchedulerHandle,
    terminated: AtomicBool,
}

impl LocalWorkerChannel {
    fn dispatch(&self, command: WorkerCommand) -> Result<(), ChannelError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.commands.send(command).map_err(|_| ChannelError::Closed)
    }

    /// Whether [`WorkerChannel::terminate`] was called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WorkerChannel for LocalWorkerChannel {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn start(&self, task: &Task) -> Result<(), ChannelError> {
        self.dispatch(WorkerCommand::Start(task.clone()))
    }

    async fn resume(&self, task: &Task) -> Result<(), ChannelError> {
        self.dispatch(WorkerCommand::Resume(task.clone()))
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(worker_id = %self.id, "terminating worker");
        let _ = self.commands.send(WorkerCommand::Terminate);
        if let Err(e) = self.handle.report_disconnect(self.id, "terminated") {
            tracing::debug!(worker_id = %self.id, error = %e, "scheduler gone");
        }
    }
}

/// Worker side of a local worker.
pub struct LocalWorker {
    channel: Arc<LocalWorkerChannel>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
}

impl LocalWorker {
    /// Create a worker and register it with the scheduler.
    pub fn connect(handle: &SchedulerHandle) -> Result<Self, ChannelError> {
        let (tx, commands) = mpsc::unbounded_channel();
        let channel = Arc::new(LocalWorkerChannel {
            id: new_worker_id(),
            commands: tx,
            handle: handle.clone(),
            terminated: AtomicBool::new(false),
        });
        handle.connect(Arc::clone(&channel) as Arc<dyn WorkerChannel>)?;
        Ok(Self { channel, commands })
    }

    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.channel.id
    }

    /// Handle to the scheduler this worker belongs to.
    pub fn handle(&self) -> &SchedulerHandle {
        &self.channel.handle
    }

    /// Wait for the next command.
    pub async fn next_command(&mut self) -> Option<WorkerCommand> {
        self.commands.recv().await
    }

    /// Report the result of the current task.
    pub fn report(&self, report: TaskReport) -> Result<(), ChannelError> {
        self.channel.handle.report_result(self.id(), report)
    }

    /// Ask the scheduler something on behalf of the current task.
    pub async fn request(&self, request: WorkerRequest) -> Result<Option<RequestOutcome>, ChannelError> {
        self.channel.handle.request(self.id(), request).await
    }

    /// Serve commands with `handler` until terminated.
    ///
    /// `handler` gets the task and whether it is a resume. A worker that
    /// stops on its own reports a disconnect.
    pub async fn run<F, Fut>(mut self, mut handler: F)
    where
        F: FnMut(Task, bool) -> Fut,
        Fut: Future<Output = TaskReport>,
    {
        while let Some(command) = self.next_command().await {
            let (task, resume) = match command {
                WorkerCommand::Start(task) => (task, false),
                WorkerCommand::Resume(task) => (task, true),
                WorkerCommand::Terminate => break,
            };
            let report = handler(task, resume).await;
            if let Err(e) = self.report(report) {
                tracing::warn!(worker_id = %self.id(), error = %e, "unable to report result");
                break;
            }
        }
        if !self.channel.is_terminated() {
            let _ = self.channel.handle.report_disconnect(self.id(), "worker stopped");
        }
        tracing::debug!(worker_id = %self.id(), "local worker stopped");
    }
}
