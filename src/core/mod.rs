//! Task lifecycle, quota accounting and scheduling.

pub mod audit;
pub mod error;
pub mod queue;
pub mod quota;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod task_queue;
pub mod worker_pool;

pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use error::{AppResult, ChannelError, SchedulerError, StoreError};
pub use queue::{Queue, QueueSummary, INITIAL_QUOTA};
pub use quota::{QuotaLimit, QuotaReserve};
pub use scheduler::Scheduler;
pub use store::{settle, NewTaskRow, StateUpdate, StoreSession, TaskRow, TaskStore};
pub use task::{ChildResult, EnqueueRequest, OperationData, Task, TaskState};
pub use task_queue::TaskQueue;
pub use worker_pool::{WorkerChannel, WorkerPool};
