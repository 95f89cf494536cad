//! Worker transport, scheduler handle and admin API surface.

pub mod api;
pub mod handle;
pub mod local;
pub mod protocol;
pub mod tokio_spawner;

pub use api::{Health, PoolCounts, Stats, WorkerCounts};
pub use handle::{AdminQuery, SchedulerEvent, SchedulerHandle};
pub use local::{LocalWorker, LocalWorkerChannel, WorkerCommand};
pub use protocol::{RequestOutcome, RequestResult, RequestsReport, TaskOutcome, TaskReport, WorkerRequest};
pub use tokio_spawner::{Spawn, TokioSpawner};
