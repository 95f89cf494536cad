//! # Quota Scheduler
//!
//! A quota- and rate-limit-aware task scheduler that distributes hierarchical
//! tasks over a pool of remote workers.
//!
//! Tasks belong to per-tenant queues. Each queue tracks the remaining daily
//! quota of the upstream API its tasks call, and the scheduler stops picking
//! from a queue once that quota drops to a configurable reserve. Tasks may
//! spawn children, suspend until every child finished, and be retried under a
//! new persisted identity.
//!
//! ## Components
//!
//! - [`core::TaskQueue`]: in-memory engine over a persistent [`core::TaskStore`].
//!   Owns queues, the task index, the children index and quota state.
//! - [`core::Scheduler`]: periodic loop that cancels timed out tasks, leases
//!   idle workers and routes worker results back into the engine.
//! - [`core::WorkerPool`]: idle/busy bookkeeping for connected workers.
//! - [`core::QuotaLimit`]: reserve percentage with per-queue overrides.
//!
//! ```rust,ignore
//! use quota_scheduler::builders::SchedulerBuilder;
//! use quota_scheduler::config::ManagerConfig;
//! use quota_scheduler::runtime::{LocalWorker, TaskOutcome, TaskReport, TokioSpawner};
//!
//! let scheduler = SchedulerBuilder::new(ManagerConfig::default()).build()?;
//! let handle = scheduler.spawn(&TokioSpawner::current());
//!
//! let worker = LocalWorker::connect(&handle)?;
//! tokio::spawn(worker.run(|task, _resume| async move {
//!     TaskReport::new(task.id, TaskOutcome::Succeeded)
//! }));
//! ```

/// Task lifecycle, quota accounting and scheduling.
pub mod core;
/// Configuration of the scheduler and its engine.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// Task store backends.
pub mod infra;
/// Worker transport, scheduler handle and admin API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
