//! Builder wiring a [`Scheduler`] from configuration and backends.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::config::ManagerConfig;
use crate::core::{AppResult, AuditSink, Scheduler, SchedulerError, TaskQueue, TaskStore};
use crate::infra::{InMemoryTaskStore, JsonlTaskStore};
use crate::util::{Clock, SystemClock};

/// Assembles a scheduler. Unset backends default to an in-memory store and
/// the system clock.
pub struct SchedulerBuilder {
    config: ManagerConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl SchedulerBuilder {
    /// Start from `config`.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            audit: None,
        }
    }

    /// Start from defaults overridden by `MANAGER_*` environment variables.
    pub fn from_env() -> AppResult<Self> {
        let config = ManagerConfig::from_env()
            .map_err(anyhow::Error::msg)
            .context("loading manager config from environment")?;
        Ok(Self::new(config))
    }

    /// Persist tasks in `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist tasks in `dir/{stream}.jsonl`.
    pub fn with_file_store(self, dir: impl AsRef<Path>, stream: &str) -> Result<Self, SchedulerError> {
        let store = JsonlTaskStore::open_with_clock(dir, stream, self.clock())?;
        Ok(self.with_store(Arc::new(store)))
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Record lifecycle changes in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>)
    }

    /// Validate the configuration and build the scheduler.
    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        self.config
            .validate()
            .map_err(SchedulerError::Config)?;
        let clock = self.clock();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::with_clock(Arc::clone(&clock))) as Arc<dyn TaskStore>);
        let mut queue = TaskQueue::new(&self.config, store, clock);
        if let Some(audit) = self.audit {
            queue = queue.with_audit(audit);
        }
        Ok(Scheduler::new(self.config, queue))
    }
}
