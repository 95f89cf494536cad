//! Idle/busy bookkeeping for connected workers.
//!
//! The pool leases workers to the scheduler one at a time. Returning a worker
//! that is not busy is a no-op, so overlapping failure and timeout paths can
//! both return the same worker safely.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{ChannelError, SchedulerError, Task};
use crate::util::WorkerId;

/// Link to one remote worker process.
///
/// Results and requests travel the other way as
/// [`SchedulerEvent`](crate::runtime::SchedulerEvent)s posted by the transport.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    /// Identifier assigned when the worker connected.
    fn id(&self) -> WorkerId;

    /// Run a fresh task.
    async fn start(&self, task: &Task) -> Result<(), ChannelError>;

    /// Continue a resumed task from its suspension point.
    async fn resume(&self, task: &Task) -> Result<(), ChannelError>;

    /// Drop the connection. The transport reports a disconnect afterwards.
    fn terminate(&self);
}

/// Leases connected workers.
#[derive(Default)]
pub struct WorkerPool {
    idle: VecDeque<Arc<dyn WorkerChannel>>,
    busy: HashMap<WorkerId, Arc<dyn WorkerChannel>>,
}

impl WorkerPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected worker as idle.
    pub fn add(&mut self, worker: Arc<dyn WorkerChannel>) {
        tracing::debug!(worker_id = %worker.id(), "worker added to pool");
        self.idle.push_back(worker);
    }

    /// Lease the longest idle worker.
    pub fn borrow(&mut self) -> Result<Arc<dyn WorkerChannel>, SchedulerError> {
        let worker = self.idle.pop_front().ok_or(SchedulerError::NoIdleWorker)?;
        self.busy.insert(worker.id(), Arc::clone(&worker));
        Ok(worker)
    }

    /// Give a leased worker back. Returns `false` if it was not busy.
    pub fn return_worker(&mut self, id: WorkerId) -> bool {
        match self.busy.remove(&id) {
            Some(worker) => {
                self.idle.push_back(worker);
                true
            }
            None => false,
        }
    }

    /// Forget a worker wherever it is. Returns the removed handle.
    pub fn remove(&mut self, id: WorkerId) -> Option<Arc<dyn WorkerChannel>> {
        if let Some(worker) = self.busy.remove(&id) {
            return Some(worker);
        }
        let pos = self.idle.iter().position(|w| w.id() == id)?;
        self.idle.remove(pos)
    }

    /// Handle of a known worker.
    pub fn get(&self, id: WorkerId) -> Option<Arc<dyn WorkerChannel>> {
        self.busy
            .get(&id)
            .cloned()
            .or_else(|| self.idle.iter().find(|w| w.id() == id).cloned())
    }

    /// Whether `id` is currently leased.
    pub fn is_busy(&self, id: WorkerId) -> bool {
        self.busy.contains_key(&id)
    }

    /// Number of idle workers.
    pub fn num_idle(&self) -> usize {
        self.idle.len()
    }

    /// Number of leased workers.
    pub fn num_busy(&self) -> usize {
        self.busy.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::new_worker_id;

    struct NullChannel(WorkerId);

    #[async_trait]
    impl WorkerChannel for NullChannel {
        fn id(&self) -> WorkerId {
            self.0
        }
        async fn start(&self, _task: &Task) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn resume(&self, _task: &Task) -> Result<(), ChannelError> {
            Ok(())
        }
        fn terminate(&self) {}
    }

    fn worker() -> Arc<dyn WorkerChannel> {
        Arc::new(NullChannel(new_worker_id()))
    }

    #[test]
    fn test_borrow_and_return() {
        let mut pool = WorkerPool::new();
        pool.add(worker());
        let w = pool.borrow().unwrap();
        assert_eq!((pool.num_idle(), pool.num_busy()), (0, 1));
        assert!(matches!(pool.borrow(), Err(SchedulerError::NoIdleWorker)));
        assert!(pool.return_worker(w.id()));
        assert_eq!((pool.num_idle(), pool.num_busy()), (1, 0));
    }

    #[test]
    fn test_double_return_is_noop() {
        let mut pool = WorkerPool::new();
        pool.add(worker());
        let w = pool.borrow().unwrap();
        assert!(pool.return_worker(w.id()));
        assert!(!pool.return_worker(w.id()));
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_remove_from_either_set() {
        let mut pool = WorkerPool::new();
        let a = worker();
        let b = worker();
        pool.add(Arc::clone(&a));
        pool.add(Arc::clone(&b));
        let leased = pool.borrow().unwrap();
        assert_eq!(leased.id(), a.id());
        assert!(pool.remove(a.id()).is_some());
        assert!(pool.remove(b.id()).is_some());
        assert!(pool.remove(b.id()).is_none());
        assert_eq!((pool.num_idle(), pool.num_busy()), (0, 0));
    }
}
