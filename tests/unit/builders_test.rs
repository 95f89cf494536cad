//! Tests for builder modules

use std::sync::Arc;

use quota_scheduler::builders::SchedulerBuilder;
use quota_scheduler::config::ManagerConfig;
use quota_scheduler::core::{EnqueueRequest, InMemoryAuditSink, SchedulerError};
use quota_scheduler::infra::InMemoryTaskStore;

#[test]
fn test_scheduler_builder_defaults() {
    let scheduler = SchedulerBuilder::new(ManagerConfig::default()).build().unwrap();
    assert_eq!(scheduler.config().rate_limit_per_second, 1);
    assert_eq!(scheduler.pool().num_idle(), 0);
    assert!(!scheduler.task_queue().is_initialized());
}

#[test]
fn test_scheduler_builder_rejects_invalid_config() {
    let config = ManagerConfig {
        rate_limit_per_second: 0,
        ..ManagerConfig::default()
    };
    let err = SchedulerBuilder::new(config).build().err().unwrap();
    assert!(matches!(err, SchedulerError::Config(_)));
}

#[tokio::test]
async fn test_scheduler_builder_wires_store_and_audit() {
    let store = InMemoryTaskStore::new();
    let audit = InMemoryAuditSink::new(10);
    let mut scheduler = SchedulerBuilder::new(ManagerConfig::default())
        .with_store(Arc::new(store.clone()))
        .with_audit(Arc::new(audit.clone()))
        .build()
        .unwrap();

    let ids = scheduler
        .task_queue_mut()
        .enqueue(EnqueueRequest::new(2, 1, "foo", "1"))
        .await
        .unwrap();
    assert_eq!(store.rows().len(), 1);
    assert_eq!(audit.events_for(ids[0]).len(), 1);
}

#[tokio::test]
async fn test_scheduler_builder_with_file_store() {
    let dir = std::env::temp_dir().join(format!("quota-scheduler-builder-{}", uuid::Uuid::new_v4()));
    let mut scheduler = SchedulerBuilder::new(ManagerConfig::default())
        .with_file_store(&dir, "tasks")
        .unwrap()
        .build()
        .unwrap();
    scheduler
        .task_queue_mut()
        .enqueue(EnqueueRequest::new(2, 1, "foo", "1"))
        .await
        .unwrap();
    assert!(dir.join("tasks.jsonl").exists());
    let _ = std::fs::remove_dir_all(&dir);
}
