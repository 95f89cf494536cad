//! Tests for tokio spawner utilities and the scheduler handle

use quota_scheduler::builders::SchedulerBuilder;
use quota_scheduler::config::ManagerConfig;
use quota_scheduler::core::SchedulerError;
use quota_scheduler::runtime::{Spawn, TokioSpawner};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_tokio_spawner_try_current_outside_runtime() {
    assert!(TokioSpawner::try_current().is_none());
}

#[tokio::test]
async fn test_handle_admin_queries() {
    let scheduler = SchedulerBuilder::new(ManagerConfig::default()).build().unwrap();
    let handle = scheduler.spawn(&TokioSpawner::current());

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.task_count, 0);
    assert_eq!(handle.workers().await.unwrap().idle, 0);
    assert!(handle.queues().await.unwrap().is_empty());
    assert!(handle.exhausted_queues().await.unwrap().is_empty());
    assert!(matches!(
        handle.queue("2_1_").await,
        Err(SchedulerError::QueueNotFound(_))
    ));

    assert_eq!(handle.reserved_quota("2_1_").await.unwrap().reserved_quota_as_percentage, 20);
    let reserve = handle.set_reserved_quota("2_1_", 5, Some(60_000)).await.unwrap();
    assert_eq!(reserve.reserved_quota_as_percentage, 5);
    assert!(reserve.timeout.is_some());
    assert_eq!(handle.reserved_quota("2_1_").await.unwrap().reserved_quota_as_percentage, 5);
    assert!(handle.set_reserved_quota("2_1_", 101, None).await.is_err());

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn test_handle_reports_closed_loop() {
    let scheduler = SchedulerBuilder::new(ManagerConfig::default()).build().unwrap();
    let handle = scheduler.handle();
    drop(scheduler);
    assert!(handle.is_closed());
    assert!(handle.stats().await.is_err());
}
