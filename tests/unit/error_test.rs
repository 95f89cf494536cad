//! Tests for error types

use quota_scheduler::core::{ChannelError, SchedulerError, StoreError, TaskState};

#[test]
fn test_task_not_found_error() {
    let err = SchedulerError::TaskNotFound(7);
    assert_eq!(format!("{}", err), "task not found: 7");
    assert!(err.is_not_found());
}

#[test]
fn test_invalid_transition_error() {
    let err = SchedulerError::InvalidTransition {
        id: 3,
        from: TaskState::Unset,
        to: TaskState::Suspended,
    };
    assert_eq!(format!("{}", err), "task 3 cannot move from unset to suspended");
    assert!(!err.is_not_found());
}

#[test]
fn test_no_idle_worker_error() {
    let err = SchedulerError::NoIdleWorker;
    assert_eq!(format!("{}", err), "no idle worker available");
}

#[test]
fn test_store_error_conversion() {
    let err: SchedulerError = StoreError::RowNotFound(9).into();
    assert_eq!(format!("{}", err), "store error: row not found: 9");
}

#[test]
fn test_channel_error_conversion() {
    let err: SchedulerError = ChannelError::Send("full".into()).into();
    assert_eq!(format!("{}", err), "worker channel error: send failed: full");
}

#[test]
fn test_serialization_error_conversion() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err = StoreError::from(json_err);
    assert!(format!("{}", err).starts_with("serialization error:"));
}
