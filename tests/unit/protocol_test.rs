//! Tests for the worker wire protocol

use quota_scheduler::runtime::{
    RequestOutcome, RequestResult, RequestsReport, TaskOutcome, TaskReport, WorkerRequest,
};
use serde_json::json;

#[test]
fn test_result_with_quota_snapshot() {
    let report: TaskReport = serde_json::from_value(json!({
        "taskId": 12,
        "result": "succeeded",
        "data": { "orders": 3 },
        "requests": { "quotaRemaining": 10, "quotaDailyLimit": 100, "quotaTimestamp": 1700 }
    }))
    .unwrap();
    assert_eq!(report.outcome(), Ok(TaskOutcome::Succeeded));
    assert_eq!(report.data_text().as_deref(), Some(r#"{"orders":3}"#));
    assert_eq!(
        report.requests,
        Some(RequestsReport::Quota {
            quota_remaining: 10,
            quota_daily_limit: 100,
            quota_timestamp: 1700,
        })
    );
    assert!(!report.do_not_retry);
}

#[test]
fn test_result_with_requests_made() {
    let report: TaskReport = serde_json::from_value(json!({
        "taskId": 12,
        "result": "failed",
        "data": "boom",
        "requests": { "requestsMade": 4 },
        "doNotRetry": true
    }))
    .unwrap();
    assert_eq!(report.outcome(), Ok(TaskOutcome::Failed));
    assert_eq!(report.data_text().as_deref(), Some("boom"));
    assert_eq!(report.requests, Some(RequestsReport::Consumed { requests_made: 4 }));
    assert!(report.do_not_retry);
}

#[test]
fn test_unknown_result_code_still_parses() {
    let report: TaskReport = serde_json::from_value(json!({ "taskId": 1, "result": "exploded" })).unwrap();
    assert!(report.outcome().is_err());
    assert_eq!(report.data_text(), None);
}

#[test]
fn test_report_builder_serializes_camel_case() {
    let report = TaskReport::new(3, TaskOutcome::Suspended).with_data("page-2").no_retry();
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(
        value,
        json!({ "taskId": 3, "result": "suspended", "data": "page-2", "doNotRetry": true })
    );
}

#[test]
fn test_worker_request_tagged_by_op() {
    let request: WorkerRequest = serde_json::from_value(json!({
        "op": "enqueue",
        "companyId": "2",
        "channelId": 1,
        "operation": "syncOrders",
        "operationData": ["a", "b"],
        "parentTaskId": 9
    }))
    .unwrap();
    assert_eq!(request.op(), "enqueue");
    match request {
        WorkerRequest::Enqueue {
            company_id,
            parent_task_id,
            retry,
            ..
        } => {
            assert_eq!(company_id, Some(json!("2")));
            assert_eq!(parent_task_id, Some(json!(9)));
            assert_eq!(retry, None);
        }
        other => panic!("unexpected request: {other:?}"),
    }
}

#[test]
fn test_request_for_task() {
    let request = WorkerRequest::for_task("hasWipSubtasks", 5).unwrap();
    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({ "op": "hasWipSubtasks", "taskId": 5 })
    );
    assert!(WorkerRequest::for_task("reportQuota", 5).is_none());
    assert!(WorkerRequest::for_task("enqueue", 5).is_none());
}

#[test]
fn test_request_outcome_shape() {
    let ok = RequestOutcome::succeeded(Some(json!([1, 2])));
    assert!(ok.is_success());
    assert_eq!(serde_json::to_value(&ok).unwrap(), json!({ "result": "succeeded", "data": [1, 2] }));

    let failed = RequestOutcome::failed("Operation should be provided.");
    assert_eq!(failed.result, RequestResult::Failed);
    assert_eq!(
        serde_json::to_value(&failed).unwrap(),
        json!({ "result": "failed", "cause": "Operation should be provided." })
    );
}

#[test]
fn test_outcome_display_round_trips_wire_names() {
    for outcome in [
        TaskOutcome::Succeeded,
        TaskOutcome::Failed,
        TaskOutcome::Suspended,
        TaskOutcome::Aborted,
    ] {
        assert_eq!(outcome.to_string().parse::<TaskOutcome>(), Ok(outcome));
    }
}
