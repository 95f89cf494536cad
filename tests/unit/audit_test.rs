//! Tests for audit sink

use chrono::{TimeZone, Utc};
use quota_scheduler::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink, TracingAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let event = build_audit_event(1, "2_1_", AuditAction::Enqueue, at, Some("payload".to_string()));
    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0], event);
    assert_eq!(events[0].task_id, 1);
    assert_eq!(events[0].action, AuditAction::Enqueue);
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);
    let at = Utc::now();

    sink.record(build_audit_event(1, "q", AuditAction::Enqueue, at, None));
    sink.record(build_audit_event(2, "q", AuditAction::Enqueue, at, None));
    sink.record(build_audit_event(3, "q", AuditAction::Enqueue, at, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].task_id, 2); // First one popped
    assert_eq!(events[1].task_id, 3);
}

#[test]
fn test_events_for_task() {
    let sink = InMemoryAuditSink::new(10);
    let at = Utc::now();
    sink.record(build_audit_event(1, "q", AuditAction::Start, at, None));
    sink.record(build_audit_event(2, "q", AuditAction::Start, at, None));
    sink.record(build_audit_event(1, "q", AuditAction::Complete, at, Some("ok".into())));

    let actions: Vec<_> = sink.events_for(1).into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::Start, AuditAction::Complete]);
}

#[test]
fn test_build_audit_event() {
    let at = Utc::now();
    let event = build_audit_event(5, "2_1_shop", AuditAction::Purge, at, Some("result".to_string()));

    assert_eq!(event.task_id, 5);
    assert_eq!(event.queue_id, "2_1_shop");
    assert_eq!(event.action, AuditAction::Purge);
    assert_eq!(event.payload, Some("result".to_string()));
    assert_eq!(event.created_at, at);
    assert_ne!(event.event_id, build_audit_event(5, "q", AuditAction::Purge, at, None).event_id);
}

#[test]
fn test_audit_event_serializes_camel_case() {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let value = serde_json::to_value(build_audit_event(1, "q", AuditAction::Retry, at, None)).unwrap();
    assert_eq!(value["action"], "retry");
    assert_eq!(value["queueId"], "q");
    assert!(value.get("eventId").is_some());
}

#[test]
fn test_tracing_sink_accepts_events() {
    TracingAuditSink.record(build_audit_event(1, "q", AuditAction::Abort, Utc::now(), None));
}
