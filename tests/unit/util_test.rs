//! Tests for utility functions

use std::time::Duration;

use chrono::{TimeZone, Utc};
use quota_scheduler::util::{
    millis, parse_int, parse_opt_int, start_of_next_hour, start_of_second, Clock, ManualClock,
};
use serde_json::json;

#[test]
fn test_start_of_next_hour() {
    let t = Utc.with_ymd_and_hms(2024, 5, 1, 13, 25, 7).unwrap();
    assert_eq!(start_of_next_hour(t), Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap());

    let midnight = Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap();
    assert_eq!(start_of_next_hour(midnight), Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
}

#[test]
fn test_start_of_second() {
    let t = Utc.with_ymd_and_hms(2024, 5, 1, 13, 25, 7).unwrap() + millis(999);
    assert_eq!(start_of_second(t), Utc.with_ymd_and_hms(2024, 5, 1, 13, 25, 7).unwrap());
}

#[test]
fn test_manual_clock_set_and_advance() {
    let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    clock.advance(Duration::from_secs(90));
    assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 30).unwrap());
    clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(clock.now(), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
}

#[test]
fn test_parse_int_messages() {
    assert_eq!(parse_int(Some(&json!("12")), "Task ID"), Ok(12));
    assert_eq!(
        parse_int(Some(&json!("x1")), "Task ID"),
        Err("Task ID is not a number: x1".to_string())
    );
    assert!(parse_int(None, "Task ID").is_err());
    assert_eq!(parse_opt_int(Some(&json!(null)), "Retry count"), Ok(None));
    assert_eq!(parse_opt_int(Some(&json!(3)), "Retry count"), Ok(Some(3)));
}
