//! Tests for configuration validation

use quota_scheduler::config::ManagerConfig;

#[test]
fn test_default_config_is_valid() {
    let config = ManagerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.daily_quota_reserve, 20);
    assert_eq!(config.task_execution_timeout_ms, 300_000);
    assert_eq!(config.task_suspension_timeout_ms, 10_800_000);
    assert_eq!(config.root_operation, "syncShop");
}

#[test]
fn test_reserve_above_hundred_is_rejected() {
    let config = ManagerConfig {
        daily_quota_reserve: 101,
        ..ManagerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_rate_is_rejected() {
    let config = ManagerConfig {
        rate_limit_per_second: 0,
        ..ManagerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_timeouts_are_rejected() {
    for config in [
        ManagerConfig {
            check_interval_ms: 0,
            ..ManagerConfig::default()
        },
        ManagerConfig {
            task_execution_timeout_ms: 0,
            ..ManagerConfig::default()
        },
        ManagerConfig {
            task_suspension_timeout_ms: 0,
            ..ManagerConfig::default()
        },
    ] {
        assert!(config.validate().is_err());
    }
}

#[test]
fn test_config_from_partial_json() {
    let json = r#"{
        "daily_quota_reserve": 30,
        "rate_limit_per_second": 2,
        "known_channels": [1, 4]
    }"#;

    let config = ManagerConfig::from_json_str(json).unwrap();
    assert_eq!(config.daily_quota_reserve, 30);
    assert_eq!(config.rate_limit_per_second, 2);
    assert_eq!(config.max_retry_count, 1);
    assert!(config.accepts_channel(4));
    assert!(!config.accepts_channel(2));
}

#[test]
fn test_config_from_invalid_json() {
    assert!(ManagerConfig::from_json_str("{ not json").is_err());
    assert!(ManagerConfig::from_json_str(r#"{"rate_limit_per_second": 0}"#).is_err());
}

#[test]
fn test_config_from_vars() {
    let vars = [
        ("MANAGER_DAILY_QUOTA_RESERVE", "15"),
        ("MANAGER_CHECK_INTERVAL_MS", " 250 "),
        ("MANAGER_ROOT_OPERATION", "syncStore"),
        ("MANAGER_KNOWN_CHANNELS", "1, 2,,3"),
        ("UNRELATED", "x"),
    ];
    let config = ManagerConfig::from_vars(vars).unwrap();
    assert_eq!(config.daily_quota_reserve, 15);
    assert_eq!(config.check_interval().as_millis(), 250);
    assert_eq!(config.root_operation, "syncStore");
    assert_eq!(config.known_channels, vec![1, 2, 3]);
}

#[test]
fn test_config_from_vars_rejects_garbage() {
    let err = ManagerConfig::from_vars([("MANAGER_MAX_RETRY_COUNT", "many")]).unwrap_err();
    assert!(err.starts_with("MANAGER_MAX_RETRY_COUNT"));
}

#[test]
fn test_empty_channel_list_accepts_any() {
    assert!(ManagerConfig::default().accepts_channel(12345));
}
