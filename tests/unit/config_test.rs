//! Tests for configuration validation

use prometheus_task_pool::config::{AutoScaleConfig, PoolConfig, UnitConfig};

#[test]
fn test_pool_config_validation() {
    let valid = PoolConfig::new().with_size(4).with_name("workers");
    assert!(valid.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_size() {
    let invalid = PoolConfig::new().with_size(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_name() {
    let invalid = PoolConfig::new().with_name("  ");
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_event_capacity() {
    let invalid = PoolConfig::new().with_event_capacity(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_autoscale_config_validation() {
    assert!(AutoScaleConfig::new().with_bounds(1, 1).validate().is_ok());
    assert!(AutoScaleConfig::new().with_bounds(3, 2).validate().is_err());
    assert!(AutoScaleConfig::new().with_check_interval_ms(0).validate().is_err());
}

#[test]
fn test_pool_config_from_json() {
    let json = r#"{
        "size": 2,
        "name": "encoder",
        "respawn_backoff_ms": 10,
        "shutdown_timeout_ms": 500
    }"#;

    let config = PoolConfig::from_json_str(json).unwrap();
    assert_eq!(config.size, 2);
    assert_eq!(config.unit.name, "encoder");
    assert_eq!(config.unit.respawn_backoff_ms, 10);
    assert_eq!(config.unit.shutdown_timeout_ms, 500);
}

#[test]
fn test_autoscale_config_from_json() {
    let json = r#"{ "min": 1, "max": 6, "idle_timeout_ms": 1000 }"#;
    let config = AutoScaleConfig::from_json_str(json).unwrap();
    assert_eq!((config.min, config.max), (1, 6));
    assert_eq!(config.idle_timeout_ms, 1000);
    assert_eq!(config.unit, UnitConfig::default());
}

#[test]
fn test_invalid_json_rejected() {
    assert!(PoolConfig::from_json_str(r#"{ "size": 0 }"#).is_err());
    assert!(AutoScaleConfig::from_json_str("not json").is_err());
}
