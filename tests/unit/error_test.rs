//! Tests for error types

use prometheus_task_pool::core::PoolError;

#[test]
fn test_invalid_work_error() {
    let err = PoolError::InvalidWork("resize".to_string());
    assert_eq!(format!("{err}"), "invalid work: `resize` is not a registered function");
}

#[test]
fn test_abort_errors() {
    assert_eq!(format!("{}", PoolError::QueueAborted), "task aborted from queue");
    assert_eq!(format!("{}", PoolError::RunAborted), "task aborted while running");
    assert_eq!(format!("{}", PoolError::AbortedBeforeStart), "task aborted before start");
}

#[test]
fn test_unit_errors() {
    let err = PoolError::UnitInit {
        unit_id: 2,
        reason: "module failed".to_string(),
    };
    assert_eq!(format!("{err}"), "execution unit 2 failed to initialize: module failed");
    assert!(!err.is_abort());
}

#[test]
fn test_lifecycle_errors() {
    assert_eq!(format!("{}", PoolError::Destroyed), "thread destroyed");
    assert_eq!(
        format!("{}", PoolError::InvalidConfig("size must be greater than 0".into())),
        "invalid configuration: size must be greater than 0"
    );
}
