//! Tests for utility functions

use prometheus_task_pool::util::serde::{Priority, TaskId};

#[test]
fn test_priority_ordering() {
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::DISPATCH_ORDER, [Priority::High, Priority::Normal, Priority::Low]);
}

#[test]
fn test_priority_names() {
    assert_eq!(Priority::from("HIGH"), Priority::High);
    assert_eq!(Priority::from("whenever"), Priority::Normal);
    assert_eq!(Priority::Low.to_string(), "low");
}

#[test]
fn test_task_id() {
    let id: TaskId = 12345;
    assert_eq!(id, 12345);
}
