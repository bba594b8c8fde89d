//! Serializable identifiers and priority classes shared across pools.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task identifier, unique within one pool's lifetime.
pub type TaskId = u64;

/// Execution unit identifier, unique within one pool's lifetime.
pub type UnitId = u64;

/// Priority class of a submitted task.
///
/// Dispatch is strict across classes (`High` before `Normal` before `Low`) and
/// FIFO within a class. Unknown names deserialize as `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Priority {
    /// Lowest priority, serviced only when no other work is pending.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Highest priority.
    High,
}

impl Priority {
    /// All classes in dispatch order.
    pub const DISPATCH_ORDER: [Self; 3] = [Self::High, Self::Normal, Self::Low];

    /// Parse a priority name, normalizing anything unrecognized to `Normal`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }

    /// Lowercase name of this class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Bucket index used by the in-memory priority buckets.
    pub(crate) const fn bucket(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Priority {
    fn from(value: String) -> Self {
        Self::from_name(&value)
    }
}

impl From<&str> for Priority {
    fn from(value: &str) -> Self {
        Self::from_name(value)
    }
}

impl From<Priority> for String {
    fn from(value: Priority) -> Self {
        value.as_str().to_string()
    }
}
