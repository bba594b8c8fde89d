//! Error types for pool and task operations.

use thiserror::Error;

use crate::util::serde::{TaskId, UnitId};

/// Errors a task handle or pool operation can settle with.
///
/// Every submitted task settles exactly once, either with its result or with
/// exactly one of these variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The submitted work name is not registered.
    #[error("invalid work: `{0}` is not a registered function")]
    InvalidWork(String),
    /// The abort token fired while the task was still queued.
    #[error("task aborted from queue")]
    QueueAborted,
    /// The abort token fired while the task was executing.
    #[error("task aborted while running")]
    RunAborted,
    /// A one-shot run was aborted before its unit reported ready.
    #[error("task aborted before start")]
    AbortedBeforeStart,
    /// A queued entry was discarded at dispatch because its token had fired.
    #[error("task {0} dropped before dispatch")]
    DispatchDropped(TaskId),
    /// The unit executing the task exited or panicked.
    #[error("execution unit {unit_id} crashed: {reason}")]
    UnitCrashed {
        /// Unit that crashed.
        unit_id: UnitId,
        /// Panic message or exit reason.
        reason: String,
    },
    /// The unit failed while loading its imports.
    #[error("execution unit {unit_id} failed to initialize: {reason}")]
    UnitInit {
        /// Unit that failed to start.
        unit_id: UnitId,
        /// Bootstrap failure.
        reason: String,
    },
    /// The work function returned an error.
    #[error("task failed: {0}")]
    Work(String),
    /// The pool is shutting down.
    #[error("pool is shutting down")]
    Shutdown,
    /// The reusable thread owning the task was destroyed.
    #[error("thread destroyed")]
    Destroyed,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal failure (thread spawn, closed channel).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Whether this error was caused by an abort request.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::QueueAborted | Self::RunAborted | Self::AbortedBeforeStart | Self::DispatchDropped(_)
        )
    }
}

/// Result type for work functions and module hooks.
pub type AppResult<T> = Result<T, anyhow::Error>;
