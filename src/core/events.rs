//! Typed event stream emitted by every pool flavor.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::error::PoolError;
use crate::core::unit::UnitExit;
use crate::util::serde::{Priority, TaskId, UnitId};

/// Default buffer size of a pool's event stream.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Lifecycle and task events. Emission never waits on subscribers; a
/// subscriber that falls behind observes `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A unit finished bootstrapping.
    UnitReady {
        /// Unit id.
        unit_id: UnitId,
    },
    /// A log line sent by running work.
    UnitLog {
        /// Unit id.
        unit_id: UnitId,
        /// Log text.
        message: String,
    },
    /// A unit's thread ended.
    UnitExit {
        /// Unit id.
        unit_id: UnitId,
        /// How it ended.
        exit: UnitExit,
    },
    /// A task entered a queue.
    TaskQueued {
        /// Task id.
        task_id: TaskId,
        /// Priority class.
        priority: Priority,
    },
    /// A task was sent to a unit.
    TaskStart {
        /// Unit id.
        unit_id: UnitId,
        /// Task id.
        task_id: TaskId,
    },
    /// A unit reported the outcome of a task.
    TaskEnd {
        /// Unit id.
        unit_id: UnitId,
        /// Task id.
        task_id: TaskId,
    },
    /// A message posted by running work on its channel.
    TaskMessage {
        /// Task id.
        task_id: TaskId,
        /// Message payload.
        message: Value,
    },
    /// An error with no task to settle.
    Error {
        /// Subsystem the error came from.
        subsystem: &'static str,
        /// Unit involved, if any.
        unit_id: Option<UnitId>,
        /// The error.
        error: PoolError,
    },
    /// A unit was added under load.
    ScalingUp {
        /// Unit count before.
        from: usize,
        /// Unit count after.
        to: usize,
    },
    /// An idle unit was evicted.
    ScalingDown {
        /// Evicted unit.
        unit_id: UnitId,
    },
    /// The pool finished tearing down.
    Shutdown,
}

/// Fan-out sender shared by a pool's orchestrator paths.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        trace!(?event, "Pool event");
        let _ = self.tx.send(event);
    }
}
