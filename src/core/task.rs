//! Task entries, in-flight slots and the caller-facing task handle.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::core::abort::{AbortToken, ListenerId};
use crate::core::error::PoolError;
use crate::core::unit::{open_channel, OrchestratorPort, TaskDispatch};
use crate::util::serde::{Priority, TaskId};

/// Outcome a task settles with.
pub type TaskResult = Result<Value, PoolError>;

type Settler = oneshot::Sender<TaskResult>;

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Priority class; only the fixed pool flavors order by it.
    pub priority: Priority,
    /// Caller-held abort token. A private one is created when absent so the
    /// returned handle can always abort.
    pub abort: Option<AbortToken>,
}

impl SubmitOptions {
    /// Default options: normal priority, no external token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority class.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach an abort token.
    #[must_use]
    pub fn with_abort_token(mut self, token: AbortToken) -> Self {
        self.abort = Some(token);
        self
    }
}

/// Awaitable result of a submitted task, with cooperative abort.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    id: Option<TaskId>,
    rx: oneshot::Receiver<TaskResult>,
    token: AbortToken,
}

impl TaskHandle {
    pub(crate) fn pending(id: TaskId, token: AbortToken) -> (Self, Settler) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: Some(id),
                rx,
                token,
            },
            tx,
        )
    }

    /// A handle that is already settled with `error`.
    pub(crate) fn rejected(error: PoolError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            id: None,
            rx,
            token: AbortToken::new(),
        }
    }

    /// Task id, or `None` for submissions rejected before an id was assigned.
    #[must_use]
    pub const fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// Request cancellation. Queued tasks are removed and rejected with
    /// `QueueAborted`; running tasks get a cancellation message and the
    /// handle settles with `RunAborted`.
    pub fn abort(&self) {
        self.token.abort();
    }

    /// The token this handle aborts.
    #[must_use]
    pub const fn abort_token(&self) -> &AbortToken {
        &self.token
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(PoolError::Internal("task dropped without settlement".into())))
        })
    }
}

/// Await handles in input order, returning every value or the first error
/// by input position once all have settled.
pub(crate) async fn collect_in_order(handles: Vec<TaskHandle>) -> Result<Vec<Value>, PoolError> {
    let mut values = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(value) => values.push(value),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(values), Err)
}

/// Bookkeeping for a task awaiting dispatch.
#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub id: TaskId,
    pub work: String,
    pub data: Value,
    pub priority: Priority,
    pub token: AbortToken,
    pub listener: Option<ListenerId>,
    settle: Settler,
}

impl TaskEntry {
    pub(crate) fn new(
        id: TaskId,
        work: String,
        data: Value,
        priority: Priority,
        token: AbortToken,
        settle: Settler,
    ) -> Self {
        Self {
            id,
            work,
            data,
            priority,
            token,
            listener: None,
            settle,
        }
    }

    /// Settle without ever dispatching.
    pub(crate) fn settle(self, result: TaskResult) {
        if let Some(listener) = self.listener {
            self.token.remove_listener(listener);
        }
        let _ = self.settle.send(result);
    }

    /// Turn the entry into an in-flight slot plus the command for the unit.
    pub(crate) fn start(self) -> (InFlight, TaskDispatch) {
        let (port, cancel) = open_channel();
        let dispatch = TaskDispatch {
            task_id: self.id,
            work: self.work,
            data: self.data,
            cancel,
        };
        let in_flight = InFlight {
            task_id: self.id,
            priority: self.priority,
            settle: Some(self.settle),
            token: self.token,
            listener: self.listener,
            port,
        };
        (in_flight, dispatch)
    }
}

/// A task currently owned by one unit.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub task_id: TaskId,
    pub priority: Priority,
    settle: Option<Settler>,
    token: AbortToken,
    listener: Option<ListenerId>,
    port: OrchestratorPort,
}

impl InFlight {
    /// Settle the caller's handle. Returns `false` if it was already settled
    /// by an abort.
    pub(crate) fn settle(&mut self, result: TaskResult) -> bool {
        let Some(settle) = self.settle.take() else {
            return false;
        };
        if let Some(listener) = self.listener.take() {
            self.token.remove_listener(listener);
        }
        let _ = settle.send(result);
        true
    }

    /// Push a cooperative cancellation into the running work.
    pub(crate) fn cancel(&self) {
        self.port.cancel();
    }

    pub(crate) const fn is_settled(&self) -> bool {
        self.settle.is_none()
    }

    /// Put a never-run task back into queue form after a failed send.
    pub(crate) fn requeue(mut self, dispatch: TaskDispatch) -> Option<TaskEntry> {
        let settle = self.settle.take()?;
        Some(TaskEntry {
            id: self.task_id,
            work: dispatch.work,
            data: dispatch.data,
            priority: self.priority,
            token: self.token.clone(),
            listener: self.listener.take(),
            settle,
        })
    }
}

/// Running totals of submissions and settlements for a pool.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TaskCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
}

impl TaskCounters {
    fn record(&mut self, result: &TaskResult) {
        match result {
            Ok(_) => self.completed += 1,
            Err(e) if e.is_abort() => self.aborted += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub(crate) fn settle_entry(&mut self, entry: TaskEntry, result: TaskResult) {
        self.record(&result);
        entry.settle(result);
    }

    pub(crate) fn settle_in_flight(&mut self, in_flight: &mut InFlight, result: TaskResult) {
        if !in_flight.is_settled() {
            self.record(&result);
            in_flight.settle(result);
        }
    }
}
