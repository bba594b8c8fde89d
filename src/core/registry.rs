//! Work function table and side-effect modules resolved inside execution units.
//!
//! Work is never shipped as code. Callers register functions under stable
//! names and submit the name; each unit resolves the name against the same
//! immutable table. Modules are named bootstrap hooks a unit runs before it
//! reports ready, selected per pool through `imports`.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::error::{AppResult, PoolError};
use crate::core::unit::{ChannelSignal, ContextId, SharedSink, UnitEvent, UnitEventKind};
use crate::util::serde::{TaskId, UnitId};

/// Signature of a registered work function.
pub type WorkFn = dyn Fn(Value, &WorkContext) -> AppResult<Value> + Send + Sync + 'static;

/// Signature of a registered bootstrap module.
pub type ModuleFn = dyn Fn() -> AppResult<()> + Send + Sync + 'static;

/// Immutable table of work functions and bootstrap modules.
///
/// Cloning is cheap; builder methods copy the table on write.
#[derive(Clone, Default)]
pub struct WorkRegistry {
    functions: Arc<HashMap<String, Arc<WorkFn>>>,
    modules: Arc<HashMap<String, Arc<ModuleFn>>>,
}

impl WorkRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a work function operating on raw JSON values.
    #[must_use]
    pub fn register<F>(mut self, name: impl Into<String>, work: F) -> Self
    where
        F: Fn(Value, &WorkContext) -> AppResult<Value> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.functions).insert(name.into(), Arc::new(work));
        self
    }

    /// Register a work function with typed input and output.
    ///
    /// Input is deserialized from the submitted payload inside the unit and the
    /// output serialized back before it crosses to the orchestrator.
    #[must_use]
    pub fn register_typed<I, O, F>(self, name: impl Into<String>, work: F) -> Self
    where
        I: DeserializeOwned,
        O: Serialize,
        F: Fn(I, &WorkContext) -> AppResult<O> + Send + Sync + 'static,
    {
        self.register(name, move |data, ctx| {
            let input: I = serde_json::from_value(data)?;
            let output = work(input, ctx)?;
            Ok(serde_json::to_value(output)?)
        })
    }

    /// Register a bootstrap module that units run when it is listed in `imports`.
    #[must_use]
    pub fn register_module<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn() -> AppResult<()> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.modules).insert(name.into(), Arc::new(hook));
        self
    }

    /// Whether a work function is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Whether a module is registered under `name`.
    #[must_use]
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Check that every import names a registered module.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` naming the first unknown import.
    pub fn validate_imports(&self, imports: &[String]) -> Result<(), PoolError> {
        match imports.iter().find(|name| !self.has_module(name)) {
            Some(missing) => Err(PoolError::InvalidConfig(format!(
                "import `{missing}` is not a registered module"
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<Arc<WorkFn>> {
        self.functions.get(name).cloned()
    }

    pub(crate) fn load_module(&self, name: &str) -> AppResult<()> {
        let hook = self
            .modules
            .get(name)
            .ok_or_else(|| anyhow!("module `{name}` is not registered"))?;
        hook()
    }
}

impl fmt::Debug for WorkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<_> = self.functions.keys().collect();
        functions.sort();
        let mut modules: Vec<_> = self.modules.keys().collect();
        modules.sort();
        f.debug_struct("WorkRegistry")
            .field("functions", &functions)
            .field("modules", &modules)
            .finish()
    }
}

/// Unit-side end of a task's message channel, handed to every work call.
pub struct WorkContext {
    task_id: TaskId,
    unit_id: UnitId,
    context: ContextId,
    cancel: Receiver<ChannelSignal>,
    cancelled: Cell<bool>,
    sink: SharedSink,
}

impl WorkContext {
    pub(crate) fn new(
        task_id: TaskId,
        unit_id: UnitId,
        context: ContextId,
        cancel: Receiver<ChannelSignal>,
        sink: SharedSink,
    ) -> Self {
        Self {
            task_id,
            unit_id,
            context,
            cancel,
            cancelled: Cell::new(false),
            sink,
        }
    }

    /// Id of the task being executed.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Id of the unit executing the task.
    #[must_use]
    pub const fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Send a progress message, surfaced as a `TaskMessage` event.
    pub fn post(&self, message: Value) {
        self.sink.deliver(UnitEvent {
            unit_id: self.unit_id,
            context: self.context,
            kind: UnitEventKind::TaskMessage {
                task_id: self.task_id,
                message,
            },
        });
    }

    /// Send a log line, surfaced as a `UnitLog` event.
    pub fn log(&self, message: impl Into<String>) {
        self.sink.deliver(UnitEvent {
            unit_id: self.unit_id,
            context: self.context,
            kind: UnitEventKind::Log(message.into()),
        });
    }

    /// Whether the orchestrator has asked this task to stop.
    ///
    /// Cancellation is cooperative: work that never checks keeps running.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.get() {
            return true;
        }
        if matches!(self.cancel.try_recv(), Ok(ChannelSignal::Cancel)) {
            self.cancelled.set(true);
        }
        self.cancelled.get()
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` if the task was cancelled before the time elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let deadline = Instant::now() + duration;
        match self.cancel.recv_deadline(deadline) {
            Ok(ChannelSignal::Cancel) => {
                self.cancelled.set(true);
                false
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                true
            }
        }
    }
}

impl fmt::Debug for WorkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkContext")
            .field("task_id", &self.task_id)
            .field("unit_id", &self.unit_id)
            .field("cancelled", &self.cancelled.get())
            .finish_non_exhaustive()
    }
}
