//! Execution units: isolated OS threads that bootstrap their imports, report
//! ready, then run one task at a time from their inbox.
//!
//! A unit shares nothing with the orchestrator. It receives owned
//! [`TaskDispatch`] commands and answers with [`UnitEvent`]s through a sink;
//! a panic anywhere in the unit is caught at the thread boundary and reported
//! as a crash exit.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::config::UnitConfig;
use crate::core::error::PoolError;
use crate::core::registry::{WorkContext, WorkRegistry};
use crate::util::serde::{TaskId, UnitId};

/// Identifier of one launched context. A respawned unit gets a new one.
pub(crate) type ContextId = u64;

/// Lifecycle state of an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Launched, bootstrap not finished.
    Starting,
    /// Ready for a task.
    Idle,
    /// Executing a task.
    Busy,
    /// Terminated or crashed; terminal for this instance.
    Dead,
}

/// How a unit's thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    /// Inbox closed by the orchestrator.
    Clean,
    /// Bootstrap failed before the unit became ready.
    InitFailed(String),
    /// The thread panicked.
    Crashed(String),
}

impl UnitExit {
    /// Whether the exit was not requested by the orchestrator.
    #[must_use]
    pub const fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Clean)
    }

    /// Human-readable reason.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Clean => "exited cleanly".to_string(),
            Self::InitFailed(reason) => reason.clone(),
            Self::Crashed(reason) => format!("panicked: {reason}"),
        }
    }
}

/// Orchestrator-to-unit signal on a task's message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelSignal {
    Cancel,
}

/// Orchestrator-side end of a task's message channel. Dropping it closes the
/// channel.
#[derive(Debug)]
pub(crate) struct OrchestratorPort {
    cancel: Sender<ChannelSignal>,
}

impl OrchestratorPort {
    pub(crate) fn cancel(&self) {
        let _ = self.cancel.try_send(ChannelSignal::Cancel);
    }
}

/// Open the message channel for one task.
pub(crate) fn open_channel() -> (OrchestratorPort, Receiver<ChannelSignal>) {
    let (cancel, rx) = bounded(1);
    (OrchestratorPort { cancel }, rx)
}

/// One task sent into a unit.
pub(crate) struct TaskDispatch {
    pub task_id: TaskId,
    pub work: String,
    pub data: Value,
    pub cancel: Receiver<ChannelSignal>,
}

/// Message from a unit, tagged with the context that produced it.
#[derive(Debug)]
pub(crate) struct UnitEvent {
    pub unit_id: UnitId,
    pub context: ContextId,
    pub kind: UnitEventKind,
}

#[derive(Debug)]
pub(crate) enum UnitEventKind {
    Ready,
    InitFailed(String),
    Log(String),
    TaskMessage { task_id: TaskId, message: Value },
    Completed { task_id: TaskId, outcome: Result<Value, String> },
    Exited(UnitExit),
}

/// Where a unit delivers its events.
pub(crate) trait UnitEventSink: Send + Sync + 'static {
    /// Returns `false` once nobody is listening.
    fn deliver(&self, event: UnitEvent) -> bool;
}

impl UnitEventSink for Sender<UnitEvent> {
    fn deliver(&self, event: UnitEvent) -> bool {
        self.send(event).is_ok()
    }
}

impl UnitEventSink for mpsc::UnboundedSender<UnitEvent> {
    fn deliver(&self, event: UnitEvent) -> bool {
        self.send(event).is_ok()
    }
}

pub(crate) type SharedSink = Arc<dyn UnitEventSink>;

/// Everything needed to launch one context.
pub(crate) struct LaunchSpec {
    pub unit_id: UnitId,
    pub context: ContextId,
    pub thread_name: String,
    pub registry: WorkRegistry,
    pub imports: Arc<[String]>,
    pub sink: SharedSink,
    pub startup_delay: Duration,
    pub stack_size: Option<usize>,
}

/// Orchestrator's handle on a launched context.
#[derive(Debug)]
pub(crate) struct UnitContext {
    id: ContextId,
    inbox: Option<Sender<TaskDispatch>>,
    exited: Option<oneshot::Receiver<()>>,
}

impl UnitContext {
    pub(crate) const fn id(&self) -> ContextId {
        self.id
    }

    /// Send a task; hands the dispatch back if the unit is gone.
    pub(crate) fn send(&self, dispatch: TaskDispatch) -> Result<(), TaskDispatch> {
        match &self.inbox {
            Some(inbox) => inbox.send(dispatch).map_err(|e| e.into_inner()),
            None => Err(dispatch),
        }
    }

    /// Close the inbox so the thread exits after its current task. Returns
    /// the exit notification the first time it is called.
    pub(crate) fn close(&mut self) -> Option<oneshot::Receiver<()>> {
        self.inbox = None;
        self.exited.take()
    }
}

#[cfg(test)]
impl UnitContext {
    /// A context whose inbox is already closed; every send bounces.
    pub(crate) const fn closed(id: ContextId) -> Self {
        Self {
            id,
            inbox: None,
            exited: None,
        }
    }
}

impl std::fmt::Debug for TaskDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatch")
            .field("task_id", &self.task_id)
            .field("work", &self.work)
            .finish_non_exhaustive()
    }
}

/// Spawn a context on a dedicated OS thread.
///
/// # Errors
///
/// Returns `PoolError::Internal` if the OS refuses the thread.
pub(crate) fn launch(spec: LaunchSpec) -> Result<UnitContext, PoolError> {
    let LaunchSpec {
        unit_id,
        context,
        thread_name,
        registry,
        imports,
        sink,
        startup_delay,
        stack_size,
    } = spec;

    let (inbox_tx, inbox_rx) = unbounded::<TaskDispatch>();
    let (exit_tx, exit_rx) = oneshot::channel::<()>();

    let mut builder = thread::Builder::new().name(thread_name);
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }

    builder
        .spawn(move || {
            if !startup_delay.is_zero() {
                thread::sleep(startup_delay);
            }
            debug!(unit_id, context, "Execution unit starting");

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                serve(unit_id, context, &registry, &imports, &inbox_rx, &sink)
            }));
            drop(inbox_rx);

            let exit = match outcome {
                Ok(Ok(())) => UnitExit::Clean,
                Ok(Err(reason)) => UnitExit::InitFailed(reason),
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!(unit_id, context, reason = %reason, "Execution unit crashed");
                    UnitExit::Crashed(reason)
                }
            };
            sink.deliver(UnitEvent {
                unit_id,
                context,
                kind: UnitEventKind::Exited(exit),
            });
            let _ = exit_tx.send(());
        })
        .map_err(|e| PoolError::Internal(format!("failed to spawn execution unit: {e}")))?;

    Ok(UnitContext {
        id: context,
        inbox: Some(inbox_tx),
        exited: Some(exit_rx),
    })
}

/// Bootstrap, then drain the inbox until the orchestrator closes it.
fn serve(
    unit_id: UnitId,
    context: ContextId,
    registry: &WorkRegistry,
    imports: &[String],
    inbox: &Receiver<TaskDispatch>,
    sink: &SharedSink,
) -> Result<(), String> {
    for module in imports {
        if let Err(e) = registry.load_module(module) {
            let reason = format!("failed to load import `{module}`: {e:#}");
            sink.deliver(UnitEvent {
                unit_id,
                context,
                kind: UnitEventKind::InitFailed(reason.clone()),
            });
            return Err(reason);
        }
        debug!(unit_id, module = %module, "Import loaded");
    }
    sink.deliver(UnitEvent {
        unit_id,
        context,
        kind: UnitEventKind::Ready,
    });

    while let Ok(TaskDispatch {
        task_id,
        work,
        data,
        cancel,
    }) = inbox.recv()
    {
        let ctx = WorkContext::new(task_id, unit_id, context, cancel, Arc::clone(sink));
        let outcome = match registry.resolve(&work) {
            Some(function) => function(data, &ctx).map_err(|e| format!("{e:#}")),
            None => Err(format!("work `{work}` is not registered")),
        };
        sink.deliver(UnitEvent {
            unit_id,
            context,
            kind: UnitEventKind::Completed { task_id, outcome },
        });
    }

    debug!(unit_id, context, "Execution unit inbox closed");
    Ok(())
}

/// Launches contexts for one pool with shared naming, imports and backoff.
pub(crate) struct UnitFactory {
    pool_name: String,
    registry: WorkRegistry,
    imports: Arc<[String]>,
    sink: SharedSink,
    stack_size: Option<usize>,
    respawn_backoff: Duration,
    next_context: AtomicU64,
}

impl UnitFactory {
    pub(crate) fn new(config: &UnitConfig, registry: WorkRegistry, sink: SharedSink) -> Self {
        Self {
            pool_name: config.name.clone(),
            registry,
            imports: config.imports.iter().cloned().collect(),
            sink,
            stack_size: config.thread_stack_size,
            respawn_backoff: config.respawn_backoff(),
            next_context: AtomicU64::new(1),
        }
    }

    pub(crate) const fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    pub(crate) const fn respawn_backoff(&self) -> Duration {
        self.respawn_backoff
    }

    /// Launch a fresh context for `unit_id`, bootstrapping after `delay`.
    pub(crate) fn launch(&self, unit_id: UnitId, delay: Duration) -> Result<UnitContext, PoolError> {
        let context = self.next_context.fetch_add(1, Ordering::Relaxed);
        launch(LaunchSpec {
            unit_id,
            context,
            thread_name: format!("{}-unit-{unit_id}", self.pool_name),
            registry: self.registry.clone(),
            imports: Arc::clone(&self.imports),
            sink: Arc::clone(&self.sink),
            startup_delay: delay,
            stack_size: self.stack_size,
        })
    }
}

/// Wait for closed units to exit, up to one shared deadline. Units still
/// running user code after it are detached.
pub(crate) async fn wait_for_exits(exits: Vec<oneshot::Receiver<()>>, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut detached = 0usize;
    for exited in exits {
        if tokio::time::timeout_at(deadline, exited).await.is_err() {
            detached += 1;
        }
    }
    if detached > 0 {
        warn!(detached, "Execution units did not exit within shutdown timeout, detaching");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(registry: WorkRegistry, imports: &[&str], sink: SharedSink) -> LaunchSpec {
        LaunchSpec {
            unit_id: 1,
            context: 10,
            thread_name: "unit-test".into(),
            registry,
            imports: imports.iter().map(|s| (*s).to_string()).collect(),
            sink,
            startup_delay: Duration::ZERO,
            stack_size: None,
        }
    }

    fn next(rx: &Receiver<UnitEvent>) -> UnitEventKind {
        rx.recv_timeout(Duration::from_secs(5)).expect("unit event").kind
    }

    #[test]
    fn test_unit_runs_task_and_exits_cleanly() {
        let registry = WorkRegistry::new().register("inc", |data, _| {
            Ok(json!(data.as_u64().unwrap_or_default() + 1))
        });
        let (tx, rx) = unbounded();
        let mut unit = launch(spec(registry, &[], Arc::new(tx))).unwrap();
        assert!(matches!(next(&rx), UnitEventKind::Ready));

        let (_port, cancel) = open_channel();
        unit.send(TaskDispatch {
            task_id: 5,
            work: "inc".into(),
            data: json!(41),
            cancel,
        })
        .unwrap();
        match next(&rx) {
            UnitEventKind::Completed { task_id, outcome } => {
                assert_eq!(task_id, 5);
                assert_eq!(outcome, Ok(json!(42)));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(unit.close().is_some());
        assert!(matches!(next(&rx), UnitEventKind::Exited(UnitExit::Clean)));
    }

    #[test]
    fn test_panic_reports_crash() {
        let registry = WorkRegistry::new().register("boom", |_, _| panic!("kaboom"));
        let (tx, rx) = unbounded();
        let unit = launch(spec(registry, &[], Arc::new(tx))).unwrap();
        assert!(matches!(next(&rx), UnitEventKind::Ready));
        let (_port, cancel) = open_channel();
        unit.send(TaskDispatch {
            task_id: 1,
            work: "boom".into(),
            data: Value::Null,
            cancel,
        })
        .unwrap();
        match next(&rx) {
            UnitEventKind::Exited(UnitExit::Crashed(reason)) => assert_eq!(reason, "kaboom"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_failed_import_reports_init_failure() {
        let registry = WorkRegistry::new().register_module("db", || Err(anyhow::anyhow!("offline")));
        let (tx, rx) = unbounded();
        let _unit = launch(spec(registry, &["db"], Arc::new(tx))).unwrap();
        match next(&rx) {
            UnitEventKind::InitFailed(reason) => assert!(reason.contains("offline")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next(&rx), UnitEventKind::Exited(UnitExit::InitFailed(_))));
    }

    #[test]
    fn test_cancel_reaches_work() {
        let registry = WorkRegistry::new().register("wait", |_, ctx| {
            let finished = ctx.sleep(Duration::from_secs(5));
            Ok(json!({ "finished": finished, "cancelled": ctx.is_cancelled() }))
        });
        let (tx, rx) = unbounded();
        let unit = launch(spec(registry, &[], Arc::new(tx))).unwrap();
        assert!(matches!(next(&rx), UnitEventKind::Ready));
        let (port, cancel) = open_channel();
        unit.send(TaskDispatch {
            task_id: 2,
            work: "wait".into(),
            data: Value::Null,
            cancel,
        })
        .unwrap();
        port.cancel();
        match next(&rx) {
            UnitEventKind::Completed { outcome, .. } => {
                assert_eq!(outcome, Ok(json!({ "finished": false, "cancelled": true })));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
