//! One-shot runner: a fresh execution unit per invocation, torn down after.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::UnitConfig;
use crate::core::abort::AbortToken;
use crate::core::error::PoolError;
use crate::core::registry::WorkRegistry;
use crate::core::task::TaskResult;
use crate::core::unit::{launch, open_channel, LaunchSpec, TaskDispatch, UnitContext, UnitEvent, UnitEventKind, UnitExit};
use crate::util::serde::UnitId;

const ONESHOT_TASK_ID: u64 = 1;

/// Options for one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Extra bootstrap modules, loaded after the runner's configured imports.
    pub imports: Vec<String>,
    /// Abort token; a private one is used when absent.
    pub abort: Option<AbortToken>,
}

impl RunOptions {
    /// No extra imports, no token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bootstrap modules.
    #[must_use]
    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.imports.extend(imports.into_iter().map(Into::into));
        self
    }

    /// Attach an abort token.
    #[must_use]
    pub fn with_abort_token(mut self, token: AbortToken) -> Self {
        self.abort = Some(token);
        self
    }
}

/// Runs each call on its own freshly spawned unit.
#[derive(Debug, Clone)]
pub struct Thread {
    registry: WorkRegistry,
    config: Arc<UnitConfig>,
    next_unit: Arc<AtomicU64>,
}

impl Thread {
    /// Runner with default unit settings.
    #[must_use]
    pub fn new(registry: WorkRegistry) -> Self {
        Self {
            registry,
            config: Arc::new(UnitConfig::default()),
            next_unit: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Runner with explicit unit settings.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad settings or unknown imports.
    pub fn with_config(registry: WorkRegistry, config: UnitConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        registry.validate_imports(&config.imports)?;
        Ok(Self {
            registry,
            config: Arc::new(config),
            next_unit: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Spawn a unit, run `work` once and tear the unit down.
    ///
    /// # Errors
    ///
    /// `InvalidWork` or `InvalidConfig` before anything is spawned,
    /// `AbortedBeforeStart` if the token fires before the unit is ready,
    /// `RunAborted` if it fires while the work runs, `UnitInit` or
    /// `UnitCrashed` when the unit fails, `Work` when the work returns an
    /// error.
    pub async fn run(&self, work: &str, data: Value, options: RunOptions) -> TaskResult {
        if !self.registry.contains(work) {
            return Err(PoolError::InvalidWork(work.to_string()));
        }
        let RunOptions { imports: extra, abort } = options;
        self.registry.validate_imports(&extra)?;
        let token = abort.unwrap_or_default();
        if token.is_aborted() {
            return Err(PoolError::AbortedBeforeStart);
        }

        let unit_id = self.next_unit.fetch_add(1, Ordering::Relaxed);
        let imports: Arc<[String]> = self.config.imports.iter().chain(&extra).cloned().collect();
        let (sink, mut events) = mpsc::unbounded_channel::<UnitEvent>();
        let mut context = launch(LaunchSpec {
            unit_id,
            context: unit_id,
            thread_name: format!("{}-oneshot-{unit_id}", self.config.name),
            registry: self.registry.clone(),
            imports,
            sink: Arc::new(sink),
            startup_delay: Duration::ZERO,
            stack_size: self.config.thread_stack_size,
        })?;
        debug!(unit_id, work, "One-shot unit spawned");

        let result = drive(unit_id, &context, &mut events, &token, work, data).await;
        drop(context.close());
        debug!(unit_id, ok = result.is_ok(), "One-shot unit torn down");
        result
    }
}

async fn drive(
    unit_id: UnitId,
    context: &UnitContext,
    events: &mut mpsc::UnboundedReceiver<UnitEvent>,
    token: &AbortToken,
    work: &str,
    data: Value,
) -> TaskResult {
    loop {
        tokio::select! {
            () = token.aborted() => return Err(PoolError::AbortedBeforeStart),
            event = events.recv() => match event.map(|e| e.kind) {
                Some(UnitEventKind::Ready) => break,
                Some(UnitEventKind::InitFailed(reason) | UnitEventKind::Exited(UnitExit::InitFailed(reason))) => {
                    return Err(PoolError::UnitInit { unit_id, reason });
                }
                Some(UnitEventKind::Exited(exit)) => {
                    return Err(PoolError::UnitCrashed { unit_id, reason: exit.reason() });
                }
                Some(_) => {}
                None => return Err(PoolError::Internal("unit event channel closed".into())),
            },
        }
    }

    let (port, cancel) = open_channel();
    let command = TaskDispatch {
        task_id: ONESHOT_TASK_ID,
        work: work.to_string(),
        data,
        cancel,
    };
    if context.send(command).is_err() {
        return Err(PoolError::UnitCrashed {
            unit_id,
            reason: "unit exited before dispatch".into(),
        });
    }

    loop {
        tokio::select! {
            () = token.aborted() => {
                port.cancel();
                return Err(PoolError::RunAborted);
            }
            event = events.recv() => match event.map(|e| e.kind) {
                Some(UnitEventKind::Completed { outcome, .. }) => return outcome.map_err(PoolError::Work),
                Some(UnitEventKind::Exited(exit)) => {
                    return Err(PoolError::UnitCrashed { unit_id, reason: exit.reason() });
                }
                Some(UnitEventKind::Log(message)) => debug!(unit_id, message = %message, "One-shot unit log"),
                Some(UnitEventKind::TaskMessage { message, .. }) => trace!(unit_id, ?message, "One-shot task message"),
                Some(_) => {}
                None => return Err(PoolError::Internal("unit event channel closed".into())),
            },
        }
    }
}

/// Eagerly started one-shot run on the current tokio runtime.
#[derive(Debug)]
pub struct Task {
    token: AbortToken,
    handle: JoinHandle<TaskResult>,
}

impl Task {
    /// Start `work` on a fresh unit right away.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn run(thread: &Thread, work: &str, data: Value, options: RunOptions) -> Self {
        let token = options.abort.clone().unwrap_or_default();
        let options = RunOptions {
            abort: Some(token.clone()),
            ..options
        };
        let thread = thread.clone();
        let work = work.to_string();
        let handle = tokio::spawn(async move { thread.run(&work, data, options).await });
        Self { token, handle }
    }

    /// Abort the run; see [`Thread::run`] for which error results.
    pub fn abort(&self) {
        self.token.abort();
    }

    /// The token this task aborts.
    #[must_use]
    pub const fn abort_token(&self) -> &AbortToken {
        &self.token
    }
}

impl Future for Task {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.handle)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(PoolError::Internal(format!("one-shot task failed: {e}")))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> WorkRegistry {
        WorkRegistry::new()
            .register_typed("add", |(a, b): (i64, i64), _| Ok(a + b))
            .register("crash", |_, _| panic!("one-shot panic"))
            .register_module("broken", || Err(anyhow::anyhow!("cannot load")))
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let thread = Thread::new(registry());
        assert_eq!(thread.run("add", json!([2, 3]), RunOptions::new()).await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_pre_aborted_token_never_spawns() {
        let token = AbortToken::new();
        token.abort();
        let thread = Thread::new(registry());
        let result = thread
            .run("add", json!([1, 1]), RunOptions::new().with_abort_token(token))
            .await;
        assert_eq!(result, Err(PoolError::AbortedBeforeStart));
        assert_eq!(thread.next_unit.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_init_failure_and_crash() {
        let thread = Thread::new(registry());
        let init = thread
            .run("add", json!([1, 1]), RunOptions::new().with_imports(["broken"]))
            .await;
        assert!(matches!(init, Err(PoolError::UnitInit { reason, .. }) if reason.contains("cannot load")));

        let crash = thread.run("crash", Value::Null, RunOptions::new()).await;
        assert!(matches!(crash, Err(PoolError::UnitCrashed { reason, .. }) if reason.contains("one-shot panic")));
    }
}
