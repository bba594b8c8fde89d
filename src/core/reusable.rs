//! Persistent execution units with their own FIFO queue.
//!
//! A reusable unit survives crashes: the in-flight task is rejected, queued
//! tasks stay put, and the unit relaunches after the respawn backoff under
//! the same [`UnitId`] with a fresh context. [`ReusableThread`] is one such
//! unit; the reusable pools share the same core with several.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::UnitConfig;
use crate::core::autoscale::ScalingPolicy;
use crate::core::error::PoolError;
use crate::core::events::{EventBus, PoolEvent};
use crate::core::reactor::{Orchestrator, Reactor};
use crate::core::registry::WorkRegistry;
use crate::core::reusable_pool::select_unit;
use crate::core::task::{InFlight, SubmitOptions, TaskCounters, TaskEntry, TaskHandle};
use crate::core::unit::{wait_for_exits, UnitContext, UnitEvent, UnitEventKind, UnitExit, UnitFactory, UnitState};
use crate::util::serde::{TaskId, UnitId};

/// Snapshot of one reusable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadStats {
    /// Unit id, stable across respawns.
    pub unit_id: UnitId,
    /// Lifecycle state.
    pub state: UnitState,
    /// Tasks waiting in this unit's queue.
    pub queue_length: usize,
    /// Task currently executing.
    pub current_task: Option<TaskId>,
}

/// One reusable unit and its private queue.
#[derive(Debug)]
pub(crate) struct ReusableUnit {
    pub id: UnitId,
    pub state: UnitState,
    context: Option<UnitContext>,
    queue: VecDeque<TaskEntry>,
    current: Option<InFlight>,
    idle_since: Option<Instant>,
}

impl ReusableUnit {
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn context_id(&self) -> Option<u64> {
        self.context.as_ref().map(UnitContext::id)
    }

    fn stats(&self) -> ThreadStats {
        ThreadStats {
            unit_id: self.id,
            state: self.state,
            queue_length: self.queue.len(),
            current_task: self.current.as_ref().map(|f| f.task_id),
        }
    }

    /// Reject everything this unit owns with `error` and close the context.
    fn destroy(&mut self, counters: &mut TaskCounters, error: &PoolError) -> Option<oneshot::Receiver<()>> {
        if let Some(mut current) = self.current.take() {
            current.cancel();
            counters.settle_in_flight(&mut current, Err(error.clone()));
        }
        for entry in self.queue.drain(..) {
            counters.settle_entry(entry, Err(error.clone()));
        }
        self.state = UnitState::Dead;
        self.idle_since = None;
        self.context.take().and_then(|mut context| context.close())
    }
}

#[cfg(test)]
impl ReusableUnit {
    /// A unit with no context and `queued` placeholder entries.
    pub(crate) fn detached(id: UnitId, state: UnitState, queued: usize) -> Self {
        use crate::core::abort::AbortToken;
        use crate::util::serde::Priority;

        let queue = (0..queued as u64)
            .map(|task_id| {
                let token = AbortToken::new();
                let (_handle, settle) = TaskHandle::pending(task_id, token.clone());
                TaskEntry::new(task_id, "noop".into(), Value::Null, Priority::Normal, token, settle)
            })
            .collect();
        Self {
            id,
            state,
            context: None,
            queue,
            current: None,
            idle_since: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ReusableState {
    pub units: Vec<ReusableUnit>,
    next_task_id: TaskId,
    next_unit_id: UnitId,
    counters: TaskCounters,
    scaling: Option<ScalingPolicy>,
    round_robin: usize,
    closed: Option<PoolError>,
}

impl ReusableState {
    fn pending(&self) -> usize {
        self.units.iter().map(ReusableUnit::queue_len).sum()
    }
}

/// Snapshot of a reusable pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReusablePoolStats {
    /// Units owned by the pool, in any state.
    pub total_threads: usize,
    /// Units waiting for work.
    pub idle_threads: usize,
    /// Units executing a task.
    pub busy_threads: usize,
    /// Units bootstrapping or respawning.
    pub starting_threads: usize,
    /// Tasks waiting in unit queues.
    pub pending_tasks: usize,
    /// Per-unit snapshots.
    pub threads: Vec<ThreadStats>,
    /// Tasks accepted since construction.
    pub submitted_tasks: u64,
    /// Tasks that settled with a value.
    pub completed_tasks: u64,
    /// Tasks that settled with a non-abort error.
    pub failed_tasks: u64,
    /// Tasks that settled with an abort error.
    pub aborted_tasks: u64,
}

pub(crate) struct ReusableShared {
    id: Uuid,
    factory: UnitFactory,
    events: EventBus,
    shutdown_timeout: Duration,
    this: Weak<Self>,
    state: Mutex<ReusableState>,
}

/// Owner of a reusable core: shared state plus its reactor.
pub(crate) struct ReusableCore {
    shared: Arc<ReusableShared>,
    reactor: Mutex<Option<Reactor>>,
}

impl ReusableCore {
    pub(crate) fn start(
        unit: &UnitConfig,
        registry: WorkRegistry,
        initial: usize,
        scaling: Option<ScalingPolicy>,
    ) -> Result<Self, PoolError> {
        registry.validate_imports(&unit.imports)?;
        let (sink, events_rx) = unbounded::<UnitEvent>();
        let factory = UnitFactory::new(unit, registry, Arc::new(sink));

        let shared = Arc::new_cyclic(|this| ReusableShared {
            id: Uuid::new_v4(),
            factory,
            events: EventBus::new(unit.event_capacity),
            shutdown_timeout: unit.shutdown_timeout(),
            this: this.clone(),
            state: Mutex::new(ReusableState {
                units: Vec::with_capacity(initial),
                next_task_id: 1,
                next_unit_id: 1,
                counters: TaskCounters::default(),
                scaling,
                round_robin: 0,
                closed: None,
            }),
        });

        {
            let mut st = shared.state.lock();
            for _ in 0..initial {
                shared.add_unit(&mut st)?;
            }
        }

        let interval = scaling.map(|policy| policy.check_interval);
        let reactor = Reactor::start(&unit.name, Arc::clone(&shared), events_rx, interval)?;
        info!(
            pool = %shared.id,
            name = %unit.name,
            size = initial,
            autoscaling = scaling.is_some(),
            "Reusable pool started"
        );
        Ok(Self {
            shared,
            reactor: Mutex::new(Some(reactor)),
        })
    }

    pub(crate) fn submit(&self, work: &str, data: Value, options: SubmitOptions) -> TaskHandle {
        self.shared.submit(work, data, options)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn stats(&self) -> ReusablePoolStats {
        self.shared.stats()
    }

    pub(crate) fn id(&self) -> Uuid {
        self.shared.id
    }

    pub(crate) fn stop_control_loop(&self) {
        if let Some(reactor) = self.reactor.lock().as_ref() {
            reactor.stop_ticker();
        }
    }

    /// Reject all outstanding work with `error`, close every unit and wait
    /// for exits. Idempotent.
    pub(crate) async fn close(&self, error: PoolError) {
        let exits = self.shared.begin_close(error);
        drop(self.reactor.lock().take());
        if exits.is_empty() {
            return;
        }
        wait_for_exits(exits, self.shared.shutdown_timeout).await;
        info!(pool = %self.shared.id, "Reusable pool shut down complete");
    }

    /// Teardown without waiting, for `Drop`.
    pub(crate) fn close_now(&self, error: PoolError) {
        if !self.shared.begin_close(error).is_empty() {
            debug!(pool = %self.shared.id, "Reusable pool dropped without explicit shutdown - units will be detached");
        }
    }
}

impl ReusableShared {
    fn submit(&self, work: &str, data: Value, options: SubmitOptions) -> TaskHandle {
        if !self.factory.registry().contains(work) {
            return TaskHandle::rejected(PoolError::InvalidWork(work.to_string()));
        }
        let SubmitOptions { priority, abort } = options;
        let token = abort.unwrap_or_default();

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(error) = &st.closed {
            return TaskHandle::rejected(error.clone());
        }
        let Some(idx) = select_unit(&st.units, &mut st.round_robin) else {
            return TaskHandle::rejected(PoolError::Internal("pool has no execution units".into()));
        };

        let task_id = st.next_task_id;
        st.next_task_id += 1;
        st.counters.submitted += 1;
        let (handle, settle) = TaskHandle::pending(task_id, token.clone());
        let mut entry = TaskEntry::new(task_id, work.to_string(), data, priority, token.clone(), settle);

        let weak = self.this.clone();
        let listener = token.on_abort(move || {
            if let Some(shared) = weak.upgrade() {
                shared.abort_task(task_id);
            }
        });
        let Some(listener) = listener else {
            debug!(pool = %self.id, task_id, "Task aborted before enqueue");
            st.counters.settle_entry(entry, Err(PoolError::QueueAborted));
            return handle;
        };
        entry.listener = Some(listener);

        let unit_id = st.units[idx].id;
        st.units[idx].queue.push_back(entry);
        debug!(pool = %self.id, unit_id, task_id, "Task queued");
        self.events.emit(PoolEvent::TaskQueued { task_id, priority });
        self.drain(st, idx);
        self.scale_up_if_saturated(st);
        handle
    }

    fn abort_task(&self, task_id: TaskId) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        for unit in &mut st.units {
            if let Some(pos) = unit.queue.iter().position(|e| e.id == task_id) {
                if let Some(entry) = unit.queue.remove(pos) {
                    debug!(pool = %self.id, unit_id = unit.id, task_id, "Task aborted from queue");
                    st.counters.settle_entry(entry, Err(PoolError::QueueAborted));
                }
                return;
            }
            if let Some(current) = unit.current.as_mut().filter(|f| f.task_id == task_id) {
                debug!(pool = %self.id, unit_id = unit.id, task_id, "Task aborted while running");
                current.cancel();
                st.counters.settle_in_flight(current, Err(PoolError::RunAborted));
                return;
            }
        }
    }

    /// Start the next queued entry on unit `idx` if it is idle.
    fn drain(&self, st: &mut ReusableState, idx: usize) {
        let unit = &mut st.units[idx];
        while unit.state == UnitState::Idle {
            let Some(entry) = unit.queue.pop_front() else {
                break;
            };
            if entry.token.is_aborted() {
                let task_id = entry.id;
                st.counters.settle_entry(entry, Err(PoolError::DispatchDropped(task_id)));
                continue;
            }
            let (in_flight, command) = entry.start();
            let task_id = in_flight.task_id;
            let sent = match &unit.context {
                Some(context) => context.send(command),
                None => Err(command),
            };
            match sent {
                Ok(()) => {
                    unit.state = UnitState::Busy;
                    unit.idle_since = None;
                    unit.current = Some(in_flight);
                    debug!(pool = %self.id, unit_id = unit.id, task_id, "Task dispatched");
                    self.events.emit(PoolEvent::TaskStart {
                        unit_id: unit.id,
                        task_id,
                    });
                }
                Err(command) => {
                    warn!(pool = %self.id, unit_id = unit.id, task_id, "Unit vanished before dispatch");
                    unit.state = UnitState::Starting;
                    if let Some(entry) = in_flight.requeue(command) {
                        unit.queue.push_front(entry);
                    }
                }
            }
        }
    }

    fn scale_up_if_saturated(&self, st: &mut ReusableState) {
        let Some(policy) = st.scaling else {
            return;
        };
        let has_idle = st.units.iter().any(|u| u.state == UnitState::Idle);
        let from = st.units.len();
        if !policy.should_scale_up(st.pending(), has_idle, from) {
            return;
        }
        match self.add_unit(st) {
            Ok(unit_id) => {
                let to = st.units.len();
                info!(pool = %self.id, unit_id, from, to, "Scaling up");
                self.events.emit(PoolEvent::ScalingUp { from, to });
            }
            Err(e) => self.report_launch_failure(None, e),
        }
    }

    fn add_unit(&self, st: &mut ReusableState) -> Result<UnitId, PoolError> {
        let unit_id = st.next_unit_id;
        st.next_unit_id += 1;
        let context = self.factory.launch(unit_id, Duration::ZERO)?;
        st.units.push(ReusableUnit {
            id: unit_id,
            state: UnitState::Starting,
            context: Some(context),
            queue: VecDeque::new(),
            current: None,
            idle_since: None,
        });
        Ok(unit_id)
    }

    fn report_launch_failure(&self, unit_id: Option<UnitId>, e: PoolError) {
        error!(pool = %self.id, ?unit_id, error = %e, "Failed to launch execution unit");
        self.events.emit(PoolEvent::Error {
            subsystem: "unit-launch",
            unit_id,
            error: e,
        });
    }

    fn complete(&self, st: &mut ReusableState, idx: usize, task_id: TaskId, outcome: Result<Value, String>) {
        let unit = &mut st.units[idx];
        let Some(mut current) = unit.current.take_if(|f| f.task_id == task_id) else {
            warn!(pool = %self.id, unit_id = unit.id, task_id, "Completion for a task the unit does not own");
            return;
        };
        unit.state = UnitState::Idle;
        unit.idle_since = Some(Instant::now());
        let unit_id = unit.id;

        debug!(pool = %self.id, unit_id, task_id, ok = outcome.is_ok(), "Task completed");
        st.counters.settle_in_flight(&mut current, outcome.map_err(PoolError::Work));
        drop(current);
        self.events.emit(PoolEvent::TaskEnd { unit_id, task_id });
        self.drain(st, idx);
    }

    /// Reject the in-flight task, keep the queue and relaunch after backoff.
    fn respawn(&self, st: &mut ReusableState, idx: usize, exit: UnitExit) {
        let unit = &mut st.units[idx];
        let unit_id = unit.id;
        unit.context = None;
        unit.idle_since = None;
        if let Some(mut current) = unit.current.take() {
            let error = PoolError::UnitCrashed {
                unit_id,
                reason: exit.reason(),
            };
            st.counters.settle_in_flight(&mut current, Err(error));
        }

        self.events.emit(PoolEvent::UnitExit {
            unit_id,
            exit: exit.clone(),
        });
        if let UnitExit::Crashed(reason) = &exit {
            error!(pool = %self.id, unit_id, reason = %reason, "Execution unit crashed");
            self.events.emit(PoolEvent::Error {
                subsystem: "unit",
                unit_id: Some(unit_id),
                error: PoolError::UnitCrashed {
                    unit_id,
                    reason: reason.clone(),
                },
            });
        }

        let unit = &mut st.units[idx];
        match self.factory.launch(unit_id, self.factory.respawn_backoff()) {
            Ok(context) => {
                info!(pool = %self.id, unit_id, queued = unit.queue.len(), "Respawning execution unit");
                unit.context = Some(context);
                unit.state = UnitState::Starting;
            }
            Err(e) => {
                let mut removed = st.units.remove(idx);
                let _ = removed.destroy(&mut st.counters, &e);
                self.report_launch_failure(Some(unit_id), e);
            }
        }
    }

    fn evict_idle(&self, st: &mut ReusableState, now: Instant) {
        let Some(policy) = st.scaling else {
            return;
        };
        let candidates = st
            .units
            .iter()
            .filter(|u| u.state == UnitState::Idle && u.queue.is_empty())
            .filter_map(|u| u.idle_since.map(|since| (u.id, since)));
        let Some(unit_id) = policy.pick_eviction(now, st.units.len(), candidates) else {
            return;
        };
        let Some(idx) = st.units.iter().position(|u| u.id == unit_id) else {
            return;
        };
        let mut unit = st.units.remove(idx);
        drop(unit.destroy(&mut st.counters, &PoolError::Shutdown));
        info!(pool = %self.id, unit_id, size = st.units.len(), "Scaling down");
        self.events.emit(PoolEvent::ScalingDown { unit_id });
    }

    fn stats(&self) -> ReusablePoolStats {
        let st = self.state.lock();
        let count = |state: UnitState| st.units.iter().filter(|u| u.state == state).count();
        ReusablePoolStats {
            total_threads: st.units.len(),
            idle_threads: count(UnitState::Idle),
            busy_threads: count(UnitState::Busy),
            starting_threads: count(UnitState::Starting),
            pending_tasks: st.pending(),
            threads: st.units.iter().map(ReusableUnit::stats).collect(),
            submitted_tasks: st.counters.submitted,
            completed_tasks: st.counters.completed,
            failed_tasks: st.counters.failed,
            aborted_tasks: st.counters.aborted,
        }
    }

    fn begin_close(&self, error: PoolError) -> Vec<oneshot::Receiver<()>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.closed.is_some() {
            return Vec::new();
        }
        st.scaling = None;
        let mut exits = Vec::with_capacity(st.units.len());
        for mut unit in st.units.drain(..) {
            if let Some(exited) = unit.destroy(&mut st.counters, &error) {
                exits.push(exited);
            }
        }
        info!(pool = %self.id, units = exits.len(), reason = %error, "Closing reusable pool");
        st.closed = Some(error);
        self.events.emit(PoolEvent::Shutdown);
        exits
    }
}

impl Orchestrator for ReusableShared {
    fn on_unit_event(&self, event: UnitEvent) {
        let UnitEvent {
            unit_id,
            context,
            kind,
        } = event;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.closed.is_some() {
            return;
        }
        let Some(idx) = st.units.iter().position(|u| u.context_id() == Some(context)) else {
            return;
        };

        match kind {
            UnitEventKind::Ready => {
                let unit = &mut st.units[idx];
                if unit.state != UnitState::Starting {
                    return;
                }
                unit.state = UnitState::Idle;
                unit.idle_since = Some(Instant::now());
                debug!(pool = %self.id, unit_id, queued = unit.queue.len(), "Execution unit ready");
                self.events.emit(PoolEvent::UnitReady { unit_id });
                self.drain(st, idx);
            }
            UnitEventKind::InitFailed(reason) => {
                warn!(pool = %self.id, unit_id, reason = %reason, "Execution unit failed to initialize");
                self.events.emit(PoolEvent::Error {
                    subsystem: "unit-bootstrap",
                    unit_id: Some(unit_id),
                    error: PoolError::UnitInit { unit_id, reason },
                });
            }
            UnitEventKind::Log(message) => {
                self.events.emit(PoolEvent::UnitLog { unit_id, message });
            }
            UnitEventKind::TaskMessage { task_id, message } => {
                let owned = st.units[idx]
                    .current
                    .as_ref()
                    .is_some_and(|f| f.task_id == task_id && !f.is_settled());
                if owned {
                    self.events.emit(PoolEvent::TaskMessage { task_id, message });
                }
            }
            UnitEventKind::Completed { task_id, outcome } => self.complete(st, idx, task_id, outcome),
            UnitEventKind::Exited(exit) => self.respawn(st, idx, exit),
        }
    }

    fn on_tick(&self, now: Instant) -> Result<(), PoolError> {
        let mut guard = self.state.lock();
        if guard.closed.is_none() {
            self.evict_idle(&mut guard, now);
        }
        Ok(())
    }

    fn report(&self, subsystem: &'static str, error: PoolError) {
        warn!(pool = %self.id, subsystem, error = %error, "Pool error");
        self.events.emit(PoolEvent::Error {
            subsystem,
            unit_id: None,
            error,
        });
    }
}

/// A single persistent unit that runs tasks from its own FIFO queue.
///
/// Must be constructed inside a tokio runtime.
pub struct ReusableThread {
    core: ReusableCore,
}

impl ReusableThread {
    /// Launch the unit.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad settings or unknown imports, `Internal` if the
    /// thread cannot be spawned.
    pub fn new(config: &UnitConfig, registry: WorkRegistry) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        Ok(Self {
            core: ReusableCore::start(config, registry, 1, None)?,
        })
    }

    /// Queue `work`; it runs once every earlier task has finished. Priority
    /// is ignored.
    pub fn run(&self, work: &str, data: Value, options: SubmitOptions) -> TaskHandle {
        self.core.submit(work, data, options)
    }

    /// State, queue length and current task of the unit.
    #[must_use]
    pub fn stats(&self) -> ThreadStats {
        let stats = self.core.stats();
        stats.threads.into_iter().next().unwrap_or(ThreadStats {
            unit_id: 0,
            state: UnitState::Dead,
            queue_length: 0,
            current_task: None,
        })
    }

    /// Subscribe to the unit's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.core.subscribe()
    }

    /// Reject all queued and running tasks with `Destroyed` and tear the unit
    /// down. Idempotent.
    pub async fn destroy(&self) {
        self.core.close(PoolError::Destroyed).await;
    }

    /// Same teardown as [`destroy`](Self::destroy).
    pub async fn terminate(&self) {
        self.destroy().await;
    }
}

impl Drop for ReusableThread {
    fn drop(&mut self) {
        self.core.close_now(PoolError::Destroyed);
    }
}

impl std::fmt::Debug for ReusableThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusableThread")
            .field("id", &self.core.id())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::abort::AbortToken;
    use crate::util::serde::Priority;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn queued_entry(id: TaskId, token: AbortToken) -> (TaskHandle, TaskEntry) {
        let (handle, settle) = TaskHandle::pending(id, token.clone());
        let entry = TaskEntry::new(id, "echo".into(), json!(id), Priority::Normal, token, settle);
        (handle, entry)
    }

    #[tokio::test]
    async fn test_runs_in_fifo_order() {
        let registry = WorkRegistry::new().register("echo", |data, _| Ok(data));
        let thread = ReusableThread::new(&UnitConfig::default(), registry).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|i| thread.run("echo", json!(i), SubmitOptions::default()))
            .collect();
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3)]);
        assert_eq!(thread.stats().queue_length, 0);
        thread.destroy().await;
    }

    #[tokio::test]
    async fn test_crash_rejects_current_and_keeps_queue() {
        let crashed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&crashed);
        let registry = WorkRegistry::new()
            .register("crash_once", move |_, _| {
                if !flag.swap(true, Ordering::SeqCst) {
                    panic!("first call dies");
                }
                Ok(json!("survived"))
            })
            .register("echo", |data, _| Ok(data));
        let thread = ReusableThread::new(&UnitConfig::default(), registry).unwrap();

        let first = thread.run("crash_once", Value::Null, SubmitOptions::default());
        let second = thread.run("echo", json!("queued"), SubmitOptions::default());
        assert!(matches!(first.await, Err(PoolError::UnitCrashed { .. })));
        assert_eq!(second.await.unwrap(), json!("queued"));
        assert!(crashed.load(Ordering::SeqCst));
        thread.terminate().await;
    }

    #[tokio::test]
    async fn test_destroy_rejects_outstanding() {
        let registry = WorkRegistry::new().register("slow", |_, ctx| {
            ctx.sleep(Duration::from_secs(2));
            Ok(Value::Null)
        });
        let thread = ReusableThread::new(&UnitConfig::default(), registry).unwrap();
        let running = thread.run("slow", Value::Null, SubmitOptions::default());
        let queued = thread.run("slow", Value::Null, SubmitOptions::default());
        thread.destroy().await;
        thread.destroy().await;
        assert_eq!(running.await, Err(PoolError::Destroyed));
        assert_eq!(queued.await, Err(PoolError::Destroyed));
        assert_eq!(
            thread.run("slow", Value::Null, SubmitOptions::default()).await,
            Err(PoolError::Destroyed)
        );
    }

    #[tokio::test]
    async fn test_drain_drops_aborted_and_keeps_queue_on_vanished_unit() {
        let registry = WorkRegistry::new().register("echo", |data, _| Ok(data));
        let core = ReusableCore::start(&UnitConfig::default(), registry, 0, None).unwrap();
        let fired = AbortToken::new();
        fired.abort();
        let (dropped, dropped_entry) = queued_entry(1, fired);
        let (_second, second_entry) = queued_entry(2, AbortToken::new());
        let (_third, third_entry) = queued_entry(3, AbortToken::new());

        {
            let mut st = core.shared.state.lock();
            st.units.push(ReusableUnit {
                id: 4,
                state: UnitState::Idle,
                context: Some(UnitContext::closed(9)),
                queue: VecDeque::from([dropped_entry, second_entry, third_entry]),
                current: None,
                idle_since: Some(Instant::now()),
            });
            core.shared.drain(&mut st, 0);

            let unit = &st.units[0];
            assert_eq!(unit.state, UnitState::Starting);
            assert!(unit.current.is_none());
            let queued: Vec<_> = unit.queue.iter().map(|e| e.id).collect();
            assert_eq!(queued, vec![2, 3]);
            assert_eq!(st.counters.aborted, 1);
        }
        assert_eq!(dropped.await, Err(PoolError::DispatchDropped(1)));

        let stats = core.stats();
        assert_eq!((stats.starting_threads, stats.pending_tasks), (1, 2));
        core.close_now(PoolError::Shutdown);
    }
}
