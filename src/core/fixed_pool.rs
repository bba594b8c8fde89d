//! Fixed-size pool of execution units fed from three priority buckets.
//!
//! The pool keeps a static number of units; a unit that exits unexpectedly is
//! replaced and the task it was running is rejected with
//! [`PoolError::UnitCrashed`]. With a [`ScalingPolicy`] attached the same core
//! backs [`AutoScalingPool`](crate::core::AutoScalingPool).

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PoolConfig, UnitConfig};
use crate::core::autoscale::ScalingPolicy;
use crate::core::error::PoolError;
use crate::core::events::{EventBus, PoolEvent};
use crate::core::reactor::{Orchestrator, Reactor};
use crate::core::registry::WorkRegistry;
use crate::core::task::{collect_in_order, InFlight, SubmitOptions, TaskCounters, TaskEntry, TaskHandle};
use crate::core::unit::{wait_for_exits, UnitContext, UnitEvent, UnitEventKind, UnitExit, UnitFactory, UnitState};
use crate::infra::queue::{PendingCounts, PriorityBuckets};
use crate::util::serde::{TaskId, UnitId};

/// Snapshot of a fixed or autoscaling pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Units owned by the pool, in any state.
    pub total_workers: usize,
    /// Units waiting for work.
    pub idle_workers: usize,
    /// Units executing a task.
    pub busy_workers: usize,
    /// Units still bootstrapping.
    pub starting_workers: usize,
    /// Units whose thread is gone and whose exit is not yet processed.
    pub dead_workers: usize,
    /// Queued tasks per priority class.
    pub pending: PendingCounts,
    /// Tasks accepted since construction.
    pub submitted_tasks: u64,
    /// Tasks that settled with a value.
    pub completed_tasks: u64,
    /// Tasks that settled with a non-abort error.
    pub failed_tasks: u64,
    /// Tasks that settled with an abort error.
    pub aborted_tasks: u64,
}

impl PoolStats {
    /// Total queued tasks.
    #[must_use]
    pub const fn pending_tasks(&self) -> usize {
        self.pending.total()
    }
}

#[derive(Debug)]
struct UnitSlot {
    id: UnitId,
    state: UnitState,
    context: UnitContext,
    in_flight: Option<InFlight>,
    idle_since: Option<Instant>,
}

#[derive(Debug)]
struct FixedState {
    units: Vec<UnitSlot>,
    queue: PriorityBuckets,
    next_task_id: TaskId,
    next_unit_id: UnitId,
    counters: TaskCounters,
    scaling: Option<ScalingPolicy>,
    shutting_down: bool,
}

pub(crate) struct FixedShared {
    id: Uuid,
    factory: UnitFactory,
    events: EventBus,
    shutdown_timeout: Duration,
    this: Weak<Self>,
    state: Mutex<FixedState>,
}

/// Statically sized pool with `high`/`normal`/`low` buckets.
///
/// Must be constructed and shut down inside a tokio runtime.
pub struct ThreadPool {
    shared: Arc<FixedShared>,
    reactor: Mutex<Option<Reactor>>,
}

impl ThreadPool {
    /// Start a pool of `config.size` units.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad settings or unknown imports, `Internal` if a
    /// thread cannot be spawned.
    pub fn new(config: &PoolConfig, registry: WorkRegistry) -> Result<Self, PoolError> {
        config.check()?;
        Self::start(&config.unit, registry, config.size, None)
    }

    pub(crate) fn start(
        unit: &UnitConfig,
        registry: WorkRegistry,
        initial: usize,
        scaling: Option<ScalingPolicy>,
    ) -> Result<Self, PoolError> {
        registry.validate_imports(&unit.imports)?;
        let (sink, events_rx) = unbounded::<UnitEvent>();
        let factory = UnitFactory::new(unit, registry, Arc::new(sink));

        let shared = Arc::new_cyclic(|this| FixedShared {
            id: Uuid::new_v4(),
            factory,
            events: EventBus::new(unit.event_capacity),
            shutdown_timeout: unit.shutdown_timeout(),
            this: this.clone(),
            state: Mutex::new(FixedState {
                units: Vec::with_capacity(initial),
                queue: PriorityBuckets::new(),
                next_task_id: 1,
                next_unit_id: 1,
                counters: TaskCounters::default(),
                scaling,
                shutting_down: false,
            }),
        });

        {
            let mut st = shared.state.lock();
            for _ in 0..initial {
                shared.add_unit(&mut st, Duration::ZERO)?;
            }
        }

        let interval = scaling.map(|policy| policy.check_interval);
        let reactor = Reactor::start(&unit.name, Arc::clone(&shared), events_rx, interval)?;

        info!(
            pool = %shared.id,
            name = %unit.name,
            size = initial,
            autoscaling = scaling.is_some(),
            "Thread pool started"
        );

        Ok(Self {
            shared,
            reactor: Mutex::new(Some(reactor)),
        })
    }

    /// Queue `work` with `data`. Never blocks; problems surface through the
    /// returned handle.
    pub fn submit(&self, work: &str, data: Value, options: SubmitOptions) -> TaskHandle {
        self.shared.submit(work, data, options)
    }

    /// Run `work` once per item and collect results in input order.
    ///
    /// # Errors
    ///
    /// The first error by input position, after every task has settled.
    pub async fn map<I>(&self, work: &str, items: I, options: &SubmitOptions) -> Result<Vec<Value>, PoolError>
    where
        I: IntoIterator<Item = Value>,
    {
        let handles = items
            .into_iter()
            .map(|item| self.submit(work, item, options.clone()))
            .collect();
        collect_in_order(handles).await
    }

    /// Run a batch of `(work, data)` jobs at normal priority and collect
    /// results in input order.
    ///
    /// # Errors
    ///
    /// The first error by input position, after every task has settled.
    pub async fn run_all<I, S>(&self, jobs: I) -> Result<Vec<Value>, PoolError>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let handles = jobs
            .into_iter()
            .map(|(work, data)| self.submit(work.as_ref(), data, SubmitOptions::default()))
            .collect();
        collect_in_order(handles).await
    }

    /// Current unit and queue snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Subscribe to the pool's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Identity used in this pool's log lines.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Stop delivering control-loop ticks.
    pub(crate) fn stop_control_loop(&self) {
        if let Some(reactor) = self.reactor.lock().as_ref() {
            reactor.stop_ticker();
        }
    }

    /// Reject every queued and running task with `Shutdown`, terminate all
    /// units and wait for them to exit up to the configured timeout.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let exits = self.shared.begin_shutdown();
        let reactor = self.reactor.lock().take();
        drop(reactor);
        if exits.is_empty() {
            return;
        }
        wait_for_exits(exits, self.shared.shutdown_timeout).await;
        info!(pool = %self.shared.id, "Thread pool shut down complete");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.shared.begin_shutdown().is_empty() {
            debug!(pool = %self.shared.id, "Thread pool dropped without explicit shutdown - units will be detached");
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl FixedShared {
    fn submit(&self, work: &str, data: Value, options: SubmitOptions) -> TaskHandle {
        if !self.factory.registry().contains(work) {
            return TaskHandle::rejected(PoolError::InvalidWork(work.to_string()));
        }
        let SubmitOptions { priority, abort } = options;
        let token = abort.unwrap_or_default();

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.shutting_down {
            return TaskHandle::rejected(PoolError::Shutdown);
        }

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

        st.queue.push(entry);
        debug!(pool = %self.id, task_id, %priority, "Task queued");
        self.events.emit(PoolEvent::TaskQueued { task_id, priority });
        self.dispatch(st);
        handle
    }

    fn abort_task(&self, task_id: TaskId) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if let Some(entry) = st.queue.remove(task_id) {
            debug!(pool = %self.id, task_id, "Task aborted from queue");
            st.counters.settle_entry(entry, Err(PoolError::QueueAborted));
            return;
        }
        let running = st
            .units
            .iter_mut()
            .find_map(|slot| slot.in_flight.as_mut().filter(|f| f.task_id == task_id));
        if let Some(in_flight) = running {
            debug!(pool = %self.id, task_id, "Task aborted while running");
            in_flight.cancel();
            st.counters.settle_in_flight(in_flight, Err(PoolError::RunAborted));
        }
    }

    /// Pair idle units with queued entries until one side runs out.
    fn dispatch(&self, st: &mut FixedState) {
        loop {
            let Some(idx) = st.units.iter().position(|u| u.state == UnitState::Idle) else {
                break;
            };
            let Some(entry) = st.queue.pop() else {
                break;
            };
            if entry.token.is_aborted() {
                let task_id = entry.id;
                st.counters.settle_entry(entry, Err(PoolError::DispatchDropped(task_id)));
                continue;
            }

            let slot = &mut st.units[idx];
            let (in_flight, command) = entry.start();
            let task_id = in_flight.task_id;
            match slot.context.send(command) {
                Ok(()) => {
                    slot.state = UnitState::Busy;
                    slot.idle_since = None;
                    slot.in_flight = Some(in_flight);
                    debug!(pool = %self.id, unit_id = slot.id, task_id, "Task dispatched");
                    self.events.emit(PoolEvent::TaskStart {
                        unit_id: slot.id,
                        task_id,
                    });
                }
                Err(command) => {
                    warn!(pool = %self.id, unit_id = slot.id, task_id, "Unit vanished before dispatch");
                    slot.state = UnitState::Dead;
                    if let Some(entry) = in_flight.requeue(command) {
                        st.queue.push_front(entry);
                    }
                }
            }
        }
        self.scale_up_if_saturated(st);
    }

    fn scale_up_if_saturated(&self, st: &mut FixedState) {
        let Some(policy) = st.scaling else {
            return;
        };
        if st.shutting_down {
            return;
        }
        let has_idle = st.units.iter().any(|u| u.state == UnitState::Idle);
        let from = st.units.len();
        if !policy.should_scale_up(st.queue.len(), has_idle, from) {
            return;
        }
        match self.add_unit(st, Duration::ZERO) {
            Ok(unit_id) => {
                let to = st.units.len();
                info!(pool = %self.id, unit_id, from, to, "Scaling up");
                self.events.emit(PoolEvent::ScalingUp { from, to });
            }
            Err(e) => self.report_launch_failure(e),
        }
    }

    fn add_unit(&self, st: &mut FixedState, delay: Duration) -> Result<UnitId, PoolError> {
        let unit_id = st.next_unit_id;
        st.next_unit_id += 1;
        let context = self.factory.launch(unit_id, delay)?;
        st.units.push(UnitSlot {
            id: unit_id,
            state: UnitState::Starting,
            context,
            in_flight: None,
            idle_since: None,
        });
        Ok(unit_id)
    }

    fn report_launch_failure(&self, e: PoolError) {
        error!(pool = %self.id, error = %e, "Failed to launch execution unit");
        self.events.emit(PoolEvent::Error {
            subsystem: "unit-launch",
            unit_id: None,
            error: e,
        });
    }

    fn complete(&self, st: &mut FixedState, idx: usize, task_id: TaskId, outcome: Result<Value, String>) {
        let slot = &mut st.units[idx];
        let Some(mut in_flight) = slot.in_flight.take_if(|f| f.task_id == task_id) else {
            warn!(pool = %self.id, unit_id = slot.id, task_id, "Completion for a task the unit does not own");
            return;
        };
        slot.state = UnitState::Idle;
        slot.idle_since = Some(Instant::now());
        let unit_id = slot.id;

        debug!(pool = %self.id, unit_id, task_id, ok = outcome.is_ok(), "Task completed");
        st.counters.settle_in_flight(&mut in_flight, outcome.map_err(PoolError::Work));
        drop(in_flight);
        self.events.emit(PoolEvent::TaskEnd { unit_id, task_id });
        self.dispatch(st);
    }

    fn unit_exited(&self, st: &mut FixedState, idx: usize, exit: UnitExit) {
        let slot = st.units.remove(idx);
        let unit_id = slot.id;
        if let Some(mut in_flight) = slot.in_flight {
            let error = PoolError::UnitCrashed {
                unit_id,
                reason: exit.reason(),
            };
            st.counters.settle_in_flight(&mut in_flight, Err(error));
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

        let below_floor = st.scaling.is_none_or(|policy| st.units.len() < policy.min);
        if below_floor {
            let delay = match exit {
                UnitExit::InitFailed(_) => self.factory.respawn_backoff(),
                UnitExit::Clean | UnitExit::Crashed(_) => Duration::ZERO,
            };
            match self.add_unit(st, delay) {
                Ok(replacement) => {
                    info!(pool = %self.id, unit_id, replacement, "Replacing execution unit");
                }
                Err(e) => self.report_launch_failure(e),
            }
        }
        self.dispatch(st);
    }

    fn evict_idle(&self, st: &mut FixedState, now: Instant) {
        let Some(policy) = st.scaling else {
            return;
        };
        let candidates = st
            .units
            .iter()
            .filter(|u| u.state == UnitState::Idle)
            .filter_map(|u| u.idle_since.map(|since| (u.id, since)));
        let Some(unit_id) = policy.pick_eviction(now, st.units.len(), candidates) else {
            return;
        };
        let Some(idx) = st.units.iter().position(|u| u.id == unit_id) else {
            return;
        };
        let mut slot = st.units.remove(idx);
        drop(slot.context.close());
        info!(pool = %self.id, unit_id, size = st.units.len(), "Scaling down");
        self.events.emit(PoolEvent::ScalingDown { unit_id });
    }

    fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        let count = |state: UnitState| st.units.iter().filter(|u| u.state == state).count();
        PoolStats {
            total_workers: st.units.len(),
            idle_workers: count(UnitState::Idle),
            busy_workers: count(UnitState::Busy),
            starting_workers: count(UnitState::Starting),
            dead_workers: count(UnitState::Dead),
            pending: st.queue.counts(),
            submitted_tasks: st.counters.submitted,
            completed_tasks: st.counters.completed,
            failed_tasks: st.counters.failed,
            aborted_tasks: st.counters.aborted,
        }
    }

    /// Reject everything, close every unit and hand back exit notifications.
    /// Returns nothing on repeated calls.
    fn begin_shutdown(&self) -> Vec<oneshot::Receiver<()>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.shutting_down {
            return Vec::new();
        }
        st.shutting_down = true;
        st.scaling = None;

        let queued = st.queue.drain();
        let rejected = queued.len();
        for entry in queued {
            st.counters.settle_entry(entry, Err(PoolError::Shutdown));
        }
        let mut exits = Vec::with_capacity(st.units.len());
        for mut slot in st.units.drain(..) {
            if let Some(mut in_flight) = slot.in_flight.take() {
                in_flight.cancel();
                st.counters.settle_in_flight(&mut in_flight, Err(PoolError::Shutdown));
            }
            if let Some(exited) = slot.context.close() {
                exits.push(exited);
            }
        }
        info!(pool = %self.id, units = exits.len(), rejected, "Shutting down thread pool");
        self.events.emit(PoolEvent::Shutdown);
        exits
    }
}

impl Orchestrator for FixedShared {
    fn on_unit_event(&self, event: UnitEvent) {
        let UnitEvent {
            unit_id,
            context,
            kind,
        } = event;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.shutting_down {
            return;
        }
        let Some(idx) = st.units.iter().position(|u| u.context.id() == context) else {
            if let UnitEventKind::Exited(exit) = kind {
                self.events.emit(PoolEvent::UnitExit { unit_id, exit });
            }
            return;
        };

        match kind {
            UnitEventKind::Ready => {
                let slot = &mut st.units[idx];
                if slot.state != UnitState::Starting {
                    return;
                }
                slot.state = UnitState::Idle;
                slot.idle_since = Some(Instant::now());
                debug!(pool = %self.id, unit_id, "Execution unit ready");
                self.events.emit(PoolEvent::UnitReady { unit_id });
                self.dispatch(st);
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
                    .in_flight
                    .as_ref()
                    .is_some_and(|f| f.task_id == task_id && !f.is_settled());
                if owned {
                    self.events.emit(PoolEvent::TaskMessage { task_id, message });
                }
            }
            UnitEventKind::Completed { task_id, outcome } => self.complete(st, idx, task_id, outcome),
            UnitEventKind::Exited(exit) => self.unit_exited(st, idx, exit),
        }
    }

    fn on_tick(&self, now: Instant) -> Result<(), PoolError> {
        let mut guard = self.state.lock();
        if !guard.shutting_down {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::abort::AbortToken;
    use crate::util::serde::Priority;
    use serde_json::json;

    fn queued_entry(id: TaskId, token: AbortToken) -> (TaskHandle, TaskEntry) {
        let (handle, settle) = TaskHandle::pending(id, token.clone());
        let entry = TaskEntry::new(id, "echo".into(), json!(id), Priority::Normal, token, settle);
        (handle, entry)
    }

    fn vanished_slot(id: UnitId) -> UnitSlot {
        UnitSlot {
            id,
            state: UnitState::Idle,
            context: UnitContext::closed(id),
            in_flight: None,
            idle_since: Some(Instant::now()),
        }
    }

    fn registry() -> WorkRegistry {
        WorkRegistry::new()
            .register("echo", |data, _| Ok(data))
            .register("fail", |_, _| Err(anyhow::anyhow!("bad input")))
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let pool = ThreadPool::new(&PoolConfig::new().with_size(2), registry()).unwrap();
        let value = pool.submit("echo", json!({"x": 1}), SubmitOptions::default()).await.unwrap();
        assert_eq!(value, json!({"x": 1}));

        let err = pool.submit("fail", Value::Null, SubmitOptions::default()).await.unwrap_err();
        assert_eq!(err, PoolError::Work("bad input".into()));

        let stats = pool.stats();
        assert_eq!(stats.total_workers, 2);
        assert_eq!((stats.submitted_tasks, stats.completed_tasks, stats.failed_tasks), (2, 1, 1));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_work_is_rejected_without_id() {
        let pool = ThreadPool::new(&PoolConfig::new().with_size(1), registry()).unwrap();
        let handle = pool.submit("missing", Value::Null, SubmitOptions::default());
        assert_eq!(handle.id(), None);
        assert_eq!(handle.await, Err(PoolError::InvalidWork("missing".into())));
        assert_eq!(pool.stats().submitted_tasks, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_import_is_invalid_config() {
        let err = ThreadPool::new(&PoolConfig::new().with_size(1).with_imports(["gpu"]), registry()).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(msg) if msg.contains("gpu")));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = ThreadPool::new(&PoolConfig::new().with_size(1), registry()).unwrap();
        pool.shutdown().await;
        pool.shutdown().await;
        let result = pool.submit("echo", json!(1), SubmitOptions::default()).await;
        assert_eq!(result, Err(PoolError::Shutdown));
        assert_eq!(pool.stats().total_workers, 0);
    }

    #[tokio::test]
    async fn test_dispatch_drops_aborted_and_requeues_on_vanished_unit() {
        let pool = ThreadPool::start(&UnitConfig::default(), registry(), 0, None).unwrap();
        let fired = AbortToken::new();
        fired.abort();
        let (dropped, dropped_entry) = queued_entry(1, fired);
        let (_second, second_entry) = queued_entry(2, AbortToken::new());
        let (_third, third_entry) = queued_entry(3, AbortToken::new());

        {
            let mut st = pool.shared.state.lock();
            st.units.push(vanished_slot(7));
            st.queue.push(dropped_entry);
            st.queue.push(second_entry);
            st.queue.push(third_entry);
            pool.shared.dispatch(&mut st);

            assert_eq!(st.units[0].state, UnitState::Dead);
            assert!(st.units[0].in_flight.is_none());
            assert_eq!(st.counters.aborted, 1);
            assert_eq!(st.queue.len(), 2);
        }
        assert_eq!(dropped.await, Err(PoolError::DispatchDropped(1)));

        let stats = pool.stats();
        assert_eq!((stats.total_workers, stats.dead_workers, stats.idle_workers), (1, 1, 0));
        assert_eq!(stats.pending_tasks(), 2);

        let mut st = pool.shared.state.lock();
        let order: Vec<_> = std::iter::from_fn(|| st.queue.pop()).map(|e| e.id).collect();
        assert_eq!(order, vec![2, 3]);
    }
}
