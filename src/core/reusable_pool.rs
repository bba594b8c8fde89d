//! Pool of reusable units with least-loaded dispatch.

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::core::error::PoolError;
use crate::core::events::PoolEvent;
use crate::core::registry::WorkRegistry;
use crate::core::reusable::{ReusableCore, ReusablePoolStats, ReusableUnit};
use crate::core::task::{collect_in_order, SubmitOptions, TaskHandle};
use crate::core::unit::UnitState;

/// Pick the unit a new task should queue on: an idle unit if any, else the
/// shortest queue. Round-robin breaks the tie only when every queue has the
/// same length.
pub(crate) fn select_unit(units: &[ReusableUnit], round_robin: &mut usize) -> Option<usize> {
    if units.is_empty() {
        return None;
    }
    if let Some(idx) = units
        .iter()
        .position(|u| u.state == UnitState::Idle && u.queue_len() == 0)
    {
        return Some(idx);
    }
    let shortest = units.iter().map(ReusableUnit::queue_len).min()?;
    let all_equal = units.iter().all(|u| u.queue_len() == shortest);
    if all_equal {
        let idx = *round_robin % units.len();
        *round_robin = round_robin.wrapping_add(1);
        return Some(idx);
    }
    units.iter().position(|u| u.queue_len() == shortest)
}

/// Fixed set of reusable units. Each unit owns its queue, so priority is
/// ignored and a crashed unit resumes its own backlog after respawning.
///
/// Must be constructed and shut down inside a tokio runtime.
pub struct ReusableThreadPool {
    core: ReusableCore,
}

impl ReusableThreadPool {
    /// Start `config.size` reusable units.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad settings or unknown imports, `Internal` if a
    /// thread cannot be spawned.
    pub fn new(config: &PoolConfig, registry: WorkRegistry) -> Result<Self, PoolError> {
        config.check()?;
        Ok(Self {
            core: ReusableCore::start(&config.unit, registry, config.size, None)?,
        })
    }

    /// Queue `work` on the least-loaded unit.
    pub fn run(&self, work: &str, data: Value, options: SubmitOptions) -> TaskHandle {
        self.core.submit(work, data, options)
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
            .map(|item| self.run(work, item, options.clone()))
            .collect();
        collect_in_order(handles).await
    }

    /// Totals by state plus per-unit snapshots.
    #[must_use]
    pub fn stats(&self) -> ReusablePoolStats {
        self.core.stats()
    }

    /// Subscribe to the pool's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.core.subscribe()
    }

    /// Identity used in this pool's log lines.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.core.id()
    }

    /// Reject outstanding tasks with `Shutdown` and tear every unit down.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.core.close(PoolError::Shutdown).await;
    }
}

impl Drop for ReusableThreadPool {
    fn drop(&mut self) {
        self.core.close_now(PoolError::Shutdown);
    }
}

impl std::fmt::Debug for ReusableThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusableThreadPool")
            .field("id", &self.core.id())
            .field("stats", &self.stats())
            .finish()
    }
}
