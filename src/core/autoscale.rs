//! Elastic pools: reactive scale-up under load, timer-driven scale-down.
//!
//! Both flavors start at `min` units. After every dispatch pass a pool with
//! pending work, no idle unit and fewer than `max` units grows by one. Every
//! `check_interval` the control loop evicts at most one unit, the one idle
//! the longest, provided it has been idle for `idle_timeout` and the pool is
//! above `min`.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::AutoScaleConfig;
use crate::core::error::PoolError;
use crate::core::events::PoolEvent;
use crate::core::fixed_pool::{PoolStats, ThreadPool};
use crate::core::registry::WorkRegistry;
use crate::core::reusable::{ReusableCore, ReusablePoolStats};
use crate::core::task::{collect_in_order, SubmitOptions, TaskHandle};
use crate::util::serde::UnitId;

/// Sizing rules shared by both autoscaling flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    /// Floor; also the initial size.
    pub min: usize,
    /// Ceiling.
    pub max: usize,
    /// How long a unit must sit idle before it may be evicted.
    pub idle_timeout: Duration,
    /// Control-loop period.
    pub check_interval: Duration,
}

impl ScalingPolicy {
    /// Policy described by `config`.
    #[must_use]
    pub const fn from_config(config: &AutoScaleConfig) -> Self {
        Self {
            min: config.min,
            max: config.max,
            idle_timeout: config.idle_timeout(),
            check_interval: config.check_interval(),
        }
    }

    /// Grow only when work is waiting and no unit can take it.
    #[must_use]
    pub const fn should_scale_up(&self, pending: usize, has_idle: bool, size: usize) -> bool {
        pending > 0 && !has_idle && size < self.max
    }

    /// Choose the unit to evict this tick, if any. `idle` yields
    /// `(unit, idle_since)` for every idle unit.
    pub fn pick_eviction<I>(&self, now: Instant, size: usize, idle: I) -> Option<UnitId>
    where
        I: IntoIterator<Item = (UnitId, Instant)>,
    {
        if size <= self.min {
            return None;
        }
        idle.into_iter()
            .filter(|(_, since)| now.saturating_duration_since(*since) >= self.idle_timeout)
            .min_by_key(|(_, since)| *since)
            .map(|(unit_id, _)| unit_id)
    }
}

/// Fixed pool with priority buckets that resizes between `min` and `max`.
///
/// A unit that exits unexpectedly is replaced only when the pool would
/// otherwise fall below `min`.
pub struct AutoScalingPool {
    pool: ThreadPool,
    policy: ScalingPolicy,
}

impl AutoScalingPool {
    /// Start `config.min` units and the control loop.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad settings or unknown imports, `Internal` if a
    /// thread cannot be spawned.
    pub fn new(config: &AutoScaleConfig, registry: WorkRegistry) -> Result<Self, PoolError> {
        config.check()?;
        let policy = ScalingPolicy::from_config(config);
        let pool = ThreadPool::start(&config.unit, registry, policy.min, Some(policy))?;
        Ok(Self { pool, policy })
    }

    /// Queue `work` with `data`; may trigger a scale-up.
    pub fn submit(&self, work: &str, data: Value, options: SubmitOptions) -> TaskHandle {
        self.pool.submit(work, data, options)
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
        self.pool.map(work, items, options).await
    }

    /// Run a batch of `(work, data)` jobs and collect results in input order.
    ///
    /// # Errors
    ///
    /// The first error by input position, after every task has settled.
    pub async fn run_all<I, S>(&self, jobs: I) -> Result<Vec<Value>, PoolError>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        self.pool.run_all(jobs).await
    }

    /// Current unit and queue snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Sizing rules in effect.
    #[must_use]
    pub const fn policy(&self) -> ScalingPolicy {
        self.policy
    }

    /// Subscribe to the pool's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    /// Identity used in this pool's log lines.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.pool.id()
    }

    /// Stop the control loop, then shut the pool down.
    pub async fn shutdown(&self) {
        self.pool.stop_control_loop();
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for AutoScalingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScalingPool")
            .field("policy", &self.policy)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Reusable pool that resizes between `min` and `max`. Respawning units keep
/// the floor on their own.
pub struct AutoScalingReusablePool {
    core: ReusableCore,
    policy: ScalingPolicy,
}

impl AutoScalingReusablePool {
    /// Start `config.min` reusable units and the control loop.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad settings or unknown imports, `Internal` if a
    /// thread cannot be spawned.
    pub fn new(config: &AutoScaleConfig, registry: WorkRegistry) -> Result<Self, PoolError> {
        config.check()?;
        let policy = ScalingPolicy::from_config(config);
        let core = ReusableCore::start(&config.unit, registry, policy.min, Some(policy))?;
        Ok(Self { core, policy })
    }

    /// Queue `work` on the least-loaded unit; may trigger a scale-up.
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

    /// Sizing rules in effect.
    #[must_use]
    pub const fn policy(&self) -> ScalingPolicy {
        self.policy
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

    /// Stop the control loop, then reject outstanding tasks with `Shutdown`
    /// and tear every unit down.
    pub async fn shutdown(&self) {
        self.core.stop_control_loop();
        self.core.close(PoolError::Shutdown).await;
    }
}

impl Drop for AutoScalingReusablePool {
    fn drop(&mut self) {
        self.core.close_now(PoolError::Shutdown);
    }
}

impl std::fmt::Debug for AutoScalingReusablePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScalingReusablePool")
            .field("id", &self.core.id())
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min: usize, max: usize) -> ScalingPolicy {
        ScalingPolicy {
            min,
            max,
            idle_timeout: Duration::from_millis(50),
            check_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_scale_up_needs_pending_and_no_idle() {
        let p = policy(1, 3);
        assert!(p.should_scale_up(1, false, 1));
        assert!(!p.should_scale_up(0, false, 1));
        assert!(!p.should_scale_up(4, true, 1));
        assert!(!p.should_scale_up(4, false, 3));
    }

    #[test]
    fn test_eviction_picks_oldest_eligible() {
        let p = policy(1, 4);
        let now = Instant::now();
        let idle = vec![
            (1, now.checked_sub(Duration::from_millis(60)).unwrap()),
            (2, now.checked_sub(Duration::from_millis(200)).unwrap()),
            (3, now.checked_sub(Duration::from_millis(10)).unwrap()),
        ];
        assert_eq!(p.pick_eviction(now, 3, idle.clone()), Some(2));
        assert_eq!(p.pick_eviction(now, 1, idle), None);
    }

    #[test]
    fn test_eviction_requires_full_idle_window() {
        let p = policy(1, 4);
        let now = Instant::now();
        let fresh = vec![(7, now.checked_sub(Duration::from_millis(49)).unwrap())];
        assert_eq!(p.pick_eviction(now, 2, fresh), None);
        let stale = vec![(7, now.checked_sub(Duration::from_millis(50)).unwrap())];
        assert_eq!(p.pick_eviction(now, 2, stale), Some(7));
    }
}
