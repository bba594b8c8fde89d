//! # Prometheus Task Pool
//!
//! Thread-isolated task pools with priority dispatch, crash recovery and
//! elastic sizing.
//!
//! Work runs on execution units: dedicated OS threads that share no mutable
//! state with the caller. Work is registered by name in a [`WorkRegistry`]
//! and submitted with a `serde_json::Value` payload; results come back
//! through an awaitable [`TaskHandle`].
//!
//! ## Pool flavors
//!
//! - [`ThreadPool`]: fixed size, `high`/`normal`/`low` priority buckets,
//!   crashed units replaced.
//! - [`ReusableThread`] / [`ReusableThreadPool`]: persistent units with their
//!   own FIFO queue that respawn after a crash and keep their backlog.
//! - [`AutoScalingPool`] / [`AutoScalingReusablePool`]: grow under load up to
//!   `max`, evict idle units down to `min` on a periodic control loop.
//! - [`Thread`] / [`Task`]: one fresh unit per invocation.
//!
//! ```rust,ignore
//! use prometheus_task_pool::{PoolConfig, Priority, SubmitOptions, ThreadPool, WorkRegistry};
//! use serde_json::json;
//!
//! let registry = WorkRegistry::new().register_typed("sum", |n: u64, _ctx| Ok((0..n).sum::<u64>()));
//! let pool = ThreadPool::new(&PoolConfig::new().with_size(4), registry)?;
//!
//! let handle = pool.submit("sum", json!(1_000_000), SubmitOptions::new().with_priority(Priority::High));
//! let total = handle.await?;
//! pool.shutdown().await;
//! ```
//!
//! Cancellation is cooperative: aborting a queued task removes it, aborting a
//! running one settles the handle with [`PoolError::RunAborted`] and signals
//! the work through [`WorkContext::is_cancelled`]. Work that never checks
//! keeps its unit busy until it returns.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct pools from configuration.
pub mod builders;
/// Configuration models for pools, units, and autoscaling.
pub mod config;
/// Execution units, task bookkeeping and pool flavors.
pub mod core;
/// Queue infrastructure backing the pools.
pub mod infra;
/// Shared utilities.
pub mod util;

pub use crate::builders::PoolBuilder;
pub use crate::config::{AutoScaleConfig, PoolConfig, UnitConfig};
pub use crate::core::{
    AbortToken, AppResult, AutoScalingPool, AutoScalingReusablePool, PoolError, PoolEvent, PoolStats,
    ReusablePoolStats, ReusableThread, ReusableThreadPool, RunOptions, ScalingPolicy, SubmitOptions, Task,
    TaskHandle, TaskResult, Thread, ThreadPool, ThreadStats, UnitExit, UnitState, WorkContext, WorkRegistry,
};
pub use crate::infra::queue::PendingCounts;
pub use crate::util::serde::{Priority, TaskId, UnitId};
pub use crate::util::telemetry::init_tracing;
