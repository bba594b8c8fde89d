//! Core scheduling: execution units, task bookkeeping and the pool flavors.

pub mod abort;
pub mod autoscale;
pub mod error;
pub mod events;
pub mod fixed_pool;
pub mod oneshot;
pub(crate) mod reactor;
pub mod registry;
pub mod reusable;
pub mod reusable_pool;
pub mod task;
pub(crate) mod unit;

pub use abort::{AbortToken, ListenerId};
pub use autoscale::{AutoScalingPool, AutoScalingReusablePool, ScalingPolicy};
pub use error::{AppResult, PoolError};
pub use events::{PoolEvent, DEFAULT_EVENT_CAPACITY};
pub use fixed_pool::{PoolStats, ThreadPool};
pub use oneshot::{RunOptions, Task, Thread};
pub use registry::{ModuleFn, WorkContext, WorkFn, WorkRegistry};
pub use reusable::{ReusablePoolStats, ReusableThread, ThreadStats};
pub use reusable_pool::ReusableThreadPool;
pub use task::{SubmitOptions, TaskHandle, TaskResult};
pub use unit::{UnitExit, UnitState};
