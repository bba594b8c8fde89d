//! Configuration models for pools, units, and autoscaling.

pub mod pool;

pub use pool::{AutoScaleConfig, PoolConfig, UnitConfig};
