//! Builders that assemble pools from a registry and configuration.

pub mod pool_builder;

pub use pool_builder::PoolBuilder;
