//! Queue infrastructure backing the pools.

pub mod queue;
