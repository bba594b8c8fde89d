//! Pending-task queues.

pub mod memory;

pub use memory::PendingCounts;
pub(crate) use memory::PriorityBuckets;
