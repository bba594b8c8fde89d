//! In-memory priority buckets: strict priority across classes, FIFO within.

use std::collections::VecDeque;

use serde::Serialize;

use crate::core::task::TaskEntry;
use crate::util::serde::{Priority, TaskId};

/// Pending task counts per priority class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Tasks waiting in the `high` bucket.
    pub high: usize,
    /// Tasks waiting in the `normal` bucket.
    pub normal: usize,
    /// Tasks waiting in the `low` bucket.
    pub low: usize,
}

impl PendingCounts {
    /// Sum over all classes.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// Three FIFO queues, one per priority class. Enqueue and pop are O(1).
#[derive(Debug, Default)]
pub(crate) struct PriorityBuckets {
    buckets: [VecDeque<TaskEntry>; 3],
}

impl PriorityBuckets {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: TaskEntry) {
        self.buckets[entry.priority.bucket()].push_back(entry);
    }

    /// Put an entry back at the head of its class.
    pub(crate) fn push_front(&mut self, entry: TaskEntry) {
        self.buckets[entry.priority.bucket()].push_front(entry);
    }

    /// Pop from `high`, else `normal`, else `low`.
    pub(crate) fn pop(&mut self) -> Option<TaskEntry> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Remove a queued entry by id.
    pub(crate) fn remove(&mut self, id: TaskId) -> Option<TaskEntry> {
        self.buckets.iter_mut().find_map(|bucket| {
            let idx = bucket.iter().position(|entry| entry.id == id)?;
            bucket.remove(idx)
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub(crate) fn counts(&self) -> PendingCounts {
        PendingCounts {
            high: self.buckets[Priority::High.bucket()].len(),
            normal: self.buckets[Priority::Normal.bucket()].len(),
            low: self.buckets[Priority::Low.bucket()].len(),
        }
    }

    /// Take every entry out, highest class first.
    pub(crate) fn drain(&mut self) -> Vec<TaskEntry> {
        self.buckets.iter_mut().flat_map(std::mem::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::abort::AbortToken;
    use crate::core::task::TaskHandle;
    use serde_json::Value;

    fn make_entry(id: TaskId, priority: Priority) -> TaskEntry {
        let token = AbortToken::new();
        let (_handle, settle) = TaskHandle::pending(id, token.clone());
        TaskEntry::new(id, "work".into(), Value::Null, priority, token, settle)
    }

    #[test]
    fn test_priority_ordering() {
        let mut q = PriorityBuckets::new();
        q.push(make_entry(1, Priority::Low));
        q.push(make_entry(2, Priority::Normal));
        q.push(make_entry(3, Priority::High));
        q.push(make_entry(4, Priority::Normal));

        let order: Vec<_> = std::iter::from_fn(|| q.pop()).map(|e| e.id).collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_and_counts() {
        let mut q = PriorityBuckets::new();
        q.push(make_entry(1, Priority::High));
        q.push(make_entry(2, Priority::Low));
        q.push(make_entry(3, Priority::Low));
        assert_eq!(q.counts(), PendingCounts { high: 1, normal: 0, low: 2 });

        assert_eq!(q.remove(2).map(|e| e.id), Some(2));
        assert!(q.remove(2).is_none());
        assert_eq!(q.len(), 2);
        assert_eq!(q.counts().total(), 2);
    }

    #[test]
    fn test_push_front_restores_head() {
        let mut q = PriorityBuckets::new();
        q.push(make_entry(1, Priority::Normal));
        q.push(make_entry(2, Priority::Normal));
        let head = q.pop().unwrap();
        q.push_front(head);
        assert_eq!(q.pop().map(|e| e.id), Some(1));
    }

    #[test]
    fn test_drain_empties_all_buckets() {
        let mut q = PriorityBuckets::new();
        q.push(make_entry(1, Priority::Low));
        q.push(make_entry(2, Priority::High));
        let drained: Vec<_> = q.drain().into_iter().map(|e| e.id).collect();
        assert_eq!(drained, vec![2, 1]);
        assert_eq!(q.len(), 0);
    }
}
