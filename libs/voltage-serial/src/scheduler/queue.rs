//! Deadline ordered queue

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// Queued entry with its due time
#[derive(Debug, Clone)]
pub struct ScheduledItem<T> {
    pub data: T,
    pub deadline: Instant,
}

impl<T: Ord> PartialEq for ScheduledItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for ScheduledItem<T> {}

impl<T: Ord> PartialOrd for ScheduledItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for ScheduledItem<T> {
    // BinaryHeap pops the greatest item: earliest deadline first, then the smallest entry
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.data.cmp(&self.data))
    }
}

/// Min-deadline priority queue
#[derive(Debug)]
pub struct PriorityQueueSchedule<T: Ord> {
    entries: BinaryHeap<ScheduledItem<T>>,
}

impl<T: Ord> Default for PriorityQueueSchedule<T> {
    fn default() -> Self {
        Self {
            entries: BinaryHeap::new(),
        }
    }
}

impl<T: Ord> PriorityQueueSchedule<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add_entry(&mut self, data: T, deadline: Instant) {
        self.entries.push(ScheduledItem { data, deadline });
    }

    /// Earliest deadline, `None` when the queue is empty
    pub fn deadline(&self) -> Option<Instant> {
        self.entries.peek().map(|item| item.deadline)
    }

    pub fn top(&self) -> Option<&ScheduledItem<T>> {
        self.entries.peek()
    }

    pub fn pop(&mut self) -> Option<ScheduledItem<T>> {
        self.entries.pop()
    }

    pub fn has_ready_items(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    pub fn contains(&self, data: &T) -> bool {
        self.entries.iter().any(|item| &item.data == data)
    }

    pub fn remove(&mut self, data: &T) {
        self.entries.retain(|item| &item.data != data);
    }
}
