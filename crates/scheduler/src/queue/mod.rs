//! Queues holding tasks that are eligible for execution.
//!
//! Both queues are safe to share between threads and support a bounded
//! `poll`, so worker loops can notice shutdown without being interrupted.

mod bucketed;
mod fifo;

use std::time::Duration;

pub use bucketed::BucketedQueue;
pub use fifo::FifoQueue;

/// A concurrent queue of runnable items.
pub trait TaskQueue<T>: Send + Sync {
    /// Add an item to the queue.
    fn add(&self, item: T);

    /// Take the next item, waiting at most `timeout` for one to arrive.
    fn poll(&self, timeout: Duration) -> Option<T>;

    /// Remove a specific item. Returns false if it was not queued or if the
    /// queue does not support removal.
    fn remove(&self, item: &T) -> bool;

    /// Approximate number of queued items.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A queue ordered by a comparator that can also hand out only items
/// strictly less than a bound.
pub trait NavigableTaskQueue<T>: TaskQueue<T> {
    /// Take the least item strictly less than `than`, waiting at most `timeout`.
    fn poll_less(&self, than: &T, timeout: Duration) -> Option<T>;
}
