use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::queue::{BucketedQueue, FifoQueue, NavigableTaskQueue, TaskQueue};
use crate::scheduler::{Param, Value};

use super::task::Task;

pub(crate) type ParamComparator<P> = Arc<dyn Fn(&P, &P) -> Ordering + Send + Sync>;

/// The parts of the engine that differ between the unordered and the
/// approximately prioritized scheduler.
pub(crate) trait SchedulingPolicy<P: Param, V: Value>: Send + Sync {
    fn enqueue(&self, task: Arc<Task<P, V>>);

    /// Drop a task that will never run from the queue, if the queue allows it.
    fn unqueue(&self, task: &Arc<Task<P, V>>);

    /// Next candidate task. `parent` is the task the calling thread is
    /// currently executing on behalf of, if any.
    fn poll(&self, parent: Option<&Arc<Task<P, V>>>, timeout: Duration) -> Option<Arc<Task<P, V>>>;

    /// Whether a task for `from` may wait on a task for `to`.
    fn can_recurse(&self, from: &P, to: &P) -> bool;

    /// Whether these parameters may be handled by one work-function invocation.
    fn can_execute_in_batch(&self, params: &[&P]) -> bool;

    /// Whether gathers should try to begin their children inline before joining.
    fn races_to_begin(&self) -> bool;

    fn queue_len(&self) -> usize;
}

// ── Unordered ────────────────────────────────────────────────────────

/// FIFO admission; any task may wait on any other.
pub(crate) struct Unordered<P, V> {
    queue: FifoQueue<Arc<Task<P, V>>>,
}

impl<P, V> Unordered<P, V> {
    pub fn new() -> Self {
        Self { queue: FifoQueue::new() }
    }
}

impl<P: Param, V: Value> SchedulingPolicy<P, V> for Unordered<P, V> {
    fn enqueue(&self, task: Arc<Task<P, V>>) {
        self.queue.add(task);
    }

    fn unqueue(&self, _task: &Arc<Task<P, V>>) {
        // stale entries are skipped once their begin fails
    }

    fn poll(&self, _parent: Option<&Arc<Task<P, V>>>, timeout: Duration) -> Option<Arc<Task<P, V>>> {
        self.queue.poll(timeout)
    }

    fn can_recurse(&self, _from: &P, _to: &P) -> bool {
        true
    }

    fn can_execute_in_batch(&self, params: &[&P]) -> bool {
        !params.is_empty()
    }

    fn races_to_begin(&self) -> bool {
        true
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

// ── Prioritized ──────────────────────────────────────────────────────

/// Bucketed ordering under a partitioning comparator.
///
/// Recursion must strictly descend through the partition, which keeps the
/// graph of waiting tasks acyclic without needing a total order.
pub(crate) struct Prioritized<P, V> {
    comparator: ParamComparator<P>,
    queue: BucketedQueue<Arc<Task<P, V>>>,
}

impl<P: Param, V: Value> Prioritized<P, V> {
    pub fn new(comparator: ParamComparator<P>) -> Self {
        let by_param = Arc::clone(&comparator);
        Self {
            comparator,
            queue: BucketedQueue::new(move |a: &Arc<Task<P, V>>, b: &Arc<Task<P, V>>| by_param(&a.param, &b.param)),
        }
    }
}

impl<P: Param, V: Value> SchedulingPolicy<P, V> for Prioritized<P, V> {
    fn enqueue(&self, task: Arc<Task<P, V>>) {
        self.queue.add(task);
    }

    fn unqueue(&self, task: &Arc<Task<P, V>>) {
        self.queue.remove(task);
    }

    fn poll(&self, parent: Option<&Arc<Task<P, V>>>, timeout: Duration) -> Option<Arc<Task<P, V>>> {
        match parent {
            // only work the parent is allowed to wait on
            Some(parent) => self.queue.poll_less(parent, timeout),
            None => self.queue.poll(timeout),
        }
    }

    fn can_recurse(&self, from: &P, to: &P) -> bool {
        (self.comparator)(from, to) == Ordering::Greater
    }

    fn can_execute_in_batch(&self, params: &[&P]) -> bool {
        match params.split_first() {
            Some((first, rest)) => rest
                .iter()
                .all(|param| (self.comparator)(first, param) == Ordering::Equal),
            None => false,
        }
    }

    fn races_to_begin(&self) -> bool {
        // children outrank the parent, so joining them is enough to get them started
        false
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(1);

    fn by_sign() -> Prioritized<i64, i64> {
        Prioritized::new(Arc::new(|a: &i64, b: &i64| a.cmp(b)))
    }

    #[test]
    fn unordered_allows_everything() {
        let policy: Unordered<i64, i64> = Unordered::new();
        assert!(policy.can_recurse(&1, &100));
        assert!(policy.can_recurse(&100, &1));
        assert!(policy.can_execute_in_batch(&[&1, &2, &3]));
        assert!(policy.races_to_begin());
    }

    #[test]
    fn unordered_polls_in_admission_order() {
        let policy: Unordered<i64, i64> = Unordered::new();
        let first = Task::new(9);
        let second = Task::new(1);
        policy.enqueue(Arc::clone(&first));
        policy.enqueue(Arc::clone(&second));
        assert_eq!(policy.queue_len(), 2);

        assert_eq!(policy.poll(None, NO_WAIT), Some(first));
        assert_eq!(policy.poll(None, NO_WAIT), Some(second));
    }

    #[test]
    fn prioritized_recursion_descends() {
        let policy = by_sign();
        assert!(policy.can_recurse(&10, &5));
        assert!(!policy.can_recurse(&5, &10));
        assert!(!policy.can_recurse(&5, &5));
        assert!(!policy.races_to_begin());
    }

    #[test]
    fn prioritized_batches_need_one_bucket() {
        let policy: Prioritized<i64, i64> = Prioritized::new(Arc::new(|a: &i64, b: &i64| (a / 10).cmp(&(b / 10))));
        assert!(policy.can_execute_in_batch(&[&11, &15, &19]));
        assert!(!policy.can_execute_in_batch(&[&11, &25]));
        assert!(!policy.can_execute_in_batch(&[]));
    }

    #[test]
    fn prioritized_poll_under_parent_only_returns_lesser_tasks() {
        let policy = by_sign();
        let parent = Task::new(10);
        let big = Task::new(20);
        let small = Task::new(3);
        policy.enqueue(Arc::clone(&big));
        assert_eq!(policy.poll(Some(&parent), NO_WAIT), None);

        policy.enqueue(Arc::clone(&small));
        assert_eq!(policy.poll(Some(&parent), NO_WAIT), Some(small));
        assert_eq!(policy.poll(None, NO_WAIT), Some(big));
    }

    #[test]
    fn prioritized_unqueue_removes_by_identity() {
        let policy = by_sign();
        let queued = Task::new(4);
        let twin = Task::new(4);
        policy.enqueue(Arc::clone(&queued));

        policy.unqueue(&twin);
        assert_eq!(policy.queue_len(), 1);
        policy.unqueue(&queued);
        assert_eq!(policy.queue_len(), 0);
    }
}
