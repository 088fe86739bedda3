use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{NavigableTaskQueue, TaskQueue};

pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Items that compare equal, in insertion order.
struct Bucket<T> {
    items: VecDeque<T>,
}

impl<T> Bucket<T> {
    /// Every bucket holds at least one item; empty buckets are dropped.
    fn representative(&self) -> &T {
        &self.items[0]
    }
}

/// Unbounded queue of buckets ordered by a comparator.
///
/// The comparator only has to partition items: all items comparing equal
/// share one bucket and leave it in insertion order. `poll` always serves the
/// least bucket.
pub struct BucketedQueue<T> {
    comparator: Comparator<T>,
    buckets: Mutex<Vec<Bucket<T>>>,
    available: Condvar,
}

impl<T> BucketedQueue<T> {
    pub fn new(comparator: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            comparator: Arc::new(comparator),
            buckets: Mutex::new(Vec::new()),
            available: Condvar::new(),
        }
    }

    fn find(&self, buckets: &[Bucket<T>], item: &T) -> Result<usize, usize> {
        buckets.binary_search_by(|bucket| (self.comparator)(bucket.representative(), item))
    }

    /// Pop from the least bucket if `accept` allows it, waiting up to `timeout`.
    fn poll_where(&self, timeout: Duration, accept: impl Fn(&T) -> bool) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut buckets = self.buckets.lock();
        loop {
            if let Some(first) = buckets.first_mut() {
                if accept(first.representative()) {
                    let item = first.items.pop_front();
                    if first.items.is_empty() {
                        buckets.remove(0);
                    }
                    return item;
                }
            }

            if self.available.wait_until(&mut buckets, deadline).timed_out() {
                return None;
            }
        }
    }
}

impl<T: Send + PartialEq> TaskQueue<T> for BucketedQueue<T> {
    fn add(&self, item: T) {
        let mut buckets = self.buckets.lock();
        match self.find(&buckets, &item) {
            Ok(idx) => buckets[idx].items.push_back(item),
            Err(idx) => buckets.insert(idx, Bucket { items: VecDeque::from([item]) }),
        }
        drop(buckets);

        // waiters may be bounded by different limits, so wake all of them
        self.available.notify_all();
    }

    fn poll(&self, timeout: Duration) -> Option<T> {
        self.poll_where(timeout, |_| true)
    }

    fn remove(&self, item: &T) -> bool {
        let mut buckets = self.buckets.lock();
        let Ok(idx) = self.find(&buckets, item) else {
            return false;
        };
        let bucket = &mut buckets[idx];
        let Some(pos) = bucket.items.iter().position(|queued| queued == item) else {
            return false;
        };
        bucket.items.remove(pos);
        if bucket.items.is_empty() {
            buckets.remove(idx);
        }
        true
    }

    fn len(&self) -> usize {
        self.buckets.lock().iter().map(|b| b.items.len()).sum()
    }
}

impl<T: Send + PartialEq> NavigableTaskQueue<T> for BucketedQueue<T> {
    fn poll_less(&self, than: &T, timeout: Duration) -> Option<T> {
        self.poll_where(timeout, |least| (self.comparator)(least, than) == Ordering::Less)
    }
}
