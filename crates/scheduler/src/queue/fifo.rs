use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::TaskQueue;

/// Unbounded first-in first-out queue.
///
/// Removal is not supported: finding an item would be O(n), so stale entries
/// stay queued and are discarded by whoever dequeues them.
pub struct FifoQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> TaskQueue<T> for FifoQueue<T> {
    fn add(&self, item: T) {
        // we own the receiver, so the channel can never be disconnected
        let _ = self.tx.send(item);
    }

    fn poll(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn remove(&self, _item: &T) -> bool {
        false
    }

    fn len(&self) -> usize {
        self.rx.len()
    }
}
