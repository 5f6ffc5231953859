//! Bounded FIFO of slot indices.
//!
//! Every hand-off between pipeline stages is an index push/pop on one of
//! these queues. Each queue owns exactly one mutex, so the raw-data queue and
//! the frame queue never serialize each other, and no caller holds the lock
//! for longer than it takes to move one integer.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Fixed-capacity FIFO of pool slot indices guarded by a single mutex.
#[derive(Debug)]
pub struct IndexQueue {
    inner: Mutex<VecDeque<usize>>,
    capacity: usize,
}

impl IndexQueue {
    /// Create an empty queue that holds at most `capacity` indices.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Create a queue pre-filled with `0..count` in ascending order.
    #[must_use]
    pub fn filled(capacity: usize, count: usize) -> Self {
        let queue = Self::new(capacity);
        {
            let mut inner = queue.inner.lock();
            inner.extend(0..count.min(capacity));
        }
        queue
    }

    /// Oldest index without removing it.
    #[must_use]
    pub fn front_index(&self) -> Option<usize> {
        self.inner.lock().front().copied()
    }

    /// Newest index without removing it.
    #[must_use]
    pub fn back_index(&self) -> Option<usize> {
        self.inner.lock().back().copied()
    }

    /// Remove and return the oldest index.
    pub fn pop(&self) -> Option<usize> {
        self.inner.lock().pop_front()
    }

    /// Append an index.
    ///
    /// When the queue is already at capacity the oldest index is evicted and
    /// returned, so the queue never grows past its fixed size.
    pub fn push(&self, index: usize) -> Option<usize> {
        let mut inner = self.inner.lock();
        let evicted = if inner.len() >= self.capacity {
            inner.pop_front()
        } else {
            None
        };
        inner.push_back(index);
        evicted
    }

    /// Move `index` to the back, removing any earlier occurrence first.
    pub fn requeue(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.retain(|&i| i != index);
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(index);
    }

    /// Remove `index` wherever it sits. Returns whether it was present.
    pub fn remove(&self, index: usize) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|&i| i != index);
        inner.len() != before
    }

    /// Pop indices from the front until `accept` yields a value.
    ///
    /// Indices rejected by `accept` are discarded. The queue lock is held for
    /// the whole scan, so `accept` must not block.
    pub fn pop_until<R>(&self, mut accept: impl FnMut(usize) -> Option<R>) -> Option<R> {
        let mut inner = self.inner.lock();
        while let Some(index) = inner.pop_front() {
            if let Some(value) = accept(index) {
                return Some(value);
            }
        }
        None
    }

    /// Run `f` against the newest index while the queue lock is held.
    pub fn with_back<R>(&self, f: impl FnOnce(usize) -> Option<R>) -> Option<R> {
        let inner = self.inner.lock();
        inner.back().copied().and_then(f)
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Queued indices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Maximum queued indices.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `index` is queued.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.inner.lock().contains(&index)
    }

    /// Drop every queued index.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Snapshot of the queue contents, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<usize> {
        self.inner.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = IndexQueue::new(4);
        assert!(q.is_empty());
        q.push(2);
        q.push(0);
        q.push(3);
        assert_eq!(q.front_index(), Some(2));
        assert_eq!(q.back_index(), Some(3));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_push_evicts_oldest_when_full() {
        let q = IndexQueue::new(2);
        assert_eq!(q.push(0), None);
        assert_eq!(q.push(1), None);
        assert_eq!(q.push(2), Some(0));
        assert_eq!(q.snapshot(), vec![1, 2]);
    }

    #[test]
    fn test_requeue_moves_to_back_without_duplicates() {
        let q = IndexQueue::filled(4, 3);
        q.requeue(0);
        assert_eq!(q.snapshot(), vec![1, 2, 0]);
        q.requeue(3);
        assert_eq!(q.snapshot(), vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_remove() {
        let q = IndexQueue::filled(4, 4);
        assert!(q.remove(2));
        assert!(!q.remove(2));
        assert_eq!(q.snapshot(), vec![0, 1, 3]);
    }

    #[test]
    fn test_pop_until_discards_rejected() {
        let q = IndexQueue::filled(5, 5);
        let found = q.pop_until(|i| (i >= 2).then_some(i * 10));
        assert_eq!(found, Some(20));
        assert_eq!(q.snapshot(), vec![3, 4]);
    }
}
