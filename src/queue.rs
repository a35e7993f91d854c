//! Bounded queues used between pipeline stages.
//!
//! [`DroppingQueue`] is newest-wins: `put` never blocks the producer and
//! evicts the oldest element when full. [`BoundedDropQueue`] is
//! drop-at-producer: `try_put` fails instead of evicting, preserving FIFO
//! order among the elements that do get through.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Bounded, newest-wins queue. Capacity `C >= 1`. Used for the decoded
/// frame queue (`C = 1`) between the decoder feeder and the render poll.
pub struct DroppingQueue<T> {
    capacity: usize,
    state: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> DroppingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "capacity must be at least 1");
        Self {
            capacity,
            state: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
        }
    }

    /// Insert `item`, evicting the oldest element if full. Returns whether
    /// an eviction occurred. Never blocks.
    pub fn put(&self, item: T) -> bool {
        let mut items = self.state.lock().unwrap();
        let dropped = if items.len() >= self.capacity {
            items.pop_front();
            true
        } else {
            false
        };
        items.push_back(item);
        self.not_empty.notify_one();
        dropped
    }

    /// Remove and return the oldest element, waiting up to `timeout` if the
    /// queue is currently empty. Returns `None` on timeout.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let mut items = self.state.lock().unwrap();
        if items.is_empty() {
            let (guard, _wait_result) = self
                .not_empty
                .wait_timeout_while(items, timeout, |items| items.is_empty())
                .unwrap();
            items = guard;
        }
        items.pop_front()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

/// Error returned by [`BoundedDropQueue::try_put`] when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

/// Bounded FIFO queue that drops at the producer instead of evicting. Used
/// for the video (`C=30`) and audio (`C=50`) ingress queues, where the
/// downstream stage has its own dropping queue and producer-side
/// observability of drops is wanted.
pub struct BoundedDropQueue<T> {
    capacity: usize,
    state: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BoundedDropQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "capacity must be at least 1");
        Self {
            capacity,
            state: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
        }
    }

    /// Insert `item` unless the queue is already at capacity, in which case
    /// the item is dropped and `Err(Full)` is returned. Never blocks.
    pub fn try_put(&self, item: T) -> Result<(), Full> {
        let mut items = self.state.lock().unwrap();
        if items.len() >= self.capacity {
            return Err(Full);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the oldest element, waiting up to `timeout` if the
    /// queue is currently empty. Returns `None` on timeout.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let mut items = self.state.lock().unwrap();
        if items.is_empty() {
            let (guard, _wait_result) = self
                .not_empty
                .wait_timeout_while(items, timeout, |items| items.is_empty())
                .unwrap();
            items = guard;
        }
        items.pop_front()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}
