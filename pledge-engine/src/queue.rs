//! Thread-safe queue
//!
//! The only concurrency primitive crossing the boundary between the
//! evaluator and background workers. A circular buffer with blocking pop
//! and a wait-until-empty predicate; pushing into a full queue doubles
//! the capacity and never shrinks it back.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const DEFAULT_CAPACITY: usize = 16;
const EXPAND_FACTOR: usize = 2;

struct Inner<T> {
    data: VecDeque<T>,
    capacity: usize,
}

/// Bounded blocking queue. The bound is soft: a push against a full
/// queue grows the capacity instead of blocking the producer.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    non_empty: Condvar,
    empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(initial_capacity: usize) -> Self {
        let capacity = if initial_capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            initial_capacity
        };
        BoundedQueue {
            inner: Mutex::new(Inner {
                data: VecDeque::with_capacity(capacity),
                capacity,
            }),
            non_empty: Condvar::new(),
            empty: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().map(|g| g.capacity).unwrap_or(0)
    }

    /// Enqueue one item, expanding capacity by doubling when full.
    pub fn push(&self, item: T) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if guard.data.len() == guard.capacity {
            guard.capacity *= EXPAND_FACTOR;
            let additional = guard.capacity - guard.data.len();
            guard.data.reserve(additional);
        }
        guard.data.push_back(item);
        self.non_empty.notify_one();
    }

    /// Dequeue one item, blocking up to `timeout` when the queue is
    /// empty. `None` on timeout rather than panicking or erroring.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let Ok(mut guard) = self.inner.lock() else {
            return None;
        };

        while guard.data.is_empty() {
            let (next, wait) = self
                .non_empty
                .wait_timeout(guard, timeout)
                .ok()?;
            guard = next;
            if wait.timed_out() && guard.data.is_empty() {
                return None;
            }
        }

        let item = guard.data.pop_front();
        if guard.data.is_empty() {
            self.empty.notify_all();
        }
        item
    }

    /// Dequeue up to `count` items at once, blocking up to `timeout` for
    /// the first one. Returns what it got; empty on timeout.
    pub fn pop_n(&self, count: usize, timeout: Duration) -> Vec<T> {
        let Ok(mut guard) = self.inner.lock() else {
            return Vec::new();
        };

        while guard.data.is_empty() {
            let Ok((next, wait)) = self.non_empty.wait_timeout(guard, timeout) else {
                return Vec::new();
            };
            guard = next;
            if wait.timed_out() && guard.data.is_empty() {
                return Vec::new();
            }
        }

        let take = count.min(guard.data.len());
        let out: Vec<T> = guard.data.drain(..take).collect();
        if guard.data.is_empty() {
            self.empty.notify_all();
        }
        out
    }

    /// Block until the queue drains, up to `timeout`. Returns whether it
    /// is actually empty.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let Ok(mut guard) = self.inner.lock() else {
            return false;
        };
        while !guard.data.is_empty() {
            let Ok((next, wait)) = self.empty.wait_timeout(guard, timeout) else {
                return false;
            };
            guard = next;
            if wait.timed_out() {
                return guard.data.is_empty();
            }
        }
        true
    }
}
