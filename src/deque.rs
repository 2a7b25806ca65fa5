// src/deque.rs
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    deq: VecDeque<T>,
    closed: bool,
}

/// Bounded blocking MPMC FIFO.
///
/// Producers block while the deque is at capacity; consumers block while it
/// is empty. `close` clears the contents and wakes every waiter, after which
/// `pop` returns `None` and `push_back` refuses the item.
pub struct BlockDeque<T> {
    inner: Mutex<Inner<T>>,
    cond_consumer: Condvar,
    cond_producer: Condvar,
    capacity: usize,
}

impl<T> BlockDeque<T> {
    pub fn new(capacity: usize) -> BlockDeque<T> {
        assert!(capacity > 0);
        BlockDeque {
            inner: Mutex::new(Inner {
                deq: VecDeque::new(),
                closed: false,
            }),
            cond_consumer: Condvar::new(),
            cond_producer: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().deq.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.deq.len() >= self.capacity
    }

    /// Append an item, blocking while the deque is at capacity.
    /// Returns false (dropping the item) once the deque is closed.
    pub fn push_back(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.len() >= self.capacity && !inner.closed {
            inner = self.cond_producer.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        inner.deq.push_back(item);
        self.cond_consumer.notify_one();
        true
    }

    /// Remove the front item, blocking while the deque is empty.
    /// Returns `None` iff the deque is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                self.cond_producer.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.cond_consumer.wait(inner).unwrap();
        }
    }

    /// Like `pop`, but gives up after `timeout`. A timeout return is always
    /// `None` and never dequeues, even if an item arrived in the race
    /// window between the wakeup and the return.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                self.cond_producer.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let (guard, result) = self.cond_consumer.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() {
                return None;
            }
        }
    }

    /// Wake one consumer so a drain thread makes progress even when
    /// producers are idle.
    pub fn flush(&self) {
        self.cond_consumer.notify_one();
    }

    /// Clear the deque, mark it closed, and wake all waiters.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.deq.clear();
            inner.closed = true;
        }
        self.cond_producer.notify_all();
        self.cond_consumer.notify_all();
    }
}
