// src/timer.rs
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnMut() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: TimeoutCallback,
}

/// Keyed min-heap of per-connection deadlines.
///
/// A sidecar map from id to heap index makes `adjust` and `cancel`
/// O(log n). Every mutation keeps the two-way invariant
/// `ref_[id] == i <=> heap[i].id == id`.
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    ref_: HashMap<RawFd, usize>,
}

impl HeapTimer {
    pub fn new() -> HeapTimer {
        HeapTimer {
            heap: Vec::new(),
            ref_: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: RawFd) -> bool {
        self.ref_.contains_key(&id)
    }

    /// Schedule `id` to expire after `timeout_ms`, or reschedule it in
    /// place if it is already present (replacing the callback too).
    pub fn add(&mut self, id: RawFd, timeout_ms: u64, cb: TimeoutCallback) {
        let expires = Instant::now() + Duration::from_millis(timeout_ms);
        match self.ref_.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.ref_.insert(id, i);
                self.heap.push(TimerNode { id, expires, cb });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = cb;
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Push the deadline of a present node. The only caller is the
    /// reactor's activity bump, which extends deadlines, so sift-down
    /// restores heap order.
    pub fn adjust(&mut self, id: RawFd, timeout_ms: u64) {
        let Some(&i) = self.ref_.get(&id) else {
            debug_assert!(false, "adjust on absent timer id {}", id);
            return;
        };
        self.heap[i].expires = Instant::now() + Duration::from_millis(timeout_ms);
        self.sift_down(i, self.heap.len());
    }

    /// Remove `id` without firing its callback.
    pub fn cancel(&mut self, id: RawFd) {
        if let Some(&i) = self.ref_.get(&id) {
            self.remove_at(i);
        }
    }

    /// Fire the callback for `id` now, then remove it.
    pub fn do_work(&mut self, id: RawFd) {
        if let Some(&i) = self.ref_.get(&id) {
            let mut node = self.remove_at(i);
            (node.cb)();
        }
    }

    /// Fire every expired node, earliest first.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.heap.first() {
            if front.expires > now {
                break;
            }
            let mut node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Milliseconds until the earliest deadline, after reaping expired
    /// nodes. -1 means there is nothing scheduled (block indefinitely).
    pub fn next_tick_ms(&mut self) -> i64 {
        self.tick();
        match self.heap.first() {
            None => -1,
            Some(front) => {
                let now = Instant::now();
                if front.expires <= now {
                    0
                } else {
                    (front.expires - now).as_millis() as i64
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.ref_.clear();
    }

    /// Detach the node at heap index `i`, restoring heap order.
    fn remove_at(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
        }
        let node = self.heap.pop().expect("remove_at on empty heap");
        self.ref_.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut j = i * 2 + 1;
        while j < n {
            if j + 1 < n && self.heap[j + 1].expires < self.heap[j].expires {
                j += 1;
            }
            if self.heap[i].expires <= self.heap[j].expires {
                break;
            }
            self.swap_nodes(i, j);
            i = j;
            j = i * 2 + 1;
        }
        i > index
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.ref_.insert(self.heap[i].id, i);
        self.ref_.insert(self.heap[j].id, j);
    }
}

impl Default for HeapTimer {
    fn default() -> Self {
        HeapTimer::new()
    }
}
