// src/threadpool.rs
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Fixed-size set of worker threads draining a shared task queue.
///
/// Workers hold their own `Arc` to the shared state and run detached, so
/// dropping the pool never blocks: the drop sets the closed flag and
/// broadcasts, and each worker exits once the queue is empty.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Spawn `count` workers; 0 means one per core.
    pub fn new(count: usize) -> ThreadPool {
        let count = if count == 0 { num_cpus::get() } else { count };
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        for i in 0..count {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
        }

        ThreadPool { shared }
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
        }
        self.shared.cond.notify_all();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            task();
            state = shared.state.lock().unwrap();
        } else if state.closed {
            break;
        } else {
            state = shared.cond.wait(state).unwrap();
        }
    }
}
