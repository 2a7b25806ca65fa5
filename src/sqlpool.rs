//! Fixed-size pool of pre-opened blocking PostgreSQL connections.
//!
//! Availability is signalled through a counting semaphore so waiters never
//! hold the FIFO mutex: `acquire` waits on the semaphore first, then locks
//! and pops. Handles come back through an RAII guard.

use crate::config::Config;
use crate::log_error;
use postgres::{Client, NoTls};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::Duration;

/// Counting semaphore over a mutex + condvar.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn post(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

static INSTANCE: OnceLock<SqlConnPool> = OnceLock::new();

pub struct SqlConnPool {
    clients: Mutex<VecDeque<Client>>,
    sem: Semaphore,
}

/// RAII handle: the connection returns to the pool on drop.
pub struct SqlConnGuard<'a> {
    pool: &'a SqlConnPool,
    client: Option<Client>,
}

impl Deref for SqlConnGuard<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("guard already released")
    }
}

impl DerefMut for SqlConnGuard<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("guard already released")
    }
}

impl Drop for SqlConnGuard<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

impl SqlConnPool {
    /// The process-wide pool; empty until [`SqlConnPool::init`] runs.
    pub fn instance() -> &'static SqlConnPool {
        INSTANCE.get_or_init(|| SqlConnPool {
            clients: Mutex::new(VecDeque::new()),
            sem: Semaphore::new(0),
        })
    }

    /// Open up to `config.sql_pool_size` connections. A connection that
    /// fails to open is logged and skipped, so the pool degrades rather
    /// than aborting startup.
    pub fn init(&self, config: &Config) {
        let mut opened = 0;
        for _ in 0..config.sql_pool_size {
            let result = postgres::Config::new()
                .host(&config.sql_host)
                .port(config.sql_port)
                .user(&config.sql_user)
                .password(&config.sql_password)
                .dbname(&config.sql_database)
                .connect_timeout(Duration::from_secs(8))
                .connect(NoTls);
            match result {
                Ok(client) => {
                    self.clients.lock().unwrap().push_back(client);
                    self.sem.post();
                    opened += 1;
                }
                Err(e) => {
                    log_error!("sql connect error: {}", e);
                }
            }
        }
        if opened < config.sql_pool_size {
            log_error!(
                "sql pool degraded: {}/{} connections opened",
                opened,
                config.sql_pool_size
            );
        }
    }

    /// Block until a connection is available.
    pub fn acquire(&self) -> SqlConnGuard<'_> {
        self.sem.acquire();
        let client = self
            .clients
            .lock()
            .unwrap()
            .pop_front()
            .expect("semaphore said a connection was available");
        SqlConnGuard {
            pool: self,
            client: Some(client),
        }
    }

    /// Non-blocking variant for request handlers: `None` when the pool is
    /// exhausted (or was never initialized), which maps to a 500 page.
    pub fn try_acquire(&self) -> Option<SqlConnGuard<'_>> {
        if !self.sem.try_acquire() {
            return None;
        }
        let client = self
            .clients
            .lock()
            .unwrap()
            .pop_front()
            .expect("semaphore said a connection was available");
        Some(SqlConnGuard {
            pool: self,
            client: Some(client),
        })
    }

    fn release(&self, client: Client) {
        self.clients.lock().unwrap().push_back(client);
        self.sem.post();
    }

    pub fn free_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Drop every pooled connection.
    pub fn close(&self) {
        let mut clients = self.clients.lock().unwrap();
        while self.sem.try_acquire() {}
        clients.clear();
    }
}
