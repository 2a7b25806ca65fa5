// src/server.rs
use crate::config::Config;
use crate::conn::{HttpConn, USER_COUNT};
use crate::epoll::{self, Epoller};
use crate::error::{Result, ServerError};
use crate::logger::Log;
use crate::sqlpool::SqlConnPool;
use crate::threadpool::ThreadPool;
use crate::timer::HeapTimer;
use crate::{log_debug, log_error, log_info, log_warn};
use libc::{c_void, socklen_t};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const MAX_EVENTS: usize = 1024;

/// Upper bound on one epoll wait so the loop re-checks the shutdown flag
/// even when the timer heap is empty.
const IDLE_WAIT_MS: i64 = 1000;

/// fd -> connection. Workers and timer callbacks resolve connections
/// through this table at run time, so a fd closed in the meantime is
/// simply absent and the task no-ops.
type ConnTable = Arc<Mutex<HashMap<RawFd, Arc<Mutex<HttpConn>>>>>;

/// The reactor: owns the listener, the connection table, the multiplexer,
/// and the timer heap, and dispatches readiness to the worker pool.
///
/// Connections are armed one-shot, so at most one worker task is in flight
/// per fd; the reactor only touches a connection while it is disarmed, and
/// rearming happens at the end of that task.
pub struct WebServer {
    port: u16,
    listen_fd: RawFd,
    is_close: Arc<AtomicBool>,
    timeout_ms: u64,
    listen_events: u32,
    conn_events: u32,
    max_fd: usize,
    src_dir: Arc<PathBuf>,
    timer: HeapTimer,
    threadpool: ThreadPool,
    epoller: Arc<Epoller>,
    users: ConnTable,
    events: Vec<epoll::epoll_event>,
}

impl WebServer {
    pub fn new(config: &Config, is_close: Arc<AtomicBool>) -> WebServer {
        if config.log_enabled {
            Log::instance()
                .init(config.log_level, Path::new("./log"), ".log", config.log_queue_size)
                .expect("log init failed");
        }

        let src_dir = if config.static_dir.is_empty() {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("resources")
        } else {
            PathBuf::from(&config.static_dir)
        };

        let (listen_events, conn_events) = event_mode(config);
        let epoller = Arc::new(Epoller::new().expect("failed to create epoll instance"));

        let mut server = WebServer {
            port: config.port,
            listen_fd: -1,
            is_close,
            timeout_ms: config.timeout_ms,
            listen_events,
            conn_events,
            max_fd: config.max_fd,
            src_dir: Arc::new(src_dir),
            timer: HeapTimer::new(),
            threadpool: ThreadPool::new(config.worker_count),
            epoller,
            users: Arc::new(Mutex::new(HashMap::new())),
            events: vec![epoll::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        };

        if config.sql_pool_size > 0 {
            SqlConnPool::instance().init(config);
        }

        if let Err(e) = server.init_socket(config) {
            log_error!("server init error: {}", e);
            server.is_close.store(true, Ordering::Release);
        }

        if server.is_close.load(Ordering::Acquire) {
            log_error!("========== Server init error! ==========");
        } else {
            log_info!("========== Server init ==========");
            log_info!("Port:{}, OpenLinger: {}", server.port, config.linger);
            log_info!(
                "Listen Mode: {}, OpenConn Mode: {}",
                if listen_events & epoll::EV_ET != 0 { "ET" } else { "LT" },
                if conn_events & epoll::EV_ET != 0 { "ET" } else { "LT" }
            );
            log_info!("LogSys level: {}", config.log_level);
            log_info!("srcDir: {}", server.src_dir.display());
            log_info!(
                "SqlConnPool num: {}, ThreadPool num: {}",
                config.sql_pool_size,
                config.worker_count
            );
        }
        server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The reactor loop. Returns once the close flag is set (or immediately
    /// when construction failed).
    pub fn run(&mut self) {
        if !self.is_close.load(Ordering::Acquire) {
            log_info!("========== Server start ==========");
        }
        while !self.is_close.load(Ordering::Acquire) {
            let mut timeout = IDLE_WAIT_MS;
            if self.timeout_ms > 0 {
                match self.timer.next_tick_ms() {
                    -1 => {}
                    ms => timeout = ms.min(IDLE_WAIT_MS),
                }
            }
            let count = match self.epoller.wait(&mut self.events, timeout as i32) {
                Ok(count) => count,
                Err(e) => {
                    log_error!("epoll wait failed: {}", e);
                    break;
                }
            };
            for i in 0..count {
                let fd = Epoller::event_fd(&self.events[i]);
                let events = Epoller::event_mask(&self.events[i]);
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if events & (epoll::EV_RDHUP | epoll::EV_HUP | epoll::EV_ERR) != 0 {
                    self.timer.cancel(fd);
                    close_conn(&self.users, &self.epoller, fd);
                } else if events & epoll::EV_IN != 0 {
                    self.deal_read(fd);
                } else if events & epoll::EV_OUT != 0 {
                    self.deal_write(fd);
                } else {
                    log_error!("unexpected event {:#x} on fd {}", events, fd);
                }
            }
        }

        log_info!("========== Server stop ==========");
        let remaining: Vec<Arc<Mutex<HttpConn>>> =
            self.users.lock().unwrap().drain().map(|(_, conn)| conn).collect();
        for conn in remaining {
            conn.lock().unwrap().close();
        }
        SqlConnPool::instance().close();
        Log::instance().shutdown();
    }

    fn deal_listen(&mut self) {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
            let fd = unsafe {
                libc::accept(
                    self.listen_fd,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if fd <= 0 {
                return;
            }
            if USER_COUNT.load(Ordering::Relaxed) >= self.max_fd {
                send_error(fd, b"Server busy!");
                log_warn!("clients are full");
                return;
            }
            self.add_client(fd, addr);
            if self.listen_events & epoll::EV_ET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: libc::sockaddr_in) {
        set_fd_nonblock(fd);
        let peer = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        ));
        let conn = Arc::new(Mutex::new(HttpConn::new(
            fd,
            peer,
            Arc::clone(&self.src_dir),
            self.conn_events & epoll::EV_ET != 0,
        )));
        self.users.lock().unwrap().insert(fd, conn);

        if self.timeout_ms > 0 {
            // The expiry callback is the close routine; a fd that was closed
            // and reused in the meantime re-adds its timer at accept, which
            // replaces this node in place.
            let users = Arc::clone(&self.users);
            let epoller = Arc::clone(&self.epoller);
            self.timer.add(
                fd,
                self.timeout_ms,
                Box::new(move || close_conn(&users, &epoller, fd)),
            );
        }

        if let Err(e) = self.epoller.add(fd, epoll::EV_IN | self.conn_events) {
            log_error!("epoll add for client {} failed: {}", fd, e);
            self.timer.cancel(fd);
            close_conn(&self.users, &self.epoller, fd);
            return;
        }
        log_info!(
            "Client[{}]({}) in, userCount:{}",
            fd,
            peer,
            USER_COUNT.load(Ordering::Relaxed)
        );
    }

    fn deal_read(&mut self, fd: RawFd) {
        if !self.users.lock().unwrap().contains_key(&fd) {
            return;
        }
        self.extent_time(fd);
        let users = Arc::clone(&self.users);
        let epoller = Arc::clone(&self.epoller);
        let conn_events = self.conn_events;
        self.threadpool
            .submit(move || on_read(&users, &epoller, conn_events, fd));
    }

    fn deal_write(&mut self, fd: RawFd) {
        if !self.users.lock().unwrap().contains_key(&fd) {
            return;
        }
        self.extent_time(fd);
        let users = Arc::clone(&self.users);
        let epoller = Arc::clone(&self.epoller);
        let conn_events = self.conn_events;
        self.threadpool
            .submit(move || on_write(&users, &epoller, conn_events, fd));
    }

    fn extent_time(&mut self, fd: RawFd) {
        if self.timeout_ms > 0 && self.timer.contains(fd) {
            self.timer.adjust(fd, self.timeout_ms);
        }
    }

    fn init_socket(&mut self, config: &Config) -> Result<()> {
        if self.port < 1024 {
            return Err(ServerError::InvalidPort(self.port));
        }

        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }

            if config.linger {
                // Block close until pending data drains, at most one second.
                let opt = libc::linger {
                    l_onoff: 1,
                    l_linger: 1,
                };
                if libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &opt as *const _ as *const c_void,
                    mem::size_of_val(&opt) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }

            let one: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }

            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: self.port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: libc::INADDR_ANY.to_be(),
                },
                sin_zero: [0; 8],
            };
            if libc::bind(
                fd,
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of_val(&sin) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }

            if libc::listen(fd, config.backlog) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }

            if let Err(e) = self.epoller.add(fd, epoll::EV_IN | self.listen_events) {
                libc::close(fd);
                return Err(e.into());
            }
            set_fd_nonblock(fd);
            self.listen_fd = fd;
        }
        log_info!("Server port:{}", self.port);
        Ok(())
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        if self.listen_fd >= 0 {
            unsafe {
                libc::close(self.listen_fd);
            }
            self.listen_fd = -1;
        }
    }
}

fn event_mode(config: &Config) -> (u32, u32) {
    let mut listen_events = epoll::EV_RDHUP;
    let mut conn_events = epoll::EV_ONESHOT | epoll::EV_RDHUP;
    if config.listen_et() {
        listen_events |= epoll::EV_ET;
    }
    if config.conn_et() {
        conn_events |= epoll::EV_ET;
    }
    (listen_events, conn_events)
}

/// Remove `fd` from the table and close it. Safe to call from the reactor,
/// a worker, or a timer callback; later callers find the fd absent.
fn close_conn(users: &ConnTable, epoller: &Epoller, fd: RawFd) {
    let conn = users.lock().unwrap().remove(&fd);
    if let Some(conn) = conn {
        let mut conn = conn.lock().unwrap();
        let _ = epoller.remove(fd);
        conn.close();
        log_info!(
            "Client[{}] quit, userCount:{}",
            fd,
            USER_COUNT.load(Ordering::Relaxed)
        );
    }
}

fn lookup(users: &ConnTable, fd: RawFd) -> Option<Arc<Mutex<HttpConn>>> {
    users.lock().unwrap().get(&fd).cloned()
}

fn on_read(users: &ConnTable, epoller: &Epoller, conn_events: u32, fd: RawFd) {
    // The timer may have closed this fd between dispatch and execution.
    let Some(conn) = lookup(users, fd) else {
        return;
    };
    let mut conn = conn.lock().unwrap();
    match conn.read() {
        Ok(0) => {
            drop(conn);
            close_conn(users, epoller, fd);
            return;
        }
        Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
            log_debug!("read error on fd {}: {}", fd, e);
            drop(conn);
            close_conn(users, epoller, fd);
            return;
        }
        _ => {}
    }
    on_process(&mut conn, epoller, conn_events, fd);
}

fn on_process(conn: &mut HttpConn, epoller: &Epoller, conn_events: u32, fd: RawFd) {
    if conn.process() {
        let _ = epoller.modify(fd, conn_events | epoll::EV_OUT);
    } else {
        let _ = epoller.modify(fd, conn_events | epoll::EV_IN);
    }
}

fn on_write(users: &ConnTable, epoller: &Epoller, conn_events: u32, fd: RawFd) {
    let Some(conn) = lookup(users, fd) else {
        return;
    };
    let mut conn = conn.lock().unwrap();
    match conn.write() {
        Ok(_) => {
            if conn.pending_write_bytes() == 0 {
                if conn.is_keep_alive() {
                    on_process(&mut conn, epoller, conn_events, fd);
                    return;
                }
                drop(conn);
                close_conn(users, epoller, fd);
                return;
            }
            // Partial drain without backpressure; keep the write armed.
            let _ = epoller.modify(fd, conn_events | epoll::EV_OUT);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let _ = epoller.modify(fd, conn_events | epoll::EV_OUT);
        }
        Err(e) => {
            log_debug!("write error on fd {}: {}", fd, e);
            drop(conn);
            close_conn(users, epoller, fd);
        }
    }
}

fn send_error(fd: RawFd, info: &[u8]) {
    let sent = unsafe { libc::send(fd, info.as_ptr() as *const c_void, info.len(), 0) };
    if sent < 0 {
        log_warn!("send error to client[{}] failed", fd);
    }
    unsafe {
        libc::close(fd);
    }
}

fn set_fd_nonblock(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}
