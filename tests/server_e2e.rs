//! Socket-level end-to-end tests: a real server on an ephemeral port,
//! exercised with plain `TcpStream` clients.
//!
//! The scenarios share one process-wide connection counter, so they run
//! inside a single test function, strictly in sequence.

use nocturne::conn::USER_COUNT;
use nocturne::{Config, WebServer};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(mut config: Config) -> TestServer {
        let port = free_port();
        config.port = port;
        config.log_enabled = false;
        config.sql_pool_size = 0;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            WebServer::new(&config, flag).run();
        });
        TestServer {
            port,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        for _ in 0..100 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", self.port)) {
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return stream;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("server on port {} never came up", self.port);
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one response: status code and exactly Content-length body bytes.
fn read_response(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find(&raw, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        raw.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let status: u16 = head
        .split(' ')
        .nth(1)
        .expect("malformed status line")
        .parse()
        .expect("non-numeric status");
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse().unwrap())
        })
        .unwrap_or(0);

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    (status, body)
}

fn expect_eof(stream: &mut TcpStream) {
    let mut chunk = [0u8; 64];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) => panic!("expected EOF, got error: {}", e),
        }
    }
}

fn wait_conns_drained() {
    for _ in 0..500 {
        if USER_COUNT.load(Ordering::Relaxed) == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("connections never drained");
}

fn static_root(index_body: &[u8]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    File::create(dir.path().join("index.html"))
        .unwrap()
        .write_all(index_body)
        .unwrap();
    dir
}

#[test]
fn server_end_to_end() {
    static_get_keep_alive();
    wait_conns_drained();
    not_found_closes();
    wait_conns_drained();
    idle_timeout_closes();
    wait_conns_drained();
    busy_server_refuses_but_keeps_serving();
    wait_conns_drained();
}

fn static_get_keep_alive() {
    let body = b"<h1>keep-alive works</h1>\n";
    let dir = static_root(body);
    let mut config = Config::default();
    config.static_dir = dir.path().to_string_lossy().into_owned();
    let server = TestServer::start(config);

    let mut stream = server.connect();
    for _ in 0..2 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (status, got) = read_response(&mut stream);
        assert_eq!(status, 200);
        assert_eq!(got, body);
    }
    drop(stream);
    server.stop();
}

fn not_found_closes() {
    let dir = static_root(b"irrelevant");
    let mut config = Config::default();
    config.static_dir = dir.path().to_string_lossy().into_owned();
    let server = TestServer::start(config);

    let mut stream = server.connect();
    stream
        .write_all(b"GET /does-not-exist HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, got) = read_response(&mut stream);
    assert_eq!(status, 404);
    assert!(!got.is_empty());
    // No keep-alive requested: the server closes after the response.
    expect_eof(&mut stream);
    server.stop();
}

fn idle_timeout_closes() {
    let dir = static_root(b"x");
    let mut config = Config::default();
    config.static_dir = dir.path().to_string_lossy().into_owned();
    config.timeout_ms = 500;
    let server = TestServer::start(config);

    let mut stream = server.connect();
    let start = std::time::Instant::now();
    // Send nothing; the idle timer must close the socket.
    expect_eof(&mut stream);
    assert!(
        start.elapsed() >= Duration::from_millis(300),
        "closed suspiciously early"
    );
    server.stop();
}

fn busy_server_refuses_but_keeps_serving() {
    let body = b"still here";
    let dir = static_root(body);
    let mut config = Config::default();
    config.static_dir = dir.path().to_string_lossy().into_owned();
    config.timeout_ms = 0;
    config.max_fd = 2;
    let server = TestServer::start(config);

    let request = b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";

    let mut first = server.connect();
    first.write_all(request).unwrap();
    let (status, _) = read_response(&mut first);
    assert_eq!(status, 200);

    let mut second = server.connect();
    second.write_all(request).unwrap();
    let (status, _) = read_response(&mut second);
    assert_eq!(status, 200);

    // The cap is reached; the next accept is refused with a short payload.
    let mut third = server.connect();
    let mut refusal = Vec::new();
    third.read_to_end(&mut refusal).unwrap();
    assert_eq!(refusal, b"Server busy!");

    // Held connections keep serving.
    first.write_all(request).unwrap();
    let (status, got) = read_response(&mut first);
    assert_eq!(status, 200);
    assert_eq!(got, body);

    drop(first);
    drop(second);
    server.stop();
}
