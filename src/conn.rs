// src/conn.rs
use crate::buffer::Buffer;
use crate::log_debug;
use crate::request::{HttpRequest, ParseStatus};
use crate::response::HttpResponse;
use libc::{c_void, iovec};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide count of open client connections; the accept path refuses
/// new sockets once it reaches the configured cap.
pub static USER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Under level-triggered writes, stop looping once the remainder is small
/// enough for the next readiness event to finish cheaply.
const LT_WRITE_THRESHOLD: usize = 10 * 1024;

/// Per-socket HTTP state: ingress and egress buffers, the request parser,
/// and the response whose body rides in an mmap'd region. The egress path
/// is a two-slot iovec of [header bytes, file bytes].
pub struct HttpConn {
    fd: RawFd,
    addr: SocketAddr,
    is_closed: bool,
    et_mode: bool,
    src_dir: Arc<PathBuf>,
    read_buf: Buffer,
    write_buf: Buffer,
    file_written: usize,
    request: HttpRequest,
    response: Option<HttpResponse>,
}

impl HttpConn {
    pub fn new(fd: RawFd, addr: SocketAddr, src_dir: Arc<PathBuf>, et_mode: bool) -> HttpConn {
        USER_COUNT.fetch_add(1, Ordering::Relaxed);
        HttpConn {
            fd,
            addr,
            is_closed: false,
            et_mode,
            src_dir,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            file_written: 0,
            request: HttpRequest::new(),
            response: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Unmap any response file, close the socket, and drop out of the
    /// process-wide count. Idempotent.
    pub fn close(&mut self) {
        if self.is_closed {
            return;
        }
        if let Some(response) = self.response.as_mut() {
            response.unmap();
        }
        unsafe {
            libc::close(self.fd);
        }
        USER_COUNT.fetch_sub(1, Ordering::Relaxed);
        self.is_closed = true;
    }

    /// Drain the socket into the ingress buffer. Under edge-triggered mode
    /// this loops until EAGAIN so no readiness edge is lost. `Ok(0)` means
    /// the peer closed; `WouldBlock` means nothing was available.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from_fd(self.fd) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(0);
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !self.et_mode {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Run the parser over whatever is buffered. Returns true iff a full
    /// response is queued and the connection should be armed for write;
    /// false means more input is required.
    pub fn process(&mut self) -> bool {
        if self.request.is_finished() {
            // Previous keep-alive cycle completed; start a fresh request.
            self.request = HttpRequest::new();
        }
        if self.read_buf.readable_len() == 0 {
            return false;
        }
        let status = self.request.parse(&mut self.read_buf);
        let code = match status {
            ParseStatus::Incomplete => return false,
            ParseStatus::Error => 400,
            ParseStatus::Complete if self.request.db_unavailable() => 500,
            ParseStatus::Complete => 200,
        };

        let mut response = HttpResponse::new(
            &self.src_dir,
            self.request.path(),
            self.request.is_keep_alive(),
            code,
        );
        self.write_buf.consume_all();
        response.make_response(&mut self.write_buf);
        self.file_written = 0;
        log_debug!(
            "response {} for {} ({} head bytes, {} file bytes)",
            response.code(),
            self.addr,
            self.write_buf.readable_len(),
            response.file().len()
        );
        self.response = Some(response);
        true
    }

    /// Vectored write of [headers, mmap region] until drained or EAGAIN.
    /// Cursors survive partial writes, so the next call resumes mid-body.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let (head_ptr, head_len) = {
                let head = self.write_buf.peek();
                (head.as_ptr(), head.len())
            };
            let (file_ptr, file_len) = {
                let file = self.response.as_ref().map_or(&[][..], HttpResponse::file);
                let rest = &file[self.file_written.min(file.len())..];
                (rest.as_ptr(), rest.len())
            };
            if head_len + file_len == 0 {
                break;
            }

            let iov = [
                iovec {
                    iov_base: head_ptr as *mut c_void,
                    iov_len: head_len,
                },
                iovec {
                    iov_base: file_ptr as *mut c_void,
                    iov_len: file_len,
                },
            ];
            let n = unsafe { libc::writev(self.fd, iov.as_ptr(), 2) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            let n = n as usize;
            total += n;

            if n > head_len {
                self.file_written += n - head_len;
                self.write_buf.consume_all();
            } else {
                self.write_buf.consume(n);
            }

            let pending = self.pending_write_bytes();
            if pending == 0 {
                break;
            }
            if !self.et_mode && pending <= LT_WRITE_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    pub fn pending_write_bytes(&self) -> usize {
        let file_rest = self
            .response
            .as_ref()
            .map_or(0, |r| r.file().len().saturating_sub(self.file_written));
        self.write_buf.readable_len() + file_rest
    }

    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::thread;
    use std::time::Duration;

    fn socketpair_nonblocking() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    fn push_bytes(fd: RawFd, data: &[u8]) {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const c_void, data.len()) };
        assert_eq!(n, data.len() as isize);
    }

    fn drain_bytes(fd: RawFd) -> Vec<u8> {
        thread::sleep(Duration::from_millis(20));
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut c_void, chunk.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n as usize]);
        }
        out
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_full_request_response_cycle() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("index.html"))
            .unwrap()
            .write_all(b"<p>front page</p>")
            .unwrap();

        let (server_fd, client_fd) = socketpair_nonblocking();
        let mut conn = HttpConn::new(server_fd, test_addr(), Arc::new(dir.path().to_path_buf()), true);

        push_bytes(client_fd, b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        let n = conn.read().unwrap();
        assert!(n > 0);

        assert!(conn.process());
        assert!(conn.pending_write_bytes() > 0);
        conn.write().unwrap();
        assert_eq!(conn.pending_write_bytes(), 0);
        assert!(conn.is_keep_alive());

        let raw = drain_bytes(client_fd);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-length: 17\r\n"));
        assert!(text.ends_with("<p>front page</p>"));

        conn.close();
        unsafe { libc::close(client_fd) };
    }

    #[test]
    fn test_second_request_on_same_connection() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("index.html"))
            .unwrap()
            .write_all(b"again")
            .unwrap();

        let (server_fd, client_fd) = socketpair_nonblocking();
        let mut conn = HttpConn::new(server_fd, test_addr(), Arc::new(dir.path().to_path_buf()), true);

        for _ in 0..2 {
            push_bytes(client_fd, b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
            conn.read().unwrap();
            assert!(conn.process());
            conn.write().unwrap();
            assert_eq!(conn.pending_write_bytes(), 0);
            let raw = drain_bytes(client_fd);
            assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 200 OK\r\n"));
        }

        conn.close();
        unsafe { libc::close(client_fd) };
    }

    #[test]
    fn test_process_without_data_requests_more_input() {
        let dir = tempfile::tempdir().unwrap();
        let (server_fd, client_fd) = socketpair_nonblocking();
        let mut conn = HttpConn::new(server_fd, test_addr(), Arc::new(dir.path().to_path_buf()), true);

        assert!(!conn.process());

        push_bytes(client_fd, b"GET /index.html HT");
        conn.read().unwrap();
        assert!(!conn.process());

        conn.close();
        unsafe { libc::close(client_fd) };
    }

    #[test]
    fn test_eof_reported_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (server_fd, client_fd) = socketpair_nonblocking();
        let mut conn = HttpConn::new(server_fd, test_addr(), Arc::new(dir.path().to_path_buf()), true);

        unsafe { libc::close(client_fd) };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(conn.read().unwrap(), 0);

        conn.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (server_fd, client_fd) = socketpair_nonblocking();
        let mut conn =
            HttpConn::new(server_fd, test_addr(), Arc::new(dir.path().to_path_buf()), false);
        assert!(!conn.is_closed());
        conn.close();
        assert!(conn.is_closed());
        // A second close (and the eventual drop) must not double-release.
        conn.close();
        unsafe { libc::close(client_fd) };
    }
}
