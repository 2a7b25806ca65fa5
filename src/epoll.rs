// src/epoll.rs
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

pub use libc::epoll_event;

/// Readable readiness.
pub const EV_IN: u32 = libc::EPOLLIN as u32;
/// Writable readiness.
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
/// Peer shut down its write half.
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
/// Edge-triggered delivery.
pub const EV_ET: u32 = libc::EPOLLET as u32;
/// Disarm after one delivery; the owner must rearm explicitly.
pub const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Thin wrapper over the epoll readiness interface.
///
/// `add`/`modify`/`remove` are safe from any thread (epoll_ctl is
/// thread-safe); `wait` fills a caller-owned event array, which the reactor
/// preallocates once at startup.
pub struct Epoller {
    fd: RawFd,
}

impl Epoller {
    pub fn new() -> io::Result<Epoller> {
        let fd = unsafe { libc::epoll_create1(0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoller { fd })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Removing a fd that was already dropped by the kernel is fine.
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness, filling `events`. A negative timeout blocks
    /// indefinitely. EINTR is reported as zero events so the caller's loop
    /// can re-check its shutdown flag.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    pub fn event_fd(ev: &epoll_event) -> RawFd {
        ev.u64 as RawFd
    }

    pub fn event_mask(ev: &epoll_event) -> u32 {
        ev.events
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_add_wait_remove() {
        let ep = Epoller::new().unwrap();
        let (r, w) = pipe();

        ep.add(r, EV_IN).unwrap();
        let mut events = vec![epoll_event { events: 0, u64: 0 }; 8];

        // Nothing readable yet.
        assert_eq!(ep.wait(&mut events, 0).unwrap(), 0);

        assert_eq!(
            unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        let n = ep.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        assert_eq!(Epoller::event_fd(&events[0]), r);
        assert!(Epoller::event_mask(&events[0]) & EV_IN != 0);

        ep.remove(r).unwrap();
        // Removing twice must not error.
        ep.remove(r).unwrap();

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
