//! Edge-triggered wake primitive.
//!
//! A latch is a one-bit flag with a wake-up side channel: `set` is
//! idempotent and safe to call from any thread (it only touches an atomic
//! and writes one byte to a pipe), `wait_or_socket` blocks until the latch
//! is set, a socket becomes readable, or a timeout elapses. The self-pipe
//! is what lets latch wake-ups and socket readiness compose into a single
//! `poll(2)` call.
//!
//! A latch is owned by at most one consumer at a time; only the owner may
//! reset or wait on it. Waits may wake spuriously; callers re-test their
//! condition.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;

/// See the module documentation.
#[derive(Debug)]
pub struct Latch {
    is_set: AtomicBool,
    owned: AtomicBool,
    receive_fd: RawFd,
    send_fd: RawFd,
}

/// What woke a [`Latch::wait_or_socket`] call. More than one field may be
/// true; all may be false on a spurious wake.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitResult {
    /// The latch was set.
    pub latch_set: bool,
    /// The socket has readable data (or was closed by the peer).
    pub socket_readable: bool,
    /// The timeout elapsed.
    pub timed_out: bool,
}

impl Latch {
    /// Create a new latch in the unset state.
    pub fn new() -> io::Result<Latch> {
        let (receive_fd, send_fd) =
            unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        Ok(Latch {
            is_set: AtomicBool::new(false),
            owned: AtomicBool::new(false),
            receive_fd,
            send_fd,
        })
    }

    /// Set the latch, waking the owner if it is waiting. Idempotent, may be
    /// called by any thread.
    pub fn set(&self) {
        if !self.is_set.swap(true, Ordering::AcqRel) {
            // A full pipe already carries a wake-up, so EAGAIN is fine.
            let _ = unistd::write(self.send_fd, &[0u8]);
        }
    }

    /// Clear the latch. Only the owner calls this.
    pub fn reset(&self) {
        self.is_set.store(false, Ordering::Release);
        self.drain();
    }

    /// Is the latch currently set?
    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    /// Claim ownership. Panics if the latch is already owned; ownership is
    /// an internal protocol invariant, not a runtime condition.
    pub fn own(&self) {
        let was_owned = self.owned.swap(true, Ordering::AcqRel);
        assert!(!was_owned, "latch is already owned");
    }

    /// Release ownership.
    pub fn disown(&self) {
        let was_owned = self.owned.swap(false, Ordering::AcqRel);
        assert!(was_owned, "disowning a latch that is not owned");
    }

    /// Block until the latch is set or `timeout` elapses. Returns true if
    /// the latch was observed set.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        assert!(self.owned.load(Ordering::Acquire), "waiting on unowned latch");
        loop {
            if self.is_set() {
                return Ok(true);
            }
            let mut fds = [PollFd::new(self.receive_fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout_millis(timeout)) {
                Ok(0) => return Ok(self.is_set()),
                Ok(_) => self.drain(),
                Err(Errno::EINTR) => return Ok(self.is_set()),
                Err(e) => return Err(io::Error::from(e)),
            }
            if timeout.is_some() {
                // Don't re-arm the full timeout after a wake that didn't
                // see the flag; report it as spurious instead.
                return Ok(self.is_set());
            }
        }
    }

    /// Block until the latch is set, `socket` is readable, or `timeout`
    /// elapses, whichever happens first.
    pub fn wait_or_socket(&self, socket: RawFd, timeout: Duration) -> io::Result<WaitResult> {
        assert!(self.owned.load(Ordering::Acquire), "waiting on unowned latch");
        if self.is_set() {
            return Ok(WaitResult {
                latch_set: true,
                ..Default::default()
            });
        }

        let mut fds = [
            PollFd::new(self.receive_fd, PollFlags::POLLIN),
            PollFd::new(socket, PollFlags::POLLIN),
        ];
        let nready = match poll(&mut fds, timeout_millis(Some(timeout))) {
            Ok(n) => n,
            // Treat an interrupted wait as a spurious wake.
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(io::Error::from(e)),
        };

        if fds[0].revents().unwrap_or(PollFlags::empty()).intersects(PollFlags::POLLIN) {
            self.drain();
        }
        // POLLHUP/POLLERR count as readable: the next read will observe it.
        let socket_readable = !fds[1].revents().unwrap_or(PollFlags::empty()).is_empty();

        Ok(WaitResult {
            latch_set: self.is_set(),
            socket_readable,
            timed_out: nready == 0,
        })
    }

    fn drain(&self) {
        let mut buf = [0u8; 16];
        while let Ok(n) = unistd::read(self.receive_fd, &mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        let _ = unistd::close(self.receive_fd);
        let _ = unistd::close(self.send_fd);
    }
}

fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_then_wait_returns_immediately() {
        let latch = Latch::new().unwrap();
        latch.own();
        latch.set();
        assert!(latch.wait(Some(Duration::from_secs(5))).unwrap());
        latch.reset();
        assert!(!latch.is_set());
        latch.disown();
    }

    #[test]
    fn set_is_idempotent() {
        let latch = Latch::new().unwrap();
        latch.own();
        for _ in 0..1000 {
            latch.set();
        }
        assert!(latch.wait(Some(Duration::from_secs(5))).unwrap());
        latch.reset();
        // After reset a short wait times out.
        assert!(!latch.wait(Some(Duration::from_millis(10))).unwrap());
        latch.disown();
    }

    #[test]
    fn wake_from_another_thread() {
        let latch = Arc::new(Latch::new().unwrap());
        latch.own();
        let setter = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set();
        });
        assert!(latch.wait(Some(Duration::from_secs(10))).unwrap());
        handle.join().unwrap();
        latch.disown();
    }

    #[test]
    fn wait_or_socket_sees_socket_data() {
        let latch = Latch::new().unwrap();
        latch.own();
        let (mut a, b) = UnixStream::pair().unwrap();
        use std::io::Write;
        a.write_all(b"x").unwrap();
        let res = latch
            .wait_or_socket(b.as_raw_fd(), Duration::from_secs(5))
            .unwrap();
        assert!(res.socket_readable);
        assert!(!res.latch_set);
        latch.disown();
    }

    #[test]
    fn wait_or_socket_times_out() {
        let latch = Latch::new().unwrap();
        latch.own();
        let (_a, b) = UnixStream::pair().unwrap();
        let res = latch
            .wait_or_socket(b.as_raw_fd(), Duration::from_millis(20))
            .unwrap();
        assert!(res.timed_out);
        assert!(!res.latch_set);
        assert!(!res.socket_readable);
        latch.disown();
    }
}
