//! Worker-side signal handling.
//!
//! Handlers only set a flag or write a byte to a self-pipe; every blocking
//! wait in the worker goes through [`WorkerSignals::wait`], which turns a
//! pending `SIGTERM`/`SIGINT` into `Err(Cancelled)`.

use signal_hook::SigId;
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::low_level::pipe;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Readiness arrives as a process-wide `SIGUSR1`; tests that start servers take this first.
#[cfg(test)]
pub(crate) static READY_SIGNAL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled by signal")]
pub struct Cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Some child changed state; callers check their own pids.
    Child,
    /// `SIGUSR1`: the X server is accepting connections.
    Ready,
    /// `extra[i]` is readable (or hung up).
    Fd(usize),
    Timeout,
}

pub struct WorkerSignals {
    term: Arc<AtomicBool>,
    term_rx: UnixStream,
    chld_rx: UnixStream,
    usr1_rx: UnixStream,
    ids: Vec<SigId>,
}

impl WorkerSignals {
    pub fn install() -> io::Result<Self> {
        let term = Arc::new(AtomicBool::new(false));
        let (term_rx, term_tx) = UnixStream::pair()?;
        let (chld_rx, chld_tx) = UnixStream::pair()?;
        let (usr1_rx, usr1_tx) = UnixStream::pair()?;
        for s in [&term_rx, &term_tx, &chld_rx, &chld_tx, &usr1_rx, &usr1_tx] {
            s.set_nonblocking(true)?;
        }
        let mut ids = Vec::new();
        for sig in [SIGTERM, SIGINT] {
            ids.push(signal_hook::flag::register(sig, Arc::clone(&term))?);
            ids.push(pipe::register(sig, term_tx.try_clone()?)?);
        }
        ids.push(pipe::register(SIGCHLD, chld_tx)?);
        ids.push(pipe::register(SIGUSR1, usr1_tx)?);
        Ok(Self {
            term,
            term_rx,
            chld_rx,
            usr1_rx,
            ids,
        })
    }

    pub fn cancelled(&self) -> bool {
        self.term.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.cancelled() { Err(Cancelled) } else { Ok(()) }
    }

    /// Stays readable once cancellation happened; hand it to other pollers.
    pub fn cancel_fd(&self) -> RawFd {
        self.term_rx.as_raw_fd()
    }

    /// Forgets readiness signals left over from an earlier server.
    pub fn drain_ready(&self) {
        drain(&self.usr1_rx);
    }

    pub fn wait(&self, extra: &[RawFd], timeout: Option<Duration>) -> Result<Wake, Cancelled> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.check()?;
            let ms = match deadline {
                None => -1,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(Wake::Timeout);
                    }
                    (d - now).as_millis().clamp(1, i32::MAX as u128) as i32
                }
            };
            let mut fds: Vec<libc::pollfd> = [
                self.term_rx.as_raw_fd(),
                self.chld_rx.as_raw_fd(),
                self.usr1_rx.as_raw_fd(),
            ]
            .into_iter()
            .chain(extra.iter().copied())
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
            let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
            if r < 0 {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!("poll failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
                continue;
            }
            if r == 0 {
                continue;
            }
            if fds[0].revents != 0 {
                return Err(Cancelled);
            }
            if fds[1].revents != 0 {
                drain(&self.chld_rx);
                return Ok(Wake::Child);
            }
            if fds[2].revents != 0 {
                drain(&self.usr1_rx);
                return Ok(Wake::Ready);
            }
            if let Some(i) = fds[3..].iter().position(|p| p.revents != 0) {
                return Ok(Wake::Fd(i));
            }
        }
    }

    /// Sleeps for `d` unless cancelled first.
    pub fn sleep(&self, d: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + d;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            if self.wait(&[], Some(deadline - now))? == Wake::Timeout {
                return Ok(());
            }
        }
    }
}

impl Drop for WorkerSignals {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

fn drain(s: &UnixStream) {
    let mut buf = [0u8; 64];
    let mut r = s;
    loop {
        match r.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn extra_fd_wakes_and_timeout_expires() {
        let sigs = WorkerSignals::install().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        assert_eq!(
            sigs.wait(&[a.as_raw_fd()], Some(Duration::from_millis(20))).unwrap(),
            Wake::Timeout
        );
        b.write_all(b"x").unwrap();
        assert_eq!(sigs.wait(&[a.as_raw_fd()], Some(Duration::from_secs(5))).unwrap(), Wake::Fd(0));
    }

    #[test]
    fn child_exit_wakes_the_waiter() {
        let sigs = WorkerSignals::install().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_child = false;
        while Instant::now() < deadline {
            if sigs.wait(&[], Some(Duration::from_millis(200))).unwrap() == Wake::Child {
                saw_child = true;
                break;
            }
        }
        let _ = child.wait();
        assert!(saw_child);
    }
}
