//! Cooperative cancellation.
//!
//! Signal handlers only touch atomics. The control loop calls
//! [`Checkpoint::check`] at every loop head and blocking boundary; the first
//! terminal observation is returned as [`Cancelled`] and the owner of the
//! session (see [`crate::site::Site::checkpoint`]) performs the shutdown
//! sequence exactly once.
//!
//! Repeated `SIGINT`s escalate: on the [`ESCALATE_AFTER`]th one the handler
//! shuts the controller and downstream task sockets down so a checkpoint
//! stuck in a blocking read or write wakes up with an error.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use thiserror::Error;
use tracing::debug;

/// Interrupt count that forces the socket shut.
pub const ESCALATE_AFTER: u32 = 3;

/// Signal number that requested exit, 0 while running.
static EXIT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static INTERRUPTS: AtomicU32 = AtomicU32::new(0);
static REOPEN: AtomicBool = AtomicBool::new(false);
/// Controller socket, -1 when not connected.
static SOCKET_FD: AtomicI32 = AtomicI32::new(-1);
/// Downstream task sockets that can be registered for escalation.
pub const MAX_TASK_SOCKETS: usize = 16;
static TASK_FDS: [AtomicI32; MAX_TASK_SOCKETS] = [const { AtomicI32::new(-1) }; MAX_TASK_SOCKETS];

extern "C" fn on_signal(sig: libc::c_int) {
    match sig {
        libc::SIGINT => {
            EXIT_SIGNAL.store(sig, Ordering::SeqCst);
            let n = INTERRUPTS.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= ESCALATE_AFTER {
                escalate();
            }
        }
        libc::SIGHUP => REOPEN.store(true, Ordering::SeqCst),
        _ => EXIT_SIGNAL.store(sig, Ordering::SeqCst),
    }
}

/// Shut down every registered socket. Safe to call from a signal handler.
pub fn escalate() {
    for fd in std::iter::once(&SOCKET_FD).chain(TASK_FDS.iter()).map(|s| s.load(Ordering::SeqCst)) {
        if fd >= 0 {
            // SAFETY: shutdown(2) is async-signal-safe; it does not free
            // the descriptor.
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }
    }
}

/// Install the process signal handlers. `SIGPIPE` is ignored so a dead
/// downstream task surfaces as a write error.
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only performs atomic operations and shutdown(2).
    unsafe {
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1, Signal::SIGHUP] {
            sigaction(sig, &action)?;
        }
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    debug!("signal handlers installed");
    Ok(())
}

/// Publish the controller socket for interrupt escalation.
pub fn register_socket(fd: RawFd) {
    SOCKET_FD.store(fd, Ordering::SeqCst);
}

pub fn clear_socket() {
    SOCKET_FD.store(-1, Ordering::SeqCst);
}

/// Publish a downstream task socket for interrupt escalation. False when
/// every slot is taken.
pub fn register_task_socket(fd: RawFd) -> bool {
    TASK_FDS
        .iter()
        .any(|slot| slot.compare_exchange(-1, fd, Ordering::SeqCst, Ordering::SeqCst).is_ok())
}

pub fn clear_task_socket(fd: RawFd) {
    for slot in &TASK_FDS {
        let _ = slot.compare_exchange(fd, -1, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// True once after each `SIGHUP`.
pub fn take_reopen() -> bool {
    REOPEN.swap(false, Ordering::SeqCst)
}

/// Why the control loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Signal(i32),
    Requested,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Signal(sig) => match Signal::try_from(*sig) {
                Ok(s) => write!(f, "{s}"),
                Err(_) => write!(f, "signal {sig}"),
            },
            StopReason::Requested => f.write_str("stop requested"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled: {0}")]
pub struct Cancelled(pub StopReason);

/// Handle on the stop condition. Clones share the same local flag.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    requested: Arc<AtomicBool>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop without a signal.
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn reason(&self) -> Option<StopReason> {
        match EXIT_SIGNAL.load(Ordering::SeqCst) {
            0 if self.requested.load(Ordering::SeqCst) => Some(StopReason::Requested),
            0 => None,
            sig => Some(StopReason::Signal(sig)),
        }
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        match self.reason() {
            Some(reason) => Err(Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Sleep in slices of at most `slice`, checking between them.
    pub fn sleep(&self, total: std::time::Duration, slice: std::time::Duration) -> Result<(), Cancelled> {
        let deadline = std::time::Instant::now() + total;
        loop {
            self.check()?;
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(slice));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn running_until_cancelled() {
        let cp = Checkpoint::new();
        assert_eq!(cp.check(), Ok(()));
        let other = cp.clone();
        other.cancel();
        assert_eq!(cp.check(), Err(Cancelled(StopReason::Requested)));
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let cp = Checkpoint::new();
        cp.cancel();
        let started = std::time::Instant::now();
        assert!(cp.sleep(Duration::from_secs(5), Duration::from_millis(10)).is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn short_sleep_completes() {
        let cp = Checkpoint::new();
        assert!(cp.sleep(Duration::from_millis(5), Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn escalation_shuts_task_sockets() {
        use std::io::Read;
        use std::net::{TcpListener, TcpStream};
        use std::os::fd::AsRawFd;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();
        let fd = client.as_raw_fd();
        assert!(register_task_socket(fd));
        escalate();
        clear_task_socket(fd);
        // A shut socket reads as end of stream instead of blocking.
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn task_slots_are_reused() {
        // Descriptors far above anything the test process opens.
        let fds: Vec<RawFd> = (0..MAX_TASK_SOCKETS as RawFd).map(|i| 90_000 + i).collect();
        let taken = fds.iter().filter(|fd| register_task_socket(**fd)).count();
        assert!(taken > 0);
        for fd in &fds {
            clear_task_socket(*fd);
        }
        assert!(register_task_socket(90_000));
        clear_task_socket(90_000);
    }

    #[test]
    fn stop_reason_display() {
        assert_eq!(StopReason::Signal(libc::SIGTERM).to_string(), "SIGTERM");
        assert_eq!(StopReason::Requested.to_string(), "stop requested");
    }
}
