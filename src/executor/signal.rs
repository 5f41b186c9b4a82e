//! SIGTERM handling while a job runs.
//!
//! A termination request during execution must not kill the worker before
//! the job's failure is reported. While a [`TerminationGuard`] is alive,
//! SIGTERM only raises a flag; job code observes it through
//! [`JobContext::checkpoint`](crate::registry::JobContext::checkpoint) and
//! the executor treats a job that finishes with the flag raised as killed.
//!
//! Jobs that never check in are covered by a [`Watchdog`]: once the flag has
//! been up for its grace period it runs a last-resort action, which in the
//! worker reports the kill and exits the process.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);

/// How often the watchdog looks at the flag.
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

extern "C" fn on_sigterm(_signum: libc::c_int) {
    TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
}

/// Whether SIGTERM arrived since the current guard was installed.
pub fn termination_requested() -> bool {
    TERMINATION_REQUESTED.load(Ordering::SeqCst)
}

/// Converts SIGTERM into a flag until dropped; then SIGTERM is back to its
/// default disposition.
pub struct TerminationGuard {
    watchdog: Option<Watchdog>,
}

impl TerminationGuard {
    pub fn install() -> io::Result<Self> {
        TERMINATION_REQUESTED.store(false, Ordering::SeqCst);
        let action = SigAction::new(SigHandler::Handler(on_sigterm), SaFlags::empty(), SigSet::empty());
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(Signal::SIGTERM, &action) }?;
        Ok(Self { watchdog: None })
    }

    /// Run `on_expire` if SIGTERM is still unanswered `grace` after it arrived.
    pub fn with_watchdog<F>(mut self, grace: Duration, on_expire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        self.watchdog = Some(Watchdog::spawn(grace, termination_requested, on_expire)?);
        Ok(self)
    }
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        // stop the watchdog first so it never fires after the job has ended
        self.watchdog.take();
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: installing the default disposition.
        if let Err(e) = unsafe { sigaction(Signal::SIGTERM, &default) } {
            tracing::warn!(error = %e, "could not restore default SIGTERM handling");
        }
    }
}

/// Background thread that fires once a trigger has stayed raised for a
/// grace period. Dropping it stops the thread and waits for it.
pub struct Watchdog {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn<F>(grace: Duration, triggered: fn() -> bool, on_expire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("employee-watchdog".to_string())
            .spawn(move || watch(stop_rx, grace, triggered, on_expire))?;
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

fn watch<F: FnOnce()>(stop: Receiver<()>, grace: Duration, triggered: fn() -> bool, on_expire: F) {
    loop {
        match stop.recv_timeout(WATCH_INTERVAL) {
            Err(RecvTimeoutError::Timeout) if triggered() => break,
            Err(RecvTimeoutError::Timeout) => continue,
            _ => return,
        }
    }
    tracing::warn!(grace = ?grace, "termination requested, waiting for job to stop");
    if let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(grace) {
        on_expire();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Instant;

    static RAISED: AtomicBool = AtomicBool::new(false);
    static QUIET: AtomicBool = AtomicBool::new(false);

    fn raised() -> bool {
        RAISED.load(Ordering::SeqCst)
    }

    fn quiet() -> bool {
        QUIET.load(Ordering::SeqCst)
    }

    #[test]
    fn test_watchdog_fires_after_grace() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let started = Instant::now();
        let watchdog = Watchdog::spawn(Duration::from_millis(100), raised, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        RAISED.store(true, Ordering::SeqCst);
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(started.elapsed() < Duration::from_secs(10), "watchdog never fired");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        drop(watchdog);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watchdog_stopped_before_trigger_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let watchdog = Watchdog::spawn(Duration::ZERO, quiet, move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(120));
        let stopped = Instant::now();
        drop(watchdog);
        assert!(stopped.elapsed() < Duration::from_secs(1));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
