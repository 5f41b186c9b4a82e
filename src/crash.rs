//! Fatal-signal reporting.
//!
//! When the boss sends a `faulthandler` descriptor, fatal signals write a
//! one-line notice to it before the process dies with the default
//! disposition. Only async-signal-safe calls happen inside the handler.

use std::io;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Signals that get a notice.
pub const FATAL_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGABRT,
];

static REPORT_FD: AtomicI32 = AtomicI32::new(-1);

const NOTICE_CAPACITY: usize = 96;

/// Process-wide crash reporter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashReporter;

impl CrashReporter {
    /// Start reporting fatal signals to `fd`, replacing any earlier target.
    pub fn enable(fd: OwnedFd) -> io::Result<()> {
        let previous = REPORT_FD.swap(fd.into_raw_fd(), Ordering::SeqCst);
        close_raw(previous);

        let action = SigAction::new(
            SigHandler::Handler(on_fatal_signal),
            SaFlags::SA_RESETHAND,
            SigSet::empty(),
        );
        for signal in FATAL_SIGNALS {
            // SAFETY: the handler only touches an atomic and calls
            // async-signal-safe libc functions.
            unsafe { sigaction(signal, &action) }?;
        }
        tracing::debug!("fatal-signal reporting enabled");
        Ok(())
    }

    /// Stop reporting and restore default dispositions.
    pub fn disable() {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for signal in FATAL_SIGNALS {
            // SAFETY: installing the default disposition.
            let _ = unsafe { sigaction(signal, &default) };
        }
        close_raw(REPORT_FD.swap(-1, Ordering::SeqCst));
    }

    pub fn is_enabled() -> bool {
        REPORT_FD.load(Ordering::SeqCst) >= 0
    }
}

fn close_raw(fd: RawFd) {
    if fd >= 0 {
        // SAFETY: the descriptor was owned by REPORT_FD and nothing else
        // refers to it.
        unsafe {
            libc::close(fd);
        }
    }
}

fn signal_name(signum: libc::c_int) -> &'static [u8] {
    match signum {
        libc::SIGSEGV => b"SIGSEGV",
        libc::SIGBUS => b"SIGBUS",
        libc::SIGFPE => b"SIGFPE",
        libc::SIGILL => b"SIGILL",
        libc::SIGABRT => b"SIGABRT",
        _ => b"signal",
    }
}

/// Format the notice without allocating. Returns the length written.
fn format_notice(signum: libc::c_int, buf: &mut [u8; NOTICE_CAPACITY]) -> usize {
    let mut len = 0;
    let mut push = |bytes: &[u8]| {
        let n = bytes.len().min(NOTICE_CAPACITY - len);
        buf[len..len + n].copy_from_slice(&bytes[..n]);
        len += n;
    };

    push(b"Fatal ");
    push(signal_name(signum));
    push(b" (");

    let mut digits = [0u8; 12];
    let mut value = signum.unsigned_abs();
    let mut start = digits.len();
    loop {
        start -= 1;
        digits[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    push(&digits[start..]);
    push(b") in employee process\n");
    len
}

extern "C" fn on_fatal_signal(signum: libc::c_int) {
    let fd = REPORT_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let mut buf = [0u8; NOTICE_CAPACITY];
        let len = format_notice(signum, &mut buf);
        // SAFETY: write(2) and raise(3) are async-signal-safe.
        unsafe {
            libc::write(fd, buf.as_ptr().cast(), len);
        }
    }
    // SA_RESETHAND already restored the default disposition.
    unsafe {
        libc::raise(signum);
    }
}
