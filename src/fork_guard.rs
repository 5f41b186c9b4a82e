//! Keeps forked children off the boss connection.
//!
//! Job code may fork. A child must never talk on the parent's socket, so a
//! `pthread_atfork` child hook closes the inherited descriptor before any
//! other code runs in the child.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

static GUARDED_FD: AtomicI32 = AtomicI32::new(-1);
static REGISTERED: OnceLock<libc::c_int> = OnceLock::new();

unsafe extern "C" fn close_in_child() {
    let fd = GUARDED_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        libc::close(fd);
    }
}

/// Close `fd` in every child forked from now on.
pub fn install(fd: RawFd) -> io::Result<()> {
    let status = *REGISTERED.get_or_init(|| {
        // SAFETY: the child hook only uses an atomic and close(2).
        unsafe { libc::pthread_atfork(None, None, Some(close_in_child)) }
    });
    if status != 0 {
        return Err(io::Error::from_raw_os_error(status));
    }
    GUARDED_FD.store(fd, Ordering::SeqCst);
    tracing::debug!(fd, "fork guard installed");
    Ok(())
}

/// Stop guarding. The hook stays registered but does nothing.
pub fn release() {
    GUARDED_FD.store(-1, Ordering::SeqCst);
}

pub fn guarded_fd() -> Option<RawFd> {
    let fd = GUARDED_FD.load(Ordering::SeqCst);
    (fd >= 0).then_some(fd)
}
