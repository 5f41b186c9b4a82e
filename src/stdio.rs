//! Standard stream redirection.
//!
//! The boss hands over pipes for the job's stdout and stderr. Each
//! redirection duplicates the received descriptor over the process-wide
//! one, keeping a copy of the original so stderr can be put back before the
//! worker exits.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Which standard stream to redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Saved originals of redirected standard streams.
#[derive(Debug)]
pub struct StdioRedirects {
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    saved_stdout: Option<OwnedFd>,
    saved_stderr: Option<OwnedFd>,
}

impl Default for StdioRedirects {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioRedirects {
    /// Redirections over the real descriptors 1 and 2.
    pub fn new() -> Self {
        Self::with_targets(libc::STDOUT_FILENO, libc::STDERR_FILENO)
    }

    /// Redirections over arbitrary descriptors standing in for stdout and stderr.
    pub fn with_targets(stdout_fd: RawFd, stderr_fd: RawFd) -> Self {
        Self {
            stdout_fd,
            stderr_fd,
            saved_stdout: None,
            saved_stderr: None,
        }
    }

    /// Point `stream` at `received`.
    ///
    /// The first redirection of a stream records the original. `received`
    /// is closed once it has been duplicated.
    pub fn redirect(&mut self, stream: Stream, received: OwnedFd) -> io::Result<()> {
        let (target, saved) = match stream {
            Stream::Stdout => (self.stdout_fd, &mut self.saved_stdout),
            Stream::Stderr => (self.stderr_fd, &mut self.saved_stderr),
        };

        flush(stream);
        if saved.is_none() {
            // SAFETY: `target` is one of the descriptors this value was built
            // for, which stay open for the life of the process.
            let original = unsafe { BorrowedFd::borrow_raw(target) }.try_clone_to_owned()?;
            *saved = Some(original);
        }
        nix::unistd::dup2(received.as_raw_fd(), target)?;
        Ok(())
    }

    /// Put the original stderr back, if it was redirected.
    pub fn restore_stderr(&mut self) -> io::Result<()> {
        if let Some(original) = self.saved_stderr.take() {
            flush(Stream::Stderr);
            nix::unistd::dup2(original.as_raw_fd(), self.stderr_fd)?;
        }
        Ok(())
    }

    pub fn is_redirected(&self, stream: Stream) -> bool {
        match stream {
            Stream::Stdout => self.saved_stdout.is_some(),
            Stream::Stderr => self.saved_stderr.is_some(),
        }
    }
}

/// Flush the Rust-side buffers of a standard stream.
pub fn flush(stream: Stream) {
    let _ = match stream {
        Stream::Stdout => io::stdout().flush(),
        Stream::Stderr => io::stderr().flush(),
    };
}

/// Flush both standard streams.
pub fn flush_all() {
    flush(Stream::Stdout);
    flush(Stream::Stderr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::FromRawFd;

    fn read_all(file: &mut File) -> String {
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        out
    }

    /// Write through a raw descriptor without taking ownership of it.
    fn write_raw(fd: RawFd, bytes: &[u8]) {
        let mut file = std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn test_redirect_and_restore_stderr() {
        let mut original = tempfile::tempfile().unwrap();
        let mut pipe = tempfile::tempfile().unwrap();
        let stand_in = tempfile::tempfile().unwrap();

        let stderr_fd = original.try_clone().unwrap();
        let stderr_fd = std::os::fd::IntoRawFd::into_raw_fd(stderr_fd);
        let mut redirects = StdioRedirects::with_targets(stand_in.as_raw_fd(), stderr_fd);

        redirects
            .redirect(Stream::Stderr, OwnedFd::from(pipe.try_clone().unwrap()))
            .unwrap();
        assert!(redirects.is_redirected(Stream::Stderr));
        write_raw(stderr_fd, b"to the job");

        redirects.restore_stderr().unwrap();
        assert!(!redirects.is_redirected(Stream::Stderr));
        write_raw(stderr_fd, b"back home");

        assert_eq!(read_all(&mut pipe), "to the job");
        assert_eq!(read_all(&mut original), "back home");

        drop(unsafe { OwnedFd::from_raw_fd(stderr_fd) });
    }

    #[test]
    fn test_second_redirect_keeps_first_original() {
        let stand_in = tempfile::tempfile().unwrap();
        let mut original = tempfile::tempfile().unwrap();
        let mut first = tempfile::tempfile().unwrap();
        let mut second = tempfile::tempfile().unwrap();

        let target = std::os::fd::IntoRawFd::into_raw_fd(original.try_clone().unwrap());
        let mut redirects = StdioRedirects::with_targets(target, stand_in.as_raw_fd());

        redirects
            .redirect(Stream::Stdout, OwnedFd::from(first.try_clone().unwrap()))
            .unwrap();
        write_raw(target, b"one");
        redirects
            .redirect(Stream::Stdout, OwnedFd::from(second.try_clone().unwrap()))
            .unwrap();
        write_raw(target, b"two");

        assert_eq!(read_all(&mut first), "one");
        assert_eq!(read_all(&mut second), "two");
        assert_eq!(read_all(&mut original), "");

        drop(unsafe { OwnedFd::from_raw_fd(target) });
    }
}
