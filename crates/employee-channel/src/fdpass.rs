//! File descriptor passing over a Unix-domain socket.
//!
//! A descriptor travels as an `SCM_RIGHTS` control message attached to a
//! single marker byte, sent after the frame that announced it.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use employee_protocol::DESCRIPTOR_MARKER;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Send one descriptor.
pub fn send_descriptor(socket: BorrowedFd<'_>, descriptor: BorrowedFd<'_>) -> io::Result<()> {
    let marker = [DESCRIPTOR_MARKER];
    let iov = [IoSlice::new(&marker)];
    let fds = [descriptor.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    loop {
        match sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted no bytes for descriptor marker",
                ))
            }
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Receive exactly one descriptor. Extra descriptors in the same control
/// message are closed.
pub fn recv_descriptor(socket: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let mut marker = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut marker)];
    let mut space = nix::cmsg_space!([RawFd; 1]);

    let msg = loop {
        match recvmsg::<()>(socket.as_raw_fd(), &mut iov, Some(&mut space), recv_flags()) {
            Err(Errno::EINTR) => continue,
            other => break other?,
        }
    };

    if msg.bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection before sending a descriptor",
        ));
    }

    let mut received: Option<OwnedFd> = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // SAFETY: the kernel just installed this descriptor for us
                // and nothing else refers to it.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                if received.is_none() {
                    received = Some(owned);
                }
            }
        }
    }

    received.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "descriptor marker arrived without SCM_RIGHTS",
        )
    })
}
