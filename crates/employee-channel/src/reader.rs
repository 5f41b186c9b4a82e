//! Blocking message reader.
//!
//! Drives a [`Decoder`] from a socket, asking for exactly the number of
//! bytes the decoder wants so a descriptor marker is never read as data.

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use employee_protocol::{Decoder, Message, Want};

use crate::error::{ChannelError, ChannelResult};
use crate::fdpass;

/// Size of the scratch buffer used for socket reads.
const READ_CHUNK: usize = 64 * 1024;

/// Reads complete messages from a socket.
pub struct MessageReader {
    socket: Arc<UnixStream>,
    decoder: Decoder,
    buffer: Box<[u8]>,
}

impl MessageReader {
    pub fn new(socket: Arc<UnixStream>) -> Self {
        Self {
            socket,
            decoder: Decoder::new(),
            buffer: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Block until one full message (including any descriptor) has arrived.
    ///
    /// A zero-length read in any decoder state is reported as
    /// [`ChannelError::ConnectionLost`].
    pub fn read_message(&mut self) -> ChannelResult<Message> {
        loop {
            match self.decoder.want() {
                Want::Ready => {
                    if let Some(message) = self.decoder.take_message() {
                        return Ok(message);
                    }
                }
                Want::Bytes(wanted) => {
                    let limit = wanted.min(self.buffer.len());
                    let read = match (&*self.socket).read(&mut self.buffer[..limit]) {
                        Ok(0) => {
                            return Err(ChannelError::ConnectionLost(
                                "peer closed the connection".to_string(),
                            ))
                        }
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    };
                    self.decoder.feed(&self.buffer[..read])?;
                }
                Want::Descriptor => {
                    let descriptor = match fdpass::recv_descriptor(self.socket.as_fd()) {
                        Ok(fd) => fd,
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            return Err(ChannelError::ConnectionLost(e.to_string()))
                        }
                        Err(e) => return Err(e.into()),
                    };
                    self.decoder.attach_descriptor(descriptor)?;
                }
            }
        }
    }
}
