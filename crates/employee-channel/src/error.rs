//! Error types for the channel.

use std::io;

use employee_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced to channel users.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer went away or a transport loop failed. Carries the failure
    /// reported by the loop that noticed first.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Both transport loops are gone and nothing is left to read.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Whether this error means the transport can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Closed)
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
