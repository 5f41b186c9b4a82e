//! Error types for the wire protocol.

use thiserror::Error;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The encoded meta does not fit the fixed header.
    #[error("message is {length} bytes, longer than maximum allowed by protocol ({max} bytes)")]
    MetaTooLong { length: usize, max: usize },

    #[error("invalid meta JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("meta is not a JSON object")]
    MetaNotObject,

    #[error("meta has no string 'type' field")]
    MissingType,

    #[error("invalid payload_length: {0}")]
    InvalidPayloadLength(String),

    /// A frame declared more payload than the receiver accepts.
    #[error("payload_length {length} exceeds maximum allowed by protocol ({max} bytes)")]
    PayloadTooLong { length: u64, max: usize },

    /// A known message type with fields that do not match its schema.
    #[error("invalid {kind} message: {reason}")]
    InvalidMessage { kind: String, reason: String },

    #[error("{kind} message arrived without a file descriptor")]
    MissingDescriptor { kind: String },

    #[error("descriptor attached while the decoder was not waiting for one")]
    UnexpectedDescriptor,
}

impl ProtocolError {
    /// Create an INVALID_MESSAGE error.
    pub fn invalid_message(kind: &str, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
