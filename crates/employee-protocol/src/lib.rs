//! Employee Protocol Types
//!
//! Defines the framing used between the boss (per-host supervisor) and an
//! employee (per-job worker process):
//!
//! - a fixed 1024-byte, space-padded JSON header ("meta")
//! - an optional payload whose length the meta declares
//! - an optional file descriptor passed out-of-band after the payload
//!
//! The typed views of the messages each side understands live in
//! [`control`] (boss → employee) and [`report`] (employee → boss).

pub mod control;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod meta;
pub mod report;

pub use control::{AssignMessage, Assignment, ControlMessage, Credentials, JobKind, PayloadParts, Setup};
pub use decoder::{Decoder, Message, Want};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{decode_meta, encode_frame};
pub use meta::Meta;
pub use report::Report;

/// Size of the encoded meta header. Every frame starts with exactly this many bytes.
pub const META_LENGTH: usize = 1024;

/// Largest payload a frame may declare.
pub const MAX_PAYLOAD_LENGTH: usize = 1 << 30;

/// Byte sent alongside an `SCM_RIGHTS` control message when a descriptor follows a frame.
pub const DESCRIPTOR_MARKER: u8 = b'*';

/// Reserved meta keys.
pub mod keys {
    pub const TYPE: &str = "type";
    pub const PAYLOAD_LENGTH: &str = "payload_length";
    pub const HAS_FD: &str = "has_fd";
    /// Marks a locally synthesized message that stands for a transport failure.
    /// Never sent over the wire.
    pub const RAISE: &str = "raise";
}

/// Known message type names.
pub mod names {
    // boss -> employee
    pub const SETUP: &str = "setup";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const LOGGING: &str = "logging";
    pub const FAULTHANDLER: &str = "faulthandler";
    pub const PILOG: &str = "pilog";
    pub const ASSIGN: &str = "assign";
    pub const DIE: &str = "die";

    // employee -> boss
    pub const PROCESSING: &str = "processing";
    pub const PROFILE: &str = "profile";
    pub const FINISHED: &str = "finished";

    // both directions
    pub const INFO: &str = "info";
    pub const HEARTBEAT: &str = "heartbeat";
}
