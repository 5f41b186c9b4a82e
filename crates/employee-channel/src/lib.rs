//! Employee Channel
//!
//! Full-duplex message transport over one Unix-domain stream socket.
//!
//! A [`Channel`] owns the socket and runs two background threads: a send
//! loop draining the outbound queue and a receive loop decoding frames into
//! the inbound queue. Heartbeats from the boss are answered by the receive
//! loop and never reach the consumer. When either loop hits an I/O or
//! protocol failure it queues a synthetic `die` message carrying the failure,
//! so a consumer blocked in [`Channel::read`] always wakes up.

pub mod channel;
pub mod error;
pub mod fdpass;
pub mod reader;

pub use channel::{Channel, Reporter};
pub use error::{ChannelError, ChannelResult};
pub use reader::MessageReader;
