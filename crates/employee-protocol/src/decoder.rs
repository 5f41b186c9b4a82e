//! Incremental frame decoder.
//!
//! State machine: `Meta → Payload? → Descriptor? → Ready`.
//!
//! The decoder is fed whatever a socket read returned, in pieces of any
//! size. It never consumes more bytes than the current state needs, and
//! [`Decoder::want`] tells the reader exactly how many bytes to ask for next.
//! That matters for descriptor passing: the descriptor rides on a one-byte
//! marker after the payload, and a read that swallowed that byte as data
//! would lose the descriptor.

use std::os::fd::OwnedFd;

use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::decode_meta;
use crate::meta::Meta;
use crate::{keys, MAX_PAYLOAD_LENGTH, META_LENGTH};

/// Payload buffer reserved up front; larger payloads grow as bytes arrive.
const PAYLOAD_RESERVE: usize = 64 * 1024;

/// What the decoder needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// Up to this many bytes of frame data.
    Bytes(usize),
    /// One file descriptor received out-of-band.
    Descriptor,
    /// A complete message is available.
    Ready,
}

/// A complete message.
#[derive(Debug)]
pub struct Message {
    pub meta: Meta,
    pub payload: Vec<u8>,
    pub descriptor: Option<OwnedFd>,
}

impl Message {
    pub fn new(meta: Meta) -> Self {
        Self {
            meta,
            payload: Vec::new(),
            descriptor: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_descriptor(mut self, descriptor: OwnedFd) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// The message type. Decoded messages always have one.
    pub fn kind(&self) -> &str {
        self.meta.kind().unwrap_or_default()
    }

    /// The failure carried by a locally synthesized message, if any.
    pub fn raised(&self) -> Option<&str> {
        self.meta.get(keys::RAISE).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Meta,
    Payload,
    Descriptor,
    Ready,
}

/// Decoder for one message at a time.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    header: Vec<u8>,
    meta: Option<Meta>,
    payload: Vec<u8>,
    payload_length: usize,
    has_fd: bool,
    descriptor: Option<OwnedFd>,
    max_payload: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Meta,
            header: Vec::with_capacity(META_LENGTH),
            meta: None,
            payload: Vec::new(),
            payload_length: 0,
            has_fd: false,
            descriptor: None,
            max_payload: MAX_PAYLOAD_LENGTH,
        }
    }

    /// A decoder that rejects frames declaring more than `max` payload bytes.
    pub fn with_max_payload(max: usize) -> Self {
        Self {
            max_payload: max,
            ..Self::new()
        }
    }

    pub fn want(&self) -> Want {
        match self.state {
            State::Meta => Want::Bytes(META_LENGTH - self.header.len()),
            State::Payload => Want::Bytes(self.payload_length - self.payload.len()),
            State::Descriptor => Want::Descriptor,
            State::Ready => Want::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Feed frame bytes. Returns how many of them were consumed; bytes past
    /// the end of the current message are left for the caller.
    pub fn feed(&mut self, bytes: &[u8]) -> ProtocolResult<usize> {
        let mut consumed = 0;

        while consumed < bytes.len() {
            let rest = &bytes[consumed..];
            match self.state {
                State::Meta => {
                    let take = rest.len().min(META_LENGTH - self.header.len());
                    self.header.extend_from_slice(&rest[..take]);
                    consumed += take;
                    if self.header.len() == META_LENGTH {
                        self.finish_meta()?;
                    }
                }
                State::Payload => {
                    let take = rest.len().min(self.payload_length - self.payload.len());
                    self.payload.extend_from_slice(&rest[..take]);
                    consumed += take;
                    if self.payload.len() == self.payload_length {
                        self.state = if self.has_fd { State::Descriptor } else { State::Ready };
                    }
                }
                State::Descriptor | State::Ready => break,
            }
        }

        Ok(consumed)
    }

    /// Attach the descriptor the meta announced.
    pub fn attach_descriptor(&mut self, descriptor: OwnedFd) -> ProtocolResult<()> {
        if self.state != State::Descriptor {
            return Err(ProtocolError::UnexpectedDescriptor);
        }
        self.descriptor = Some(descriptor);
        self.state = State::Ready;
        Ok(())
    }

    /// Take the completed message and reset for the next one.
    pub fn take_message(&mut self) -> Option<Message> {
        if self.state != State::Ready {
            return None;
        }
        let max_payload = self.max_payload;
        let finished = std::mem::replace(self, Self::with_max_payload(max_payload));
        finished.meta.map(|meta| Message {
            meta,
            payload: finished.payload,
            descriptor: finished.descriptor,
        })
    }

    fn finish_meta(&mut self) -> ProtocolResult<()> {
        let mut meta = decode_meta(&self.header)?;
        if meta.kind().is_none() {
            return Err(ProtocolError::MissingType);
        }

        let declared = match meta.remove(keys::PAYLOAD_LENGTH) {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| ProtocolError::InvalidPayloadLength(value.to_string()))?,
        };
        self.payload_length = usize::try_from(declared)
            .ok()
            .filter(|length| *length <= self.max_payload)
            .ok_or(ProtocolError::PayloadTooLong {
                length: declared,
                max: self.max_payload,
            })?;
        self.has_fd = matches!(meta.remove(keys::HAS_FD), Some(Value::Bool(true)));

        self.payload = Vec::with_capacity(self.payload_length.min(PAYLOAD_RESERVE));
        self.meta = Some(meta);
        self.state = if self.payload_length > 0 {
            State::Payload
        } else if self.has_fd {
            State::Descriptor
        } else {
            State::Ready
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use std::fs::File;

    fn null_fd() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    fn feed_in_chunks(decoder: &mut Decoder, frame: &[u8], chunk: usize) -> usize {
        let mut offset = 0;
        while offset < frame.len() {
            let Want::Bytes(n) = decoder.want() else { break };
            let end = (offset + n.min(chunk)).min(frame.len());
            let used = decoder.feed(&frame[offset..end]).unwrap();
            assert_eq!(used, end - offset);
            offset = end;
        }
        offset
    }

    #[test]
    fn test_meta_only_message() {
        let frame = encode_frame(&Meta::typed("die"), &[], false).unwrap();
        let mut decoder = Decoder::new();
        assert_eq!(decoder.want(), Want::Bytes(META_LENGTH));

        assert_eq!(decoder.feed(&frame).unwrap(), META_LENGTH);
        assert!(decoder.is_ready());

        let message = decoder.take_message().unwrap();
        assert_eq!(message.kind(), "die");
        assert!(message.payload.is_empty());
        assert!(message.descriptor.is_none());
        assert_eq!(decoder.want(), Want::Bytes(META_LENGTH));
    }

    #[test]
    fn test_round_trip_reproduces_meta_and_payload() {
        let meta = Meta::typed("finished").with("runtime", 0.25).with("traceback", true);
        let payload = b"Traceback: boom".to_vec();
        let frame = encode_frame(&meta, &payload, false).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(&frame).unwrap();
        let message = decoder.take_message().unwrap();

        assert_eq!(message.meta, meta);
        assert_eq!(message.payload, payload);
    }

    #[test]
    fn test_ready_independent_of_chunk_boundaries() {
        for payload_length in [0usize, 1, 17, 1023, 1024, 5000] {
            let payload: Vec<u8> = (0..payload_length).map(|i| (i % 251) as u8).collect();
            let frame = encode_frame(&Meta::typed("assign"), &payload, false).unwrap();

            for chunk in [1usize, 3, 7, 512, 4096] {
                let mut decoder = Decoder::new();
                let mut offset = 0;
                while offset < frame.len() {
                    assert!(!decoder.is_ready(), "ready before all {} bytes fed", frame.len());
                    let end = (offset + chunk).min(frame.len());
                    offset += decoder.feed(&frame[offset..end]).unwrap();
                }
                assert!(decoder.is_ready(), "len={} chunk={}", payload_length, chunk);
                assert_eq!(decoder.take_message().unwrap().payload, payload);
            }
        }
    }

    #[test]
    fn test_feed_stops_at_message_boundary() {
        let mut stream = encode_frame(&Meta::typed("stdout"), b"ab", false).unwrap();
        stream.extend(encode_frame(&Meta::typed("die"), &[], false).unwrap());

        let mut decoder = Decoder::new();
        let used = decoder.feed(&stream).unwrap();
        assert_eq!(used, META_LENGTH + 2);
        assert_eq!(decoder.take_message().unwrap().kind(), "stdout");

        decoder.feed(&stream[used..]).unwrap();
        assert_eq!(decoder.take_message().unwrap().kind(), "die");
    }

    #[test]
    fn test_descriptor_state_after_payload() {
        let frame = encode_frame(&Meta::typed("stdout"), b"xyz", true).unwrap();
        let mut decoder = Decoder::new();

        let consumed = feed_in_chunks(&mut decoder, &frame, 100);
        assert_eq!(consumed, frame.len());
        assert_eq!(decoder.want(), Want::Descriptor);
        assert_eq!(decoder.feed(b"*").unwrap(), 0);

        decoder.attach_descriptor(null_fd()).unwrap();
        let message = decoder.take_message().unwrap();
        assert_eq!(message.payload, b"xyz");
        assert!(message.descriptor.is_some());
        assert!(!message.meta.contains_key(keys::HAS_FD));
    }

    #[test]
    fn test_descriptor_without_payload() {
        let frame = encode_frame(&Meta::typed("pilog"), &[], true).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&frame).unwrap();
        assert_eq!(decoder.want(), Want::Descriptor);
    }

    #[test]
    fn test_unexpected_descriptor() {
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.attach_descriptor(null_fd()),
            Err(ProtocolError::UnexpectedDescriptor)
        ));
    }

    #[test]
    fn test_missing_type_rejected() {
        let frame = encode_frame(&Meta::new().with("jid", 1), &[], false).unwrap();
        let mut decoder = Decoder::new();
        assert!(matches!(decoder.feed(&frame), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn test_bad_payload_length_rejected() {
        let mut header = br#"{"type":"assign","payload_length":-4}"#.to_vec();
        header.resize(META_LENGTH, b' ');
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.feed(&header),
            Err(ProtocolError::InvalidPayloadLength(_))
        ));
    }

    #[test]
    fn test_declared_payload_over_limit_rejected() {
        let mut header = format!(r#"{{"type":"assign","payload_length":{}}}"#, u64::MAX).into_bytes();
        header.resize(META_LENGTH, b' ');
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.feed(&header),
            Err(ProtocolError::PayloadTooLong { length: u64::MAX, .. })
        ));

        let frame = encode_frame(&Meta::typed("assign"), &[1u8; 65], false).unwrap();
        let mut small = Decoder::with_max_payload(64);
        assert!(matches!(
            small.feed(&frame),
            Err(ProtocolError::PayloadTooLong { length: 65, max: 64 })
        ));
    }

    #[test]
    fn test_payload_limit_survives_take_message() {
        let mut stream = encode_frame(&Meta::typed("assign"), &[1u8; 64], false).unwrap();
        stream.extend(encode_frame(&Meta::typed("assign"), &[1u8; 65], false).unwrap());

        let mut decoder = Decoder::with_max_payload(64);
        let used = decoder.feed(&stream).unwrap();
        assert_eq!(decoder.take_message().unwrap().payload.len(), 64);
        assert!(matches!(
            decoder.feed(&stream[used..]),
            Err(ProtocolError::PayloadTooLong { .. })
        ));
    }

    #[test]
    fn test_large_declared_payload_is_not_reserved_up_front() {
        let mut header = format!(r#"{{"type":"assign","payload_length":{}}}"#, MAX_PAYLOAD_LENGTH)
            .into_bytes();
        header.resize(META_LENGTH, b' ');
        let mut decoder = Decoder::new();
        decoder.feed(&header).unwrap();
        assert_eq!(decoder.want(), Want::Bytes(MAX_PAYLOAD_LENGTH));
        assert!(decoder.payload.capacity() < MAX_PAYLOAD_LENGTH);
    }
}
