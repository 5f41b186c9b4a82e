//! Frame encoding.
//!
//! A frame is the meta serialized as compact JSON, right-padded with spaces
//! to [`META_LENGTH`] bytes, followed by the payload. When a descriptor is
//! attached the meta says so (`has_fd`) and the transport sends it after the
//! payload.

use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::meta::Meta;
use crate::{keys, MAX_PAYLOAD_LENGTH, META_LENGTH};

/// Encode a frame.
///
/// Works on a copy of `meta`, so the caller's mapping never observes the
/// injected `payload_length`/`has_fd` keys. Fails before producing any bytes
/// if the encoded meta exceeds [`META_LENGTH`] or the payload exceeds
/// [`MAX_PAYLOAD_LENGTH`].
pub fn encode_frame(meta: &Meta, payload: &[u8], has_fd: bool) -> ProtocolResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(ProtocolError::PayloadTooLong {
            length: payload.len() as u64,
            max: MAX_PAYLOAD_LENGTH,
        });
    }
    let mut header = meta.clone();
    header.remove(keys::PAYLOAD_LENGTH);
    header.remove(keys::HAS_FD);
    header.remove(keys::RAISE);

    if !payload.is_empty() {
        header.insert(keys::PAYLOAD_LENGTH, payload.len());
    }
    if has_fd {
        header.insert(keys::HAS_FD, true);
    }

    let mut data = serde_json::to_vec(&header)?;
    if data.len() > META_LENGTH {
        return Err(ProtocolError::MetaTooLong {
            length: data.len(),
            max: META_LENGTH,
        });
    }

    data.resize(META_LENGTH, b' ');
    data.reserve(payload.len());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Decode a complete meta header.
pub fn decode_meta(header: &[u8]) -> ProtocolResult<Meta> {
    match serde_json::from_slice::<Value>(header)? {
        Value::Object(map) => Ok(Meta::from(map)),
        _ => Err(ProtocolError::MetaNotObject),
    }
}
