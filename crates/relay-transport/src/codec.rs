//! Frame layout: a 4-byte big-endian length prefix followed by a JSON document.
//! The acknowledgment is a frame holding exactly [`ACK_BYTE`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::Result;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const ACK_BYTE: u8 = 0x06;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

pub fn ack_frame() -> Bytes {
    Bytes::from_static(&[ACK_BYTE])
}

pub fn is_ack(frame: &[u8]) -> bool {
    matches!(frame, [ACK_BYTE])
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}
