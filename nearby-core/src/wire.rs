//! Frame codec.
//!
//! A frame is a `u32` little-endian body length followed by the bincode body
//! of one [`Message`]. Bodies longer than [`MAX_FRAME_LEN`] are refused both
//! when encoding and when decoding, before anything is allocated for them.
//!
//! Transports here deliver whole frames, so receivers use [`decode_datagram`].
//! [`decode_frame`] is for byte streams, where a frame may arrive in pieces or
//! several may share one read.

use crate::protocol::Message;

/// Largest frame body.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Stream only: the buffer ends inside a frame.
    #[error("incomplete frame")]
    NeedMore,
    #[error("frame body of {0} bytes exceeds limit")]
    TooLarge(u64),
    #[error("{0} bytes after the frame")]
    TrailingBytes(usize),
    #[error("bincode: {0}")]
    Codec(#[from] bincode::Error),
}

pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    let body_len = bincode::serialized_size(msg)?;
    if body_len > u64::from(MAX_FRAME_LEN) {
        return Err(WireError::TooLarge(body_len));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body_len as usize);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    bincode::serialize_into(&mut frame, msg)?;
    Ok(frame)
}

/// Decode the frame at the front of `bytes`; returns it with the bytes it used.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), WireError> {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return Err(WireError::NeedMore);
    };
    let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if body_len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(body_len.into()));
    }
    let end = HEADER_LEN + body_len as usize;
    let body = bytes.get(HEADER_LEN..end).ok_or(WireError::NeedMore)?;
    Ok((bincode::deserialize(body)?, end))
}

/// Decode a buffer that must hold exactly one frame.
pub fn decode_datagram(bytes: &[u8]) -> Result<Message, WireError> {
    let (msg, used) = decode_frame(bytes)?;
    match bytes.len() - used {
        0 => Ok(msg),
        extra => Err(WireError::TrailingBytes(extra)),
    }
}
