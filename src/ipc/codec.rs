//! Frame layout for the client/server channel.
//!
//! Each frame is a 12-byte header followed by the payload:
//! `[4B type][4B peer_id][4B len]`, all host-native byte order (the channel
//! never leaves the machine). `len` counts the header as well as the payload
//! and is capped at [`MAX_FRAME_SIZE`].

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::ipc::message::MsgType;

pub const HEADER_SIZE: usize = 12;
pub const MAX_FRAME_SIZE: usize = 16384;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw wire value; see [`MsgType::from_raw`].
    pub kind: u32,
    pub peer_id: u32,
    pub payload: Vec<u8>,
}

pub fn encode(kind: MsgType, peer_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let total = HEADER_SIZE + payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame too large: {total} bytes"
        )));
    }
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(kind as u32).to_ne_bytes());
    buf.extend_from_slice(&peer_id.to_ne_bytes());
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Pop one complete frame off the front of `buf`, or return `None` if more
/// bytes are needed. A header that cannot be valid is a protocol error.
pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let kind = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let peer_id = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
    let len = u32::from_ne_bytes(buf[8..12].try_into().unwrap()) as usize;
    if len < HEADER_SIZE || len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("bad frame length: {len}")));
    }
    if buf.len() < len {
        return Ok(None);
    }
    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(len - HEADER_SIZE).to_vec();
    Ok(Some(Frame {
        kind,
        peer_id,
        payload,
    }))
}
