//! Unencrypted message envelope and message id helpers.
//!
//! Before an auth key exists, messages travel as
//! `auth_key_id = 0 (u64) | msg_id (u64) | body_len (u32) | body`.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the unencrypted envelope header
pub const PLAIN_HEADER_SIZE: usize = 20;

/// An unencrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainMessage {
    /// Message identifier
    pub msg_id: u64,
    /// TL-serialized body
    pub body: Bytes,
}

/// Wrap `body` into an unencrypted envelope.
pub fn encode_plain(msg_id: u64, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PLAIN_HEADER_SIZE + body.len());
    buf.put_u64_le(0);
    buf.put_u64_le(msg_id);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Parse an unencrypted envelope.
pub fn decode_plain(payload: &Bytes) -> Result<PlainMessage, WireError> {
    if payload.len() < PLAIN_HEADER_SIZE {
        return Err(WireError::Truncated(PLAIN_HEADER_SIZE - payload.len()));
    }
    if auth_key_id(payload) != Some(0) {
        return Err(WireError::Malformed("plain message with nonzero auth key id"));
    }

    let msg_id = u64::from_le_bytes(read8(&payload[8..16]));
    let len = u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]) as usize;
    let available = payload.len() - PLAIN_HEADER_SIZE;
    if len > available {
        return Err(WireError::Truncated(len - available));
    }

    Ok(PlainMessage {
        msg_id,
        body: payload.slice(PLAIN_HEADER_SIZE..PLAIN_HEADER_SIZE + len),
    })
}

/// Auth key id prefix of any MTProto payload.
pub fn auth_key_id(payload: &[u8]) -> Option<u64> {
    (payload.len() >= 8).then(|| u64::from_le_bytes(read8(&payload[..8])))
}

fn read8(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&slice[..8]);
    out
}

/// Message id for a client message sent at `unix_ms`.
///
/// The upper 32 bits hold whole seconds, the lower 32 bits the fraction of
/// the second. Client ids are divisible by four.
pub fn msg_id_at(unix_ms: u64) -> u64 {
    let seconds = unix_ms / 1000;
    let fraction = ((unix_ms % 1000) << 32) / 1000;
    ((seconds << 32) | fraction) & !3
}

/// Seconds part of a message id.
pub fn msg_id_seconds(msg_id: u64) -> i64 {
    (msg_id >> 32) as i64
}
