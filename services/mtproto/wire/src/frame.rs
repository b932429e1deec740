//! Transport packet framing.
//!
//! Every packet on a TCP connection is laid out as
//!
//! ```text
//! +--------------------+------------------------------------+
//! | u32 LE length      | payload length + 12                |
//! +--------------------+------------------------------------+
//! | u32 LE packet_no   | per-connection counter from 0      |
//! +--------------------+------------------------------------+
//! | payload            | variable                           |
//! +--------------------+------------------------------------+
//! | u32 LE crc32       | IEEE CRC32 of all preceding bytes  |
//! +--------------------+------------------------------------+
//! ```

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes added around a payload by the packet framing
pub const PACKET_OVERHEAD: usize = 12;

/// Maximum packet size (16 MiB default, 64 MiB hard limit)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum packet size limit (64 MiB)
pub const HARD_MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Transport error code the server sends when it does not know the auth key
pub const BAD_AUTH_KEY_CODE: i32 = -404;

/// One decoded transport packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number assigned by the sender
    pub packet_number: u32,
    /// Packet payload without framing
    pub payload: Bytes,
}

impl Packet {
    /// Transport-level error code carried by this packet, if any.
    ///
    /// Servers report transport failures as a packet whose whole payload
    /// is a single negative little-endian `i32`.
    pub fn error_code(&self) -> Option<i32> {
        transport_error_code(&self.payload)
    }
}

/// Interpret a bare payload as a transport error code.
pub fn transport_error_code(payload: &[u8]) -> Option<i32> {
    if payload.len() != 4 {
        return None;
    }
    let code = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    (code < 0).then_some(code)
}

/// Frame a payload with the given packet number.
pub fn encode_packet(payload: &[u8], packet_number: u32) -> Bytes {
    let total = payload.len() + PACKET_OVERHEAD;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(total as u32);
    buf.put_u32_le(packet_number);
    buf.put_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

/// Stateful packet encoder that numbers packets sequentially
#[derive(Debug, Default)]
pub struct PacketEncoder {
    next_packet: u32,
}

impl PacketEncoder {
    /// Create an encoder starting at packet number zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame the next outgoing payload
    pub fn encode(&mut self, payload: &[u8]) -> Bytes {
        let packet_number = self.next_packet;
        self.next_packet = self.next_packet.wrapping_add(1);
        encode_packet(payload, packet_number)
    }

    /// Packet number the next call to [`encode`](Self::encode) will use
    pub fn next_packet(&self) -> u32 {
        self.next_packet
    }
}

/// Packet decoder for parsing incoming byte streams
#[derive(Debug)]
pub struct PacketDecoder {
    max_packet_size: usize,
}

impl PacketDecoder {
    /// Create a new packet decoder
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Create a decoder with a custom size limit, clamped to the hard maximum
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.clamp(PACKET_OVERHEAD, HARD_MAX_PACKET_SIZE),
        }
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full packet.
    /// Bytes are only consumed when a complete packet is available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < PACKET_OVERHEAD || len > self.max_packet_size {
            return Err(WireError::Length(len));
        }

        if buf.len() < len {
            return Ok(None);
        }

        let mut packet = buf.split_to(len);
        let crc_offset = len - 4;
        let expected = u32::from_le_bytes([
            packet[crc_offset],
            packet[crc_offset + 1],
            packet[crc_offset + 2],
            packet[crc_offset + 3],
        ]);
        let computed = crc32fast::hash(&packet[..crc_offset]);
        if expected != computed {
            return Err(WireError::Checksum { expected, computed });
        }

        packet.advance(4);
        let packet_number = packet.get_u32_le();
        packet.truncate(len - PACKET_OVERHEAD);

        Ok(Some(Packet {
            packet_number,
            payload: packet.freeze(),
        }))
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_packet_layout() {
        let packet = encode_packet(&[1, 2, 3, 4], 7);
        assert_eq!(
            packet.as_ref(),
            &[
                0x10, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x5b,
                0x06, 0x70, 0xea
            ]
        );
    }

    #[test]
    fn test_encoder_numbers_packets() {
        let mut encoder = PacketEncoder::new();
        let mut decoder = PacketDecoder::new();
        let mut buf = BytesMut::new();
        for _ in 0..3 {
            buf.extend_from_slice(&encoder.encode(b"ping"));
        }

        for expected in 0..3 {
            let packet = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(packet.packet_number, expected);
            assert_eq!(packet.payload.as_ref(), b"ping");
        }
        assert!(buf.is_empty());
        assert_eq!(encoder.next_packet(), 3);
    }

    #[test]
    fn test_partial_input_waits() {
        let packet = encode_packet(b"partial delivery", 0);
        let mut decoder = PacketDecoder::new();
        let mut buf = BytesMut::new();

        for byte in &packet[..packet.len() - 1] {
            buf.put_u8(*byte);
            assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        }
        assert_eq!(buf.len(), packet.len() - 1);

        buf.put_u8(packet[packet.len() - 1]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"partial delivery");
    }

    #[test]
    fn test_length_bounds() {
        let mut decoder = PacketDecoder::with_max_packet_size(1024);

        let mut short = BytesMut::from(&[8u8, 0, 0, 0][..]);
        assert_eq!(decoder.decode(&mut short), Err(WireError::Length(8)));

        let mut long = BytesMut::from(&2048u32.to_le_bytes()[..]);
        assert_eq!(decoder.decode(&mut long), Err(WireError::Length(2048)));
    }

    #[test]
    fn test_empty_payload() {
        let packet = encode_packet(&[], 0);
        assert_eq!(packet.len(), PACKET_OVERHEAD);
        let decoded = PacketDecoder::new()
            .decode(&mut BytesMut::from(packet.as_ref()))
            .unwrap()
            .unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_transport_error_code() {
        let packet = Packet {
            packet_number: 0,
            payload: Bytes::copy_from_slice(&BAD_AUTH_KEY_CODE.to_le_bytes()),
        };
        assert_eq!(packet.error_code(), Some(-404));
        assert_eq!(transport_error_code(&5i32.to_le_bytes()), None);
        assert_eq!(transport_error_code(&[0xff; 8]), None);
    }

    proptest! {
        #[test]
        fn prop_decode_recovers_payload(
            payload in proptest::collection::vec(any::<u8>(), 0..65536),
            packet_number in any::<u32>(),
        ) {
            let packet = encode_packet(&payload, packet_number);
            let mut buf = BytesMut::from(packet.as_ref());
            let decoded = PacketDecoder::new().decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded.packet_number, packet_number);
            prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_corrupted_checksum_rejected(
            payload in proptest::collection::vec(any::<u8>(), 0..1024),
            offset in 0usize..4,
            flip in 1u8..=255,
        ) {
            let mut packet = BytesMut::from(encode_packet(&payload, 1).as_ref());
            let index = packet.len() - 4 + offset;
            packet[index] ^= flip;
            let result = PacketDecoder::new().decode(&mut packet);
            let is_checksum_error = matches!(result, Err(WireError::Checksum { .. }));
            prop_assert!(is_checksum_error);
        }
    }
}
