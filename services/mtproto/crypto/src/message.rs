//! Encrypted message envelope.
//!
//! ```text
//! auth_key_id (8) | msg_key (16) | AES-IGE(
//!     salt (8) | session_id (8) | msg_id (8) | seq_no (4) | len (4) | body | padding
//! )
//! ```
//!
//! `msg_key` is the middle of SHA-1 over the plaintext without padding.

use crate::aes_ige;
use crate::hash::ct_eq;
use crate::kdf::{message_key, message_key_iv, Direction};
use crate::{AuthKey, CryptoError};
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

/// Bytes in front of the ciphertext
pub const OUTER_HEADER_SIZE: usize = 24;
/// Bytes of inner header before the body
pub const INNER_HEADER_SIZE: usize = 32;

/// Inner fields of an encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Server salt
    pub salt: u64,
    /// Session identifier
    pub session_id: u64,
    /// Message identifier
    pub msg_id: u64,
    /// Sequence number
    pub seq_no: u32,
}

/// A decrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Inner header fields
    pub header: MessageHeader,
    /// Message body
    pub body: Bytes,
}

/// Encrypt a message body for the wire.
pub fn encrypt_message(
    auth_key: &AuthKey,
    header: &MessageHeader,
    body: &[u8],
    direction: Direction,
) -> Result<Bytes, CryptoError> {
    let unpadded = INNER_HEADER_SIZE + body.len();
    let padding = (16 - unpadded % 16) % 16;

    let mut plain = BytesMut::with_capacity(unpadded + padding);
    plain.put_u64_le(header.salt);
    plain.put_u64_le(header.session_id);
    plain.put_u64_le(header.msg_id);
    plain.put_u32_le(header.seq_no);
    plain.put_u32_le(body.len() as u32);
    plain.put_slice(body);

    let msg_key = message_key(&plain);

    let mut pad = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut pad[..padding]);
    plain.put_slice(&pad[..padding]);

    let derived = message_key_iv(auth_key.key(), &msg_key, direction);
    aes_ige::encrypt(&derived.key, &derived.iv, &mut plain)?;

    let mut out = BytesMut::with_capacity(OUTER_HEADER_SIZE + plain.len());
    out.put_u64_le(auth_key.id());
    out.put_slice(&msg_key);
    out.put_slice(&plain);
    Ok(out.freeze())
}

/// Decrypt and authenticate a message from the wire.
pub fn decrypt_message(
    auth_key: &AuthKey,
    packet: &[u8],
    direction: Direction,
) -> Result<DecryptedMessage, CryptoError> {
    if packet.len() < OUTER_HEADER_SIZE + INNER_HEADER_SIZE
        || (packet.len() - OUTER_HEADER_SIZE) % 16 != 0
    {
        return Err(CryptoError::MessageLength(packet.len()));
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&packet[..8]);
    let actual = u64::from_le_bytes(id);
    if actual != auth_key.id() {
        return Err(CryptoError::AuthKeyMismatch {
            expected: auth_key.id(),
            actual,
        });
    }

    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&packet[8..OUTER_HEADER_SIZE]);

    let derived = message_key_iv(auth_key.key(), &msg_key, direction);
    let mut plain = BytesMut::from(&packet[OUTER_HEADER_SIZE..]);
    aes_ige::decrypt(&derived.key, &derived.iv, &mut plain)?;

    let len = u32::from_le_bytes([plain[28], plain[29], plain[30], plain[31]]);
    let end = INNER_HEADER_SIZE + len as usize;
    if len % 4 != 0 || end > plain.len() || plain.len() - end >= 16 {
        return Err(CryptoError::InnerLength(len));
    }
    if !ct_eq(&message_key(&plain[..end]), &msg_key) {
        return Err(CryptoError::MessageKeyMismatch);
    }

    let field = |offset: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&plain[offset..offset + 8]);
        u64::from_le_bytes(raw)
    };
    let header = MessageHeader {
        salt: field(0),
        session_id: field(8),
        msg_id: field(16),
        seq_no: u32::from_le_bytes([plain[24], plain[25], plain[26], plain[27]]),
    };

    let body = plain.freeze().slice(INNER_HEADER_SIZE..end);
    Ok(DecryptedMessage { header, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AuthKey {
        let mut raw = [0u8; 256];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = (i * 13 + 1) as u8;
        }
        AuthKey::new(raw)
    }

    fn header() -> MessageHeader {
        MessageHeader {
            salt: 0x1122334455667788,
            session_id: 0x0102030405060708,
            msg_id: 0x5e0b800e00000004,
            seq_no: 3,
        }
    }

    #[test]
    fn test_roundtrip_between_directions() {
        let key = test_key();
        let packet = encrypt_message(&key, &header(), b"payload!", Direction::ClientToServer).unwrap();
        assert_eq!((packet.len() - OUTER_HEADER_SIZE) % 16, 0);
        assert_eq!(&packet[..8], &key.id().to_le_bytes());

        let decrypted = decrypt_message(&key, &packet, Direction::ClientToServer).unwrap();
        assert_eq!(decrypted.header, header());
        assert_eq!(decrypted.body.as_ref(), b"payload!");

        assert!(decrypt_message(&key, &packet, Direction::ServerToClient).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = test_key();
        let packet = encrypt_message(&key, &header(), &[0u8; 64], Direction::ServerToClient).unwrap();
        let mut tampered = packet.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;
        assert!(decrypt_message(&key, &tampered, Direction::ServerToClient).is_err());
    }

    #[test]
    fn test_foreign_key_rejected() {
        let key = test_key();
        let other = AuthKey::new([7u8; 256]);
        let packet = encrypt_message(&other, &header(), b"data", Direction::ServerToClient).unwrap();
        assert!(matches!(
            decrypt_message(&key, &packet, Direction::ServerToClient),
            Err(CryptoError::AuthKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_short_packet_rejected() {
        let key = test_key();
        assert_eq!(
            decrypt_message(&key, &[0u8; 40], Direction::ServerToClient),
            Err(CryptoError::MessageLength(40))
        );
    }
}
