//! AES key and IV derivation.

use crate::hash::sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256-IGE key and IV pair
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesKeyIv {
    /// 256-bit key
    pub key: [u8; 32],
    /// 256-bit IGE IV
    pub iv: [u8; 32],
}

impl std::fmt::Debug for AesKeyIv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKeyIv").finish_non_exhaustive()
    }
}

/// Which side encrypted a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the client
    ClientToServer,
    /// Sent by the server
    ServerToClient,
}

impl Direction {
    fn offset(self) -> usize {
        match self {
            Self::ClientToServer => 0,
            Self::ServerToClient => 8,
        }
    }
}

/// Temporary key used to protect the DH exchange.
pub fn handshake_key_iv(new_nonce: &[u8; 32], server_nonce: &[u8; 16]) -> AesKeyIv {
    let ns = sha1(&[new_nonce, server_nonce]);
    let sn = sha1(&[server_nonce, new_nonce]);
    let nn = sha1(&[new_nonce, new_nonce]);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&ns);
    key[20..].copy_from_slice(&sn[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&sn[12..20]);
    iv[8..28].copy_from_slice(&nn);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    AesKeyIv { key, iv }
}

/// Per-message key derived from the auth key and msg_key.
pub fn message_key_iv(auth_key: &[u8; 256], msg_key: &[u8; 16], direction: Direction) -> AesKeyIv {
    let x = direction.offset();
    let a = sha1(&[msg_key, &auth_key[x..x + 32]]);
    let b = sha1(&[&auth_key[32 + x..48 + x], msg_key, &auth_key[48 + x..64 + x]]);
    let c = sha1(&[&auth_key[64 + x..96 + x], msg_key]);
    let d = sha1(&[msg_key, &auth_key[96 + x..128 + x]]);

    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&a[..8]);
    key[8..20].copy_from_slice(&b[8..20]);
    key[20..].copy_from_slice(&c[4..16]);

    let mut iv = [0u8; 32];
    iv[..12].copy_from_slice(&a[8..20]);
    iv[12..20].copy_from_slice(&b[..8]);
    iv[20..24].copy_from_slice(&c[16..20]);
    iv[24..].copy_from_slice(&d[..8]);

    AesKeyIv { key, iv }
}

/// msg_key of a plaintext: the middle 128 bits of its SHA-1.
pub fn message_key(plaintext: &[u8]) -> [u8; 16] {
    let hash = sha1(&[plaintext]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[4..20]);
    out
}

/// `new_nonce_hash{number}` for the DH answer checks.
pub fn new_nonce_hash(new_nonce: &[u8; 32], number: u8, aux_hash: u64) -> [u8; 16] {
    let hash = sha1(&[new_nonce, &[number], &aux_hash.to_le_bytes()]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[4..20]);
    out
}

/// Initial server salt: `new_nonce[0..8] XOR server_nonce[0..8]`.
pub fn initial_salt(new_nonce: &[u8; 32], server_nonce: &[u8; 16]) -> u64 {
    let mut salt = [0u8; 8];
    for (i, byte) in salt.iter_mut().enumerate() {
        *byte = new_nonce[i] ^ server_nonce[i];
    }
    u64::from_le_bytes(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_auth_key() -> [u8; 256] {
        let mut key = [0u8; 256];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = ((i * 7 + 3) & 0xff) as u8;
        }
        key
    }

    #[test]
    fn test_handshake_key_iv_vector() {
        let new_nonce: [u8; 32] =
            hex::decode("311C85DB234AA2640AFC4A76A735CF5B1F0FD68BD17FA181E1229AD867CC024D")
                .unwrap()
                .try_into()
                .unwrap();
        let server_nonce: [u8; 16] = hex::decode("A5CF4D33F4A11EA877BA4AA573907330")
            .unwrap()
            .try_into()
            .unwrap();

        let derived = handshake_key_iv(&new_nonce, &server_nonce);
        assert_eq!(
            hex::encode_upper(derived.key),
            "F011280887C7BB01DF0FC4E17830E0B91FBB8BE4B2267CB985AE25F33B527253"
        );
        assert_eq!(
            hex::encode_upper(derived.iv),
            "3212D579EE35452ED23E0D0C92841AA7D31B2E9BDEF2151E80D15860311C85DB"
        );
    }

    #[test]
    fn test_message_key_iv_vector() {
        let auth_key = patterned_auth_key();
        let mut msg_key = [0u8; 16];
        for (i, byte) in msg_key.iter_mut().enumerate() {
            *byte = 0xa0 + i as u8;
        }

        let derived = message_key_iv(&auth_key, &msg_key, Direction::ClientToServer);
        assert_eq!(
            hex::encode(derived.key),
            "75006915073cf5af0c74b1eff9d9cb9b77349e8ba49d3cfcd25fb574623a240f"
        );
        assert_eq!(
            hex::encode(derived.iv),
            "329834aaec23cc3f064cb89197587388f360e2f5e04a6c697ee46c13c2760552"
        );

        let reverse = message_key_iv(&auth_key, &msg_key, Direction::ServerToClient);
        assert_ne!(reverse.key, derived.key);
    }

    #[test]
    fn test_initial_salt() {
        let mut new_nonce = [0u8; 32];
        new_nonce[..8].copy_from_slice(&[0xff, 0, 0xff, 0, 1, 2, 3, 4]);
        let mut server_nonce = [0u8; 16];
        server_nonce[..8].copy_from_slice(&[0x0f, 0, 0xf0, 0, 1, 2, 3, 5]);
        assert_eq!(
            initial_salt(&new_nonce, &server_nonce),
            u64::from_le_bytes([0xf0, 0, 0x0f, 0, 0, 0, 0, 1])
        );
    }

    #[test]
    fn test_new_nonce_hash_depends_on_number() {
        let new_nonce = [9u8; 32];
        assert_ne!(
            new_nonce_hash(&new_nonce, 1, 42),
            new_nonce_hash(&new_nonce, 2, 42)
        );
    }
}
