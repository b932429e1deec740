//! Long-lived 2048-bit auth key.

use crate::hash::sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an auth key in bytes
pub const AUTH_KEY_SIZE: usize = 256;

/// Shared secret established by the DH exchange.
///
/// Key bytes are wiped when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey {
    key: [u8; AUTH_KEY_SIZE],
    #[zeroize(skip)]
    id: u64,
    #[zeroize(skip)]
    aux_hash: u64,
}

impl AuthKey {
    /// Wrap raw key bytes and precompute the key id and aux hash
    pub fn new(key: [u8; AUTH_KEY_SIZE]) -> Self {
        let hash = sha1(&[&key]);
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash[12..20]);
        let mut aux = [0u8; 8];
        aux.copy_from_slice(&hash[..8]);
        Self {
            key,
            id: u64::from_le_bytes(id),
            aux_hash: u64::from_le_bytes(aux),
        }
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8; AUTH_KEY_SIZE] {
        &self.key
    }

    /// Lower 64 bits of SHA-1(key), sent in front of every encrypted message
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Upper 64 bits of SHA-1(key), used in new nonce hashes and retry ids
    pub fn aux_hash(&self) -> u64 {
        self.aux_hash
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKey")
            .field("id", &format_args!("{:#018x}", self.id))
            .finish_non_exhaustive()
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        crate::hash::ct_eq(&self.key, &other.key)
    }
}

impl Eq for AuthKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_and_aux_hash() {
        let mut raw = [0u8; AUTH_KEY_SIZE];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = ((i * 7 + 3) & 0xff) as u8;
        }
        let key = AuthKey::new(raw);
        assert_eq!(key.id(), 0x31c96c19efe6d69e);
        assert_eq!(key.aux_hash(), 0x2edc73d32ce6a06a);
        assert_eq!(key.key(), &raw);
    }

    #[test]
    fn test_debug_hides_key_bytes() {
        let key = AuthKey::new([0xab; AUTH_KEY_SIZE]);
        let printed = format!("{key:?}");
        assert!(printed.starts_with("AuthKey { id: 0x"));
        assert!(!printed.contains("key:"));
    }
}
