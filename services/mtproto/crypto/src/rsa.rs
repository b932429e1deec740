//! Server RSA public keys.
//!
//! Used once per handshake to encrypt `p_q_inner_data`. Keys are selected
//! by fingerprint from the list the server advertises in `resPQ`.

use crate::hash::sha1;
use crate::CryptoError;
use mtproto_wire::TlWriter;
use num_bigint::BigUint;
use num_traits::Zero;

/// Size of RSA-encrypted handshake data
pub const RSA_BLOCK_SIZE: usize = 256;

/// An RSA public key with its precomputed fingerprint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsaPublicKey {
    n: BigUint,
    e: BigUint,
    fingerprint: u64,
}

impl RsaPublicKey {
    /// Build from modulus and exponent
    pub fn new(n: BigUint, e: BigUint) -> Result<Self, CryptoError> {
        if n.bits() != (RSA_BLOCK_SIZE * 8) as u64 {
            return Err(CryptoError::InvalidRsaKey("modulus must be 2048 bits"));
        }
        if e.is_zero() {
            return Err(CryptoError::InvalidRsaKey("zero exponent"));
        }
        let fingerprint = fingerprint(&n, &e);
        Ok(Self { n, e, fingerprint })
    }

    /// Build from a hex modulus and a numeric exponent
    pub fn from_hex(modulus: &str, exponent: u64) -> Result<Self, CryptoError> {
        let cleaned: String = modulus.chars().filter(|c| !c.is_whitespace()).collect();
        let n = BigUint::parse_bytes(cleaned.as_bytes(), 16)
            .ok_or(CryptoError::InvalidRsaKey("modulus is not hex"))?;
        Self::new(n, BigUint::from(exponent))
    }

    /// Lower 64 bits of SHA-1 over the TL-serialized modulus and exponent
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Modulus
    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    /// Raw RSA: `data^e mod n`, left-padded to 256 bytes.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let value = BigUint::from_bytes_be(data);
        if data.len() > RSA_BLOCK_SIZE || value >= self.n {
            return Err(CryptoError::RsaInputTooLarge(data.len()));
        }
        Ok(to_fixed_be(&value.modpow(&self.e, &self.n), RSA_BLOCK_SIZE))
    }
}

fn fingerprint(n: &BigUint, e: &BigUint) -> u64 {
    let mut w = TlWriter::with_capacity(272);
    w.write_bytes(&n.to_bytes_be()).write_bytes(&e.to_bytes_be());
    let hash = sha1(&[&w.finish()]);
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash[12..20]);
    u64::from_le_bytes(id)
}

/// Big-endian encoding of `value` left-padded with zeros to `len` bytes.
pub fn to_fixed_be(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

/// Set of keys the client trusts
#[derive(Clone, Debug, Default)]
pub struct RsaKeyRing {
    keys: Vec<RsaPublicKey>,
}

impl RsaKeyRing {
    /// Create a key ring
    pub fn new(keys: Vec<RsaPublicKey>) -> Self {
        Self { keys }
    }

    /// First trusted key whose fingerprint the server offered
    pub fn find(&self, fingerprints: &[u64]) -> Option<&RsaPublicKey> {
        fingerprints
            .iter()
            .find_map(|fp| self.keys.iter().find(|key| key.fingerprint == *fp))
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no key is configured
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
