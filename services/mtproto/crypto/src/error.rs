//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Input to a block cipher is not a whole number of blocks
    #[error("data length {0} is not a multiple of the AES block size")]
    BlockAlignment(usize),

    /// PQ value could not be split into two factors
    #[error("cannot factorize pq {0:#x}")]
    Factorization(u64),

    /// PQ value does not fit in 64 bits
    #[error("pq is {0} bytes long")]
    PqTooLarge(usize),

    /// Malformed RSA key material
    #[error("invalid rsa key: {0}")]
    InvalidRsaKey(&'static str),

    /// Plaintext is too large for the RSA modulus
    #[error("rsa input of {0} bytes does not fit the modulus")]
    RsaInputTooLarge(usize),

    /// DH prime failed validation
    #[error("bad dh prime: {0}")]
    BadPrime(&'static str),

    /// Generator is unsupported or does not match the prime
    #[error("bad dh generator {0}")]
    BadGenerator(i32),

    /// A DH public value is outside the safe range
    #[error("dh value out of range: {0}")]
    DhValueOutOfRange(&'static str),

    /// Encrypted message addressed to a different auth key
    #[error("auth key id mismatch: expected {expected:#018x}, got {actual:#018x}")]
    AuthKeyMismatch {
        /// Id of the local key
        expected: u64,
        /// Id found in the message
        actual: u64,
    },

    /// Decrypted message does not hash to its msg_key
    #[error("msg_key mismatch")]
    MessageKeyMismatch,

    /// Encrypted message has an invalid size
    #[error("invalid encrypted message length {0}")]
    MessageLength(usize),

    /// Declared inner length is inconsistent with the decrypted data
    #[error("invalid inner message length {0}")]
    InnerLength(u32),
}
