//! Cryptographic primitives for MTProto sessions.
//!
//! This crate provides:
//! - AES-256-IGE encryption
//! - Message key and temporary handshake key derivation
//! - The encrypted message envelope
//! - RSA public keys with fingerprints
//! - Pollard-Brent factorization of the `pq` challenge
//! - Diffie-Hellman prime, generator, and public value checks
//! - The auth key type with its id and aux hash
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Symmetric cipher | AES-256-IGE |
//! | Hash | SHA-1 |
//! | Key transport | RSA-2048, raw |
//! | Key agreement | DH over a 2048-bit safe prime |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aes_ige;
pub mod auth_key;
pub mod dh;
pub mod error;
pub mod factor;
pub mod hash;
pub mod kdf;
pub mod message;
pub mod rsa;

pub use auth_key::{AuthKey, AUTH_KEY_SIZE};
pub use error::CryptoError;
pub use kdf::{AesKeyIv, Direction};
pub use message::{decrypt_message, encrypt_message, DecryptedMessage, MessageHeader};
pub use rsa::{RsaKeyRing, RsaPublicKey};
