//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Declared packet length is outside the accepted bounds
    #[error("invalid packet length: {0}")]
    Length(usize),

    /// CRC32 trailer does not match the packet contents
    #[error("packet checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    Checksum {
        /// Checksum carried in the packet trailer
        expected: u32,
        /// Checksum computed over the received bytes
        computed: u32,
    },

    /// Buffer ended before a value could be read
    #[error("truncated input: {0} more bytes needed")]
    Truncated(usize),

    /// A constructor other than the expected one was found
    #[error("unexpected constructor {0:#010x}")]
    UnexpectedConstructor(u32),

    /// Structurally invalid message
    #[error("malformed {0}")]
    Malformed(&'static str),
}
