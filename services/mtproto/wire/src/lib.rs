//! Wire protocol framing and TL encoding for MTProto transports.
//!
//! This crate provides the byte-level layer shared by every transport:
//! the CRC32-checked packet framing used over TCP, the TL primitive
//! encoding, the unencrypted message envelope used during the auth key
//! exchange, and the handshake and service message constructors.
//!
//! ## Features
//!
//! - **Incremental Decoding**: packets are decoded from partial stream input
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Service Messages**: containers, acks, salts, pings, and state queries
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 length           | payload length + 12        |
//! +----------------------+----------------------------+
//! | u32 packet number    | per connection, from 0     |
//! +----------------------+----------------------------+
//! | payload              | MTProto message            |
//! +----------------------+----------------------------+
//! | u32 crc32            | over all preceding bytes   |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod frame;
pub mod schema;
pub mod tl;

// Re-export main types
pub use envelope::{
    auth_key_id, decode_plain, encode_plain, msg_id_at, msg_id_seconds, PlainMessage,
    PLAIN_HEADER_SIZE,
};
pub use error::WireError;
pub use frame::{
    encode_packet, transport_error_code, Packet, PacketDecoder, PacketEncoder,
    BAD_AUTH_KEY_CODE, DEFAULT_MAX_PACKET_SIZE, HARD_MAX_PACKET_SIZE, PACKET_OVERHEAD,
};
pub use schema::{
    ids, ClientDhInnerData, ContainerItem, DhGenAnswer, DhGenKind, PqInnerData, ReqDhParams,
    ReqPq, ResPq, ServerDhInnerData, ServerDhParams, ServiceMessage, SetClientDhParams,
};
pub use tl::{TlReader, TlWriter};
