//! Transports, auth key exchange, session state, and the connection state
//! machine for MTProto clients.
//!
//! This crate keeps one encrypted session to a datacenter alive. A
//! [`Connection`] owns a worker thread that connects over TCP, HTTP, or both
//! at once, creates an auth key when the session has none, and then carries
//! the requests queued in a shared [`SessionData`], retrying and resending
//! until each one is answered or acknowledged.
//!
//! ## Features
//!
//! - **Transports**: CRC32-framed TCP, HTTP POST, and a racing mode that
//!   picks whichever connects first
//! - **Auth Key Exchange**: the unencrypted DH exchange, with RSA key pinning
//! - **Session State**: message ids, sequence numbers, acks, resends, and
//!   containers, shared between the caller and the worker
//! - **Recovery**: backoff, clock and salt resync, state queries for
//!   unacknowledged requests, stale connection detection, and a fresh key
//!   when the server forgets ours
//!
//! ## Example
//!
//! ```rust,no_run
//! use mtproto_session::{Connection, ConnectionConfig, ConnectionEvent, SessionData, StaticDcTable};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = SessionData::new();
//! let mut conn = Connection::new(ConnectionConfig::default(), Arc::new(StaticDcTable::production()));
//! let dc = conn.start(session.clone(), 0)?;
//! let mut events = conn.take_events().expect("events of a fresh start");
//!
//! let request_id = session.enqueue(Bytes::from_static(b"serialized TL request")).await;
//! println!("Queued request {} for DC {}", request_id, dc);
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ConnectionEvent::DataReceived { request_id, payload, .. } => {
//!             println!("Result for {:?}: {} bytes", request_id, payload.len());
//!         }
//!         ConnectionEvent::Finished => break,
//!         other => println!("{:?}", other),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dc;
pub mod error;
pub mod handle;
pub mod handshake;
pub mod keepalive;
pub mod session_data;
pub mod state;
pub mod transport;

// Re-export main types
pub use config::{ConnectionConfig, TransportKind};
pub use dc::{DcEndpoint, DcEndpoints, DcFlags, DcId, DcLookup, DcOption, StaticDcTable};
pub use error::{ConnectionError, HandshakeError, TransportError};
pub use handle::Connection;
pub use handshake::{AuthKeyHandshake, AuthKeyResult, HandshakeOutcome};
pub use session_data::{MsgId, RequestId, SessionData, SessionSnapshot};
pub use state::{ConnectionEvent, ConnectionState, FailureReason, HandshakeStep};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
