//! Transports carrying MTProto packets to a datacenter.
//!
//! Every transport is driven without blocking: `connect_*` and `send`
//! return at once and the I/O runs on tasks the transport spawns. Results
//! flow back to the connection manager as [`TransportEvent`]s tagged with
//! the slot and generation the transport was created for, so events from a
//! transport that was already replaced are easy to discard.

use crate::config::{ConnectionConfig, TransportKind};
use crate::dc::DcEndpoint;
use crate::error::TransportError;
use bytes::Bytes;
use mtproto_wire::{decode_plain, encode_plain, msg_id_at, ReqPq, ResPq};
use rand::RngCore;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub mod auto;
pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod tcp;

pub use auto::AutoTransport;
pub use http::HttpTransport;
pub use tcp::TcpTransport;

/// Address family a transport was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// IPv4 endpoint
    V4,
    /// IPv6 endpoint
    V6,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// What happened on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Probe answered; the transport can carry packets
    Connected,
    /// Peer closed the connection
    Disconnected,
    /// Transport failed and will not recover
    Error {
        /// Whether the failure suggests an unknown auth key
        may_be_bad_key: bool,
    },
    /// A packet payload arrived
    Received(Bytes),
}

/// Event reported by a transport to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Slot of the reporting transport
    pub slot: Slot,
    /// Generation of the reporting transport
    pub generation: u64,
    /// What happened
    pub kind: TransportEventKind,
}

/// Sending side of the event channel, bound to one transport
#[derive(Debug, Clone)]
pub struct EventSink {
    slot: Slot,
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Bind a sink to a slot and generation
    pub fn new(slot: Slot, generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            slot,
            generation,
            tx,
        }
    }

    /// Slot events are tagged with
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Report an event; dropped silently once the owner is gone
    pub fn emit(&self, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent {
            slot: self.slot,
            generation: self.generation,
            kind,
        });
    }

    /// Report a successful probe
    pub fn connected(&self) {
        self.emit(TransportEventKind::Connected);
    }

    /// Report a closed connection
    pub fn disconnected(&self) {
        self.emit(TransportEventKind::Disconnected);
    }

    /// Report a failure
    pub fn error(&self, may_be_bad_key: bool) {
        self.emit(TransportEventKind::Error { may_be_bad_key });
    }

    /// Deliver a packet payload
    pub fn received(&self, payload: Bytes) {
        self.emit(TransportEventKind::Received(payload));
    }
}

/// A connection to one datacenter endpoint
pub trait Transport: Send {
    /// Connect over TCP
    fn connect_tcp(&mut self, endpoint: &DcEndpoint);

    /// Connect over HTTP; transports without HTTP ignore this
    fn connect_http(&mut self, _endpoint: &DcEndpoint) {}

    /// Queue a packet payload for sending
    fn send(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Tear down all I/O; no events follow
    fn disconnect(&mut self);

    /// Whether the probe was answered and the transport is usable
    fn is_connected(&self) -> bool;

    /// Whether the server needs an `http_wait` to have a channel to answer on
    fn needs_http_wait(&self) -> bool {
        false
    }

    /// Human-readable transport name
    fn name(&self) -> String;
}

/// Creates transports for the connection manager
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Create a transport of `kind` reporting through `sink`
    fn create(
        &self,
        kind: TransportKind,
        config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Factory for the real TCP, HTTP, and racing transports
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        Ok(match kind {
            TransportKind::Tcp => Box::new(TcpTransport::new(config, sink)),
            TransportKind::Http => Box::new(HttpTransport::new(config, sink)?),
            TransportKind::Auto => Box::new(AutoTransport::new(config, sink)?),
        })
    }
}

/// Unencrypted `req_pq` used to check that an endpoint speaks MTProto
#[derive(Debug, Clone)]
pub struct Probe {
    nonce: [u8; 16],
}

impl Probe {
    /// Probe with a fresh random nonce
    pub fn new() -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self { nonce }
    }

    /// Packet payload to send
    pub fn request(&self) -> Bytes {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        encode_plain(msg_id_at(unix_ms), &ReqPq { nonce: self.nonce }.to_bytes())
    }

    /// Whether `payload` is the `resPQ` answering this probe
    pub fn matches(&self, payload: &Bytes) -> bool {
        decode_plain(payload)
            .ok()
            .and_then(|message| ResPq::parse(&message.body).ok())
            .is_some_and(|res_pq| res_pq.nonce == self.nonce)
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self::new()
    }
}
