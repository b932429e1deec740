//! Connection manager: the per-connection state machine.
//!
//! One manager runs per connection, on the worker thread owned by the
//! [`Connection`](crate::handle::Connection) handle. It creates transports,
//! drives the auth key exchange over them, encrypts whatever the shared
//! [`SessionData`] has queued, decrypts and dispatches what comes back, and
//! owns every timer: retry backoff, connect timeout, receive wait, pings,
//! the sent-request state check and the stale connection check.
//!
//! The manager never blocks. Transports report through an unbounded channel,
//! callers through the control channel and the session's send notification,
//! and all of them are multiplexed in [`ConnectionManager::run`].

use crate::backoff::RetryBackoff;
use crate::config::{ConnectionConfig, TransportKind};
use crate::dc::{DcEndpoints, DcId, DcLookup};
use crate::error::{HandshakeError, TransportError};
use crate::handshake::{AuthKeyHandshake, HandshakeOutcome};
use crate::keepalive::{build_ping, build_pong, next_ping_id, KeepaliveState};
use crate::session_data::{ExtraMessage, MsgId, SendLimits, SessionData};
use crate::state::{ConnectionEvent, ConnectionState, FailureReason, ProtocolFault};
use crate::transport::{
    EventSink, Slot, Transport, TransportEvent, TransportEventKind, TransportFactory,
};
use bytes::Bytes;
use mtproto_crypto::{decrypt_message, encrypt_message, Direction, MessageHeader};
use mtproto_wire::{
    auth_key_id, decode_plain, encode_plain, transport_error_code, ContainerItem, ServiceMessage,
    BAD_AUTH_KEY_CODE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Requests from the handle to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Tear everything down and stop
    Kill,
    /// Drop the transports and reconnect at once
    Restart,
}

/// Channel ends owned by the worker
#[derive(Debug)]
pub struct WorkerChannels {
    control_rx: mpsc::UnboundedReceiver<Control>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    transport_name_tx: watch::Sender<String>,
}

/// Channel ends owned by the handle
#[derive(Debug)]
pub struct OwnerChannels {
    /// Control requests
    pub control_tx: mpsc::UnboundedSender<Control>,
    /// Connection events
    pub events_rx: mpsc::Receiver<ConnectionEvent>,
    /// Current state
    pub state_rx: watch::Receiver<ConnectionState>,
    /// Name of the transport in use, empty while none is
    pub transport_name_rx: watch::Receiver<String>,
}

/// Create the channels linking a worker to its owner
pub fn channels(event_capacity: usize) -> (WorkerChannels, OwnerChannels) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(event_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let (transport_name_tx, transport_name_rx) = watch::channel(String::new());
    (
        WorkerChannels {
            control_rx,
            events_tx,
            state_tx,
            transport_name_tx,
        },
        OwnerChannels {
            control_tx,
            events_rx,
            state_rx,
            transport_name_rx,
        },
    )
}

/// Deadlines of the manager's timers
#[derive(Debug, Default)]
struct Timers {
    retry_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    ipv4_grace_at: Option<Instant>,
    wait_received_at: Option<Instant>,
    next_ping_at: Option<Instant>,
    ping_deadline: Option<Instant>,
    state_check_at: Option<Instant>,
    old_check_at: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [
            self.retry_at,
            self.connect_deadline,
            self.ipv4_grace_at,
            self.wait_received_at,
            self.next_ping_at,
            self.ping_deadline,
            self.state_check_at,
            self.old_check_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Take the deadline if it has passed
fn fired(timer: &mut Option<Instant>, now: Instant) -> bool {
    if timer.is_some_and(|deadline| deadline <= now) {
        *timer = None;
        true
    } else {
        false
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Per-connection state machine
pub struct ConnectionManager {
    dc: DcId,
    session: Arc<SessionData>,
    config: ConnectionConfig,
    dcs: Arc<dyn DcLookup>,
    factory: Arc<dyn TransportFactory>,
    channels: WorkerChannels,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    v4: Option<Box<dyn Transport>>,
    v6: Option<Box<dyn Transport>>,
    active: Option<Slot>,
    generation: u64,
    handshake: Option<AuthKeyHandshake>,
    backoff: RetryBackoff,
    keepalive: KeepaliveState,
    pending_extras: Vec<ExtraMessage>,
    ping_due: bool,
    timers: Timers,
    connect_timeout: Duration,
    wait_received: Duration,
    last_received: Instant,
    state: ConnectionState,
    finished: bool,
}

impl ConnectionManager {
    /// Create a manager for `dc`; nothing happens until [`run`](Self::run)
    pub fn new(
        dc: DcId,
        session: Arc<SessionData>,
        config: ConnectionConfig,
        dcs: Arc<dyn DcLookup>,
        factory: Arc<dyn TransportFactory>,
        channels: WorkerChannels,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            dc,
            session,
            backoff: RetryBackoff::new(
                config.retry_initial,
                config.retry_ceiling,
                config.retry_jitter,
            ),
            connect_timeout: config.connect_timeout,
            wait_received: config.wait_received,
            config,
            dcs,
            factory,
            channels,
            transport_tx,
            transport_rx,
            v4: None,
            v6: None,
            active: None,
            generation: 0,
            handshake: None,
            keepalive: KeepaliveState::default(),
            pending_extras: Vec::new(),
            ping_due: false,
            timers: Timers::default(),
            last_received: Instant::now(),
            state: ConnectionState::Idle,
            finished: false,
        }
    }

    /// Worker loop; returns after a kill or when the handle is gone
    pub async fn run(mut self) {
        info!(dc = self.dc, "Connection worker started");
        let session = self.session.clone();
        self.socket_start();

        while !self.finished {
            let deadline = self.timers.next();
            tokio::select! {
                biased;

                control = self.channels.control_rx.recv() => match control {
                    Some(Control::Restart) => {
                        info!(dc = self.dc, "Restart requested");
                        self.teardown();
                        self.socket_start();
                    }
                    Some(Control::Kill) | None => self.finish().await,
                },

                Some(event) = self.transport_rx.recv() => {
                    self.on_transport_event(event).await;
                }

                _ = session.send_requested() => {
                    self.try_send().await;
                }

                _ = sleep_until_opt(deadline) => {
                    self.on_timers().await;
                }
            }
        }

        info!(dc = self.dc, "Connection worker stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!(dc = self.dc, "Connection state {} -> {}", self.state, state);
        self.state = state.clone();
        self.channels.state_tx.send_replace(state.clone());
        self.emit(ConnectionEvent::StateChanged(state));
    }

    fn emit(&self, event: ConnectionEvent) {
        match self.channels.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(dc = self.dc, "Event channel full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(dc = self.dc, "Event receiver gone");
            }
        }
    }

    fn transport_mut(&mut self, slot: Slot) -> Option<&mut Box<dyn Transport>> {
        match slot {
            Slot::V4 => self.v4.as_mut(),
            Slot::V6 => self.v6.as_mut(),
        }
    }

    fn take_transport(&mut self, slot: Slot) -> Option<Box<dyn Transport>> {
        match slot {
            Slot::V4 => self.v4.take(),
            Slot::V6 => self.v6.take(),
        }
    }

    /// Drop every transport, the exchange in progress, and all timers
    fn teardown(&mut self) {
        for slot in [Slot::V4, Slot::V6] {
            if let Some(mut transport) = self.take_transport(slot) {
                transport.disconnect();
            }
        }
        self.active = None;
        self.handshake = None;
        self.timers.clear();
        self.keepalive.clear();
        self.pending_extras.clear();
        self.ping_due = false;
        self.channels.transport_name_tx.send_replace(String::new());
    }

    /// Create transports for every usable address family and connect them
    fn socket_start(&mut self) {
        self.teardown();
        self.generation += 1;

        let v4 = self.dcs.lookup(self.dc, false);
        let v6 = if self.config.try_ipv6 {
            self.dcs.lookup(self.dc, true)
        } else {
            None
        };

        self.set_state(ConnectionState::Connecting);
        for (slot, endpoints) in [(Slot::V4, v4), (Slot::V6, v6)] {
            if let Some(endpoints) = endpoints {
                self.create_transport(slot, &endpoints);
            }
        }

        if self.v4.is_none() && self.v6.is_none() {
            error!(dc = self.dc, "No usable endpoint");
            self.schedule_retry(ConnectionState::Failed(FailureReason::Transport));
            return;
        }
        self.timers.connect_deadline = Some(Instant::now() + self.connect_timeout);
    }

    fn create_transport(&mut self, slot: Slot, endpoints: &DcEndpoints) {
        let kind = match (self.config.transport, &endpoints.http) {
            (TransportKind::Auto, None) => TransportKind::Tcp,
            (TransportKind::Http, None) => {
                warn!(dc = self.dc, "{} endpoint {} is TCP only", slot, endpoints.tcp);
                return;
            }
            (kind, _) => kind,
        };

        let sink = EventSink::new(slot, self.generation, self.transport_tx.clone());
        let mut transport = match self.factory.create(kind, &self.config, sink) {
            Ok(transport) => transport,
            Err(e) => {
                error!(dc = self.dc, "Failed to create {} transport: {}", kind, e);
                return;
            }
        };

        debug!(dc = self.dc, "Connecting {} over {}", kind, slot);
        if kind != TransportKind::Http {
            transport.connect_tcp(&endpoints.tcp);
        }
        if let Some(http) = endpoints.http.as_ref().filter(|_| kind != TransportKind::Tcp) {
            transport.connect_http(http);
        }

        match slot {
            Slot::V4 => self.v4 = Some(transport),
            Slot::V6 => self.v6 = Some(transport),
        }
    }

    /// Give up on the current attempt and retry after the backoff delay
    fn schedule_retry(&mut self, state: ConnectionState) {
        self.teardown();
        self.set_state(state);
        let delay = self.backoff.record_failure();
        info!(dc = self.dc, "Retrying in {:?}", delay);
        self.timers.retry_at = Some(Instant::now() + delay);
    }

    /// Abandon the connection for `reason`
    async fn restart(&mut self, reason: FailureReason) {
        if reason == FailureReason::BadAuthKey && self.session.auth_key().await.is_some() {
            warn!(dc = self.dc, "Server does not know our auth key, creating a new one");
            self.session.clear_auth_key().await;
            self.set_state(ConnectionState::Failed(reason));
            self.socket_start();
            return;
        }
        let reason = if reason == FailureReason::BadAuthKey {
            FailureReason::Transport
        } else {
            reason
        };
        self.schedule_retry(ConnectionState::Failed(reason));
    }

    async fn handle_fault(&mut self, fault: ProtocolFault) {
        if fault.restarts_connection() {
            warn!(dc = self.dc, ?fault, "Restarting connection");
            self.restart(fault.failure_reason()).await;
        } else {
            info!(dc = self.dc, ?fault, "Recovering within the session");
            self.session.request_send();
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        if event.generation != self.generation {
            trace!(dc = self.dc, "Ignoring event from old transport: {:?}", event.kind);
            return;
        }
        match event.kind {
            TransportEventKind::Connected => self.on_connected(event.slot).await,
            TransportEventKind::Disconnected => self.on_transport_lost(event.slot, None).await,
            TransportEventKind::Error { may_be_bad_key } => {
                self.emit(ConnectionEvent::Error { may_be_bad_key });
                self.on_transport_lost(event.slot, Some(may_be_bad_key)).await;
            }
            TransportEventKind::Received(payload) => {
                if self.active == Some(event.slot) {
                    self.on_received(payload).await;
                } else {
                    debug!(dc = self.dc, "Ignoring data on inactive {} transport", event.slot);
                }
            }
        }
    }

    async fn on_connected(&mut self, slot: Slot) {
        if self.active.is_some() {
            return;
        }
        match slot {
            Slot::V4 => self.choose(Slot::V4).await,
            Slot::V6 if self.v4.is_some() => {
                debug!(dc = self.dc, "IPv6 connected, waiting for IPv4");
                self.timers.ipv4_grace_at = Some(Instant::now() + self.config.ipv4_grace);
            }
            Slot::V6 => self.choose(Slot::V6).await,
        }
    }

    /// Make `slot` the active transport and drop the other one
    async fn choose(&mut self, slot: Slot) {
        let other = match slot {
            Slot::V4 => Slot::V6,
            Slot::V6 => Slot::V4,
        };
        if let Some(mut transport) = self.take_transport(other) {
            transport.disconnect();
        }
        let Some(name) = self.transport_mut(slot).map(|transport| transport.name()) else {
            return;
        };

        self.active = Some(slot);
        self.timers.ipv4_grace_at = None;
        self.timers.connect_deadline = None;
        self.connect_timeout = self.config.connect_timeout;
        self.last_received = Instant::now();
        info!(dc = self.dc, "Using {} transport over {}", name, slot);
        self.channels.transport_name_tx.send_replace(name);

        if self.session.auth_key().await.is_some() {
            self.on_authorized().await;
        } else {
            let mut handshake =
                AuthKeyHandshake::new(self.config.rsa_keys.clone(), self.config.handshake_retries);
            let body = handshake.start();
            let step = handshake.step();
            self.handshake = Some(handshake);
            if let Some(step) = step {
                self.set_state(ConnectionState::WaitingForAuthKey(step));
            }
            self.send_plain(body).await;
        }
    }

    async fn on_transport_lost(&mut self, slot: Slot, error: Option<bool>) {
        let was_active = self.active == Some(slot);
        if let Some(mut transport) = self.take_transport(slot) {
            transport.disconnect();
        }

        if was_active || (self.v4.is_none() && self.v6.is_none()) {
            match error {
                Some(true) => self.restart(FailureReason::BadAuthKey).await,
                Some(false) => self.restart(FailureReason::Transport).await,
                None => self.schedule_retry(ConnectionState::Disconnected),
            }
        } else if slot == Slot::V4 && self.timers.ipv4_grace_at.is_some() {
            self.timers.ipv4_grace_at = None;
            self.choose(Slot::V6).await;
        }
    }

    /// Session is usable: start pings and flush the queue.
    ///
    /// Requests sent over an earlier connection may never have reached the
    /// server, so their state is asked about right away.
    async fn on_authorized(&mut self) {
        self.set_state(ConnectionState::Connected);
        if self.backoff.record_success() {
            info!(dc = self.dc, "Connection recovered");
        }
        let in_doubt = self.session.query_sent_state(Duration::ZERO).await;
        if in_doubt > 0 {
            info!(dc = self.dc, "Asking for the state of {} unacknowledged requests", in_doubt);
        }
        let now = Instant::now();
        self.wait_received = self.config.wait_received;
        self.timers.wait_received_at = None;
        self.timers.next_ping_at = Some(now + self.config.ping_interval);
        self.timers.state_check_at = Some(now + self.config.state_check_interval);
        self.timers.old_check_at = Some(now + self.config.old_connection_check);
        self.try_send().await;
    }

    /// Queue a packet on the active transport
    fn send_packet(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let slot = self.active.ok_or(TransportError::NotConnected)?;
        self.transport_mut(slot)
            .ok_or(TransportError::NotConnected)?
            .send(payload)
    }

    async fn send_plain(&mut self, body: Bytes) {
        let msg_id = self.session.next_plain_msg_id().await;
        if let Err(e) = self.send_packet(encode_plain(msg_id, &body)) {
            warn!(dc = self.dc, "Failed to send key exchange message: {}", e);
            self.restart(FailureReason::Transport).await;
            return;
        }
        self.arm_wait_received();
    }

    fn arm_wait_received(&mut self) {
        if self.timers.wait_received_at.is_none() {
            self.timers.wait_received_at = Some(Instant::now() + self.wait_received);
        }
    }

    async fn on_received(&mut self, payload: Bytes) {
        self.last_received = Instant::now();
        self.wait_received = self.config.wait_received;
        self.timers.wait_received_at = None;

        if let Some(code) = transport_error_code(&payload) {
            warn!(dc = self.dc, "Transport error code {}", code);
            let may_be_bad_key = code == BAD_AUTH_KEY_CODE;
            self.emit(ConnectionEvent::Error { may_be_bad_key });
            let reason = if may_be_bad_key {
                FailureReason::BadAuthKey
            } else {
                FailureReason::Transport
            };
            self.restart(reason).await;
            return;
        }

        match auth_key_id(&payload) {
            Some(0) => self.handle_plain(payload).await,
            Some(_) => self.handle_encrypted(payload).await,
            None => {
                warn!(dc = self.dc, "Packet of {} bytes is too short", payload.len());
                self.handle_fault(ProtocolFault::Framing).await;
            }
        }
    }

    async fn handle_plain(&mut self, payload: Bytes) {
        let Some(handshake) = self.handshake.as_mut() else {
            debug!(dc = self.dc, "Ignoring unencrypted message outside the key exchange");
            return;
        };
        let outcome = decode_plain(&payload)
            .map_err(HandshakeError::from)
            .and_then(|message| handshake.handle(&message.body));
        let step = handshake.step();

        match outcome {
            Ok(HandshakeOutcome::Send(body)) => {
                if let Some(step) = step {
                    self.set_state(ConnectionState::WaitingForAuthKey(step));
                }
                self.send_plain(body).await;
            }
            Ok(HandshakeOutcome::Done(result)) => {
                self.handshake = None;
                self.session
                    .set_auth_key(result.auth_key, result.server_salt, result.server_time)
                    .await;
                self.on_authorized().await;
            }
            Err(e) => {
                warn!(dc = self.dc, "Auth key exchange failed: {}", e);
                self.handle_fault(ProtocolFault::Handshake).await;
            }
        }
    }

    async fn handle_encrypted(&mut self, payload: Bytes) {
        let Some(auth_key) = self.session.auth_key().await else {
            warn!(dc = self.dc, "Encrypted message without an auth key");
            return;
        };
        let message = match decrypt_message(&auth_key, &payload, Direction::ServerToClient) {
            Ok(message) => message,
            Err(e) => {
                warn!(dc = self.dc, "Failed to decrypt message: {}", e);
                self.handle_fault(ProtocolFault::Framing).await;
                return;
            }
        };

        let session_id = self.session.session_id().await;
        if message.header.session_id != session_id {
            warn!(
                dc = self.dc,
                "Ignoring message for session {:#018x}, current is {:#018x}",
                message.header.session_id,
                session_id
            );
            return;
        }
        if message.header.msg_id & 3 == 0 {
            warn!(dc = self.dc, "Ignoring message with client msg_id {:#x}", message.header.msg_id);
            return;
        }

        let items = match ServiceMessage::parse(&message.body) {
            Ok(ServiceMessage::Container(items)) => {
                self.session
                    .register_received(message.header.msg_id, false)
                    .await;
                items
            }
            _ => vec![ContainerItem {
                msg_id: message.header.msg_id,
                seq_no: message.header.seq_no,
                body: message.body,
            }],
        };
        for item in items {
            if self.state != ConnectionState::Connected {
                break;
            }
            self.handle_single(item).await;
        }

        self.try_send().await;
    }

    async fn handle_single(&mut self, item: ContainerItem) {
        let msg_id = item.msg_id;
        let content_related = item.seq_no & 1 == 1;
        if !self.session.register_received(msg_id, content_related).await {
            debug!(dc = self.dc, msg_id, "Duplicate message");
            return;
        }

        let message = match ServiceMessage::parse(&item.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(dc = self.dc, msg_id, "Malformed message: {}", e);
                self.handle_fault(ProtocolFault::Framing).await;
                return;
            }
        };

        match message {
            ServiceMessage::Container(_) => {
                warn!(dc = self.dc, msg_id, "Ignoring nested container");
            }
            ServiceMessage::RpcResult { req_msg_id, result } => {
                match self.session.response_received(req_msg_id).await {
                    Some(request_id) => {
                        debug!(dc = self.dc, msg_id, request_id, "Result received");
                        self.emit(ConnectionEvent::DataReceived {
                            request_id: Some(request_id),
                            msg_id,
                            payload: result,
                        });
                    }
                    None => {
                        warn!(dc = self.dc, "Result for unknown message {:#x}", req_msg_id);
                    }
                }
            }
            ServiceMessage::MsgsAck { msg_ids } => {
                let acked = self.session.requests_acked(&msg_ids, false).await;
                trace!(dc = self.dc, "Acked requests {:?}", acked);
            }
            ServiceMessage::BadMsgNotification {
                bad_msg_id,
                error_code,
                ..
            } => self.on_bad_msg(msg_id, bad_msg_id, error_code).await,
            ServiceMessage::BadServerSalt {
                bad_msg_id,
                new_server_salt,
                ..
            } => {
                info!(dc = self.dc, "Server salt changed to {:#018x}", new_server_salt);
                self.session.set_server_salt(new_server_salt).await;
                self.session.mark_for_resend(bad_msg_id).await;
            }
            ServiceMessage::NewSessionCreated {
                first_msg_id,
                server_salt,
                ..
            } => {
                self.session.set_server_salt(server_salt).await;
                let resent = self.session.resend_older_than(first_msg_id).await;
                info!(dc = self.dc, "Server created a new session, resending {}", resent);
            }
            ServiceMessage::Pong { ping_id, .. } => {
                if let Some(rtt) = self.keepalive.process_pong(ping_id) {
                    debug!(dc = self.dc, "Pong in {:?}", rtt);
                }
                if self.keepalive.outstanding() == 0 {
                    self.timers.ping_deadline = None;
                }
            }
            ServiceMessage::Ping { ping_id }
            | ServiceMessage::PingDelayDisconnect { ping_id, .. } => {
                self.pending_extras.push(ExtraMessage {
                    body: build_pong(msg_id, ping_id),
                    content_related: true,
                });
            }
            ServiceMessage::MsgsStateReq { msg_ids } => {
                let info = self.session.received_state(&msg_ids).await;
                self.pending_extras
                    .push(ExtraMessage::service(&ServiceMessage::MsgsStateInfo {
                        req_msg_id: msg_id,
                        info: Bytes::from(info),
                    }));
            }
            ServiceMessage::MsgResendReq { msg_ids } => {
                let mut resent = 0;
                for id in msg_ids {
                    resent += self.session.mark_for_resend(id).await;
                }
                debug!(dc = self.dc, "Server asked for {} resends", resent);
            }
            ServiceMessage::MsgDetailedInfo {
                msg_id: our_msg_id,
                answer_msg_id,
                ..
            } => {
                self.session.requests_acked(&[our_msg_id], false).await;
                self.request_answer(answer_msg_id).await;
            }
            ServiceMessage::MsgNewDetailedInfo { answer_msg_id, .. } => {
                self.request_answer(answer_msg_id).await;
            }
            ServiceMessage::MsgsStateInfo { req_msg_id, info } => {
                let resent = self.session.state_info_received(req_msg_id, &info).await;
                if resent > 0 {
                    info!(dc = self.dc, "Server never got {} requests, resending", resent);
                }
            }
            ServiceMessage::MsgsAllInfo { msg_ids, .. } => {
                debug!(dc = self.dc, "State info for {} messages", msg_ids.len());
            }
            ServiceMessage::HttpWait { .. } => {}
            ServiceMessage::GzipPacked(payload) | ServiceMessage::Other(payload) => {
                self.emit(ConnectionEvent::DataReceived {
                    request_id: None,
                    msg_id,
                    payload,
                });
            }
        }
    }

    /// Ask for an answer the server says it sent, unless it already arrived
    async fn request_answer(&mut self, answer_msg_id: MsgId) {
        let state = self.session.received_state(&[answer_msg_id]).await;
        if state.first() != Some(&4) {
            self.pending_extras
                .push(ExtraMessage::service(&ServiceMessage::MsgResendReq {
                    msg_ids: vec![answer_msg_id],
                }));
        }
    }

    async fn on_bad_msg(&mut self, server_msg_id: MsgId, bad_msg_id: MsgId, code: i32) {
        warn!(dc = self.dc, code, "Server rejected message {:#x}", bad_msg_id);
        match code {
            16 | 17 => {
                self.session
                    .fix_time_and_salt(bad_msg_id, server_msg_id, None)
                    .await;
                if code == 17 {
                    self.session.reset_session().await;
                    self.session.lower_msg_id_floor().await;
                }
                self.handle_fault(ProtocolFault::ClockSkew).await;
            }
            32 | 33 => {
                self.session.reset_session().await;
                self.handle_fault(ProtocolFault::SessionExpired).await;
            }
            20 => {
                self.session.mark_for_resend(bad_msg_id).await;
            }
            _ => self.restart(FailureReason::Protocol).await,
        }
    }

    /// Encrypt and send everything due
    async fn try_send(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(slot) = self.active else {
            return;
        };
        let needs_http_wait = self
            .transport_mut(slot)
            .is_some_and(|transport| transport.needs_http_wait());

        let mut extras = std::mem::take(&mut self.pending_extras);
        if self.ping_due {
            self.ping_due = false;
            let ping_id = next_ping_id();
            self.keepalive.record_ping(ping_id);
            self.timers.ping_deadline = Some(Instant::now() + self.config.ping_timeout);
            extras.push(ExtraMessage {
                body: build_ping(ping_id, self.config.ping_disconnect_delay),
                content_related: true,
            });
        }
        if needs_http_wait {
            let max_wait = self.config.http_wait_max.as_millis().min(i32::MAX as u128) as i32;
            extras.push(ExtraMessage::service(&ServiceMessage::HttpWait {
                max_delay: 0,
                wait_after: 0,
                max_wait,
            }));
        }

        let limits = SendLimits {
            max_container_bytes: self.config.max_container_bytes,
            max_container_messages: self.config.max_container_messages,
        };
        let Some(prepared) = self.session.dequeue_for_send(extras, limits).await else {
            return;
        };

        for message in &prepared.messages {
            let header = MessageHeader {
                salt: prepared.salt,
                session_id: prepared.session_id,
                msg_id: message.msg_id,
                seq_no: message.seq_no,
            };
            let packet = match encrypt_message(
                &prepared.auth_key,
                &header,
                &message.body,
                Direction::ClientToServer,
            ) {
                Ok(packet) => packet,
                Err(e) => {
                    error!(dc = self.dc, "Failed to encrypt message: {}", e);
                    self.restart(FailureReason::Protocol).await;
                    return;
                }
            };
            if let Err(e) = self.send_packet(packet) {
                warn!(dc = self.dc, "Failed to send: {}", e);
                self.restart(FailureReason::Transport).await;
                return;
            }
        }

        debug!(
            dc = self.dc,
            "Sent {} messages carrying {} requests",
            prepared.messages.len(),
            prepared.requests
        );
        if prepared.has_content {
            self.arm_wait_received();
        }
    }

    /// Handle the first timer that is due; the loop comes back for the rest
    async fn on_timers(&mut self) {
        let now = Instant::now();

        if fired(&mut self.timers.retry_at, now) {
            self.socket_start();
        } else if fired(&mut self.timers.connect_deadline, now) {
            warn!(dc = self.dc, "Connect timed out after {:?}", self.connect_timeout);
            self.connect_timeout = (self.connect_timeout * 2).min(self.config.max_connect_timeout);
            self.restart(FailureReason::Transport).await;
        } else if fired(&mut self.timers.ipv4_grace_at, now) {
            if self.active.is_none() && self.v6.is_some() {
                self.choose(Slot::V6).await;
            }
        } else if fired(&mut self.timers.wait_received_at, now) {
            warn!(dc = self.dc, "Nothing received for {:?}", self.wait_received);
            self.wait_received = (self.wait_received * 2).min(self.config.max_wait_received);
            self.restart(FailureReason::Stale).await;
        } else if fired(&mut self.timers.next_ping_at, now) {
            self.timers.next_ping_at = Some(now + self.config.ping_interval);
            self.ping_due = true;
            self.try_send().await;
        } else if fired(&mut self.timers.ping_deadline, now) {
            if self.keepalive.outstanding() > 0 {
                warn!(dc = self.dc, "Ping unanswered for {:?}", self.config.ping_timeout);
                self.restart(FailureReason::Stale).await;
            }
        } else if fired(&mut self.timers.state_check_at, now) {
            self.timers.state_check_at = Some(now + self.config.state_check_interval);
            if self
                .session
                .query_sent_state(self.config.state_query_after)
                .await
                > 0
            {
                self.try_send().await;
            }
        } else if fired(&mut self.timers.old_check_at, now) {
            self.timers.old_check_at = Some(now + self.config.old_connection_check);
            let silent = now.saturating_duration_since(self.last_received);
            let stale = (silent > self.config.old_connection_timeout
                && self.session.has_outstanding().await)
                || self.keepalive.overdue(self.config.ping_timeout);
            if stale {
                warn!(dc = self.dc, "Connection silent for {:?}", silent);
                self.restart(FailureReason::Stale).await;
            }
        }
    }

    /// Tear down and report what was not delivered
    async fn finish(&mut self) {
        info!(dc = self.dc, "Finishing connection");
        self.set_state(ConnectionState::Finishing);
        self.teardown();

        let pending = self.session.outstanding_request_ids().await;
        if !pending.is_empty() {
            info!(dc = self.dc, "{} requests not delivered", pending.len());
            self.emit(ConnectionEvent::NotDelivered(pending));
        }
        self.set_state(ConnectionState::Stopped);
        self.emit(ConnectionEvent::Finished);
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dc::{DcFlags, DcOption, StaticDcTable};
    use crate::session_data::RequestId;
    use crate::state::HandshakeStep;
    use crate::transport::mock::{
        test_key_ring, MockBehavior, MockServer, MockTransportFactory, SERVER_PING_ID,
    };
    use mtproto_crypto::AuthKey;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SALT: u64 = 0x5a17_0000_5a17;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            transport: TransportKind::Tcp,
            rsa_keys: test_key_ring(),
            ..ConnectionConfig::default()
        }
    }

    fn test_dcs() -> Arc<dyn DcLookup> {
        Arc::new(StaticDcTable::new(
            2,
            vec![DcOption::new(2, "127.0.0.1", 443, DcFlags::empty())],
        ))
    }

    fn dual_stack_dcs() -> Arc<dyn DcLookup> {
        Arc::new(StaticDcTable::new(
            2,
            vec![
                DcOption::new(2, "127.0.0.1", 443, DcFlags::empty()),
                DcOption::new(2, "::1", 443, DcFlags::IPV6),
            ],
        ))
    }

    fn shared_key() -> AuthKey {
        let mut raw = [0u8; 256];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = (i * 13 + 5) as u8;
        }
        AuthKey::new(raw)
    }

    /// Session and mock server that already share a key
    async fn keyed(behavior: MockBehavior) -> (Arc<SessionData>, MockTransportFactory) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i32;
        let session = SessionData::new();
        session.set_auth_key(shared_key(), SALT, now).await;
        (
            session,
            MockTransportFactory::with_auth_key(behavior, shared_key(), SALT),
        )
    }

    fn spawn_with(
        session: Arc<SessionData>,
        factory: &MockTransportFactory,
        config: ConnectionConfig,
        dcs: Arc<dyn DcLookup>,
    ) -> (OwnerChannels, tokio::task::JoinHandle<()>) {
        let (worker, owner) = channels(64);
        let manager =
            ConnectionManager::new(2, session, config, dcs, Arc::new(factory.clone()), worker);
        (owner, tokio::spawn(manager.run()))
    }

    fn spawn_manager(
        session: Arc<SessionData>,
        factory: &MockTransportFactory,
    ) -> (OwnerChannels, tokio::task::JoinHandle<()>) {
        spawn_with(session, factory, test_config(), test_dcs())
    }

    async fn next_event(owner: &mut OwnerChannels) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(30), owner.events_rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn wait_for(
        owner: &mut OwnerChannels,
        wanted: impl Fn(&ConnectionEvent) -> bool,
    ) -> (Vec<ConnectionEvent>, ConnectionEvent) {
        let mut seen = Vec::new();
        loop {
            let event = next_event(owner).await;
            if wanted(&event) {
                return (seen, event);
            }
            seen.push(event);
        }
    }

    async fn wait_for_data(owner: &mut OwnerChannels) -> (Vec<ConnectionEvent>, ConnectionEvent) {
        wait_for(owner, |event| {
            matches!(event, ConnectionEvent::DataReceived { .. })
        })
        .await
    }

    /// Poll the mock server until `done` holds
    async fn settle(factory: &MockTransportFactory, done: impl Fn(&MockServer) -> bool) {
        for _ in 0..200 {
            if done(&factory.server()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mock server never reached the expected state");
    }

    fn assert_answers(event: &ConnectionEvent, request_id: RequestId) {
        match event {
            ConnectionEvent::DataReceived {
                request_id: got,
                payload,
                ..
            } => {
                assert_eq!(*got, Some(request_id));
                assert_eq!(payload.as_ref(), REQUEST);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn failures(events: &[ConnectionEvent]) -> Vec<FailureReason> {
        events
            .iter()
            .filter_map(|event| match event {
                ConnectionEvent::StateChanged(ConnectionState::Failed(reason)) => Some(*reason),
                _ => None,
            })
            .collect()
    }

    async fn kill_and_drain(
        owner: &mut OwnerChannels,
        worker: tokio::task::JoinHandle<()>,
    ) -> Vec<ConnectionEvent> {
        owner.control_tx.send(Control::Kill).unwrap();
        let mut rest = Vec::new();
        loop {
            let event = next_event(owner).await;
            let done = event == ConnectionEvent::Finished;
            rest.push(event);
            if done {
                break;
            }
        }
        worker.await.unwrap();
        rest
    }

    const REQUEST: &[u8] = &[0xef, 0xbe, 0xad, 0xde, 1, 2, 3, 4];

    #[tokio::test]
    async fn test_request_round_trip() {
        let factory = MockTransportFactory::new(MockBehavior::Normal);
        let session = SessionData::new();
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, data) = wait_for_data(&mut owner).await;
        assert_eq!(
            before.first(),
            Some(&ConnectionEvent::StateChanged(ConnectionState::Connecting))
        );
        assert!(before.contains(&ConnectionEvent::StateChanged(
            ConnectionState::WaitingForAuthKey(HandshakeStep::PqSent)
        )));
        assert!(before.contains(&ConnectionEvent::StateChanged(ConnectionState::Connected)));
        match data {
            ConnectionEvent::DataReceived {
                request_id: got,
                payload,
                ..
            } => {
                assert_eq!(got, Some(request_id));
                assert_eq!(payload.as_ref(), REQUEST);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*owner.state_rx.borrow(), ConnectionState::Connected);
        assert_eq!(*owner.transport_name_rx.borrow(), "Mock");

        let snapshot = session.snapshot().await;
        assert!(snapshot.have_sent.is_empty());
        assert_eq!(snapshot.were_acked.len(), 1);
        assert!(snapshot.has_auth_key);
        assert_eq!(factory.server().requests().len(), 1);

        let rest = kill_and_drain(&mut owner, worker).await;
        assert!(!rest
            .iter()
            .any(|event| matches!(event, ConnectionEvent::DataReceived { .. })));
        assert!(!rest
            .iter()
            .any(|event| matches!(event, ConnectionEvent::NotDelivered(_))));
        assert_eq!(
            rest[rest.len() - 2..],
            [
                ConnectionEvent::StateChanged(ConnectionState::Stopped),
                ConnectionEvent::Finished
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_key_creates_new_key_and_resends() {
        let factory = MockTransportFactory::new(MockBehavior::RejectKeyOnce);
        let session = SessionData::new();
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, data) = wait_for_data(&mut owner).await;
        assert!(before.contains(&ConnectionEvent::Error {
            may_be_bad_key: true
        }));
        assert!(before.contains(&ConnectionEvent::StateChanged(ConnectionState::Failed(
            FailureReason::BadAuthKey
        ))));
        assert!(matches!(
            data,
            ConnectionEvent::DataReceived { request_id: Some(id), .. } if id == request_id
        ));
        assert_eq!(factory.server().completed_handshakes(), 2);
        assert_eq!(factory.server().requests().len(), 1);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test]
    async fn test_kill_reports_undelivered() {
        let factory = MockTransportFactory::new(MockBehavior::StallAfterPq);
        let session = SessionData::new();
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        loop {
            if next_event(&mut owner).await
                == ConnectionEvent::StateChanged(ConnectionState::WaitingForAuthKey(
                    HandshakeStep::DhParamsSent,
                ))
            {
                break;
            }
        }

        let rest = kill_and_drain(&mut owner, worker).await;
        assert_eq!(
            rest,
            vec![
                ConnectionEvent::StateChanged(ConnectionState::Finishing),
                ConnectionEvent::NotDelivered(vec![request_id]),
                ConnectionEvent::StateChanged(ConnectionState::Stopped),
                ConnectionEvent::Finished,
            ]
        );
        assert!(session.auth_key().await.is_none());
        assert_eq!(session.snapshot().await.to_send, vec![request_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_lost_before_disconnect_is_resent() {
        let (session, factory) = keyed(MockBehavior::DropFirstEncrypted).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, data) = wait_for_data(&mut owner).await;
        assert!(before.contains(&ConnectionEvent::StateChanged(ConnectionState::Disconnected)));
        assert_answers(&data, request_id);
        {
            let server = factory.server();
            assert_eq!(server.requests().len(), 1);
            assert_eq!(server.state_queries(), 1);
            assert_eq!(server.completed_handshakes(), 0);
        }
        let snapshot = session.snapshot().await;
        assert!(snapshot.have_sent.is_empty());
        assert!(snapshot.state_queries.is_empty());

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_check_recovers_swallowed_request() {
        let (session, factory) = keyed(MockBehavior::SwallowFirstRequest).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let config = ConnectionConfig {
            state_query_after: Duration::from_secs(2),
            state_check_interval: Duration::from_secs(1),
            wait_received: Duration::from_secs(30),
            ..test_config()
        };
        let started = Instant::now();
        let (mut owner, worker) = spawn_with(session.clone(), &factory, config, test_dcs());

        let (before, data) = wait_for_data(&mut owner).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(failures(&before).is_empty());
        assert!(!before.contains(&ConnectionEvent::StateChanged(ConnectionState::Disconnected)));
        assert_answers(&data, request_id);
        assert_eq!(factory.server().state_queries(), 1);
        assert_eq!(factory.server().requests().len(), 1);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_received_restarts_and_resends() {
        let (session, factory) = keyed(MockBehavior::SwallowFirstRequest).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let started = Instant::now();
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, data) = wait_for_data(&mut owner).await;
        assert_eq!(failures(&before), vec![FailureReason::Stale]);
        assert!(started.elapsed() >= test_config().wait_received);
        assert_answers(&data, request_id);
        // the reconnect asked about the request before resending it
        assert_eq!(factory.server().state_queries(), 1);
        assert_eq!(factory.server().requests().len(), 1);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_restarts() {
        let (session, factory) = keyed(MockBehavior::SwallowFirstRequest).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let config = ConnectionConfig {
            wait_received: Duration::from_secs(60),
            max_wait_received: Duration::from_secs(64),
            old_connection_timeout: Duration::from_secs(3),
            old_connection_check: Duration::from_secs(1),
            state_query_after: Duration::from_secs(600),
            ping_interval: Duration::from_secs(600),
            ..test_config()
        };
        let started = Instant::now();
        let (mut owner, worker) = spawn_with(session.clone(), &factory, config, test_dcs());

        let (before, data) = wait_for_data(&mut owner).await;
        assert_eq!(failures(&before), vec![FailureReason::Stale]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(10));
        assert_answers(&data, request_id);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_restarts() {
        let (session, factory) = keyed(MockBehavior::IgnorePings).await;
        let config = ConnectionConfig {
            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            wait_received: Duration::from_secs(30),
            ..test_config()
        };
        let started = Instant::now();
        let (mut owner, worker) = spawn_with(session.clone(), &factory, config, test_dcs());

        wait_for(&mut owner, |event| {
            *event == ConnectionEvent::StateChanged(ConnectionState::Failed(FailureReason::Stale))
        })
        .await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(30));
        assert_eq!(factory.server().pings(), 0);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test]
    async fn test_bad_msg_clock_codes_resync_and_resend() {
        for (code, sessions) in [(16, 1), (17, 2)] {
            let (session, factory) = keyed(MockBehavior::BadMsgOnce(code)).await;
            let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
            let (mut owner, worker) = spawn_manager(session.clone(), &factory);

            let (before, data) = wait_for_data(&mut owner).await;
            assert!(failures(&before).is_empty(), "code {}", code);
            assert_answers(&data, request_id);
            assert_eq!(factory.server().session_ids().len(), sessions, "code {}", code);
            assert_eq!(factory.server().requests().len(), 1);
            assert!(session.snapshot().await.time_delta.abs() <= 1);

            kill_and_drain(&mut owner, worker).await;
        }
    }

    #[tokio::test]
    async fn test_bad_msg_session_codes_reset_session() {
        for code in [32, 33] {
            let (session, factory) = keyed(MockBehavior::BadMsgOnce(code)).await;
            let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
            let first_session = session.session_id().await;
            let (mut owner, worker) = spawn_manager(session.clone(), &factory);

            let (before, data) = wait_for_data(&mut owner).await;
            assert!(failures(&before).is_empty(), "code {}", code);
            assert_answers(&data, request_id);
            let session_ids = factory.server().session_ids().to_vec();
            assert_eq!(session_ids.len(), 2, "code {}", code);
            assert_eq!(session_ids[0], first_session);
            assert_eq!(session_ids[1], session.session_id().await);

            kill_and_drain(&mut owner, worker).await;
        }
    }

    #[tokio::test]
    async fn test_bad_msg_forgotten_message_is_resent() {
        let (session, factory) = keyed(MockBehavior::BadMsgOnce(20)).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, data) = wait_for_data(&mut owner).await;
        assert!(failures(&before).is_empty());
        assert_answers(&data, request_id);
        assert_eq!(factory.server().session_ids().len(), 1);
        assert_eq!(factory.server().requests().len(), 1);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_msg_other_code_restarts() {
        let (session, factory) = keyed(MockBehavior::BadMsgOnce(64)).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, data) = wait_for_data(&mut owner).await;
        assert_eq!(failures(&before), vec![FailureReason::Protocol]);
        assert_answers(&data, request_id);
        assert_eq!(factory.server().state_queries(), 1);
        assert_eq!(factory.server().requests().len(), 1);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test]
    async fn test_bad_server_salt_switches_salt() {
        let (session, factory) = keyed(MockBehavior::BadSaltOnce(0xfeed)).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, data) = wait_for_data(&mut owner).await;
        assert!(failures(&before).is_empty());
        assert_answers(&data, request_id);
        assert_eq!(session.server_salt().await, 0xfeed);
        {
            let server = factory.server();
            assert_eq!(server.salts().first(), Some(&SALT));
            assert_eq!(server.salts().last(), Some(&0xfeed));
            assert_eq!(server.requests().len(), 1);
        }

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test]
    async fn test_new_session_created_takes_salt() {
        let (session, factory) = keyed(MockBehavior::AnnounceSessions(0xabcd)).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (_, data) = wait_for_data(&mut owner).await;
        assert_answers(&data, request_id);
        assert_eq!(session.server_salt().await, 0xabcd);
        // nothing was sent before the session's first message
        assert_eq!(factory.server().requests().len(), 1);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test]
    async fn test_server_ping_and_state_query_answered() {
        let (session, factory) = keyed(MockBehavior::PingClient).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (_, data) = wait_for_data(&mut owner).await;
        assert_answers(&data, request_id);
        settle(&factory, |server| {
            !server.client_pongs().is_empty() && !server.client_state_infos().is_empty()
        })
        .await;
        {
            let server = factory.server();
            assert_eq!(server.client_pongs(), &[SERVER_PING_ID]);
            // the queried id predates everything received, so its state is unknown
            assert_eq!(server.client_state_infos(), &[Bytes::from_static(&[1])]);
        }

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_errors_back_off() {
        let (session, factory) = keyed(MockBehavior::FailConnects(2)).await;
        let started = Instant::now();
        let (mut owner, worker) = spawn_manager(session.clone(), &factory);

        let (before, _) = wait_for(&mut owner, |event| {
            *event == ConnectionEvent::StateChanged(ConnectionState::Connected)
        })
        .await;
        let elapsed = started.elapsed();
        assert_eq!(
            failures(&before),
            vec![FailureReason::Transport, FailureReason::Transport]
        );
        let errors = before
            .iter()
            .filter(|event| {
                **event
                    == ConnectionEvent::Error {
                        may_be_bad_key: false,
                    }
            })
            .count();
        assert_eq!(errors, 2);
        // 1 s then 2 s, each within the 20 % jitter
        assert!(elapsed >= Duration::from_millis(2400), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(3700), "{:?}", elapsed);

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ipv6_waits_for_ipv4_grace() {
        let (session, factory) = keyed(MockBehavior::SlowIpv4).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let config = ConnectionConfig {
            try_ipv6: true,
            ..test_config()
        };
        let started = Instant::now();
        let (mut owner, worker) = spawn_with(session.clone(), &factory, config, dual_stack_dcs());

        let (_, data) = wait_for_data(&mut owner).await;
        assert!(started.elapsed() >= test_config().ipv4_grace);
        assert_answers(&data, request_id);
        assert_eq!(*owner.transport_name_rx.borrow(), "Mock6");

        kill_and_drain(&mut owner, worker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ipv4_preferred_when_both_connect() {
        let (session, factory) = keyed(MockBehavior::Normal).await;
        let request_id = session.enqueue(Bytes::from_static(REQUEST)).await;
        let config = ConnectionConfig {
            try_ipv6: true,
            ..test_config()
        };
        let started = Instant::now();
        let (mut owner, worker) = spawn_with(session.clone(), &factory, config, dual_stack_dcs());

        let (_, data) = wait_for_data(&mut owner).await;
        assert!(started.elapsed() < test_config().ipv4_grace);
        assert_answers(&data, request_id);
        assert_eq!(*owner.transport_name_rx.borrow(), "Mock");

        kill_and_drain(&mut owner, worker).await;
    }

    #[test]
    fn test_timers_pick_earliest() {
        let now = Instant::now();
        let mut timers = Timers {
            retry_at: Some(now + Duration::from_secs(5)),
            next_ping_at: Some(now + Duration::from_secs(1)),
            ..Timers::default()
        };
        assert_eq!(timers.next(), Some(now + Duration::from_secs(1)));

        assert!(!fired(&mut timers.retry_at, now));
        assert!(fired(&mut timers.next_ping_at, now + Duration::from_secs(1)));
        assert_eq!(timers.next_ping_at, None);
        assert_eq!(timers.next(), Some(now + Duration::from_secs(5)));

        timers.clear();
        assert_eq!(timers.next(), None);
    }
}
