//! Session state shared between the caller and the connection worker.
//!
//! Everything that must survive a reconnect lives here: the auth key, the
//! salt, the session id and sequence counter, the clock correction, and the
//! queues of requests that are unsent, sent but unacknowledged, or due for
//! resend. All of it sits behind a single `RwLock` which is only held for
//! short, non-blocking sections.
//!
//! Requests left unacknowledged are asked about with `msgs_state_req`; the
//! server's `msgs_state_info` decides whether they are resent.

use bytes::Bytes;
use mtproto_crypto::AuthKey;
use mtproto_wire::{msg_id_at, msg_id_seconds, ContainerItem, ServiceMessage};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

/// Message identifier
pub type MsgId = u64;

/// Caller-visible request identifier
pub type RequestId = u64;

/// Acknowledged ids kept for response correlation
const WERE_ACKED_LIMIT: usize = 400;
/// Received server ids kept for deduplication
const RECEIVED_IDS_LIMIT: usize = 400;
/// Container records kept for resend expansion
const CONTAINERS_LIMIT: usize = 400;
/// Outstanding `msgs_state_req` records
const STATE_QUERIES_LIMIT: usize = 64;
/// Ids per `msgs_ack`
const MAX_ACK_IDS: usize = 8192;
/// Bytes of container header in front of the items
const CONTAINER_HEADER_SIZE: usize = 8;
/// Bytes of item header in front of each body
const CONTAINER_ITEM_HEADER_SIZE: usize = 16;

/// A caller request owned by the session until acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Caller-visible id
    pub id: RequestId,
    /// Serialized TL body
    pub body: Bytes,
    /// Whether an `rpc_result` is expected
    pub needs_response: bool,
    /// Id of the message carrying the last attempt
    pub msg_id: Option<MsgId>,
    /// Sequence number of the last attempt
    pub seq_no: u32,
    /// Number of resends
    pub retries: u32,
    /// When the last attempt went out, or its state was last asked about
    pub sent_at: Option<Instant>,
}

/// Limits applied when batching messages into containers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendLimits {
    /// Largest serialized container
    pub max_container_bytes: usize,
    /// Most messages in one container
    pub max_container_messages: usize,
}

impl Default for SendLimits {
    fn default() -> Self {
        Self {
            max_container_bytes: 64 * 1024,
            max_container_messages: 1020,
        }
    }
}

/// A service message the worker wants sent along with queued requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraMessage {
    /// Serialized body
    pub body: Bytes,
    /// Whether the message takes an odd sequence number
    pub content_related: bool,
}

impl ExtraMessage {
    /// Wrap a service message
    pub fn service(message: &ServiceMessage) -> Self {
        Self {
            body: message.to_bytes(),
            content_related: message.is_content_related(),
        }
    }
}

/// One top-level message ready for encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Message id
    pub msg_id: MsgId,
    /// Sequence number
    pub seq_no: u32,
    /// Body, possibly a container
    pub body: Bytes,
}

/// Everything needed to encrypt and send one batch
#[derive(Debug, Clone)]
pub struct PreparedSend {
    /// Key to encrypt with
    pub auth_key: Arc<AuthKey>,
    /// Current salt
    pub salt: u64,
    /// Current session id
    pub session_id: u64,
    /// Top-level messages, one encrypted packet each
    pub messages: Vec<OutgoingMessage>,
    /// Number of caller requests in the batch
    pub requests: usize,
    /// Whether any message expects an answer or ack
    pub has_content: bool,
}

/// Point-in-time copy of the session queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current session id
    pub session_id: u64,
    /// Current salt
    pub server_salt: u64,
    /// Content messages sent in this session
    pub seq_no: u32,
    /// Server minus local clock, seconds
    pub time_delta: i64,
    /// Whether an auth key is set
    pub has_auth_key: bool,
    /// Requests not yet sent
    pub to_send: Vec<RequestId>,
    /// Ids sent and awaiting ack
    pub have_sent: Vec<MsgId>,
    /// Acknowledged ids
    pub were_acked: Vec<MsgId>,
    /// Ids scheduled for resend
    pub to_resend: Vec<MsgId>,
    /// Server ids waiting to be acknowledged
    pub acks_to_send: Vec<MsgId>,
    /// Ids of `msgs_state_req` messages still waiting for `msgs_state_info`
    pub state_queries: Vec<MsgId>,
    /// Sent ids to ask about with the next send
    pub pending_state_query: Vec<MsgId>,
}

/// What a laid-out message carries besides its body
enum Carried {
    Nothing,
    Request(Request),
    StateQuery(Vec<MsgId>),
}

#[derive(Debug)]
struct SessionState {
    auth_key: Option<Arc<AuthKey>>,
    server_salt: u64,
    session_id: u64,
    seq_no: u32,
    time_delta: i64,
    last_msg_id: MsgId,
    to_send: VecDeque<Request>,
    have_sent: BTreeMap<MsgId, Request>,
    were_acked: BTreeMap<MsgId, RequestId>,
    to_resend: BTreeSet<MsgId>,
    containers: BTreeMap<MsgId, Vec<MsgId>>,
    received_ids: BTreeSet<MsgId>,
    acks_to_send: Vec<MsgId>,
    state_queries: BTreeMap<MsgId, Vec<MsgId>>,
    pending_state_query: BTreeSet<MsgId>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            auth_key: None,
            server_salt: 0,
            session_id: rand::random(),
            seq_no: 0,
            time_delta: 0,
            last_msg_id: 0,
            to_send: VecDeque::new(),
            have_sent: BTreeMap::new(),
            were_acked: BTreeMap::new(),
            to_resend: BTreeSet::new(),
            containers: BTreeMap::new(),
            received_ids: BTreeSet::new(),
            acks_to_send: Vec::new(),
            state_queries: BTreeMap::new(),
            pending_state_query: BTreeSet::new(),
        }
    }

    fn next_msg_id(&mut self) -> MsgId {
        let local_ms = unix_now_ms() as i64;
        let adjusted = local_ms.saturating_add(self.time_delta.saturating_mul(1000));
        let mut msg_id = msg_id_at(adjusted.max(0) as u64);
        if msg_id <= self.last_msg_id {
            msg_id = self.last_msg_id + 4;
        }
        self.last_msg_id = msg_id;
        msg_id
    }

    fn next_seq_no(&mut self, content_related: bool) -> u32 {
        let seq_no = self.seq_no * 2 + u32::from(content_related);
        if content_related {
            self.seq_no += 1;
        }
        seq_no
    }

    fn reset(&mut self) {
        self.session_id = rand::random();
        self.seq_no = 0;
        self.to_resend = self.have_sent.keys().copied().collect();
        self.containers.clear();
        self.received_ids.clear();
        self.acks_to_send.clear();
        self.state_queries.clear();
        self.pending_state_query.clear();
    }

    fn mark_for_resend(&mut self, msg_id: MsgId) -> usize {
        if let Some(inner) = self.containers.remove(&msg_id) {
            return inner.into_iter().map(|id| self.mark_for_resend(id)).sum();
        }
        if self.have_sent.contains_key(&msg_id) && self.to_resend.insert(msg_id) {
            1
        } else {
            0
        }
    }

    fn acked(&mut self, msg_id: MsgId, by_response: bool, out: &mut Vec<RequestId>) {
        if let Some(inner) = self.containers.remove(&msg_id) {
            for id in inner {
                self.acked(id, false, out);
            }
            return;
        }
        if let Some(request) = self.have_sent.remove(&msg_id) {
            self.to_resend.remove(&msg_id);
            self.were_acked.insert(msg_id, request.id);
            while self.were_acked.len() > WERE_ACKED_LIMIT {
                self.were_acked.pop_first();
            }
            out.push(request.id);
        } else if by_response {
            if let Some(&request_id) = self.were_acked.get(&msg_id) {
                out.push(request_id);
            }
        }
    }
}

/// Shared, lock-protected session state
#[derive(Debug)]
pub struct SessionData {
    state: RwLock<SessionState>,
    send_notify: Notify,
    next_request_id: AtomicU64,
}

impl SessionData {
    /// Create an empty session without an auth key
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(SessionState::new()),
            send_notify: Notify::new(),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Queue a request that expects a response and wake the sender
    pub async fn enqueue(&self, body: Bytes) -> RequestId {
        self.enqueue_with(body, true).await
    }

    /// Queue a request and wake the sender
    pub async fn enqueue_with(&self, body: Bytes, needs_response: bool) -> RequestId {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.state.write().await.to_send.push_back(Request {
            id,
            body,
            needs_response,
            msg_id: None,
            seq_no: 0,
            retries: 0,
            sent_at: None,
        });
        debug!("Queued request {}", id);
        self.send_notify.notify_one();
        id
    }

    /// Future resolving when something asked for a send
    pub fn send_requested(&self) -> Notified<'_> {
        self.send_notify.notified()
    }

    /// Wake the sender without queueing anything
    pub fn request_send(&self) {
        self.send_notify.notify_one();
    }

    /// Current auth key
    pub async fn auth_key(&self) -> Option<Arc<AuthKey>> {
        self.state.read().await.auth_key.clone()
    }

    /// Install a freshly negotiated key and start a new session with it
    pub async fn set_auth_key(&self, auth_key: AuthKey, server_salt: u64, server_time: i32) {
        let mut state = self.state.write().await;
        info!("Installed auth key {:#018x}", auth_key.id());
        state.auth_key = Some(Arc::new(auth_key));
        state.server_salt = server_salt;
        state.time_delta = i64::from(server_time) - unix_now_secs();
        state.reset();
    }

    /// Forget the auth key; everything sent is resent under the next key
    pub async fn clear_auth_key(&self) {
        let mut state = self.state.write().await;
        if state.auth_key.take().is_some() {
            info!("Cleared auth key");
        }
        state.reset();
    }

    /// Current salt
    pub async fn server_salt(&self) -> u64 {
        self.state.read().await.server_salt
    }

    /// Replace the salt
    pub async fn set_server_salt(&self, salt: u64) {
        self.state.write().await.server_salt = salt;
    }

    /// Current session id
    pub async fn session_id(&self) -> u64 {
        self.state.read().await.session_id
    }

    /// Start a new session id and schedule every unacknowledged request for resend
    pub async fn reset_session(&self) {
        let mut state = self.state.write().await;
        state.reset();
        info!(
            "Reset session to {:#018x} ({} requests to resend)",
            state.session_id,
            state.to_resend.len()
        );
    }

    /// Let the next message id follow the corrected clock even if it is lower
    /// than the last one. Only valid right after a session reset.
    pub async fn lower_msg_id_floor(&self) {
        self.state.write().await.last_msg_id = 0;
    }

    /// Record acknowledgements; returns the request ids they cover
    pub async fn requests_acked(&self, msg_ids: &[MsgId], by_response: bool) -> Vec<RequestId> {
        let mut state = self.state.write().await;
        let mut acked = Vec::new();
        for &msg_id in msg_ids {
            state.acked(msg_id, by_response, &mut acked);
        }
        acked
    }

    /// Request id a response to `req_msg_id` belongs to
    pub async fn response_received(&self, req_msg_id: MsgId) -> Option<RequestId> {
        self.requests_acked(&[req_msg_id], true)
            .await
            .into_iter()
            .next()
    }

    /// Schedule a sent message, or the contents of a sent container, for resend
    pub async fn mark_for_resend(&self, msg_id: MsgId) -> usize {
        self.state.write().await.mark_for_resend(msg_id)
    }

    /// Resend everything sent before `first_msg_id`
    pub async fn resend_older_than(&self, first_msg_id: MsgId) -> usize {
        let mut state = self.state.write().await;
        let older: Vec<MsgId> = state.have_sent.range(..first_msg_id).map(|(id, _)| *id).collect();
        older.into_iter().map(|id| state.mark_for_resend(id)).sum()
    }

    /// Resync the clock from a server message id, optionally take a new salt,
    /// and schedule the rejected message for resend.
    ///
    /// Returns whether anything was scheduled.
    pub async fn fix_time_and_salt(
        &self,
        bad_msg_id: MsgId,
        server_msg_id: MsgId,
        salt: Option<u64>,
    ) -> bool {
        let mut state = self.state.write().await;
        let delta = msg_id_seconds(server_msg_id) - unix_now_secs();
        if delta != state.time_delta {
            info!("Adjusted time delta from {}s to {}s", state.time_delta, delta);
            state.time_delta = delta;
        }
        if let Some(salt) = salt {
            state.server_salt = salt;
        }
        state.mark_for_resend(bad_msg_id) > 0
    }

    /// Record a server message id; returns false for a duplicate.
    ///
    /// Content-related messages are queued for acknowledgement either way.
    pub async fn register_received(&self, msg_id: MsgId, content_related: bool) -> bool {
        let mut state = self.state.write().await;
        if content_related {
            state.acks_to_send.push(msg_id);
        }
        let full = state.received_ids.len() >= RECEIVED_IDS_LIMIT;
        if state.received_ids.contains(&msg_id)
            || (full && state.received_ids.first().is_some_and(|&oldest| msg_id < oldest))
        {
            return false;
        }
        state.received_ids.insert(msg_id);
        while state.received_ids.len() > RECEIVED_IDS_LIMIT {
            state.received_ids.pop_first();
        }
        true
    }

    /// `msgs_state_info` bytes for the given server ids
    pub async fn received_state(&self, msg_ids: &[MsgId]) -> Vec<u8> {
        let state = self.state.read().await;
        msg_ids
            .iter()
            .map(|id| {
                if state.received_ids.contains(id) {
                    4
                } else if state.received_ids.first().is_some_and(|oldest| id < oldest) {
                    // too old to tell
                    1
                } else {
                    2
                }
            })
            .collect()
    }

    /// Ask the server about sent requests that have waited at least `older_than`.
    ///
    /// The `msgs_state_req` goes out with the next send. A request is asked
    /// about again only after waiting `older_than` once more. Returns how many
    /// requests were added to the query.
    pub async fn query_sent_state(&self, older_than: Duration) -> usize {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let now = Instant::now();
        let mut queried = 0;
        for (msg_id, request) in state.have_sent.iter_mut() {
            if state.to_resend.contains(msg_id) || state.pending_state_query.contains(msg_id) {
                continue;
            }
            let due = request
                .sent_at
                .is_none_or(|sent_at| now.saturating_duration_since(sent_at) >= older_than);
            if due {
                request.sent_at = Some(now);
                state.pending_state_query.insert(*msg_id);
                queried += 1;
            }
        }
        if queried > 0 {
            debug!("Asking for the state of {} sent requests", queried);
        }
        queried
    }

    /// Apply the `msgs_state_info` answering our query `req_msg_id`.
    ///
    /// Requests the server reports as not received are scheduled for resend;
    /// requests it reports as received and acknowledged count as acked.
    /// Returns how many were scheduled for resend.
    pub async fn state_info_received(&self, req_msg_id: MsgId, info: &[u8]) -> usize {
        let mut state = self.state.write().await;
        let Some(queried) = state.state_queries.remove(&req_msg_id) else {
            debug!("State info for unknown query {:#x}", req_msg_id);
            return 0;
        };

        let mut resent = 0;
        let mut acked = Vec::new();
        for (msg_id, &flags) in queried.into_iter().zip(info) {
            match flags & 0x07 {
                1..=3 => resent += state.mark_for_resend(msg_id),
                4 if flags & (0x08 | 0x80) != 0 => state.acked(msg_id, false, &mut acked),
                _ => {}
            }
        }
        debug!(
            "State info for {:#x}: {} to resend, {} acked",
            req_msg_id,
            resent,
            acked.len()
        );
        resent
    }

    /// Whether requests are unsent or unacknowledged
    pub async fn has_outstanding(&self) -> bool {
        let state = self.state.read().await;
        !state.to_send.is_empty() || !state.have_sent.is_empty()
    }

    /// Ids of requests unsent or unacknowledged, ascending
    pub async fn outstanding_request_ids(&self) -> Vec<RequestId> {
        let state = self.state.read().await;
        let mut ids: Vec<RequestId> = state
            .to_send
            .iter()
            .map(|request| request.id)
            .chain(state.have_sent.values().map(|request| request.id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Message id for an unencrypted message
    pub async fn next_plain_msg_id(&self) -> MsgId {
        self.state.write().await.next_msg_id()
    }

    /// Take everything due for sending and lay it out as top-level messages.
    ///
    /// Order is pending acks, `extras`, a pending state query, resends, then
    /// new requests. Resent requests get fresh ids. Returns `None` without an
    /// auth key or when there is nothing to send; `extras` are dropped in that
    /// case.
    pub async fn dequeue_for_send(
        &self,
        extras: Vec<ExtraMessage>,
        limits: SendLimits,
    ) -> Option<PreparedSend> {
        let mut state = self.state.write().await;
        let auth_key = state.auth_key.clone()?;

        let mut items: Vec<(ExtraMessage, Carried)> = Vec::new();
        if !state.acks_to_send.is_empty() {
            let acks = std::mem::take(&mut state.acks_to_send);
            for chunk in acks.chunks(MAX_ACK_IDS) {
                let ack = ServiceMessage::MsgsAck {
                    msg_ids: chunk.to_vec(),
                };
                items.push((ExtraMessage::service(&ack), Carried::Nothing));
            }
        }
        items.extend(extras.into_iter().map(|extra| (extra, Carried::Nothing)));

        let query: Vec<MsgId> = std::mem::take(&mut state.pending_state_query)
            .into_iter()
            .filter(|msg_id| state.have_sent.contains_key(msg_id) && !state.to_resend.contains(msg_id))
            .collect();
        if !query.is_empty() {
            let req = ServiceMessage::MsgsStateReq {
                msg_ids: query.clone(),
            };
            items.push((ExtraMessage::service(&req), Carried::StateQuery(query)));
        }

        let resend = std::mem::take(&mut state.to_resend);
        for msg_id in resend {
            if let Some(mut request) = state.have_sent.remove(&msg_id) {
                request.retries += 1;
                debug!(
                    "Resending request {} (was {:#x}, attempt {})",
                    request.id, msg_id, request.retries
                );
                items.push((content(&request), Carried::Request(request)));
            }
        }
        while let Some(request) = state.to_send.pop_front() {
            items.push((content(&request), Carried::Request(request)));
        }
        if items.is_empty() {
            return None;
        }

        let requests = items
            .iter()
            .filter(|(_, carried)| matches!(carried, Carried::Request(_)))
            .count();
        let now = Instant::now();
        let has_content = items.iter().any(|(extra, _)| extra.content_related);
        let mut messages = Vec::new();
        for group in group_items(items, limits) {
            let mut inner = Vec::with_capacity(group.len());
            for (extra, carried) in group {
                let msg_id = state.next_msg_id();
                let seq_no = state.next_seq_no(extra.content_related);
                match carried {
                    Carried::Request(mut request) => {
                        request.msg_id = Some(msg_id);
                        request.seq_no = seq_no;
                        request.sent_at = Some(now);
                        state.have_sent.insert(msg_id, request);
                    }
                    Carried::StateQuery(ids) => {
                        state.state_queries.insert(msg_id, ids);
                        while state.state_queries.len() > STATE_QUERIES_LIMIT {
                            state.state_queries.pop_first();
                        }
                    }
                    Carried::Nothing => {}
                }
                inner.push(ContainerItem {
                    msg_id,
                    seq_no,
                    body: extra.body,
                });
            }

            if inner.len() == 1 {
                if let Some(item) = inner.pop() {
                    messages.push(OutgoingMessage {
                        msg_id: item.msg_id,
                        seq_no: item.seq_no,
                        body: item.body,
                    });
                }
                continue;
            }

            let inner_ids: Vec<MsgId> = inner.iter().map(|item| item.msg_id).collect();
            let body = ServiceMessage::Container(inner).to_bytes();
            let msg_id = state.next_msg_id();
            let seq_no = state.next_seq_no(false);
            state.containers.insert(msg_id, inner_ids);
            while state.containers.len() > CONTAINERS_LIMIT {
                state.containers.pop_first();
            }
            messages.push(OutgoingMessage {
                msg_id,
                seq_no,
                body,
            });
        }

        Some(PreparedSend {
            auth_key,
            salt: state.server_salt,
            session_id: state.session_id,
            messages,
            requests,
            has_content,
        })
    }

    /// Copy of the queues for inspection
    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        SessionSnapshot {
            session_id: state.session_id,
            server_salt: state.server_salt,
            seq_no: state.seq_no,
            time_delta: state.time_delta,
            has_auth_key: state.auth_key.is_some(),
            to_send: state.to_send.iter().map(|request| request.id).collect(),
            have_sent: state.have_sent.keys().copied().collect(),
            were_acked: state.were_acked.keys().copied().collect(),
            to_resend: state.to_resend.iter().copied().collect(),
            acks_to_send: state.acks_to_send.clone(),
            state_queries: state.state_queries.keys().copied().collect(),
            pending_state_query: state.pending_state_query.iter().copied().collect(),
        }
    }
}

fn content(request: &Request) -> ExtraMessage {
    ExtraMessage {
        body: request.body.clone(),
        content_related: true,
    }
}

/// Split items into groups that each fit one container
fn group_items<T>(items: Vec<(ExtraMessage, T)>, limits: SendLimits) -> Vec<Vec<(ExtraMessage, T)>> {
    let max_messages = limits.max_container_messages.max(1);
    let mut groups: Vec<Vec<(ExtraMessage, T)>> = Vec::new();
    let mut current: Vec<(ExtraMessage, T)> = Vec::new();
    let mut current_bytes = CONTAINER_HEADER_SIZE;

    for item in items {
        let size = CONTAINER_ITEM_HEADER_SIZE + item.0.body.len();
        if !current.is_empty()
            && (current.len() >= max_messages || current_bytes + size > limits.max_container_bytes)
        {
            groups.push(std::mem::take(&mut current));
            current_bytes = CONTAINER_HEADER_SIZE;
        }
        current_bytes += size;
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn unix_now_secs() -> i64 {
    (unix_now_ms() / 1000) as i64
}
