//! Transport racing TCP against HTTP.
//!
//! Both probes start together. TCP wins whenever it answers before the
//! race is decided; an HTTP answer only wins after TCP had `http_grace` to
//! catch up or has already failed. A relay task watches both inner
//! transports, decides the race, and forwards the winner's events.

use super::http::HttpTransport;
use super::tcp::TcpTransport;
use super::{EventSink, Transport, TransportEvent, TransportEventKind};
use crate::config::ConnectionConfig;
use crate::dc::DcEndpoint;
use crate::error::TransportError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Progress of the race
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStatus {
    /// Neither probe answered yet
    WaitingBoth,
    /// TCP failed, HTTP still probing
    WaitingHttp,
    /// HTTP failed, TCP still probing
    WaitingTcp,
    /// HTTP answered, giving TCP its grace period
    HttpReady,
    /// HTTP won
    UsingHttp,
    /// TCP won
    UsingTcp,
    /// Both failed, the race timed out, or the winner failed
    FinishedWork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Tcp,
    Http,
}

/// Apply an inner event; returns the new status and the event to forward
fn advance(
    status: AutoStatus,
    side: Side,
    kind: TransportEventKind,
) -> (AutoStatus, Option<TransportEventKind>) {
    use AutoStatus::*;
    use TransportEventKind::{Connected, Disconnected, Error, Received};

    let lost = |kind: TransportEventKind| match kind {
        Error { may_be_bad_key } => Error { may_be_bad_key },
        _ => Error {
            may_be_bad_key: false,
        },
    };

    match (status, side, kind) {
        (WaitingBoth | WaitingTcp | HttpReady, Side::Tcp, Connected) => (UsingTcp, Some(Connected)),
        (WaitingBoth, Side::Http, Connected) => (HttpReady, None),
        (WaitingHttp, Side::Http, Connected) => (UsingHttp, Some(Connected)),

        (WaitingBoth, Side::Tcp, Error { .. } | Disconnected) => (WaitingHttp, None),
        (HttpReady, Side::Tcp, Error { .. } | Disconnected) => (UsingHttp, Some(Connected)),
        (WaitingTcp, Side::Tcp, kind @ (Error { .. } | Disconnected)) => {
            (FinishedWork, Some(lost(kind)))
        }

        (WaitingBoth | HttpReady, Side::Http, Error { .. } | Disconnected) => (WaitingTcp, None),
        (WaitingHttp, Side::Http, kind @ (Error { .. } | Disconnected)) => {
            (FinishedWork, Some(lost(kind)))
        }

        (UsingTcp, Side::Tcp, kind @ (Error { .. } | Disconnected)) => (FinishedWork, Some(kind)),
        (UsingTcp, Side::Tcp, kind @ Received(_)) => (UsingTcp, Some(kind)),
        (UsingHttp, Side::Http, kind @ (Error { .. } | Disconnected)) => {
            (FinishedWork, Some(kind))
        }
        (UsingHttp, Side::Http, kind @ Received(_)) => (UsingHttp, Some(kind)),

        (status, _, _) => (status, None),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Relay task deciding the race
async fn run_race(
    mut tcp_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut http_rx: mpsc::UnboundedReceiver<TransportEvent>,
    sink: EventSink,
    status: Arc<watch::Sender<AutoStatus>>,
    http_grace: Duration,
    race_timeout: Duration,
) {
    let race_deadline = Instant::now() + race_timeout;
    let mut grace_deadline = None;

    loop {
        let current = *status.borrow();
        if current == AutoStatus::FinishedWork {
            break;
        }
        let deadline = match current {
            AutoStatus::HttpReady => grace_deadline,
            AutoStatus::WaitingBoth | AutoStatus::WaitingHttp | AutoStatus::WaitingTcp => {
                Some(race_deadline)
            }
            _ => None,
        };

        let (next, forward) = tokio::select! {
            biased;

            Some(event) = tcp_rx.recv() => advance(current, Side::Tcp, event.kind),
            Some(event) = http_rx.recv() => advance(current, Side::Http, event.kind),
            _ = sleep_until_opt(deadline) => {
                if current == AutoStatus::HttpReady {
                    debug!("TCP missed the HTTP grace period");
                    (AutoStatus::UsingHttp, Some(TransportEventKind::Connected))
                } else {
                    warn!("Transport race timed out after {:?}", race_timeout);
                    (
                        AutoStatus::FinishedWork,
                        Some(TransportEventKind::Error { may_be_bad_key: false }),
                    )
                }
            }
        };

        if next != current {
            debug!("Transport race {:?} -> {:?}", current, next);
            if next == AutoStatus::HttpReady {
                grace_deadline = Some(Instant::now() + http_grace);
            }
            match next {
                AutoStatus::UsingTcp => info!("Transport race won by TCP"),
                AutoStatus::UsingHttp => info!("Transport race won by HTTP"),
                _ => {}
            }
            status.send_replace(next);
        }
        if let Some(kind) = forward {
            sink.emit(kind);
        }
    }
}

/// Races a TCP transport against an HTTP transport and keeps the winner
pub struct AutoTransport {
    tcp: TcpTransport,
    http: HttpTransport,
    status: Arc<watch::Sender<AutoStatus>>,
    relay: Option<JoinHandle<()>>,
    settled: bool,
}

impl AutoTransport {
    /// Create both inner transports and start the relay
    pub fn new(config: &ConnectionConfig, sink: EventSink) -> Result<Self, TransportError> {
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (http_tx, http_rx) = mpsc::unbounded_channel();
        let tcp = TcpTransport::new(config, EventSink::new(sink.slot(), 0, tcp_tx));
        let http = HttpTransport::new(config, EventSink::new(sink.slot(), 0, http_tx))?;

        let (status, _) = watch::channel(AutoStatus::WaitingBoth);
        let status = Arc::new(status);
        let relay = tokio::spawn(run_race(
            tcp_rx,
            http_rx,
            sink,
            status.clone(),
            config.http_grace,
            config.race_timeout,
        ));

        Ok(Self {
            tcp,
            http,
            status,
            relay: Some(relay),
            settled: false,
        })
    }

    /// Current status
    pub fn status(&self) -> AutoStatus {
        *self.status.borrow()
    }

    /// Tear down the loser once the race is decided
    fn settle(&mut self) {
        if self.settled {
            return;
        }
        match self.status() {
            AutoStatus::UsingTcp => self.http.disconnect(),
            AutoStatus::UsingHttp => self.tcp.disconnect(),
            AutoStatus::FinishedWork => {
                self.tcp.disconnect();
                self.http.disconnect();
            }
            _ => return,
        }
        self.settled = true;
    }
}

impl Transport for AutoTransport {
    fn connect_tcp(&mut self, endpoint: &DcEndpoint) {
        self.tcp.connect_tcp(endpoint);
    }

    fn connect_http(&mut self, endpoint: &DcEndpoint) {
        self.http.connect_http(endpoint);
    }

    fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.settle();
        match self.status() {
            AutoStatus::UsingTcp => self.tcp.send(payload),
            AutoStatus::UsingHttp => self.http.send(payload),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn disconnect(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
        self.tcp.disconnect();
        self.http.disconnect();
        self.status.send_replace(AutoStatus::FinishedWork);
        self.settled = true;
    }

    fn is_connected(&self) -> bool {
        matches!(self.status(), AutoStatus::UsingTcp | AutoStatus::UsingHttp)
    }

    fn needs_http_wait(&self) -> bool {
        self.status() == AutoStatus::UsingHttp && self.http.needs_http_wait()
    }

    fn name(&self) -> String {
        match self.status() {
            AutoStatus::UsingTcp => "Auto (TCP)".to_string(),
            AutoStatus::UsingHttp => "Auto (HTTP)".to_string(),
            _ => "Auto".to_string(),
        }
    }
}

impl Drop for AutoTransport {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}
