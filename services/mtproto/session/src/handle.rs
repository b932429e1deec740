//! Owner-side handle of a connection and its worker thread.

use crate::config::ConnectionConfig;
use crate::connection::{channels, Control, ConnectionManager};
use crate::dc::{DcId, DcLookup};
use crate::error::ConnectionError;
use crate::session_data::SessionData;
use crate::state::{ConnectionEvent, ConnectionState};
use crate::transport::{DefaultTransportFactory, TransportFactory};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

struct Worker {
    control_tx: mpsc::UnboundedSender<Control>,
    thread: JoinHandle<()>,
}

/// A connection to one datacenter.
///
/// The connection runs on a dedicated thread with its own single-threaded
/// runtime. Callers queue requests through the shared [`SessionData`] and
/// observe progress through [`take_events`](Self::take_events) and
/// [`state`](Self::state).
pub struct Connection {
    config: ConnectionConfig,
    dcs: Arc<dyn DcLookup>,
    factory: Arc<dyn TransportFactory>,
    worker: Option<Worker>,
    events: Option<mpsc::Receiver<ConnectionEvent>>,
    state_rx: watch::Receiver<ConnectionState>,
    transport_name_rx: watch::Receiver<String>,
    dc: Option<DcId>,
}

impl Connection {
    /// Create an unstarted connection using the real transports
    pub fn new(config: ConnectionConfig, dcs: Arc<dyn DcLookup>) -> Self {
        Self::with_transport_factory(config, dcs, Arc::new(DefaultTransportFactory))
    }

    /// Create an unstarted connection with custom transports
    pub fn with_transport_factory(
        config: ConnectionConfig,
        dcs: Arc<dyn DcLookup>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            dcs,
            factory,
            worker: None,
            events: None,
            state_rx: watch::channel(ConnectionState::Idle).1,
            transport_name_rx: watch::channel(String::new()).1,
            dc: None,
        }
    }

    /// Start the worker for `dc`, or for the main datacenter when `dc` is 0.
    ///
    /// Returns the datacenter actually used.
    pub fn start(&mut self, session: Arc<SessionData>, dc: DcId) -> Result<DcId, ConnectionError> {
        if self.worker.is_some() {
            return Err(ConnectionError::AlreadyStarted);
        }
        let dc = if dc == 0 { self.dcs.main_dc() } else { dc };
        let known = self.dcs.lookup(dc, false).is_some()
            || (self.config.try_ipv6 && self.dcs.lookup(dc, true).is_some());
        if !known {
            return Err(ConnectionError::UnknownDc(dc));
        }

        let (worker_channels, owner) = channels(self.config.event_capacity);
        let manager = ConnectionManager::new(
            dc,
            session,
            self.config.clone(),
            self.dcs.clone(),
            self.factory.clone(),
            worker_channels,
        );

        let thread = std::thread::Builder::new()
            .name(format!("mtproto-dc{}", dc))
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(manager.run()),
                    Err(e) => error!(dc, "Failed to build connection runtime: {}", e),
                }
            })
            .map_err(ConnectionError::Spawn)?;

        info!(dc, "Started connection");
        self.worker = Some(Worker {
            control_tx: owner.control_tx,
            thread,
        });
        self.events = Some(owner.events_rx);
        self.state_rx = owner.state_rx;
        self.transport_name_rx = owner.transport_name_rx;
        self.dc = Some(dc);
        Ok(dc)
    }

    /// Ask the worker to stop; the last event it emits is `Finished`
    pub fn kill(&self) {
        if let Some(worker) = &self.worker {
            if worker.control_tx.send(Control::Kill).is_err() {
                debug!("Connection worker already gone");
            }
        }
    }

    /// Drop the transports and reconnect
    pub fn restart(&self) {
        if let Some(worker) = &self.worker {
            if worker.control_tx.send(Control::Restart).is_err() {
                debug!("Connection worker already gone");
            }
        }
    }

    /// Block until the worker thread has exited
    pub fn wait_till_finish(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.thread.join().is_err() {
                error!("Connection thread panicked");
            }
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Name of the transport in use, empty while none is
    pub fn transport_name(&self) -> String {
        self.transport_name_rx.borrow().clone()
    }

    /// Event stream of the current worker; can be taken once per start
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events.take()
    }

    /// Datacenter of the last start
    pub fn dc(&self) -> Option<DcId> {
        self.dc
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.kill();
        self.wait_till_finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::dc::{DcFlags, DcOption, StaticDcTable};
    use crate::state::HandshakeStep;
    use crate::transport::mock::{test_key_ring, MockBehavior, MockTransportFactory};
    use bytes::Bytes;
    use std::time::Duration;

    fn connection(behavior: MockBehavior) -> (Connection, MockTransportFactory) {
        let factory = MockTransportFactory::new(behavior);
        let config = ConnectionConfig {
            transport: TransportKind::Tcp,
            rsa_keys: test_key_ring(),
            ..ConnectionConfig::default()
        };
        let dcs = Arc::new(StaticDcTable::new(
            2,
            vec![
                DcOption::new(2, "127.0.0.1", 443, DcFlags::empty()),
                DcOption::new(4, "::1", 443, DcFlags::IPV6),
            ],
        ));
        (
            Connection::with_transport_factory(config, dcs, Arc::new(factory.clone())),
            factory,
        )
    }

    async fn wait_for(
        events: &mut mpsc::Receiver<ConnectionEvent>,
        wanted: impl Fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if wanted(&event) {
                return event;
            }
        }
    }

    async fn join(mut conn: Connection) -> Connection {
        tokio::task::spawn_blocking(move || {
            conn.wait_till_finish();
            conn
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_dc() {
        let (mut conn, _) = connection(MockBehavior::Normal);
        let session = SessionData::new();
        assert!(matches!(
            conn.start(session.clone(), 7),
            Err(ConnectionError::UnknownDc(7))
        ));
        // IPv6-only datacenter without IPv6 enabled
        assert!(matches!(
            conn.start(session, 4),
            Err(ConnectionError::UnknownDc(4))
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.take_events().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_on_main_dc() {
        let (mut conn, _) = connection(MockBehavior::Normal);
        let session = SessionData::new();
        let request_id = session
            .enqueue(Bytes::from_static(&[0xef, 0xbe, 0xad, 0xde, 9]))
            .await;

        assert_eq!(conn.start(session.clone(), 0).unwrap(), 2);
        assert_eq!(conn.dc(), Some(2));
        assert!(matches!(
            conn.start(session.clone(), 2),
            Err(ConnectionError::AlreadyStarted)
        ));

        let mut events = conn.take_events().unwrap();
        let data = wait_for(&mut events, |event| {
            matches!(event, ConnectionEvent::DataReceived { .. })
        })
        .await;
        assert!(matches!(
            data,
            ConnectionEvent::DataReceived { request_id: Some(id), .. } if id == request_id
        ));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.transport_name(), "Mock");

        conn.kill();
        conn.kill();
        wait_for(&mut events, |event| *event == ConnectionEvent::Finished).await;
        let conn = join(conn).await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
        assert_eq!(conn.transport_name(), "");
    }

    #[tokio::test]
    async fn test_kill_during_key_exchange() {
        let (mut conn, factory) = connection(MockBehavior::StallAfterPq);
        let session = SessionData::new();
        conn.start(session.clone(), 2).unwrap();
        let mut events = conn.take_events().unwrap();

        wait_for(&mut events, |event| {
            *event
                == ConnectionEvent::StateChanged(ConnectionState::WaitingForAuthKey(
                    HandshakeStep::DhParamsSent,
                ))
        })
        .await;
        conn.kill();
        wait_for(&mut events, |event| *event == ConnectionEvent::Finished).await;
        let _conn = join(conn).await;

        assert!(session.auth_key().await.is_none());
        assert_eq!(factory.server().completed_handshakes(), 0);
    }
}
