//! HTTP transport: one POST per packet, answers in the response body.

use super::{EventSink, Probe, Transport};
use crate::config::ConnectionConfig;
use crate::dc::DcEndpoint;
use crate::error::TransportError;
use bytes::Bytes;
use mtproto_wire::{transport_error_code, BAD_AUTH_KEY_CODE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Progress of an HTTP transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    /// Waiting for the probe answer
    WaitingHttp,
    /// Probe answered, carrying packets
    UsingHttp,
    /// Failed
    FinishedWork,
}

/// Counts a request as in flight for as long as it lives
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn post(client: &reqwest::Client, url: &str, body: Bytes) -> Result<Bytes, TransportError> {
    let response = client.post(url).body(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::HttpStatus(status.as_u16()));
    }
    Ok(response.bytes().await?)
}

/// Turn a response body into events
fn deliver(sink: &EventSink, url: &str, body: Bytes) -> bool {
    if let Some(code) = transport_error_code(&body) {
        warn!("HTTP transport error code {} from {}", code, url);
        sink.error(code == BAD_AUTH_KEY_CODE);
        return false;
    }
    if body.is_empty() {
        debug!("Empty HTTP response from {}", url);
    } else {
        sink.received(body);
    }
    true
}

/// MTProto over HTTP POST requests
pub struct HttpTransport {
    client: reqwest::Client,
    sink: EventSink,
    url: Option<String>,
    probe_timeout: Duration,
    requests: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
    status: Arc<watch::Sender<HttpStatus>>,
}

impl HttpTransport {
    /// Create an unconnected transport
    pub fn new(config: &ConnectionConfig, sink: EventSink) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let (status, _) = watch::channel(HttpStatus::WaitingHttp);
        Ok(Self {
            client,
            sink,
            url: None,
            probe_timeout: config.tcp_timeout,
            requests: Arc::new(Semaphore::new(config.max_http_requests.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tasks: Vec::new(),
            status: Arc::new(status),
        })
    }

    /// Current status
    pub fn status(&self) -> HttpStatus {
        *self.status.borrow()
    }

    /// Number of requests waiting for a response
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Transport for HttpTransport {
    fn connect_tcp(&mut self, _endpoint: &DcEndpoint) {}

    fn connect_http(&mut self, endpoint: &DcEndpoint) {
        self.abort_tasks();
        let url = endpoint.http_url();
        self.url = Some(url.clone());
        self.status.send_replace(HttpStatus::WaitingHttp);

        let client = self.client.clone();
        let sink = self.sink.clone();
        let status = self.status.clone();
        let timeout = self.probe_timeout;
        debug!("Probing HTTP endpoint {}", url);

        self.tasks.push(tokio::spawn(async move {
            let probe = Probe::new();
            let result = tokio::time::timeout(timeout, post(&client, &url, probe.request())).await;
            match result {
                Ok(Ok(body)) if probe.matches(&body) => {
                    info!("HTTP connected to {} ({})", url, sink.slot());
                    status.send_replace(HttpStatus::UsingHttp);
                    sink.connected();
                }
                Ok(Ok(body)) => {
                    status.send_replace(HttpStatus::FinishedWork);
                    match transport_error_code(&body) {
                        Some(code) => {
                            warn!("HTTP probe to {} got error code {}", url, code);
                            sink.error(code == BAD_AUTH_KEY_CODE);
                        }
                        None => {
                            warn!("HTTP probe to {} got an unexpected answer", url);
                            sink.error(false);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("HTTP probe to {} failed: {}", url, e);
                    status.send_replace(HttpStatus::FinishedWork);
                    sink.error(e.may_be_bad_key());
                }
                Err(_) => {
                    warn!("HTTP probe to {} timed out after {:?}", url, timeout);
                    status.send_replace(HttpStatus::FinishedWork);
                    sink.error(false);
                }
            }
        }));
    }

    fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        if self.status() != HttpStatus::UsingHttp {
            return Err(TransportError::NotConnected);
        }
        let url = self.url.clone().ok_or(TransportError::NotConnected)?;
        self.tasks.retain(|task| !task.is_finished());

        let client = self.client.clone();
        let sink = self.sink.clone();
        let status = self.status.clone();
        let requests = self.requests.clone();
        let in_flight = InFlight::new(&self.in_flight);

        self.tasks.push(tokio::spawn(async move {
            let _in_flight = in_flight;
            let Ok(_permit) = requests.acquire_owned().await else {
                return;
            };
            match post(&client, &url, payload).await {
                Ok(body) => {
                    if !deliver(&sink, &url, body) {
                        status.send_replace(HttpStatus::FinishedWork);
                    }
                }
                Err(e) => {
                    warn!("HTTP request to {} failed: {}", url, e);
                    status.send_replace(HttpStatus::FinishedWork);
                    sink.error(e.may_be_bad_key());
                }
            }
        }));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.abort_tasks();
        self.status.send_replace(HttpStatus::FinishedWork);
    }

    fn is_connected(&self) -> bool {
        self.status() == HttpStatus::UsingHttp
    }

    fn needs_http_wait(&self) -> bool {
        self.is_connected() && self.in_flight() == 0
    }

    fn name(&self) -> String {
        "HTTP".to_string()
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Slot, TransportEventKind};
    use tokio::sync::mpsc;

    #[test]
    fn test_deliver_classifies_bodies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(Slot::V4, 1, tx);

        assert!(deliver(&sink, "u", Bytes::new()));
        assert!(rx.try_recv().is_err());

        assert!(deliver(&sink, "u", Bytes::from_static(b"payload!")));
        assert_eq!(
            rx.try_recv().unwrap().kind,
            TransportEventKind::Received(Bytes::from_static(b"payload!"))
        );

        assert!(!deliver(&sink, "u", Bytes::copy_from_slice(&(-404i32).to_le_bytes())));
        assert_eq!(
            rx.try_recv().unwrap().kind,
            TransportEventKind::Error {
                may_be_bad_key: true
            }
        );
    }

    #[test]
    fn test_in_flight_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = InFlight::new(&counter);
        let second = InFlight::new(&counter);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(first);
        drop(second);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_requires_probe() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport =
            HttpTransport::new(&ConnectionConfig::default(), EventSink::new(Slot::V4, 1, tx)).unwrap();
        assert!(matches!(
            transport.send(Bytes::from_static(b"x")),
            Err(TransportError::NotConnected)
        ));
        assert!(!transport.needs_http_wait());
        assert_eq!(transport.name(), "HTTP");
    }
}
