//! Framed TCP transport.

use super::{EventSink, Probe, Transport};
use crate::config::ConnectionConfig;
use crate::dc::DcEndpoint;
use crate::error::TransportError;
use bytes::{Bytes, BytesMut};
use mtproto_wire::{Packet, PacketDecoder, PacketEncoder, BAD_AUTH_KEY_CODE};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Progress of a TCP transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpStatus {
    /// Connecting or waiting for the probe answer
    WaitingTcp,
    /// Probe answered, carrying packets
    UsingTcp,
    /// Closed or failed
    FinishedWork,
}

/// Read half with its packet decoder
struct PacketReader {
    reader: OwnedReadHalf,
    decoder: PacketDecoder,
    buffer: BytesMut,
}

impl PacketReader {
    /// Read the next packet. Cancel safe: buffered bytes survive a dropped call.
    async fn read_packet(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = self.decoder.decode(&mut self.buffer)? {
                return Ok(packet);
            }
            let bytes_read = self.reader.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                return Err(TransportError::Closed);
            }
            trace!(
                "Read {} bytes, buffer now has {} bytes",
                bytes_read,
                self.buffer.len()
            );
        }
    }
}

/// Write half with its packet counter
struct PacketWriter {
    writer: OwnedWriteHalf,
    encoder: PacketEncoder,
}

impl PacketWriter {
    async fn write_packet(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let packet = self.encoder.encode(payload);
        self.writer.write_all(&packet).await?;
        Ok(())
    }
}

/// Connect, send the probe, and wait for its answer
async fn establish(
    addr: &str,
    max_packet_size: usize,
) -> Result<(PacketReader, PacketWriter), TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();

    let mut reader = PacketReader {
        reader,
        decoder: PacketDecoder::with_max_packet_size(max_packet_size),
        buffer: BytesMut::with_capacity(8 * 1024),
    };
    let mut writer = PacketWriter {
        writer,
        encoder: PacketEncoder::new(),
    };

    let probe = Probe::new();
    writer.write_packet(&probe.request()).await?;
    loop {
        let packet = reader.read_packet().await?;
        if let Some(code) = packet.error_code() {
            return Err(TransportError::ErrorCode(code));
        }
        if probe.matches(&packet.payload) {
            return Ok((reader, writer));
        }
        debug!("Ignoring packet {} before probe answer", packet.packet_number);
    }
}

/// Socket task: connect, then pump packets both ways until failure
async fn run_socket(
    addr: String,
    timeout: Duration,
    max_packet_size: usize,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    sink: EventSink,
    status: Arc<watch::Sender<TcpStatus>>,
) {
    let (mut reader, mut writer) =
        match tokio::time::timeout(timeout, establish(&addr, max_packet_size)).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                warn!("TCP connect to {} failed: {}", addr, e);
                status.send_replace(TcpStatus::FinishedWork);
                sink.error(e.may_be_bad_key());
                return;
            }
            Err(_) => {
                warn!("TCP connect to {} timed out after {:?}", addr, timeout);
                status.send_replace(TcpStatus::FinishedWork);
                sink.error(false);
                return;
            }
        };

    info!("TCP connected to {} ({})", addr, sink.slot());
    status.send_replace(TcpStatus::UsingTcp);
    sink.connected();

    loop {
        tokio::select! {
            biased;

            payload = outbound.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = writer.write_packet(&payload).await {
                        warn!("TCP write to {} failed: {}", addr, e);
                        sink.error(e.may_be_bad_key());
                        break;
                    }
                }
                // Transport dropped
                None => break,
            },

            result = reader.read_packet() => match result {
                Ok(packet) => match packet.error_code() {
                    Some(code) => {
                        warn!("TCP transport error code {} from {}", code, addr);
                        sink.error(code == BAD_AUTH_KEY_CODE);
                        break;
                    }
                    None => sink.received(packet.payload),
                },
                Err(TransportError::Closed) => {
                    info!("TCP connection to {} closed by peer", addr);
                    sink.disconnected();
                    break;
                }
                Err(e) => {
                    warn!("TCP read from {} failed: {}", addr, e);
                    sink.error(e.may_be_bad_key());
                    break;
                }
            },
        }
    }

    status.send_replace(TcpStatus::FinishedWork);
}

/// MTProto over a single TCP socket with full framing
pub struct TcpTransport {
    sink: EventSink,
    timeout: Duration,
    max_packet_size: usize,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
    status: Arc<watch::Sender<TcpStatus>>,
}

impl TcpTransport {
    /// Create an unconnected transport
    pub fn new(config: &ConnectionConfig, sink: EventSink) -> Self {
        let (status, _) = watch::channel(TcpStatus::WaitingTcp);
        Self {
            sink,
            timeout: config.tcp_timeout,
            max_packet_size: config.max_packet_size,
            outbound: None,
            task: None,
            status: Arc::new(status),
        }
    }

    /// Current status
    pub fn status(&self) -> TcpStatus {
        *self.status.borrow()
    }
}

impl Transport for TcpTransport {
    fn connect_tcp(&mut self, endpoint: &DcEndpoint) {
        self.disconnect();

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.status.send_replace(TcpStatus::WaitingTcp);

        let addr = endpoint.socket_addr();
        debug!("Connecting TCP to {}", addr);
        self.task = Some(tokio::spawn(run_socket(
            addr,
            self.timeout,
            self.max_packet_size,
            rx,
            self.sink.clone(),
            self.status.clone(),
        )));
    }

    fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        if self.status() != TcpStatus::UsingTcp {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.status.send_replace(TcpStatus::FinishedWork);
    }

    fn is_connected(&self) -> bool {
        self.status() == TcpStatus::UsingTcp
    }

    fn name(&self) -> String {
        "TCP".to_string()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dc::DcFlags;
    use crate::transport::{Slot, TransportEventKind};
    use mtproto_wire::{decode_plain, encode_packet, encode_plain, ReqPq, ResPq};
    use tokio::net::TcpListener;

    fn endpoint(port: u16) -> DcEndpoint {
        DcEndpoint {
            address: "127.0.0.1".to_string(),
            port,
            flags: DcFlags::empty(),
        }
    }

    async fn read_one(stream: &mut TcpStream, decoder: &mut PacketDecoder, buf: &mut BytesMut) -> Packet {
        loop {
            if let Some(packet) = decoder.decode(buf).unwrap() {
                return packet;
            }
            assert!(stream.read_buf(buf).await.unwrap() > 0);
        }
    }

    /// Answers the probe, then echoes one packet back and sends an error code
    async fn fake_server(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut decoder = PacketDecoder::new();
        let mut buf = BytesMut::new();

        let probe = read_one(&mut stream, &mut decoder, &mut buf).await;
        let req_pq = ReqPq::parse(&decode_plain(&probe.payload).unwrap().body).unwrap();
        let res_pq = ResPq {
            nonce: req_pq.nonce,
            server_nonce: [9; 16],
            pq: vec![0x17, 0xed, 0x48, 0x94, 0x1a, 0x08, 0xf9, 0x81],
            fingerprints: vec![1],
        };
        let answer = encode_plain(0x51e57ac91e83c801, &res_pq.to_bytes());
        stream.write_all(&encode_packet(&answer, 0)).await.unwrap();

        let echoed = read_one(&mut stream, &mut decoder, &mut buf).await;
        assert_eq!(echoed.packet_number, 1);
        stream
            .write_all(&encode_packet(&echoed.payload, 1))
            .await
            .unwrap();
        stream
            .write_all(&encode_packet(&(-404i32).to_le_bytes(), 2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_echo_and_error_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_server(listener));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = TcpTransport::new(&ConnectionConfig::default(), EventSink::new(Slot::V4, 1, tx));
        assert!(transport.send(Bytes::from_static(b"early")).is_err());
        transport.connect_tcp(&endpoint(port));

        let connected = rx.recv().await.unwrap();
        assert_eq!(connected.kind, TransportEventKind::Connected);
        assert!(transport.is_connected());

        transport.send(Bytes::from_static(b"echo me!")).unwrap();
        assert_eq!(
            rx.recv().await.unwrap().kind,
            TransportEventKind::Received(Bytes::from_static(b"echo me!"))
        );
        assert_eq!(
            rx.recv().await.unwrap().kind,
            TransportEventKind::Error {
                may_be_bad_key: true
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = TcpTransport::new(&ConnectionConfig::default(), EventSink::new(Slot::V4, 1, tx));
        transport.connect_tcp(&endpoint(port));

        assert_eq!(
            rx.recv().await.unwrap().kind,
            TransportEventKind::Error {
                may_be_bad_key: false
            }
        );
        assert!(!transport.is_connected());
        assert_eq!(transport.name(), "TCP");
    }
}
