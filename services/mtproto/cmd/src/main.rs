//! MTProto client binary.
//!
//! Keeps an encrypted session to one datacenter, sends the requests given on
//! the command line, and prints every result and update that arrives.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use mtproto_session::{
    Connection, ConnectionEvent, ConnectionState, SessionData, TransportKind,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ClientConfig;
use logging::MtprotoLogFormatter;

/// MTProto client connection
#[derive(Parser, Debug)]
#[command(name = "mtproto-client", version, about = "Keeps an MTProto session to a datacenter")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Datacenter id; overrides the config file
    #[arg(long)]
    dc: Option<i32>,

    /// Transport (tcp, http, auto); overrides the config file
    #[arg(long)]
    transport: Option<TransportKind>,

    /// Ping interval, e.g. 30s; overrides the config file
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Serialized TL request to send, as hex (repeatable)
    #[arg(long = "request")]
    requests: Vec<String>,

    /// Disconnect once every request is answered
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("mtproto_client={}", args.log_level).parse()?)
        .add_directive(format!("mtproto_session={}", args.log_level).parse()?)
        .add_directive(format!("mtproto_wire={}", args.log_level).parse()?)
        .add_directive(format!("mtproto_crypto={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(MtprotoLogFormatter::new("mtproto".to_string()))
        .init();

    info!("Starting MTProto client v{}", env!("CARGO_PKG_VERSION"));

    let mut client_config = ClientConfig::load_from_file(&args.config)?;
    if let Some(dc) = args.dc {
        client_config.dc = dc;
    }
    if let Some(transport) = args.transport {
        client_config.transport = transport;
    }
    if let Some(interval) = args.ping_interval {
        client_config.ping_interval = Duration::from(interval).as_secs();
    }
    if client_config.rsa_keys.is_empty() {
        anyhow::bail!("no rsa_keys configured in {:?}; the server cannot be authenticated", args.config);
    }

    let connection_config = client_config.connection_config()?;
    let session = SessionData::new();
    let mut pending = HashSet::new();
    for request in &args.requests {
        let body = hex::decode(request).with_context(|| format!("invalid request hex '{}'", request))?;
        pending.insert(session.enqueue(Bytes::from(body)).await);
    }

    let mut conn = Connection::new(connection_config, Arc::new(client_config.dc_table()));
    let dc = conn.start(session.clone(), client_config.dc)?;
    info!("Connecting to DC {} with {} queued requests", dc, pending.len());

    let mut events = conn
        .take_events()
        .context("event stream of a fresh connection")?;
    let mut killed = false;
    if args.once && pending.is_empty() {
        conn.kill();
        killed = true;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::DataReceived { request_id, msg_id, payload } => {
                        println!(
                            "{} msg {:#x}: {}",
                            request_id.map_or_else(|| "update".to_string(), |id| format!("request {}", id)),
                            msg_id,
                            hex::encode(&payload)
                        );
                        if let Some(id) = request_id {
                            pending.remove(&id);
                        }
                        if args.once && pending.is_empty() && !killed {
                            conn.kill();
                            killed = true;
                        }
                    }
                    ConnectionEvent::StateChanged(ConnectionState::Connected) => {
                        info!("Connected over {}", conn.transport_name());
                    }
                    ConnectionEvent::StateChanged(state) => info!("State: {}", state),
                    ConnectionEvent::Error { may_be_bad_key } => {
                        warn!("Connection error (may be bad key: {})", may_be_bad_key);
                    }
                    ConnectionEvent::NotDelivered(ids) => {
                        warn!("{} requests not delivered: {:?}", ids.len(), ids);
                    }
                    ConnectionEvent::Finished => break,
                }
            }
            _ = tokio::signal::ctrl_c(), if !killed => {
                info!("Received SIGINT, disconnecting");
                conn.kill();
                killed = true;
            }
        }
    }

    tokio::task::spawn_blocking(move || conn.wait_till_finish()).await?;
    info!("MTProto client stopped");
    Ok(())
}
