use crate::metrics::BRIDGE_CLIENTS;
use crate::protocol::{ErrorMsg, HelloMsg, IncomingMessage, OutcomeMsg, WriteResultMsg};
use regpoll_core::{Coordinator, CycleOutcome, Transport};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct BridgeConfig {
    pub bind_addr: String,
    pub require_handshake: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7010".to_string(),
            require_handshake: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
struct ClientState {
    handshake_seen: bool,
    client_id: Option<String>,
}

impl ClientState {
    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.client_id = hello.client_id.clone();
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Reply {
    WriteResult(WriteResultMsg),
    Error(ErrorMsg),
}

/// Binds `config.bind_addr` and serves clients until `shutdown` fires.
pub async fn run_bridge<T: Transport>(
    coordinator: Arc<Coordinator<T>>,
    config: BridgeConfig,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|source| BridgeError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
    info!(
        addr = %config.bind_addr,
        require_handshake = config.require_handshake,
        "Bridge listening"
    );
    serve_listener(listener, coordinator, config.require_handshake, shutdown).await;
    Ok(())
}

/// Accept loop over an already bound listener. One task per client.
pub async fn serve_listener<T: Transport>(
    listener: TcpListener,
    coordinator: Arc<Coordinator<T>>,
    require_handshake: bool,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(client_addr = %addr, "Bridge client connected");
                    let coordinator = Arc::clone(&coordinator);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        BRIDGE_CLIENTS.inc();
                        if let Err(err) =
                            serve_client(stream, coordinator, require_handshake, shutdown).await
                        {
                            warn!(client_addr = %addr, error = %err, "Bridge client error");
                        }
                        BRIDGE_CLIENTS.dec();
                        info!(client_addr = %addr, "Bridge client disconnected");
                    });
                }
                Err(err) => warn!(error = %err, "Bridge accept error"),
            },
        }
    }
    debug!("Bridge stopped accepting clients");
}

async fn serve_client<T: Transport>(
    stream: TcpStream,
    coordinator: Arc<Coordinator<T>>,
    require_handshake: bool,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut outcomes = coordinator.subscribe();
    let mut state = ClientState::default();
    let mut sequence: u64 = 0;

    publish(&mut writer, &mut outcomes, &mut sequence).await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = outcomes.changed() => {
                if changed.is_err() {
                    debug!("Poller stopped; closing bridge client");
                    break;
                }
                publish(&mut writer, &mut outcomes, &mut sequence).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match IncomingMessage::parse(trimmed) {
                    Some(msg) => {
                        if let Some(reply) =
                            handle_incoming(msg, &coordinator, require_handshake, &mut state).await
                        {
                            send(&mut writer, &reply).await?;
                        }
                    }
                    None => warn!(line = trimmed, "Ignoring malformed bridge message"),
                }
            }
        }
    }
    writer.shutdown().await
}

async fn publish(
    writer: &mut OwnedWriteHalf,
    outcomes: &mut watch::Receiver<Option<CycleOutcome>>,
    sequence: &mut u64,
) -> io::Result<()> {
    let current = outcomes.borrow_and_update().clone();
    *sequence = sequence.wrapping_add(1);
    send(writer, &OutcomeMsg::new(*sequence, current.as_ref())).await
}

async fn send<M: Serialize>(writer: &mut OwnedWriteHalf, msg: &M) -> io::Result<()> {
    let mut line = serde_json::to_vec(msg).map_err(io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

#[instrument(skip_all, fields(client_id = ?state.client_id))]
async fn handle_incoming<T: Transport>(
    msg: IncomingMessage,
    coordinator: &Coordinator<T>,
    require_handshake: bool,
    state: &mut ClientState,
) -> Option<Reply> {
    let version = msg.protocol_version();
    if !version.is_supported() {
        warn!(
            major = version.major,
            minor = version.minor,
            "Unsupported protocol version"
        );
        return Some(Reply::Error(ErrorMsg::new(format!(
            "unsupported protocol version {}.{}",
            version.major, version.minor
        ))));
    }

    if require_handshake && !state.handshake_seen && !matches!(msg, IncomingMessage::Hello(_)) {
        warn!("Request received before handshake");
        return Some(Reply::Error(ErrorMsg::new("handshake required")));
    }

    match msg {
        IncomingMessage::Hello(hello) => {
            state.note_handshake(&hello);
            info!(client_id = ?hello.client_id, "Bridge handshake received");
            None
        }
        IncomingMessage::Refresh(_) => {
            debug!("Refresh requested by bridge client");
            coordinator.request_refresh();
            None
        }
        IncomingMessage::Write(write) => {
            let result = coordinator.write(write.register, write.value).await;
            Some(Reply::WriteResult(WriteResultMsg::new(
                write.request_id,
                write.register,
                Some(write.value),
                result.as_ref().map(|_| ()),
            )))
        }
        IncomingMessage::Toggle(toggle) => {
            let result = coordinator.toggle(toggle.register).await;
            Some(Reply::WriteResult(WriteResultMsg::new(
                toggle.request_id,
                toggle.register,
                result.as_ref().ok().copied(),
                result.as_ref().map(|_| ()),
            )))
        }
    }
}
