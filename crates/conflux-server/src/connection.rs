//! Per-connection lifecycle: handshake phase, ready-phase select loop,
//! and cooperative close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conflux_wire::{Message, RelayCodec, WireError};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{ConnToken, StreamKind};
use crate::error::RelayError;
use crate::router::HandshakeOutcome;
use crate::server::{IpSlot, ServerState};

/// A stream transport carrying whole relay records.
#[async_trait::async_trait]
pub trait RecordTransport: Send {
    /// The next inbound record; `None` on orderly close.
    async fn next_record(&mut self) -> Option<Result<Message, RelayError>>;

    /// Writes one record.
    async fn send_record(&mut self, msg: Message) -> Result<(), RelayError>;

    /// Flushes and closes the transport.
    async fn close(&mut self);
}

/// Raw TCP with length-delimited records.
pub struct TcpTransport {
    framed: Framed<TcpStream, RelayCodec>,
}

impl TcpTransport {
    /// Wraps an accepted TCP stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, RelayCodec::server()),
        }
    }
}

#[async_trait::async_trait]
impl RecordTransport for TcpTransport {
    async fn next_record(&mut self) -> Option<Result<Message, RelayError>> {
        self.framed.next().await.map(|r| r.map_err(Into::into))
    }

    async fn send_record(&mut self, msg: Message) -> Result<(), RelayError> {
        self.framed.send(msg).await.map_err(Into::into)
    }

    async fn close(&mut self) {
        let _ = self.framed.close().await;
    }
}

/// Websocket transport; the websocket layer provides the record
/// boundaries, so each binary message is head byte plus payload.
pub struct WsTransport<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    /// Wraps a completed websocket handshake.
    #[must_use]
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> RecordTransport for WsTransport<S> {
    async fn next_record(&mut self) -> Option<Result<Message, RelayError>> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Binary(data)) => {
                    if data.is_empty() {
                        return Some(Err(WireError::Empty.into()));
                    }
                    return Some(
                        Message::decode_from_client(data[0], &data[1..]).map_err(Into::into),
                    );
                }
                Ok(WsMessage::Ping(payload)) => {
                    if let Err(e) = self.ws.send(WsMessage::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(WsMessage::Close(_)) => return None,
                Ok(WsMessage::Text(_)) => {
                    return Some(Err(RelayError::Protocol(
                        "text frames are not part of the relay protocol".into(),
                    )))
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn send_record(&mut self, msg: Message) -> Result<(), RelayError> {
        self.ws
            .send(WsMessage::Binary(msg.encode_record()))
            .await
            .map_err(Into::into)
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Drives one accepted stream through handshake, the ready loop, and
/// teardown.
///
/// # Errors
///
/// Returns the error that ended the connection; orderly closes return
/// `Ok`.
pub async fn handle_connection<T: RecordTransport>(
    mut transport: T,
    peer_addr: SocketAddr,
    kind: StreamKind,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    // Bound the number of connections sitting in the handshake phase.
    let permit = state
        .pre_handshake_semaphore
        .acquire()
        .await
        .map_err(|_| RelayError::Resource("pre-handshake slots closed".into()))?;

    let Some(_ip_slot) = IpSlot::claim(&state, peer_addr.ip()) else {
        debug!(
            ip = %peer_addr.ip(),
            limit = state.config.max_conns_ip,
            "per-IP connection limit exceeded"
        );
        return Err(RelayError::Policy("per-IP connection limit exceeded".into()));
    };

    let token = state.allocate_token();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let handshake = timeout(
        Duration::from_secs(state.config.handshake_timeout),
        transport.next_record(),
    )
    .await;

    let outcome = match handshake {
        Err(_) => {
            debug!(%peer_addr, "no handshake within the timeout, closing");
            return Ok(());
        }
        Ok(None) => return Ok(()),
        Ok(Some(Ok(Message::Handshake { revision, name }))) => {
            state.core.lock().await.begin_handshake(
                token,
                revision,
                name,
                peer_addr,
                kind,
                tx.clone(),
                cancel.clone(),
            )
        }
        Ok(Some(Ok(_))) => {
            state.core.lock().await.prehandshake_violation(peer_addr);
            return Err(RelayError::Protocol(
                "first record was not a handshake".into(),
            ));
        }
        Ok(Some(Err(e))) => {
            state.core.lock().await.prehandshake_violation(peer_addr);
            return Err(e);
        }
    };
    drop(permit);

    if outcome == HandshakeOutcome::Denied {
        flush_queued(&mut transport, &mut rx).await;
        transport.close().await;
        return Ok(());
    }

    let result = run_message_loop(&mut transport, &mut rx, token, &cancel, &state).await;

    state.core.lock().await.disconnect_token(token);
    flush_queued(&mut transport, &mut rx).await;
    transport.close().await;
    result
}

/// Delivers whatever is already queued, best-effort. Used on the close
/// paths so a final deny or error notice still reaches the peer.
async fn flush_queued<T: RecordTransport>(transport: &mut T, rx: &mut mpsc::UnboundedReceiver<Message>) {
    while let Ok(msg) = rx.try_recv() {
        if transport.send_record(msg).await.is_err() {
            return;
        }
    }
}

async fn run_message_loop<T: RecordTransport>(
    transport: &mut T,
    rx: &mut mpsc::UnboundedReceiver<Message>,
    token: ConnToken,
    cancel: &CancellationToken,
    state: &Arc<ServerState>,
) -> Result<(), RelayError> {
    let mut ping_timer = interval(Duration::from_secs(state.config.ping_interval));
    let ping_after = Duration::from_secs(state.config.ping_interval);
    let idle_limit = Duration::from_secs(state.config.pong_timeout);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            record = transport.next_record() => {
                last_inbound = Instant::now();
                match record {
                    Some(Ok(msg)) => state.core.lock().await.handle_record(token, msg),
                    Some(Err(e @ (RelayError::Wire(_) | RelayError::Protocol(_)))) => {
                        state.core.lock().await.stream_violation(token, &e.to_string());
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        state.core.lock().await.report_error(&e);
                        return Err(e);
                    }
                    None => return Ok(()),
                }
            }
            Some(msg) = rx.recv() => {
                transport.send_record(msg).await?;
            }
            _ = ping_timer.tick() => {
                if last_inbound.elapsed() >= idle_limit {
                    debug!("idle timeout reached, closing connection");
                    return Ok(());
                }
                if last_inbound.elapsed() >= ping_after {
                    transport.send_record(Message::Ping).await?;
                }
            }
        }
    }
}
