//! Websocket listeners for browser-style clients, plain and TLS.

use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, warn};

use conflux_wire::types::MAX_PAYLOAD;

use crate::client::StreamKind;
use crate::connection::{handle_connection, WsTransport};
use crate::error::RelayError;
use crate::server::ServerState;

/// Builds a TLS acceptor from PEM chain and key files.
///
/// # Errors
///
/// Returns [`RelayError::Config`] when either file is unreadable or the
/// pair does not form a usable certificate. Callers treat this as
/// non-fatal: the plain listener keeps running without the secure one.
pub fn load_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, RelayError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        RelayError::Config(format!("cannot read {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", key_path.display())))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| RelayError::Config(format!("bad certificate chain: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| RelayError::Config(format!("bad private key: {e}")))?
        .ok_or_else(|| {
            RelayError::Config(format!("no private key found in {}", key_path.display()))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Config(format!("unusable certificate/key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(1 + MAX_PAYLOAD);
    config.max_frame_size = Some(1 + MAX_PAYLOAD);
    config
}

/// Accept loop for one websocket listener. With an acceptor, streams
/// are TLS-wrapped before the websocket handshake.
pub async fn run_listener(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    state: Arc<ServerState>,
) {
    let kind = if acceptor.is_some() {
        StreamKind::WebSocketTls
    } else {
        StreamKind::WebSocket
    };

    loop {
        let accepted = tokio::select! {
            () = state.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                if state.core.lock().await.client_count() >= state.config.max_conns {
                    warn!("max connections reached, rejecting {addr}");
                    drop(stream);
                    continue;
                }
                let state = Arc::clone(&state);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(stream, addr, kind, acceptor, state).await {
                        debug!("websocket connection from {addr} closed: {e}");
                    }
                });
            }
            Err(e) => error!("failed to accept websocket connection: {e}"),
        }
    }
}

async fn serve_stream(
    stream: TcpStream,
    addr: std::net::SocketAddr,
    kind: StreamKind,
    acceptor: Option<TlsAcceptor>,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await.map_err(RelayError::Transport)?;
            let ws =
                tokio_tungstenite::accept_async_with_config(tls, Some(ws_config())).await?;
            handle_connection(WsTransport::new(ws), addr, kind, state).await
        }
        None => {
            let ws =
                tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await?;
            handle_connection(WsTransport::new(ws), addr, kind, state).await
        }
    }
}
