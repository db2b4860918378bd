//! Per-client state held by the server core.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use conflux_wire::{ClientId, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::UploadMeter;

/// Token identifying a connection before (and independent of) id
/// assignment. Unique for the server's lifetime.
pub type ConnToken = u64;

/// Which listener a client arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Raw TCP with length-delimited records.
    Tcp,
    /// Plain websocket.
    WebSocket,
    /// TLS websocket.
    WebSocketTls,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "ws",
            Self::WebSocketTls => "wss",
        })
    }
}

/// A fully-accepted client.
#[derive(Debug)]
pub struct Client {
    /// Assigned id, unique for the server's lifetime.
    pub id: ClientId,
    /// Connection token from before acceptance.
    pub token: ConnToken,
    /// Display name (validated against the ClientNames allow-list).
    pub name: String,
    /// Remote stream endpoint.
    pub addr: SocketAddr,
    /// Registered datagram endpoint, set by UdpHello.
    pub udp_addr: Option<SocketAddr>,
    /// Listener the client came through.
    pub stream_kind: StreamKind,
    /// False after any protocol violation; feeds the ban list.
    pub trusted: bool,
    /// Set once teardown has begun; makes disconnect idempotent.
    pub closing: bool,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Lowercased keys of every channel the client is in.
    pub channels: HashSet<String>,
    /// Upload accounting.
    pub meter: UploadMeter,
    pub(crate) tx: mpsc::UnboundedSender<Message>,
    pub(crate) cancel: CancellationToken,
}

impl Client {
    /// Enqueues a message on the client's outbound queue. Returns
    /// `false` when the connection task is already gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Signals the connection task to drain its queue and close.
    pub(crate) fn request_close(&self) {
        self.cancel.cancel();
    }
}
