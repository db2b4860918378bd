use thiserror::Error;

/// Errors that can occur during relay server operation.
///
/// Variants are the error kinds the server reports through
/// [`crate::hooks::ServerHooks::on_error`] or returns from fallible
/// operations; none of them tear the whole server down except a failed
/// listener.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Underlying transport I/O error on one socket.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Wire-format error from a peer.
    #[error("wire error: {0}")]
    Wire(#[from] conflux_wire::WireError),
    /// A client violated the relay protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A policy check (allow-list, upload cap, ban) rejected an action.
    #[error("policy violation: {0}")]
    Policy(String),
    /// A resource limit was reached (ids, buffers, connection slots).
    #[error("resource exhausted: {0}")]
    Resource(String),
    /// A destination address was missing or unusable.
    #[error("bad address: {0}")]
    BadAddress(String),
    /// Invalid configuration, surfaced synchronously to the caller.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<conflux_wire::codec::CodecError> for RelayError {
    fn from(err: conflux_wire::codec::CodecError) -> Self {
        match err {
            conflux_wire::codec::CodecError::Wire(e) => Self::Wire(e),
            conflux_wire::codec::CodecError::Io(e) => Self::Transport(e),
        }
    }
}
