//! Core type definitions and protocol constants for the relay protocol.

/// Numeric client identity assigned by the server at handshake.
/// Never reused within a server's lifetime.
pub type ClientId = u16;

/// Current protocol revision, declared by clients in the handshake.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_REVISION: u16 = 3;

/// Maximum payload size in bytes for a single stream record (64 KiB - 1).
pub const MAX_PAYLOAD: usize = 65_535;

/// Receive buffer size for one datagram; leaves at least 1500 bytes of
/// payload room after the sender-id prefix and record head.
pub const MAX_DATAGRAM: usize = 1_600;

/// Record types, carried in the high nibble of the head byte.
pub mod record_type {
    /// Client-to-server request (handshake, join, leave, list, pong).
    pub const REQUEST: u8 = 0;
    /// Server-to-client response or notification.
    pub const RESPONSE: u8 = 1;
    /// Application message addressed to (or sent by) the server.
    pub const SERVER_MESSAGE: u8 = 2;
    /// Broadcast within a channel.
    pub const CHANNEL_MESSAGE: u8 = 3;
    /// Message addressed to one peer via a shared channel.
    pub const PEER_MESSAGE: u8 = 4;
    /// Datagram endpoint registration.
    pub const UDP_HELLO: u8 = 5;
    /// Unreliable variant of [`CHANNEL_MESSAGE`].
    pub const CHANNEL_MESSAGE_BLASTED: u8 = 6;
    /// Unreliable variant of [`PEER_MESSAGE`].
    pub const PEER_MESSAGE_BLASTED: u8 = 7;
    /// Structured object relay (recognized, not served by this server).
    pub const OBJECT_MESSAGE: u8 = 8;
    /// Server-to-client liveness probe.
    pub const PING: u8 = 9;
    /// Implementation-specific extension traffic.
    pub const IMPLEMENTATION: u8 = 10;
}

/// Request kinds, first payload byte of a [`record_type::REQUEST`] record.
pub mod request_kind {
    /// Name handshake with declared protocol revision.
    pub const HANDSHAKE: u8 = 0;
    /// Change display name after handshake.
    pub const SET_NAME: u8 = 1;
    /// Join (or create) a named channel.
    pub const JOIN_CHANNEL: u8 = 2;
    /// Leave a channel.
    pub const LEAVE_CHANNEL: u8 = 3;
    /// List visible channels.
    pub const LIST_CHANNELS: u8 = 4;
    /// Answer to a server ping.
    pub const PONG: u8 = 5;
}

/// Response kinds, first payload byte of a [`record_type::RESPONSE`] record.
pub mod response_kind {
    /// Handshake accepted; carries the assigned id and welcome text.
    pub const WELCOME: u8 = 0;
    /// Handshake denied; carries the reason.
    pub const CONNECT_DENY: u8 = 1;
    /// Join outcome with the channel roster.
    pub const JOIN: u8 = 2;
    /// Leave outcome.
    pub const LEAVE: u8 = 3;
    /// Visible-channel listing.
    pub const CHANNEL_LIST: u8 = 4;
    /// A peer joined one of the recipient's channels.
    pub const PEER_JOINED: u8 = 5;
    /// A peer left one of the recipient's channels.
    pub const PEER_LEFT: u8 = 6;
    /// A channel the recipient was in has been closed.
    pub const CHANNEL_CLOSED: u8 = 7;
}

/// Channel flags carried in join requests and join responses.
pub mod channel_flags {
    /// Channel is hidden from the channel list.
    pub const HIDDEN: u8 = 0b01;
    /// Channel closes when its master leaves.
    pub const AUTOCLOSE: u8 = 0b10;
}

/// Peer flags carried in rosters and peer-joined notifications.
pub mod peer_flags {
    /// The peer is the channel master.
    pub const MASTER: u8 = 0b01;
}

/// Variant flags on user-data records.
pub mod variant_flags {
    /// Channel broadcast also echoes to the sender.
    pub const ECHO_SENDER: u8 = 0b01;
}
