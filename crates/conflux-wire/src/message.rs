//! Relay message types and their binary encoding.
//!
//! A record on the wire is a head byte (record type in the high nibble,
//! variant in the low nibble) followed by a payload. How the payload is
//! delimited depends on the transport; see [`crate::codec`]. Integer
//! fields are little-endian; strings are UTF-8 without a terminator.
//! Length-prefixed strings carry a LEB128 varint length.

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use thiserror::Error;

use crate::types::{record_type, request_kind, response_kind, ClientId, MAX_PAYLOAD};

/// One channel member, as carried in rosters and join notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// The member's numeric id.
    pub id: ClientId,
    /// Peer flags ([`crate::types::peer_flags`]).
    pub flags: u8,
    /// The member's display name.
    pub name: String,
}

/// One visible channel, as carried in channel listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    /// Number of clients currently in the channel.
    pub member_count: u32,
    /// The channel's name, in its original casing.
    pub name: String,
}

/// A parsed relay protocol message.
///
/// Requests travel client-to-server, responses and pings
/// server-to-client; user-data messages exist in both directions with
/// direction-dependent payloads, which is why parsing is split into
/// [`Message::decode_from_client`] and [`Message::decode_from_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Name handshake carrying the declared protocol revision.
    Handshake {
        /// Protocol revision the client implements.
        revision: u16,
        /// Desired display name.
        name: String,
    },
    /// Change display name after the handshake.
    SetName {
        /// The new display name.
        name: String,
    },
    /// Join (or create) a named channel.
    JoinChannel {
        /// Channel flags ([`crate::types::channel_flags`]), honored on create.
        flags: u8,
        /// Channel name.
        name: String,
    },
    /// Leave a channel.
    LeaveChannel {
        /// Channel name.
        name: String,
    },
    /// Request the visible-channel listing.
    ListChannels,
    /// Answer to a server [`Message::Ping`].
    Pong,

    /// Handshake accepted.
    Welcome {
        /// The id assigned to the client.
        id: ClientId,
        /// Server welcome text.
        welcome: String,
    },
    /// Handshake denied.
    ConnectDeny {
        /// Human-readable denial reason.
        reason: String,
    },
    /// Join outcome.
    JoinResponse {
        /// Whether the join was accepted.
        success: bool,
        /// Effective channel flags.
        flags: u8,
        /// Channel name in its original casing.
        name: String,
        /// Current roster, master first.
        members: Vec<PeerEntry>,
    },
    /// Leave outcome.
    LeaveResponse {
        /// Whether the leave was accepted.
        success: bool,
        /// Channel name.
        name: String,
    },
    /// Visible-channel listing.
    ChannelList {
        /// The visible channels.
        channels: Vec<ChannelEntry>,
    },
    /// A peer joined one of the recipient's channels.
    PeerJoined {
        /// Channel the peer joined.
        channel: String,
        /// The peer's id.
        id: ClientId,
        /// Peer flags.
        flags: u8,
        /// The peer's display name.
        name: String,
    },
    /// A peer left one of the recipient's channels.
    PeerLeft {
        /// Channel the peer left.
        channel: String,
        /// The peer's id.
        id: ClientId,
    },
    /// A channel the recipient was in has been closed.
    ChannelClosed {
        /// The closed channel.
        channel: String,
    },

    /// Application message between a client and the server (either
    /// direction). Over the datagram transport this arrives blasted.
    ServerMessage {
        /// User-defined variant tag (low nibble of the head).
        variant: u8,
        /// User-defined subchannel tag.
        subchannel: u8,
        /// Opaque application data.
        data: Vec<u8>,
    },
    /// Client-to-server broadcast request within a channel.
    ChannelMessage {
        /// Unreliable delivery requested/used.
        blasted: bool,
        /// User-defined variant tag.
        variant: u8,
        /// User-defined subchannel tag.
        subchannel: u8,
        /// Target channel name.
        channel: String,
        /// Opaque application data.
        data: Vec<u8>,
    },
    /// Server-to-member forward of a channel broadcast.
    ChannelForward {
        /// Delivered unreliably.
        blasted: bool,
        /// User-defined variant tag.
        variant: u8,
        /// User-defined subchannel tag.
        subchannel: u8,
        /// Id of the broadcasting client.
        sender: ClientId,
        /// Channel name.
        channel: String,
        /// Opaque application data.
        data: Vec<u8>,
    },
    /// Client-to-server request to deliver to one peer via a shared channel.
    PeerMessage {
        /// Unreliable delivery requested/used.
        blasted: bool,
        /// User-defined variant tag.
        variant: u8,
        /// User-defined subchannel tag.
        subchannel: u8,
        /// Channel both clients share.
        channel: String,
        /// Id of the destination peer.
        peer: ClientId,
        /// Opaque application data.
        data: Vec<u8>,
    },
    /// Server-to-peer forward of a peer message.
    PeerForward {
        /// Delivered unreliably.
        blasted: bool,
        /// User-defined variant tag.
        variant: u8,
        /// User-defined subchannel tag.
        subchannel: u8,
        /// Id of the sending client.
        sender: ClientId,
        /// Channel the message traveled via.
        channel: String,
        /// Opaque application data.
        data: Vec<u8>,
    },

    /// Datagram endpoint registration (client-blasted) or its
    /// acknowledgement (server-blasted).
    UdpHello,
    /// Server-to-client liveness probe.
    Ping,
    /// Structured object relay. Recognized but not served; the raw
    /// payload is preserved.
    ObjectMessage {
        /// Variant tag from the head byte.
        variant: u8,
        /// Raw record payload.
        payload: Vec<u8>,
    },
    /// Implementation-specific extension traffic; raw payload preserved.
    ImplementationRelated {
        /// Variant tag from the head byte.
        variant: u8,
        /// Raw record payload.
        payload: Vec<u8>,
    },
}

/// Errors that can occur while parsing a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The record was empty (no head byte).
    #[error("record is empty")]
    Empty,
    /// The payload ended before a required field.
    #[error("record truncated")]
    Truncated,
    /// The payload exceeds the maximum allowed size.
    #[error("payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Maximum allowed payload size.
        max: usize,
        /// Actual payload size.
        actual: usize,
    },
    /// The head byte carries an unassigned record type.
    #[error("unknown record type {0}")]
    UnknownType(u8),
    /// A request or response kind byte is unassigned.
    #[error("unknown request/response kind {0}")]
    UnknownKind(u8),
    /// The record type is assigned but not valid from this peer.
    #[error("record type {0} not valid from this peer")]
    UnexpectedType(u8),
    /// A string field is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    Utf8,
    /// A varint field is malformed.
    #[error("malformed varint field")]
    Varint,
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if buf.is_empty() {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u16_le(buf: &mut &[u8]) -> Result<u16, WireError> {
    if buf.len() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn take_varint(buf: &mut &[u8]) -> Result<u32, WireError> {
    buf.get_u32_varint().map_err(|_| WireError::Varint)
}

fn take_lpstring(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = take_varint(buf)? as usize;
    if buf.len() < len {
        return Err(WireError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| WireError::Utf8)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn take_rest_string(buf: &mut &[u8]) -> Result<String, WireError> {
    let s = std::str::from_utf8(buf).map_err(|_| WireError::Utf8)?.to_owned();
    *buf = &[];
    Ok(s)
}

fn put_lpstring(out: &mut Vec<u8>, s: &str) {
    out.put_u32_varint(s.len() as u32);
    out.put_slice(s.as_bytes());
}

impl Message {
    /// Returns the record type (high nibble of the head byte).
    #[must_use]
    pub fn record_type(&self) -> u8 {
        match self {
            Self::Handshake { .. }
            | Self::SetName { .. }
            | Self::JoinChannel { .. }
            | Self::LeaveChannel { .. }
            | Self::ListChannels
            | Self::Pong => record_type::REQUEST,
            Self::Welcome { .. }
            | Self::ConnectDeny { .. }
            | Self::JoinResponse { .. }
            | Self::LeaveResponse { .. }
            | Self::ChannelList { .. }
            | Self::PeerJoined { .. }
            | Self::PeerLeft { .. }
            | Self::ChannelClosed { .. } => record_type::RESPONSE,
            Self::ServerMessage { .. } => record_type::SERVER_MESSAGE,
            Self::ChannelMessage { blasted, .. } | Self::ChannelForward { blasted, .. } => {
                if *blasted {
                    record_type::CHANNEL_MESSAGE_BLASTED
                } else {
                    record_type::CHANNEL_MESSAGE
                }
            }
            Self::PeerMessage { blasted, .. } | Self::PeerForward { blasted, .. } => {
                if *blasted {
                    record_type::PEER_MESSAGE_BLASTED
                } else {
                    record_type::PEER_MESSAGE
                }
            }
            Self::UdpHello => record_type::UDP_HELLO,
            Self::Ping => record_type::PING,
            Self::ObjectMessage { .. } => record_type::OBJECT_MESSAGE,
            Self::ImplementationRelated { .. } => record_type::IMPLEMENTATION,
        }
    }

    fn variant_bits(&self) -> u8 {
        match self {
            Self::ServerMessage { variant, .. }
            | Self::ChannelMessage { variant, .. }
            | Self::ChannelForward { variant, .. }
            | Self::PeerMessage { variant, .. }
            | Self::PeerForward { variant, .. }
            | Self::ObjectMessage { variant, .. }
            | Self::ImplementationRelated { variant, .. } => variant & 0x0F,
            _ => 0,
        }
    }

    /// Serializes the message into its head byte and payload.
    #[must_use]
    pub fn encode(&self) -> (u8, Vec<u8>) {
        let head = (self.record_type() << 4) | self.variant_bits();
        let mut out = Vec::new();

        match self {
            Self::Handshake { revision, name } => {
                out.put_u8(request_kind::HANDSHAKE);
                out.put_u16_le(*revision);
                out.put_slice(name.as_bytes());
            }
            Self::SetName { name } => {
                out.put_u8(request_kind::SET_NAME);
                out.put_slice(name.as_bytes());
            }
            Self::JoinChannel { flags, name } => {
                out.put_u8(request_kind::JOIN_CHANNEL);
                out.put_u8(*flags);
                out.put_slice(name.as_bytes());
            }
            Self::LeaveChannel { name } => {
                out.put_u8(request_kind::LEAVE_CHANNEL);
                out.put_slice(name.as_bytes());
            }
            Self::ListChannels => out.put_u8(request_kind::LIST_CHANNELS),
            Self::Pong => out.put_u8(request_kind::PONG),

            Self::Welcome { id, welcome } => {
                out.put_u8(response_kind::WELCOME);
                out.put_u16_le(*id);
                out.put_slice(welcome.as_bytes());
            }
            Self::ConnectDeny { reason } => {
                out.put_u8(response_kind::CONNECT_DENY);
                out.put_slice(reason.as_bytes());
            }
            Self::JoinResponse {
                success,
                flags,
                name,
                members,
            } => {
                out.put_u8(response_kind::JOIN);
                out.put_u8(u8::from(*success));
                out.put_u8(*flags);
                put_lpstring(&mut out, name);
                out.put_u32_varint(members.len() as u32);
                for m in members {
                    out.put_u16_le(m.id);
                    out.put_u8(m.flags);
                    put_lpstring(&mut out, &m.name);
                }
            }
            Self::LeaveResponse { success, name } => {
                out.put_u8(response_kind::LEAVE);
                out.put_u8(u8::from(*success));
                out.put_slice(name.as_bytes());
            }
            Self::ChannelList { channels } => {
                out.put_u8(response_kind::CHANNEL_LIST);
                out.put_u32_varint(channels.len() as u32);
                for ch in channels {
                    out.put_u32_varint(ch.member_count);
                    put_lpstring(&mut out, &ch.name);
                }
            }
            Self::PeerJoined {
                channel,
                id,
                flags,
                name,
            } => {
                out.put_u8(response_kind::PEER_JOINED);
                put_lpstring(&mut out, channel);
                out.put_u16_le(*id);
                out.put_u8(*flags);
                out.put_slice(name.as_bytes());
            }
            Self::PeerLeft { channel, id } => {
                out.put_u8(response_kind::PEER_LEFT);
                put_lpstring(&mut out, channel);
                out.put_u16_le(*id);
            }
            Self::ChannelClosed { channel } => {
                out.put_u8(response_kind::CHANNEL_CLOSED);
                out.put_slice(channel.as_bytes());
            }

            Self::ServerMessage {
                subchannel, data, ..
            } => {
                out.put_u8(*subchannel);
                out.put_slice(data);
            }
            Self::ChannelMessage {
                subchannel,
                channel,
                data,
                ..
            } => {
                out.put_u8(*subchannel);
                put_lpstring(&mut out, channel);
                out.put_slice(data);
            }
            Self::ChannelForward {
                subchannel,
                sender,
                channel,
                data,
                ..
            } => {
                out.put_u8(*subchannel);
                out.put_u16_le(*sender);
                put_lpstring(&mut out, channel);
                out.put_slice(data);
            }
            Self::PeerMessage {
                subchannel,
                channel,
                peer,
                data,
                ..
            } => {
                out.put_u8(*subchannel);
                put_lpstring(&mut out, channel);
                out.put_u16_le(*peer);
                out.put_slice(data);
            }
            Self::PeerForward {
                subchannel,
                sender,
                channel,
                data,
                ..
            } => {
                out.put_u8(*subchannel);
                out.put_u16_le(*sender);
                put_lpstring(&mut out, channel);
                out.put_slice(data);
            }

            Self::UdpHello | Self::Ping => {}
            Self::ObjectMessage { payload, .. } | Self::ImplementationRelated { payload, .. } => {
                out.put_slice(payload);
            }
        }

        (head, out)
    }

    /// Serializes the message as a self-delimited record (head byte
    /// followed by the payload), as carried in one websocket binary
    /// message or after the sender-id prefix of a datagram.
    #[must_use]
    pub fn encode_record(&self) -> Vec<u8> {
        let (head, payload) = self.encode();
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(head);
        out.extend_from_slice(&payload);
        out
    }

    /// Serializes the message as a datagram: sender id, head, payload.
    #[must_use]
    pub fn encode_datagram(&self, sender: ClientId) -> Vec<u8> {
        let (head, payload) = self.encode();
        let mut out = Vec::with_capacity(3 + payload.len());
        out.put_u16_le(sender);
        out.push(head);
        out.extend_from_slice(&payload);
        out
    }

    /// Parses a record received from a client.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the payload is truncated, oversized,
    /// malformed, or the record type is not one a client may send.
    pub fn decode_from_client(head: u8, payload: &[u8]) -> Result<Self, WireError> {
        Self::check_len(payload)?;
        let ty = head >> 4;
        let variant = head & 0x0F;
        let mut buf = payload;

        match ty {
            record_type::REQUEST => Self::decode_request(&mut buf),
            record_type::SERVER_MESSAGE => {
                let subchannel = take_u8(&mut buf)?;
                Ok(Self::ServerMessage {
                    variant,
                    subchannel,
                    data: buf.to_vec(),
                })
            }
            record_type::CHANNEL_MESSAGE | record_type::CHANNEL_MESSAGE_BLASTED => {
                let subchannel = take_u8(&mut buf)?;
                let channel = take_lpstring(&mut buf)?;
                Ok(Self::ChannelMessage {
                    blasted: ty == record_type::CHANNEL_MESSAGE_BLASTED,
                    variant,
                    subchannel,
                    channel,
                    data: buf.to_vec(),
                })
            }
            record_type::PEER_MESSAGE | record_type::PEER_MESSAGE_BLASTED => {
                let subchannel = take_u8(&mut buf)?;
                let channel = take_lpstring(&mut buf)?;
                let peer = take_u16_le(&mut buf)?;
                Ok(Self::PeerMessage {
                    blasted: ty == record_type::PEER_MESSAGE_BLASTED,
                    variant,
                    subchannel,
                    channel,
                    peer,
                    data: buf.to_vec(),
                })
            }
            record_type::UDP_HELLO => Ok(Self::UdpHello),
            record_type::OBJECT_MESSAGE => Ok(Self::ObjectMessage {
                variant,
                payload: payload.to_vec(),
            }),
            record_type::IMPLEMENTATION => Ok(Self::ImplementationRelated {
                variant,
                payload: payload.to_vec(),
            }),
            record_type::RESPONSE | record_type::PING => Err(WireError::UnexpectedType(ty)),
            t => Err(WireError::UnknownType(t)),
        }
    }

    /// Parses a record received from the server.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the payload is truncated, oversized,
    /// malformed, or the record type is not one the server may send.
    pub fn decode_from_server(head: u8, payload: &[u8]) -> Result<Self, WireError> {
        Self::check_len(payload)?;
        let ty = head >> 4;
        let variant = head & 0x0F;
        let mut buf = payload;

        match ty {
            record_type::RESPONSE => Self::decode_response(&mut buf),
            record_type::SERVER_MESSAGE => {
                let subchannel = take_u8(&mut buf)?;
                Ok(Self::ServerMessage {
                    variant,
                    subchannel,
                    data: buf.to_vec(),
                })
            }
            record_type::CHANNEL_MESSAGE | record_type::CHANNEL_MESSAGE_BLASTED => {
                let subchannel = take_u8(&mut buf)?;
                let sender = take_u16_le(&mut buf)?;
                let channel = take_lpstring(&mut buf)?;
                Ok(Self::ChannelForward {
                    blasted: ty == record_type::CHANNEL_MESSAGE_BLASTED,
                    variant,
                    subchannel,
                    sender,
                    channel,
                    data: buf.to_vec(),
                })
            }
            record_type::PEER_MESSAGE | record_type::PEER_MESSAGE_BLASTED => {
                let subchannel = take_u8(&mut buf)?;
                let sender = take_u16_le(&mut buf)?;
                let channel = take_lpstring(&mut buf)?;
                Ok(Self::PeerForward {
                    blasted: ty == record_type::PEER_MESSAGE_BLASTED,
                    variant,
                    subchannel,
                    sender,
                    channel,
                    data: buf.to_vec(),
                })
            }
            record_type::UDP_HELLO => Ok(Self::UdpHello),
            record_type::PING => Ok(Self::Ping),
            record_type::OBJECT_MESSAGE => Ok(Self::ObjectMessage {
                variant,
                payload: payload.to_vec(),
            }),
            record_type::IMPLEMENTATION => Ok(Self::ImplementationRelated {
                variant,
                payload: payload.to_vec(),
            }),
            record_type::REQUEST => Err(WireError::UnexpectedType(ty)),
            t => Err(WireError::UnknownType(t)),
        }
    }

    fn check_len(payload: &[u8]) -> Result<(), WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: payload.len(),
            });
        }
        Ok(())
    }

    fn decode_request(buf: &mut &[u8]) -> Result<Self, WireError> {
        match take_u8(buf)? {
            request_kind::HANDSHAKE => {
                let revision = take_u16_le(buf)?;
                let name = take_rest_string(buf)?;
                Ok(Self::Handshake { revision, name })
            }
            request_kind::SET_NAME => Ok(Self::SetName {
                name: take_rest_string(buf)?,
            }),
            request_kind::JOIN_CHANNEL => {
                let flags = take_u8(buf)?;
                let name = take_rest_string(buf)?;
                Ok(Self::JoinChannel { flags, name })
            }
            request_kind::LEAVE_CHANNEL => Ok(Self::LeaveChannel {
                name: take_rest_string(buf)?,
            }),
            request_kind::LIST_CHANNELS => Ok(Self::ListChannels),
            request_kind::PONG => Ok(Self::Pong),
            k => Err(WireError::UnknownKind(k)),
        }
    }

    fn decode_response(buf: &mut &[u8]) -> Result<Self, WireError> {
        match take_u8(buf)? {
            response_kind::WELCOME => {
                let id = take_u16_le(buf)?;
                let welcome = take_rest_string(buf)?;
                Ok(Self::Welcome { id, welcome })
            }
            response_kind::CONNECT_DENY => Ok(Self::ConnectDeny {
                reason: take_rest_string(buf)?,
            }),
            response_kind::JOIN => {
                let success = take_u8(buf)? != 0;
                let flags = take_u8(buf)?;
                let name = take_lpstring(buf)?;
                let count = take_varint(buf)? as usize;
                let mut members = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let id = take_u16_le(buf)?;
                    let flags = take_u8(buf)?;
                    let name = take_lpstring(buf)?;
                    members.push(PeerEntry { id, flags, name });
                }
                Ok(Self::JoinResponse {
                    success,
                    flags,
                    name,
                    members,
                })
            }
            response_kind::LEAVE => {
                let success = take_u8(buf)? != 0;
                let name = take_rest_string(buf)?;
                Ok(Self::LeaveResponse { success, name })
            }
            response_kind::CHANNEL_LIST => {
                let count = take_varint(buf)? as usize;
                let mut channels = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let member_count = take_varint(buf)?;
                    let name = take_lpstring(buf)?;
                    channels.push(ChannelEntry { member_count, name });
                }
                Ok(Self::ChannelList { channels })
            }
            response_kind::PEER_JOINED => {
                let channel = take_lpstring(buf)?;
                let id = take_u16_le(buf)?;
                let flags = take_u8(buf)?;
                let name = take_rest_string(buf)?;
                Ok(Self::PeerJoined {
                    channel,
                    id,
                    flags,
                    name,
                })
            }
            response_kind::PEER_LEFT => {
                let channel = take_lpstring(buf)?;
                let id = take_u16_le(buf)?;
                Ok(Self::PeerLeft { channel, id })
            }
            response_kind::CHANNEL_CLOSED => Ok(Self::ChannelClosed {
                channel: take_rest_string(buf)?,
            }),
            k => Err(WireError::UnknownKind(k)),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 ]{0,32}"
    }

    fn arb_data() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..1024)
    }

    proptest! {
        #[test]
        fn handshake_round_trip(revision in any::<u16>(), name in arb_name()) {
            let msg = Message::Handshake { revision, name };
            let (head, payload) = msg.encode();
            prop_assert_eq!(Message::decode_from_client(head, &payload).unwrap(), msg);
        }

        #[test]
        fn channel_message_round_trip(
            blasted in any::<bool>(),
            variant in 0u8..16,
            subchannel in any::<u8>(),
            channel in arb_name(),
            data in arb_data(),
        ) {
            let msg = Message::ChannelMessage { blasted, variant, subchannel, channel, data };
            let (head, payload) = msg.encode();
            prop_assert_eq!(Message::decode_from_client(head, &payload).unwrap(), msg);
        }

        #[test]
        fn peer_forward_round_trip(
            blasted in any::<bool>(),
            variant in 0u8..16,
            subchannel in any::<u8>(),
            sender in any::<u16>(),
            channel in arb_name(),
            data in arb_data(),
        ) {
            let msg = Message::PeerForward { blasted, variant, subchannel, sender, channel, data };
            let (head, payload) = msg.encode();
            prop_assert_eq!(Message::decode_from_server(head, &payload).unwrap(), msg);
        }

        #[test]
        fn welcome_round_trip(id in any::<u16>(), welcome in arb_name()) {
            let msg = Message::Welcome { id, welcome };
            let (head, payload) = msg.encode();
            prop_assert_eq!(Message::decode_from_server(head, &payload).unwrap(), msg);
        }

        #[test]
        fn head_byte_carries_type_and_variant(
            variant in 0u8..16,
            subchannel in any::<u8>(),
            data in arb_data(),
        ) {
            let msg = Message::ServerMessage { variant, subchannel, data };
            let (head, _) = msg.encode();
            prop_assert_eq!(head >> 4, record_type::SERVER_MESSAGE);
            prop_assert_eq!(head & 0x0F, variant);
        }
    }
}
