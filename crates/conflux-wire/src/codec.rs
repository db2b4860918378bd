//! Framing codecs for the relay protocol.
//!
//! Raw TCP carries length-delimited records (`head, varint length,
//! payload`); websocket and datagram transports are message-oriented,
//! so their records are just `head, payload` (datagrams additionally
//! prefixed with the sender's id).

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Message, WireError};
use crate::types::{ClientId, MAX_PAYLOAD};

/// Which peer the decoded records originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    FromClient,
    FromServer,
}

/// Codec error: a protocol parse failure or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The record violated the wire grammar.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames relay records on a raw TCP stream.
#[derive(Debug)]
pub struct RelayCodec {
    direction: Direction,
}

impl RelayCodec {
    /// Codec for the server side: decodes client records, encodes
    /// server records.
    #[must_use]
    pub fn server() -> Self {
        Self {
            direction: Direction::FromClient,
        }
    }

    /// Codec for the client side: decodes server records, encodes
    /// client records.
    #[must_use]
    pub fn client() -> Self {
        Self {
            direction: Direction::FromServer,
        }
    }
}

/// Longest possible LEB128 encoding of a u32 length.
const MAX_VARINT_LEN: usize = 5;

impl Decoder for RelayCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut peek: &[u8] = &src[1..];
        let avail = peek.len();
        let len = match peek.get_u32_varint() {
            Ok(len) => len as usize,
            // A short buffer is indistinguishable from a varint still in
            // flight until MAX_VARINT_LEN bytes have arrived.
            Err(_) if avail < MAX_VARINT_LEN => return Ok(None),
            Err(_) => return Err(WireError::Varint.into()),
        };
        let varint_len = avail - peek.len();

        if len > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: len,
            }
            .into());
        }

        let record_len = 1 + varint_len + len;
        if src.len() < record_len {
            src.reserve(record_len - src.len());
            return Ok(None);
        }

        let head = src[0];
        src.advance(1 + varint_len);
        let payload = src.split_to(len);

        let msg = match self.direction {
            Direction::FromClient => Message::decode_from_client(head, &payload)?,
            Direction::FromServer => Message::decode_from_server(head, &payload)?,
        };
        Ok(Some(msg))
    }
}

impl Encoder<Message> for RelayCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (head, payload) = item.encode();
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: payload.len(),
            }
            .into());
        }
        dst.reserve(1 + MAX_VARINT_LEN + payload.len());
        dst.put_u8(head);
        dst.put_u32_varint(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Splits a raw datagram into its sender-id prefix, record head, and
/// payload.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] if the datagram is shorter than
/// the three-byte minimum.
pub fn split_datagram(buf: &[u8]) -> Result<(ClientId, u8, &[u8]), WireError> {
    if buf.len() < 3 {
        return Err(WireError::Truncated);
    }
    let sender = u16::from_le_bytes([buf[0], buf[1]]);
    Ok((sender, buf[2], &buf[3..]))
}
