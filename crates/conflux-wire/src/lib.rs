//! Wire protocol shared between the Conflux relay server and its clients.
//!
//! This crate provides:
//! - Typed relay messages with binary encode/parse ([`message`])
//! - Stream and datagram framing codecs ([`codec`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod message;
pub mod types;

pub use codec::{split_datagram, RelayCodec};
pub use message::{Message, WireError};
pub use types::ClientId;
