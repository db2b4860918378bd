//! Host-facing lifecycle and message hooks.
//!
//! Hooks run on the core's serialized processing path; they must not
//! block. Message hooks answer permit/deny synchronously through their
//! return value; connect approval may additionally be deferred and
//! answered later via [`crate::server::ServerHandle::connect_response`].

use std::net::SocketAddr;

use crate::channel::Channel;
use crate::client::{Client, ConnToken};
use crate::error::RelayError;

/// A client awaiting connect approval. No id has been assigned yet.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Token to answer a deferred decision with.
    pub token: ConnToken,
    /// The requested display name (already allow-list validated).
    pub name: String,
    /// Declared protocol revision.
    pub revision: u16,
    /// Remote stream endpoint.
    pub addr: SocketAddr,
}

/// Outcome of [`ServerHooks::on_connect_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Accept: assign an id and send the welcome.
    Accept,
    /// Deny with a reason; the connection closes after the response.
    Deny(String),
    /// Park the client until the host calls `connect_response`.
    Defer,
}

/// Host callbacks for server lifecycle and message routing.
///
/// Every method has a permissive default, so hosts implement only what
/// they care about.
pub trait ServerHooks: Send + Sync {
    /// A client finished its name handshake and passed the policy
    /// checks. Runs before id assignment.
    fn on_connect_request(&self, request: &ConnectRequest) -> ConnectDecision {
        let _ = request;
        ConnectDecision::Accept
    }

    /// A fully-accepted client is gone. Fires exactly once per client.
    fn on_disconnect(&self, client: &Client) {
        let _ = client;
    }

    /// An application message addressed to the server. Never forwarded
    /// automatically.
    fn on_server_message(
        &self,
        client: &Client,
        blasted: bool,
        subchannel: u8,
        data: &[u8],
        variant: u8,
    ) {
        let _ = (client, blasted, subchannel, data, variant);
    }

    /// A channel broadcast request. Return `false` to suppress the
    /// forward.
    fn on_channel_message(
        &self,
        sender: &Client,
        channel: &Channel,
        blasted: bool,
        subchannel: u8,
        data: &[u8],
        variant: u8,
    ) -> bool {
        let _ = (sender, channel, blasted, subchannel, data, variant);
        true
    }

    /// A peer-to-peer message request. Return `false` to suppress the
    /// forward.
    #[allow(clippy::too_many_arguments)]
    fn on_peer_message(
        &self,
        sender: &Client,
        via_channel: &Channel,
        receiver: &Client,
        blasted: bool,
        subchannel: u8,
        data: &[u8],
        variant: u8,
    ) -> bool {
        let _ = (sender, via_channel, receiver, blasted, subchannel, data, variant);
        true
    }

    /// A non-fatal error from any subsystem.
    fn on_error(&self, err: &RelayError) {
        let _ = err;
    }
}

/// Permit-everything hooks; the default host behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ServerHooks for DefaultHooks {}
