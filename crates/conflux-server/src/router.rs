//! The relay core: client and channel registries, handshake and
//! dispatch state machine, and policy enforcement.
//!
//! All methods run under the server's core lock, one event at a time.
//! Everything a frame does (registry mutation, hook invocation,
//! enqueuing forwards to every recipient) completes before the lock is
//! released, which is what makes broadcasts atomic with respect to
//! other traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use conflux_wire::codec::split_datagram;
use conflux_wire::message::{ChannelEntry, PeerEntry};
use conflux_wire::types::{record_type, variant_flags};
use conflux_wire::{ClientId, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::admission::{BanList, PROTOCOL_BAN, UPLOAD_BAN, WASTED_BAN};
use crate::allowlist::{CodepointSet, TextCategory};
use crate::channel::Channel;
use crate::client::{Client, ConnToken, StreamKind};
use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::hooks::{ConnectDecision, ConnectRequest, ServerHooks};
use crate::metrics::{counters, gauges};
use crate::udp::DatagramSender;

/// Wasted server messages beyond this count get the sender banned.
const WASTED_LIMIT: u32 = 5;
/// Upper bound on client and channel name length, in characters.
const MAX_NAME_CHARS: usize = 64;

const UPLOAD_BAN_REASON: &str = "Disconnected for exceeding the upload limit.";
const WASTED_BAN_REASON: &str =
    "Disconnected for sending too many messages the server is not meant to handle.";
const PROTOCOL_BAN_REASON: &str = "Malformed relay protocol usage.";

/// Server-wide traffic counters, rolled once per second by the tick.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Messages received over the server's lifetime.
    pub total_messages_in: u64,
    /// Messages forwarded over the server's lifetime.
    pub total_messages_out: u64,
    /// Payload bytes received over the server's lifetime.
    pub total_bytes_in: u64,
    /// Payload bytes forwarded over the server's lifetime.
    pub total_bytes_out: u64,
    /// Messages received in the current second.
    pub sec_messages_in: u64,
    /// Messages forwarded in the current second.
    pub sec_messages_out: u64,
    /// Bytes received in the current second.
    pub sec_bytes_in: u64,
    /// Bytes forwarded in the current second.
    pub sec_bytes_out: u64,
    /// Most messages received in any one second.
    pub max_messages_in: u64,
    /// Most messages forwarded in any one second.
    pub max_messages_out: u64,
    /// Most bytes received in any one second.
    pub max_bytes_in: u64,
    /// Most bytes forwarded in any one second.
    pub max_bytes_out: u64,
    /// Most clients connected at once.
    pub peak_clients: usize,
    /// Most channels alive at once.
    pub peak_channels: usize,
}

impl ServerStats {
    fn count_in(&mut self, bytes: usize) {
        self.sec_messages_in += 1;
        self.sec_bytes_in += bytes as u64;
        counters::payload_bytes_total("in", bytes as u64);
    }

    fn count_out(&mut self, bytes: usize) {
        self.sec_messages_out += 1;
        self.sec_bytes_out += bytes as u64;
        counters::payload_bytes_total("out", bytes as u64);
    }

    fn roll(&mut self) {
        self.total_messages_in += self.sec_messages_in;
        self.total_messages_out += self.sec_messages_out;
        self.total_bytes_in += self.sec_bytes_in;
        self.total_bytes_out += self.sec_bytes_out;
        self.max_messages_in = self.max_messages_in.max(self.sec_messages_in);
        self.max_messages_out = self.max_messages_out.max(self.sec_messages_out);
        self.max_bytes_in = self.max_bytes_in.max(self.sec_bytes_in);
        self.max_bytes_out = self.max_bytes_out.max(self.sec_bytes_out);
        self.sec_messages_in = 0;
        self.sec_messages_out = 0;
        self.sec_bytes_in = 0;
        self.sec_bytes_out = 0;
    }
}

/// Outcome of a name handshake, as seen by the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Accepted; the welcome is queued and the id assigned.
    Accepted(ClientId),
    /// Denied; a deny response is queued, close after it drains.
    Denied,
    /// Parked for a deferred host decision.
    Deferred,
}

/// A client between handshake and connect approval.
#[derive(Debug)]
struct PendingClient {
    token: ConnToken,
    name: String,
    revision: u16,
    addr: SocketAddr,
    stream_kind: StreamKind,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

/// The serialized server core.
pub struct RelayCore {
    config: ServerConfig,
    hooks: Arc<dyn ServerHooks>,
    allowlists: [Option<CodepointSet>; 4],
    clients: HashMap<ClientId, Client>,
    tokens: HashMap<ConnToken, ClientId>,
    pending: HashMap<ConnToken, PendingClient>,
    channels: HashMap<String, Channel>,
    /// The per-IP ban list.
    pub bans: BanList,
    /// Server-wide traffic counters.
    pub stats: ServerStats,
    udp: Option<DatagramSender>,
    next_id: u32,
}

impl RelayCore {
    /// Builds a core from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when an allow-list specification
    /// does not parse.
    pub fn new(config: ServerConfig, hooks: Arc<dyn ServerHooks>) -> Result<Self, RelayError> {
        let allowlists = [
            Some(CodepointSet::parse(&config.name_codepoints)?),
            Some(CodepointSet::parse(&config.channel_codepoints)?),
            Some(CodepointSet::parse(&config.server_message_codepoints)?),
            config
                .client_message_codepoints
                .as_deref()
                .map(CodepointSet::parse)
                .transpose()?,
        ];
        Ok(Self {
            config,
            hooks,
            allowlists,
            clients: HashMap::new(),
            tokens: HashMap::new(),
            pending: HashMap::new(),
            channels: HashMap::new(),
            bans: BanList::new(),
            stats: ServerStats::default(),
            udp: None,
            next_id: 1,
        })
    }

    /// Attaches the datagram send path once the engine is hosted.
    pub fn set_datagram_sender(&mut self, sender: DatagramSender) {
        self.udp = Some(sender);
    }

    /// Number of fully-accepted clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of clients parked for deferred approval.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Looks up a client by id.
    #[must_use]
    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Looks up a channel by (case-insensitive) name.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&Channel::key(name))
    }

    // ── Handshake ───────────────────────────────────────────────────

    /// Processes a name handshake. Policy checks (name allow-list, ban
    /// list) run before the host hook; no id exists until acceptance.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_handshake(
        &mut self,
        token: ConnToken,
        revision: u16,
        name: String,
        addr: SocketAddr,
        stream_kind: StreamKind,
        tx: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> HandshakeOutcome {
        if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
            counters::connects_total("denied");
            let _ = tx.send(Message::ConnectDeny {
                reason: "invalid client name".into(),
            });
            return HandshakeOutcome::Denied;
        }

        if let Some(set) = &self.allowlists[TextCategory::ClientNames.index()] {
            if let Err(c) = set.check(&name) {
                counters::connects_total("denied");
                debug!(%addr, codepoint = c as u32, "client name rejected by allow-list");
                let _ = tx.send(Message::ConnectDeny {
                    reason: format!("client name contains disallowed codepoint U+{:04X}", c as u32),
                });
                return HandshakeOutcome::Denied;
            }
        }

        if let Some(reason) = self.bans.check_connect(addr.ip(), Instant::now()) {
            counters::connects_total("banned");
            info!(ip = %addr.ip(), %reason, "blocked connection attempt from banned address");
            let _ = tx.send(Message::ConnectDeny { reason });
            return HandshakeOutcome::Denied;
        }

        let request = ConnectRequest {
            token,
            name: name.clone(),
            revision,
            addr,
        };
        let pending = PendingClient {
            token,
            name,
            revision,
            addr,
            stream_kind,
            tx,
            cancel,
        };

        match self.hooks.on_connect_request(&request) {
            ConnectDecision::Accept => match self.accept_pending(pending) {
                Some(id) => HandshakeOutcome::Accepted(id),
                None => HandshakeOutcome::Denied,
            },
            ConnectDecision::Deny(reason) => {
                counters::connects_total("denied");
                let _ = pending.tx.send(Message::ConnectDeny { reason });
                HandshakeOutcome::Denied
            }
            ConnectDecision::Defer => {
                self.pending.insert(token, pending);
                HandshakeOutcome::Deferred
            }
        }
    }

    /// Answers a deferred connect decision. An empty `deny` accepts
    /// the client. Returns `false` when the token is no longer parked
    /// (the connection dropped first).
    pub fn connect_response(&mut self, token: ConnToken, deny: Option<String>) -> bool {
        let Some(pending) = self.pending.remove(&token) else {
            return false;
        };
        match deny {
            Some(reason) => {
                counters::connects_total("denied");
                let _ = pending.tx.send(Message::ConnectDeny { reason });
                pending.cancel.cancel();
            }
            None => {
                self.accept_pending(pending);
            }
        }
        true
    }

    fn accept_pending(&mut self, pending: PendingClient) -> Option<ClientId> {
        if self.next_id > u32::from(ClientId::MAX) {
            counters::connects_total("denied");
            self.report_error(&RelayError::Resource(
                "client id space exhausted; refusing new connections".into(),
            ));
            let _ = pending.tx.send(Message::ConnectDeny {
                reason: "server full".into(),
            });
            pending.cancel.cancel();
            return None;
        }
        let id = self.next_id as ClientId;
        self.next_id += 1;

        let _ = pending.tx.send(Message::Welcome {
            id,
            welcome: self.config.welcome.clone(),
        });

        let client = Client {
            id,
            token: pending.token,
            name: pending.name,
            addr: pending.addr,
            udp_addr: None,
            stream_kind: pending.stream_kind,
            trusted: true,
            closing: false,
            connected_at: Instant::now(),
            channels: Default::default(),
            meter: Default::default(),
            tx: pending.tx,
            cancel: pending.cancel,
        };
        info!(
            id,
            name = %client.name,
            ip = %client.addr.ip(),
            transport = %client.stream_kind,
            revision = pending.revision,
            "client connected"
        );
        self.tokens.insert(pending.token, id);
        self.clients.insert(id, client);
        counters::connects_total("accepted");
        gauges::inc_clients_active();
        self.stats.peak_clients = self.stats.peak_clients.max(self.clients.len());
        Some(id)
    }

    // ── Inbound records ─────────────────────────────────────────────

    /// Dispatches a stream record from the connection owning `token`.
    pub fn handle_record(&mut self, token: ConnToken, msg: Message) {
        let Some(&id) = self.tokens.get(&token) else {
            // Pending approval or already torn down; nothing to route.
            trace!(token, "record dropped for unregistered connection");
            return;
        };
        self.dispatch(id, msg, false);
    }

    /// Handles a raw datagram. Spoofed, malformed or unattributable
    /// datagrams are dropped silently; reporting them would make a
    /// spoof flood into a log flood.
    pub fn handle_datagram(&mut self, from: SocketAddr, buf: &[u8]) {
        let Ok((sender_id, head, payload)) = split_datagram(buf) else {
            return;
        };
        let Some(client) = self.clients.get_mut(&sender_id) else {
            return;
        };
        if client.addr.ip() != from.ip() {
            return;
        }

        if head >> 4 == record_type::UDP_HELLO {
            client.udp_addr = Some(from);
            debug!(id = sender_id, %from, "datagram endpoint registered");
            if let Some(udp) = &self.udp {
                udp.send(from, Message::UdpHello.encode_datagram(0));
            }
            return;
        }

        let Ok(msg) = Message::decode_from_client(head, payload) else {
            return;
        };
        self.dispatch(sender_id, msg, true);
    }

    fn dispatch(&mut self, id: ClientId, msg: Message, blasted: bool) {
        match msg {
            Message::Handshake { .. } => {
                self.protocol_violation(id, "handshake repeated after acceptance");
            }
            Message::SetName { name } => self.handle_set_name(id, name),
            Message::JoinChannel { flags, name } => self.handle_join(id, flags, &name),
            Message::LeaveChannel { name } => self.handle_leave(id, &name),
            Message::ListChannels => self.handle_list(id),
            Message::Pong => {}
            Message::ServerMessage {
                variant,
                subchannel,
                data,
            } => self.handle_server_message(id, blasted, subchannel, &data, variant),
            Message::ChannelMessage {
                blasted: record_blasted,
                variant,
                subchannel,
                channel,
                data,
            } => self.handle_channel_message(
                id,
                blasted || record_blasted,
                variant,
                subchannel,
                &channel,
                &data,
            ),
            Message::PeerMessage {
                blasted: record_blasted,
                variant,
                subchannel,
                channel,
                peer,
                data,
            } => self.handle_peer_message(
                id,
                blasted || record_blasted,
                variant,
                subchannel,
                &channel,
                peer,
                &data,
            ),
            // A stream-borne hello has no datagram source to register.
            Message::UdpHello => debug!(id, "udp hello over stream ignored"),
            Message::ObjectMessage { .. } => {
                self.protocol_violation(id, "object messages are not supported by this server");
            }
            Message::ImplementationRelated { .. } => {
                debug!(id, "implementation-related record ignored");
            }
            _ => self.protocol_violation(id, "server-bound record of a server-only type"),
        }
    }

    fn handle_set_name(&mut self, id: ClientId, name: String) {
        if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
            self.notify(id, "invalid client name");
            return;
        }
        if let Some(set) = &self.allowlists[TextCategory::ClientNames.index()] {
            if let Err(c) = set.check(&name) {
                self.notify(
                    id,
                    &format!("client name contains disallowed codepoint U+{:04X}", c as u32),
                );
                return;
            }
        }
        if let Some(client) = self.clients.get_mut(&id) {
            debug!(id, old = %client.name, new = %name, "client renamed");
            client.name = name;
        }
    }

    fn handle_join(&mut self, id: ClientId, flags: u8, name: &str) {
        let fail = || Message::JoinResponse {
            success: false,
            flags,
            name: name.to_owned(),
            members: Vec::new(),
        };

        if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
            self.send_to(id, fail());
            return;
        }
        if let Some(set) = &self.allowlists[TextCategory::ChannelNames.index()] {
            if set.check(name).is_err() {
                counters::messages_dropped_total("codepoint");
                self.send_to(id, fail());
                return;
            }
        }

        let key = Channel::key(name);
        if self
            .clients
            .get(&id)
            .is_some_and(|c| c.channels.contains(&key))
        {
            self.protocol_violation(id, "join for a channel the client is already in");
            return;
        }

        let (roster, channel_name, channel_flags) = match self.channels.get_mut(&key) {
            Some(ch) => {
                ch.add_member(id);
                (ch.members.clone(), ch.name.clone(), ch.flags())
            }
            None => {
                let ch = Channel::new(name.to_owned(), id, flags, Instant::now());
                let out = (ch.members.clone(), ch.name.clone(), ch.flags());
                self.channels.insert(key.clone(), ch);
                gauges::inc_channels_active();
                self.stats.peak_channels = self.stats.peak_channels.max(self.channels.len());
                debug!(channel = name, master = id, "channel created");
                out
            }
        };

        if let Some(client) = self.clients.get_mut(&id) {
            client.channels.insert(key.clone());
        }

        let joiner_name = self.clients.get(&id).map(|c| c.name.clone()).unwrap_or_default();
        let ch = &self.channels[&key];
        let joined = Message::PeerJoined {
            channel: channel_name.clone(),
            id,
            flags: ch.member_flags(id),
            name: joiner_name,
        };
        let members = Message::JoinResponse {
            success: true,
            flags: channel_flags,
            name: channel_name,
            members: roster
                .iter()
                .map(|&m| PeerEntry {
                    id: m,
                    flags: ch.member_flags(m),
                    name: self.clients.get(&m).map(|c| c.name.clone()).unwrap_or_default(),
                })
                .collect(),
        };

        for &m in &roster {
            if m != id {
                if let Some(c) = self.clients.get(&m) {
                    c.send(joined.clone());
                }
            }
        }
        self.send_to(id, members);
    }

    fn handle_leave(&mut self, id: ClientId, name: &str) {
        let key = Channel::key(name);
        let is_member = self
            .clients
            .get(&id)
            .is_some_and(|c| c.channels.contains(&key));
        if !is_member {
            self.send_to(
                id,
                Message::LeaveResponse {
                    success: false,
                    name: name.to_owned(),
                },
            );
            return;
        }
        self.send_to(
            id,
            Message::LeaveResponse {
                success: true,
                name: name.to_owned(),
            },
        );
        self.remove_membership(id, &key);
    }

    fn handle_list(&mut self, id: ClientId) {
        let channels = self
            .channels
            .values()
            .filter(|ch| !ch.hidden)
            .map(|ch| ChannelEntry {
                member_count: ch.members.len() as u32,
                name: ch.name.clone(),
            })
            .collect();
        self.send_to(id, Message::ChannelList { channels });
    }

    fn handle_server_message(
        &mut self,
        id: ClientId,
        blasted: bool,
        subchannel: u8,
        data: &[u8],
        variant: u8,
    ) {
        self.stats.count_in(data.len());
        let cap = self.config.upload_cap;
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        client.meter.record(data.len(), blasted, cap);

        let valid_shape = !blasted && variant == 0 && (subchannel == 0 || subchannel == 5);
        let valid_text = match &self.allowlists[TextCategory::MessagesSentToServer.index()] {
            Some(set) => std::str::from_utf8(data).map_or(true, |s| set.check(s).is_ok()),
            None => true,
        };
        if !valid_shape || !valid_text {
            counters::messages_dropped_total("wasted");
            let client = self.clients.get_mut(&id).expect("present above");
            let wasted = client.meter.record_wasted();
            debug!(id, ip = %client.addr.ip(), wasted, "dropped invalid server message");
            if wasted > WASTED_LIMIT {
                let ip = client.addr.ip();
                self.bans
                    .record(ip, WASTED_BAN_REASON, WASTED_BAN, Instant::now());
                info!(id, %ip, "client banned for wasted server messages");
                self.notify_on(id, 1, WASTED_BAN_REASON);
                self.disconnect(id);
            }
            return;
        }

        let hooks = Arc::clone(&self.hooks);
        if let Some(client) = self.clients.get(&id) {
            hooks.on_server_message(client, blasted, subchannel, data, variant);
        }
    }

    fn handle_channel_message(
        &mut self,
        id: ClientId,
        blasted: bool,
        variant: u8,
        subchannel: u8,
        channel: &str,
        data: &[u8],
    ) {
        self.stats.count_in(data.len());
        let cap = self.config.upload_cap;
        let key = Channel::key(channel);

        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let within_cap = client.meter.record(data.len(), blasted, cap);

        if !client.channels.contains(&key) {
            self.protocol_violation(id, "channel message for a channel the sender is not in");
            return;
        }

        if !self.text_allowed_to_clients(data) {
            counters::messages_dropped_total("codepoint");
            return;
        }

        let hooks = Arc::clone(&self.hooks);
        let permitted = {
            let client = &self.clients[&id];
            let ch = &self.channels[&key];
            hooks.on_channel_message(client, ch, blasted, subchannel, data, variant)
        };
        if !permitted || !within_cap {
            counters::messages_dropped_total(if permitted { "upload_cap" } else { "denied" });
            return;
        }

        let ch = &self.channels[&key];
        let echo = variant & variant_flags::ECHO_SENDER != 0;
        let recipients: Vec<ClientId> = ch
            .members
            .iter()
            .copied()
            .filter(|&m| echo || m != id)
            .collect();
        let forward = Message::ChannelForward {
            blasted,
            variant,
            subchannel,
            sender: id,
            channel: ch.name.clone(),
            data: data.to_vec(),
        };

        for m in recipients {
            self.forward_to(m, forward.clone(), blasted, data.len());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_peer_message(
        &mut self,
        id: ClientId,
        blasted: bool,
        variant: u8,
        subchannel: u8,
        channel: &str,
        peer: ClientId,
        data: &[u8],
    ) {
        self.stats.count_in(data.len());
        let cap = self.config.upload_cap;
        let key = Channel::key(channel);

        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let within_cap = client.meter.record(data.len(), blasted, cap);

        if !client.channels.contains(&key) {
            self.protocol_violation(id, "peer message via a channel the sender is not in");
            return;
        }
        let receiver_in_channel = self
            .channels
            .get(&key)
            .is_some_and(|ch| ch.is_member(peer));
        if !receiver_in_channel {
            self.protocol_violation(id, "peer message to a client outside the via channel");
            return;
        }

        if !self.text_allowed_to_clients(data) {
            counters::messages_dropped_total("codepoint");
            return;
        }

        let hooks = Arc::clone(&self.hooks);
        let permitted = {
            let sender = &self.clients[&id];
            let ch = &self.channels[&key];
            let receiver = &self.clients[&peer];
            hooks.on_peer_message(sender, ch, receiver, blasted, subchannel, data, variant)
        };
        if !permitted || !within_cap {
            counters::messages_dropped_total(if permitted { "upload_cap" } else { "denied" });
            return;
        }

        let forward = Message::PeerForward {
            blasted,
            variant,
            subchannel,
            sender: id,
            channel: self.channels[&key].name.clone(),
            data: data.to_vec(),
        };
        self.forward_to(peer, forward, blasted, data.len());
    }

    fn text_allowed_to_clients(&self, data: &[u8]) -> bool {
        match &self.allowlists[TextCategory::MessagesSentToClients.index()] {
            Some(set) => std::str::from_utf8(data).map_or(true, |s| set.check(s).is_ok()),
            None => true,
        }
    }

    /// Delivers a forward, preferring the datagram path for blasted
    /// traffic when the recipient registered an endpoint.
    fn forward_to(&mut self, target: ClientId, msg: Message, blasted: bool, bytes: usize) {
        let Some(client) = self.clients.get(&target) else {
            return;
        };
        self.stats.count_out(bytes);
        counters::messages_relayed_total();

        if blasted {
            if let (Some(udp), Some(addr)) = (&self.udp, client.udp_addr) {
                let sender = match &msg {
                    Message::ChannelForward { sender, .. } | Message::PeerForward { sender, .. } => {
                        *sender
                    }
                    _ => 0,
                };
                udp.send(addr, msg.encode_datagram(sender));
                return;
            }
        }
        client.send(msg);
    }

    fn send_to(&self, id: ClientId, msg: Message) {
        if let Some(client) = self.clients.get(&id) {
            client.send(msg);
        }
    }

    /// Sends a server notice (text on the given subchannel) to a client.
    fn notify_on(&self, id: ClientId, subchannel: u8, text: &str) {
        self.send_to(
            id,
            Message::ServerMessage {
                variant: 0,
                subchannel,
                data: text.as_bytes().to_vec(),
            },
        );
    }

    fn notify(&self, id: ClientId, text: &str) {
        self.notify_on(id, 0, text);
    }

    // ── Violations & disconnect ─────────────────────────────────────

    /// Pre-acceptance protocol garbage: there is no client to mark, so
    /// the address goes straight onto the ban list.
    pub fn prehandshake_violation(&mut self, addr: SocketAddr) {
        counters::messages_dropped_total("protocol");
        warn!(ip = %addr.ip(), "protocol violation before handshake");
        self.bans
            .record(addr.ip(), PROTOCOL_BAN_REASON, PROTOCOL_BAN, Instant::now());
    }

    /// A stream-level protocol violation from an accepted connection.
    pub fn stream_violation(&mut self, token: ConnToken, desc: &str) {
        if let Some(&id) = self.tokens.get(&token) {
            self.protocol_violation(id, desc);
        }
    }

    fn protocol_violation(&mut self, id: ClientId, desc: &str) {
        counters::messages_dropped_total("protocol");
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        warn!(id, ip = %client.addr.ip(), desc, "protocol violation");
        client.trusted = false;
        self.notify(id, desc);
        self.disconnect(id);
    }

    /// Tears down the connection owning `token` (stream closed or
    /// errored). Safe for unknown tokens.
    pub fn disconnect_token(&mut self, token: ConnToken) {
        if let Some(&id) = self.tokens.get(&token) {
            self.disconnect(id);
        } else if let Some(pending) = self.pending.remove(&token) {
            pending.cancel.cancel();
        }
    }

    /// Disconnects a client. Idempotent: the second call is a no-op.
    pub fn disconnect(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.closing {
            return;
        }
        client.closing = true;
        let channels: Vec<String> = client.channels.iter().cloned().collect();

        for key in channels {
            self.remove_membership(id, &key);
        }

        let client = self.clients.get(&id).expect("present above");
        let hooks = Arc::clone(&self.hooks);
        hooks.on_disconnect(client);
        info!(
            id,
            name = %client.name,
            ip = %client.addr.ip(),
            bytes_in = client.meter.total_bytes_in(),
            messages_in = client.meter.total_messages_in(),
            "client disconnected"
        );

        if !client.trusted {
            self.bans.record(
                client.addr.ip(),
                PROTOCOL_BAN_REASON,
                PROTOCOL_BAN,
                Instant::now(),
            );
        }

        client.request_close();
        let token = client.token;
        self.tokens.remove(&token);
        self.clients.remove(&id);
        gauges::dec_clients_active();
    }

    /// Removes `id` from the channel at `key`, applying the
    /// master-left and empty-channel rules.
    fn remove_membership(&mut self, id: ClientId, key: &str) {
        let Some(ch) = self.channels.get_mut(key) else {
            return;
        };
        let was_master = ch.master == Some(id);
        if !ch.remove_member(id) {
            return;
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.channels.remove(key);
        }

        let close = (was_master && ch.autoclose) || ch.members.is_empty();
        let name = ch.name.clone();
        let members = ch.members.clone();

        if close {
            self.channels.remove(key);
            gauges::dec_channels_active();
            debug!(channel = %name, "channel closed");
            for m in members {
                if let Some(c) = self.clients.get_mut(&m) {
                    c.channels.remove(key);
                    c.send(Message::ChannelClosed {
                        channel: name.clone(),
                    });
                }
            }
        } else {
            for m in members {
                if let Some(c) = self.clients.get(&m) {
                    c.send(Message::PeerLeft {
                        channel: name.clone(),
                        id,
                    });
                }
            }
        }
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// One second of maintenance: roll counters, enforce latched upload
    /// caps, sweep expired bans.
    pub fn tick(&mut self, now: Instant) {
        self.stats.roll();
        trace!(
            clients = self.clients.len(),
            channels = self.channels.len(),
            "tick"
        );

        let exceeded: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.meter.exceeded())
            .map(|c| c.id)
            .collect();
        for id in exceeded {
            let Some(client) = self.clients.get(&id) else {
                continue;
            };
            let ip = client.addr.ip();
            info!(
                id,
                %ip,
                window_bytes = client.meter.window_bytes(),
                window_messages = client.meter.window_messages(),
                "client dropped for heavy upload"
            );
            self.bans.record(ip, UPLOAD_BAN_REASON, UPLOAD_BAN, now);
            self.notify_on(id, 1, UPLOAD_BAN_REASON);
            self.notify_on(id, 0, UPLOAD_BAN_REASON);
            self.disconnect(id);
        }

        for client in self.clients.values_mut() {
            client.meter.roll_window();
        }

        self.bans.sweep(now);
    }

    /// Emits the per-second status line. Split from [`Self::tick`] so
    /// the log cadence is the timer's business.
    pub fn trace_status(&self) {
        debug!(
            "last sec received {} messages ({} bytes), forwarded {} ({} bytes)",
            self.stats.sec_messages_in,
            self.stats.sec_bytes_in,
            self.stats.sec_messages_out,
            self.stats.sec_bytes_out,
        );
    }

    /// Disconnects every client; used for graceful shutdown.
    pub fn close_all(&mut self) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        for (_, pending) in self.pending.drain() {
            pending.cancel.cancel();
        }
    }

    /// Logs the lifetime totals; called once at shutdown.
    pub fn log_summary(&self) {
        info!(
            "total bytes: {} in, {} out",
            self.stats.total_bytes_in, self.stats.total_bytes_out
        );
        info!(
            "total messages: {} in, {} out",
            self.stats.total_messages_in, self.stats.total_messages_out
        );
        info!(
            "max in one second: {} messages in / {} out, {} bytes in / {} out",
            self.stats.max_messages_in,
            self.stats.max_messages_out,
            self.stats.max_bytes_in,
            self.stats.max_bytes_out,
        );
        info!(
            "peak population: {} clients, {} channels",
            self.stats.peak_clients, self.stats.peak_channels
        );
    }

    pub(crate) fn report_error(&self, err: &RelayError) {
        warn!("error: {err}; execution continues");
        self.hooks.on_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use conflux_wire::types::{channel_flags, PROTOCOL_REVISION};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::hooks::DefaultHooks;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ws_listen: None,
            wss_listen: None,
            tls_cert: "./fullchain.pem".into(),
            tls_key: "./privkey.pem".into(),
            welcome: "welcome".into(),
            upload_cap: None,
            max_conns: 1000,
            max_conns_ip: 100,
            handshake_timeout: 30,
            ping_interval: 30,
            pong_timeout: 60,
            name_codepoints: "L*,M*,N*,P*,32".into(),
            channel_codepoints: "L*,M*,N*,P*,32".into(),
            server_message_codepoints: "L*,M*,N*,P*,32".into(),
            client_message_codepoints: None,
        }
    }

    fn test_core() -> RelayCore {
        RelayCore::new(test_config(), Arc::new(DefaultHooks)).unwrap()
    }

    fn hooks_dyn<H: ServerHooks + 'static>(hooks: &Arc<H>) -> Arc<dyn ServerHooks> {
        Arc::clone(hooks) as Arc<dyn ServerHooks>
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, last], 40_000 + u16::from(last)))
    }

    struct TestPeer {
        id: ClientId,
        token: ConnToken,
        rx: UnboundedReceiver<Message>,
    }

    impl TestPeer {
        fn next(&mut self) -> Option<Message> {
            self.rx.try_recv().ok()
        }

        fn drain(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn connect(core: &mut RelayCore, token: ConnToken, name: &str, ip_last: u8) -> TestPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = core.begin_handshake(
            token,
            PROTOCOL_REVISION,
            name.to_owned(),
            addr(ip_last),
            StreamKind::Tcp,
            tx,
            CancellationToken::new(),
        );
        let HandshakeOutcome::Accepted(id) = outcome else {
            panic!("expected acceptance, got {outcome:?}");
        };
        let mut peer = TestPeer { id, token, rx };
        let welcome = peer.next().expect("welcome queued");
        assert!(matches!(welcome, Message::Welcome { id: wid, .. } if wid == id));
        peer
    }

    fn join(core: &mut RelayCore, peer: &mut TestPeer, channel: &str, flags: u8) {
        core.handle_record(
            peer.token,
            Message::JoinChannel {
                flags,
                name: channel.to_owned(),
            },
        );
        let response = peer
            .drain()
            .into_iter()
            .find(|m| matches!(m, Message::JoinResponse { .. }))
            .expect("join response");
        assert!(matches!(response, Message::JoinResponse { success: true, .. }));
    }

    fn channel_text(core: &mut RelayCore, peer: &TestPeer, channel: &str, subchannel: u8, data: &[u8]) {
        core.handle_record(
            peer.token,
            Message::ChannelMessage {
                blasted: false,
                variant: 0,
                subchannel,
                channel: channel.to_owned(),
                data: data.to_vec(),
            },
        );
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut core = test_core();
        let a = connect(&mut core, 1, "a", 1);
        let b = connect(&mut core, 2, "b", 2);
        let c = connect(&mut core, 3, "c", 3);
        assert_eq!((a.id, b.id, c.id), (1, 2, 3));
        assert_eq!(core.client_count(), 3);
    }

    #[test]
    fn rejected_name_gets_deny_and_no_id() {
        let mut core = test_core();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = core.begin_handshake(
            1,
            PROTOCOL_REVISION,
            "hi\u{7}".to_owned(),
            addr(1),
            StreamKind::Tcp,
            tx,
            CancellationToken::new(),
        );
        assert_eq!(outcome, HandshakeOutcome::Denied);
        assert!(matches!(rx.try_recv(), Ok(Message::ConnectDeny { .. })));
        assert_eq!(core.client_count(), 0);
    }

    #[test]
    fn banned_address_is_refused_with_reason() {
        let mut core = test_core();
        for _ in 0..4 {
            core.bans
                .record(addr(9).ip(), "go away", PROTOCOL_BAN, Instant::now());
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = core.begin_handshake(
            1,
            PROTOCOL_REVISION,
            "ok name".to_owned(),
            addr(9),
            StreamKind::Tcp,
            tx,
            CancellationToken::new(),
        );
        assert_eq!(outcome, HandshakeOutcome::Denied);
        match rx.try_recv() {
            Ok(Message::ConnectDeny { reason }) => assert_eq!(reason, "go away"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn join_creates_channel_with_master_and_notifies_members() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        let mut b = connect(&mut core, 2, "b", 2);

        join(&mut core, &mut a, "Room", 0);
        let ch = core.channel("room").expect("channel exists");
        assert_eq!(ch.master, Some(a.id));
        assert_eq!(ch.name, "Room");

        join(&mut core, &mut b, "ROOM", 0);
        let notification = a.drain().into_iter().find_map(|m| match m {
            Message::PeerJoined { id, name, .. } => Some((id, name)),
            _ => None,
        });
        assert_eq!(notification, Some((b.id, "b".to_owned())));
        assert_eq!(core.channel("room").unwrap().members, vec![a.id, b.id]);
        assert_eq!(core.channel_count(), 1);
    }

    #[test]
    fn channel_broadcast_reaches_peers_but_not_the_sender() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        let mut b = connect(&mut core, 2, "b", 2);
        join(&mut core, &mut a, "room", 0);
        join(&mut core, &mut b, "room", 0);
        a.drain();
        b.drain();

        channel_text(&mut core, &a, "room", 7, b"hello");

        match b.next() {
            Some(Message::ChannelForward {
                blasted,
                variant,
                subchannel,
                sender,
                channel,
                data,
            }) => {
                assert!(!blasted);
                assert_eq!(variant, 0);
                assert_eq!(subchannel, 7);
                assert_eq!(sender, a.id);
                assert_eq!(channel, "room");
                assert_eq!(data, b"hello");
            }
            other => panic!("expected forward, got {other:?}"),
        }
        assert!(a.next().is_none());
    }

    #[test]
    fn echo_variant_includes_the_sender() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        join(&mut core, &mut a, "room", 0);
        a.drain();

        core.handle_record(
            a.token,
            Message::ChannelMessage {
                blasted: false,
                variant: variant_flags::ECHO_SENDER,
                subchannel: 0,
                channel: "room".to_owned(),
                data: b"x".to_vec(),
            },
        );
        assert!(matches!(a.next(), Some(Message::ChannelForward { .. })));
    }

    #[test]
    fn channel_message_outside_membership_is_a_violation() {
        let mut core = test_core();
        let a = connect(&mut core, 1, "a", 1);
        channel_text(&mut core, &a, "nowhere", 0, b"x");
        assert_eq!(core.client_count(), 0);
        let entry = core.bans.get(addr(1).ip()).expect("ban recorded");
        assert_eq!(entry.disconnect_count, 1);
    }

    #[test]
    fn peer_message_routes_to_one_member_only() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        let mut b = connect(&mut core, 2, "b", 2);
        let mut c = connect(&mut core, 3, "c", 3);
        for peer in [&mut a, &mut b, &mut c] {
            join(&mut core, peer, "room", 0);
        }
        a.drain();
        b.drain();
        c.drain();

        core.handle_record(
            a.token,
            Message::PeerMessage {
                blasted: false,
                variant: 0,
                subchannel: 3,
                channel: "room".to_owned(),
                peer: b.id,
                data: b"psst".to_vec(),
            },
        );
        assert!(matches!(
            b.next(),
            Some(Message::PeerForward { sender, .. }) if sender == a.id
        ));
        assert!(c.next().is_none());
    }

    #[test]
    fn peer_message_to_client_outside_channel_is_a_violation() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        let b = connect(&mut core, 2, "b", 2);
        join(&mut core, &mut a, "room", 0);

        core.handle_record(
            a.token,
            Message::PeerMessage {
                blasted: false,
                variant: 0,
                subchannel: 0,
                channel: "room".to_owned(),
                peer: b.id,
                data: b"x".to_vec(),
            },
        );
        assert!(core.client(a.id).is_none(), "sender disconnected");
        assert!(core.client(b.id).is_some(), "receiver unaffected");
    }

    #[test]
    fn master_leaving_autoclose_channel_closes_it() {
        let mut core = test_core();
        let mut master = connect(&mut core, 1, "m", 1);
        let mut other = connect(&mut core, 2, "o", 2);
        join(&mut core, &mut master, "room", channel_flags::AUTOCLOSE);
        join(&mut core, &mut other, "room", 0);
        other.drain();

        core.disconnect(master.id);

        let closed = other
            .drain()
            .into_iter()
            .any(|m| matches!(m, Message::ChannelClosed { channel } if channel == "room"));
        assert!(closed, "remaining member told the channel closed");
        assert!(core.channel("room").is_none());
        assert!(core.client(other.id).unwrap().channels.is_empty());
    }

    #[test]
    fn master_leaving_plain_channel_leaves_it_masterless() {
        let mut core = test_core();
        let mut master = connect(&mut core, 1, "m", 1);
        let mut other = connect(&mut core, 2, "o", 2);
        join(&mut core, &mut master, "room", 0);
        join(&mut core, &mut other, "room", 0);

        core.handle_record(
            master.token,
            Message::LeaveChannel {
                name: "room".to_owned(),
            },
        );
        let ch = core.channel("room").expect("channel survives");
        assert_eq!(ch.master, None);
        assert_eq!(ch.members, vec![other.id]);
    }

    #[test]
    fn empty_channel_is_deleted() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        join(&mut core, &mut a, "room", 0);
        core.handle_record(
            a.token,
            Message::LeaveChannel {
                name: "room".to_owned(),
            },
        );
        assert_eq!(core.channel_count(), 0);
    }

    #[test]
    fn six_wasted_server_messages_ban_and_disconnect() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        for _ in 0..6 {
            core.handle_record(
                a.token,
                Message::ServerMessage {
                    variant: 0,
                    subchannel: 2,
                    data: b"junk".to_vec(),
                },
            );
        }
        assert_eq!(core.client_count(), 0);
        let entry = core.bans.get(addr(1).ip()).expect("banned");
        assert_eq!(entry.disconnect_count, 1);

        let notice = a
            .drain()
            .into_iter()
            .find_map(|m| match m {
                Message::ServerMessage { subchannel, .. } => Some(subchannel),
                _ => None,
            })
            .expect("ban notice queued");
        assert_eq!(notice, 1);
    }

    #[test]
    fn valid_server_message_reaches_the_hook() {
        struct Capture {
            count: AtomicUsize,
        }
        impl ServerHooks for Capture {
            fn on_server_message(
                &self,
                _client: &Client,
                blasted: bool,
                subchannel: u8,
                data: &[u8],
                variant: u8,
            ) {
                assert!(!blasted);
                assert_eq!(subchannel, 5);
                assert_eq!(data, b"HI");
                assert_eq!(variant, 0);
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }
        let hooks = Arc::new(Capture {
            count: AtomicUsize::new(0),
        });
        let mut core = RelayCore::new(test_config(), hooks_dyn(&hooks)).unwrap();
        let a = connect(&mut core, 1, "a", 1);
        core.handle_record(
            a.token,
            Message::ServerMessage {
                variant: 0,
                subchannel: 5,
                data: b"HI".to_vec(),
            },
        );
        assert_eq!(hooks.count.load(Ordering::SeqCst), 1);
        assert_eq!(core.client_count(), 1);
    }

    #[test]
    fn upload_cap_breach_notices_disconnect_and_ban() {
        let mut config = test_config();
        config.upload_cap = Some(3000);
        let mut core = RelayCore::new(config, Arc::new(DefaultHooks)).unwrap();
        let mut a = connect(&mut core, 1, "a", 1);
        join(&mut core, &mut a, "room", 0);
        a.drain();

        channel_text(&mut core, &a, "room", 0, &vec![b'x'; 4000]);
        assert!(core.client(a.id).unwrap().meter.exceeded());

        core.tick(Instant::now());

        let notices: Vec<u8> = a
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                Message::ServerMessage { subchannel, .. } => Some(subchannel),
                _ => None,
            })
            .collect();
        assert_eq!(notices, vec![1, 0]);
        assert_eq!(core.client_count(), 0);
        let entry = core.bans.get(addr(1).ip()).expect("banned");
        assert_eq!(entry.disconnect_count, 1);
    }

    #[test]
    fn disconnect_is_idempotent_and_hook_fires_once() {
        struct Count {
            disconnects: AtomicUsize,
        }
        impl ServerHooks for Count {
            fn on_disconnect(&self, _client: &Client) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }
        let hooks = Arc::new(Count {
            disconnects: AtomicUsize::new(0),
        });
        let mut core = RelayCore::new(test_config(), hooks_dyn(&hooks)).unwrap();
        let mut a = connect(&mut core, 1, "a", 1);
        join(&mut core, &mut a, "room", 0);

        core.disconnect(a.id);
        core.disconnect(a.id);

        assert_eq!(hooks.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(core.client_count(), 0);
        assert_eq!(core.channel_count(), 0);
    }

    #[test]
    fn spoofed_datagram_is_dropped_without_side_effects() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        let mut b = connect(&mut core, 2, "b", 2);
        join(&mut core, &mut a, "room", 0);
        join(&mut core, &mut b, "room", 0);
        a.drain();
        b.drain();

        let datagram = Message::ChannelMessage {
            blasted: true,
            variant: 0,
            subchannel: 0,
            channel: "room".to_owned(),
            data: b"spoof".to_vec(),
        }
        .encode_datagram(a.id);

        // claims a's id but arrives from c's address
        core.handle_datagram(addr(77), &datagram);

        assert!(b.next().is_none());
        assert_eq!(core.stats.sec_messages_in, 0);
        assert!(core.client(a.id).unwrap().trusted);
    }

    #[test]
    fn datagram_from_registered_address_is_routed() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        let mut b = connect(&mut core, 2, "b", 2);
        join(&mut core, &mut a, "room", 0);
        join(&mut core, &mut b, "room", 0);
        a.drain();
        b.drain();

        let datagram = Message::ChannelMessage {
            blasted: true,
            variant: 0,
            subchannel: 1,
            channel: "room".to_owned(),
            data: b"blast".to_vec(),
        }
        .encode_datagram(a.id);
        core.handle_datagram(addr(1), &datagram);

        // no datagram endpoint registered for b, so the forward falls
        // back to the stream queue
        match b.next() {
            Some(Message::ChannelForward { blasted, data, .. }) => {
                assert!(blasted);
                assert_eq!(data, b"blast");
            }
            other => panic!("expected blasted forward, got {other:?}"),
        }
    }

    #[test]
    fn udp_hello_registers_the_datagram_endpoint() {
        let mut core = test_core();
        let a = connect(&mut core, 1, "a", 1);
        let hello = Message::UdpHello.encode_datagram(a.id);
        let udp_source = SocketAddr::new(addr(1).ip(), 50_505);
        core.handle_datagram(udp_source, &hello);
        assert_eq!(core.client(a.id).unwrap().udp_addr, Some(udp_source));
    }

    #[test]
    fn deferred_approval_accepts_on_connect_response() {
        struct Defer;
        impl ServerHooks for Defer {
            fn on_connect_request(&self, _request: &ConnectRequest) -> ConnectDecision {
                ConnectDecision::Defer
            }
        }
        let mut core = RelayCore::new(test_config(), Arc::new(Defer)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = core.begin_handshake(
            1,
            PROTOCOL_REVISION,
            "a".to_owned(),
            addr(1),
            StreamKind::Tcp,
            tx,
            CancellationToken::new(),
        );
        assert_eq!(outcome, HandshakeOutcome::Deferred);
        assert_eq!(core.pending_count(), 1);
        assert_eq!(core.client_count(), 0);

        assert!(core.connect_response(1, None));
        assert!(matches!(rx.try_recv(), Ok(Message::Welcome { .. })));
        assert_eq!(core.client_count(), 1);

        // answered already; a second response has nobody to deliver to
        assert!(!core.connect_response(1, None));
    }

    #[test]
    fn accounting_totals_are_monotonic_across_ticks() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        join(&mut core, &mut a, "room", 0);
        let mut last = 0;
        for i in 0..5 {
            channel_text(&mut core, &a, "room", 0, &vec![b'x'; 10 * (i + 1)]);
            core.tick(Instant::now() + Duration::from_secs(i as u64));
            assert!(core.stats.total_bytes_in >= last);
            last = core.stats.total_bytes_in;
        }
    }

    #[test]
    fn channel_list_hides_hidden_channels() {
        let mut core = test_core();
        let mut a = connect(&mut core, 1, "a", 1);
        let mut b = connect(&mut core, 2, "b", 2);
        join(&mut core, &mut a, "open", 0);
        join(&mut core, &mut b, "secret", channel_flags::HIDDEN);
        a.drain();

        core.handle_record(a.token, Message::ListChannels);
        match a.next() {
            Some(Message::ChannelList { channels }) => {
                assert_eq!(channels.len(), 1);
                assert_eq!(channels[0].name, "open");
                assert_eq!(channels[0].member_count, 1);
            }
            other => panic!("expected channel list, got {other:?}"),
        }
    }
}
