//! Listener setup, shared server state, and the accept loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conflux_wire::ClientId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ConnToken, StreamKind};
use crate::config::ServerConfig;
use crate::connection::{handle_connection, TcpTransport};
use crate::error::RelayError;
use crate::filter::Filter;
use crate::hooks::ServerHooks;
use crate::router::RelayCore;
use crate::udp::{DatagramEngine, DatagramHandler};
use crate::{timer, websocket};

/// Connections allowed to sit in the handshake phase at once.
const MAX_PRE_HANDSHAKE_CONNECTIONS: usize = 1000;

/// State shared by every listener and connection task.
pub struct ServerState {
    /// The serialized relay core.
    pub core: Mutex<RelayCore>,
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Host hooks, shared with the core.
    pub hooks: Arc<dyn ServerHooks>,
    /// Live connection counts per address, backing [`IpSlot`].
    pub ip_slots: DashMap<IpAddr, usize>,
    /// Bounds connections that have not finished the handshake.
    pub pre_handshake_semaphore: Semaphore,
    /// Cancelled exactly once, when shutdown begins.
    pub shutdown: CancellationToken,
    next_token: AtomicU64,
}

impl ServerState {
    /// Allocates a connection token, unique for the process lifetime.
    pub fn allocate_token(&self) -> ConnToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

/// One claimed per-IP connection slot. Claimed before the handshake;
/// the count drops back when the connection task finishes with it.
pub struct IpSlot {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl IpSlot {
    /// Claims a slot for `ip`, or `None` once the address already has
    /// `max_conns_ip` live connections. Claim and count move under one
    /// map guard, so concurrent accepts cannot overshoot the limit.
    #[must_use]
    pub fn claim(state: &Arc<ServerState>, ip: IpAddr) -> Option<Self> {
        match state.ip_slots.entry(ip) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    return None;
                }
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
        Some(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for IpSlot {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.state.ip_slots.entry(self.ip) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                entry.remove();
            }
        }
    }
}

/// Routes received datagrams into the core.
struct EngineBridge {
    state: Arc<ServerState>,
}

#[async_trait::async_trait]
impl DatagramHandler for EngineBridge {
    async fn handle_datagram(&self, from: SocketAddr, buf: &[u8]) {
        self.state.core.lock().await.handle_datagram(from, buf);
    }

    fn on_send_error(&self, err: RelayError) {
        debug!("datagram send failed: {err}");
        self.state.hooks.on_error(&err);
    }
}

/// A bound relay server, ready to run.
pub struct Server {
    state: Arc<ServerState>,
    tcp: TcpListener,
    engine: DatagramEngine,
    ws: Option<TcpListener>,
    wss: Option<(TcpListener, TlsAcceptor)>,
}

impl Server {
    /// Binds every configured listener: TCP and UDP on the main port,
    /// plus the optional websocket pair. A missing or unusable TLS
    /// certificate skips the secure listener with a warning; the rest
    /// of the server is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for invalid configuration and
    /// [`RelayError::Transport`] when a required bind fails.
    pub async fn bind(
        config: ServerConfig,
        hooks: Arc<dyn ServerHooks>,
    ) -> Result<Self, RelayError> {
        config.validate().map_err(RelayError::Config)?;

        let core = RelayCore::new(config.clone(), Arc::clone(&hooks))?;
        let state = Arc::new(ServerState {
            core: Mutex::new(core),
            config: config.clone(),
            hooks,
            ip_slots: DashMap::new(),
            pre_handshake_semaphore: Semaphore::new(MAX_PRE_HANDSHAKE_CONNECTIONS),
            shutdown: CancellationToken::new(),
            next_token: AtomicU64::new(1),
        });

        let tcp = Filter::local_port(config.listen.port())
            .with_local_ip(config.listen.ip())
            .with_reuse_addr(true)
            .bind_tcp()?;
        let tcp_addr = tcp.local_addr().map_err(RelayError::Transport)?;

        // The datagram port mirrors whatever the stream listener got,
        // which matters when the configured port was 0.
        let engine = DatagramEngine::host(
            Filter::local_port(tcp_addr.port()).with_local_ip(config.listen.ip()),
            Arc::new(EngineBridge {
                state: Arc::clone(&state),
            }),
        )
        .await?;
        state.core.lock().await.set_datagram_sender(engine.sender());

        let ws = match config.ws_listen {
            Some(addr) => {
                let listener = Filter::local_port(addr.port())
                    .with_local_ip(addr.ip())
                    .with_reuse_addr(true)
                    .bind_tcp()?;
                info!("websocket listening on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        let wss = match config.wss_listen {
            Some(addr) => match websocket::load_tls(&config.tls_cert, &config.tls_key) {
                Ok(acceptor) => {
                    let listener = Filter::local_port(addr.port())
                        .with_local_ip(addr.ip())
                        .with_reuse_addr(true)
                        .bind_tcp()?;
                    info!("secure websocket listening on {}", listener.local_addr()?);
                    Some((listener, acceptor))
                }
                Err(e) => {
                    warn!("secure websocket listener skipped: {e}");
                    state.hooks.on_error(&e);
                    None
                }
            },
            None => None,
        };

        info!(
            "relay listening on {tcp_addr} (tcp) and {} (udp)",
            engine.local_addr()
        );
        Ok(Self {
            state,
            tcp,
            engine,
            ws,
            wss,
        })
    }

    /// The main (TCP) listener address.
    ///
    /// # Panics
    ///
    /// Panics if the listener has lost its local address, which only
    /// happens when the socket is already dead.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr().expect("listener has a local address")
    }

    /// The datagram listener address.
    #[must_use]
    pub fn udp_local_addr(&self) -> SocketAddr {
        self.engine.local_addr()
    }

    /// The plain websocket listener address, when configured.
    #[must_use]
    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// The secure websocket listener address, when configured and the
    /// certificate loaded.
    #[must_use]
    pub fn wss_local_addr(&self) -> Option<SocketAddr> {
        self.wss.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    /// A handle for host-side control (shutdown, deferred approvals).
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// The shared state; exposed for embedding hosts and tests.
    #[must_use]
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Runs until [`ServerHandle::shutdown`] is called or the main
    /// listener dies, then drains: disconnects every client, unhosts
    /// the datagram engine, and logs the lifetime totals.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable listener failure.
    pub async fn run(self) -> Result<(), RelayError> {
        let Self {
            state,
            tcp,
            engine,
            ws,
            wss,
        } = self;

        if let Some(listener) = ws {
            tokio::spawn(websocket::run_listener(listener, None, Arc::clone(&state)));
        }
        if let Some((listener, acceptor)) = wss {
            tokio::spawn(websocket::run_listener(
                listener,
                Some(acceptor),
                Arc::clone(&state),
            ));
        }
        let ticker = timer::spawn(Arc::clone(&state));

        loop {
            let accepted = tokio::select! {
                () = state.shutdown.cancelled() => break,
                accepted = tcp.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if state.core.lock().await.client_count() >= state.config.max_conns {
                        warn!("max connections reached, rejecting {addr}");
                        drop(stream);
                        continue;
                    }
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(TcpTransport::new(stream), addr, StreamKind::Tcp, state)
                                .await
                        {
                            debug!("connection from {addr} closed: {e}");
                        }
                    });
                }
                Err(e) => error!("failed to accept connection: {e}"),
            }
        }

        {
            let mut core = state.core.lock().await;
            core.close_all();
            core.log_summary();
        }
        let _ = ticker.await;
        engine.unhost().await;
        Ok(())
    }
}

/// Cloneable host-side control handle.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// Begins shutdown; [`Server::run`] returns after draining.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Answers a deferred connect decision; `None` accepts. Returns
    /// `false` when the client is no longer waiting.
    pub async fn connect_response(&self, token: ConnToken, deny: Option<String>) -> bool {
        self.state.core.lock().await.connect_response(token, deny)
    }

    /// Disconnects a client; a no-op when it is already gone.
    pub async fn disconnect(&self, id: ClientId) {
        self.state.core.lock().await.disconnect(id);
    }

    /// Number of fully-accepted clients.
    pub async fn client_count(&self) -> usize {
        self.state.core.lock().await.client_count()
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.state.core.lock().await.channel_count()
    }
}
