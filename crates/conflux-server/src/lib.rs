//! Conflux relay server: channel-based client-to-client message
//! relaying over TCP, UDP and websockets.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Connect-time admission policy and the escalating ban list.
pub mod admission;
/// Codepoint allow-lists for names and user text.
pub mod allowlist;
/// Channel state.
pub mod channel;
/// Per-client state.
pub mod client;
/// CLI argument parsing and server configuration.
pub mod config;
/// Per-connection lifecycle and stream transports.
pub mod connection;
/// Error types for relay server operations.
pub mod error;
/// Declarative socket bind/accept policy.
pub mod filter;
/// Host-facing hooks.
pub mod hooks;
/// Metric names recorded through the `metrics` facade.
pub mod metrics;
/// Per-client upload accounting.
pub mod ratelimit;
/// The relay core: registries, dispatch, policy enforcement.
pub mod router;
/// Listener setup, shared state, accept loop.
pub mod server;
/// Periodic maintenance tick.
pub mod timer;
/// The datagram engine.
pub mod udp;
/// Websocket listeners and TLS loading.
pub mod websocket;

pub use error::RelayError;
pub use hooks::{ConnectDecision, DefaultHooks, ServerHooks};
pub use server::{Server, ServerHandle, ServerState};
