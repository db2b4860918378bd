use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "conflux-server")]
#[command(about = "Conflux relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on (TCP and UDP share the port).
    #[arg(long, default_value = "0.0.0.0:6121", env = "CONFLUX_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the plain websocket listener.
    #[arg(long, env = "CONFLUX_WS_LISTEN")]
    pub ws_listen: Option<SocketAddr>,
    /// Socket address for the TLS websocket listener.
    #[arg(long, env = "CONFLUX_WSS_LISTEN")]
    pub wss_listen: Option<SocketAddr>,
    /// Path to the PEM certificate chain for the TLS listener.
    #[arg(long, default_value = "./fullchain.pem", env = "CONFLUX_TLS_CERT")]
    pub tls_cert: PathBuf,
    /// Path to the PEM private key for the TLS listener.
    #[arg(long, default_value = "./privkey.pem", env = "CONFLUX_TLS_KEY")]
    pub tls_key: PathBuf,
    /// Welcome text sent to every accepted client.
    #[arg(
        long,
        default_value = "Connected to a Conflux relay server.",
        env = "CONFLUX_WELCOME"
    )]
    pub welcome: String,
    /// Per-client upload cap in bytes per second (unset = no cap).
    #[arg(long, env = "CONFLUX_UPLOAD_CAP")]
    pub upload_cap: Option<u64>,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "CONFLUX_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "CONFLUX_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Seconds a connection may sit without completing the handshake.
    #[arg(long, default_value = "30", env = "CONFLUX_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Seconds of idleness between server pings.
    #[arg(long, default_value = "30", env = "CONFLUX_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Seconds without any inbound traffic before disconnecting.
    #[arg(long, default_value = "60", env = "CONFLUX_PONG_TIMEOUT")]
    pub pong_timeout: u64,
    /// Codepoint allow-list for client names.
    #[arg(long, default_value = "L*,M*,N*,P*,32", env = "CONFLUX_NAME_CODEPOINTS")]
    pub name_codepoints: String,
    /// Codepoint allow-list for channel names.
    #[arg(long, default_value = "L*,M*,N*,P*,32", env = "CONFLUX_CHANNEL_CODEPOINTS")]
    pub channel_codepoints: String,
    /// Codepoint allow-list for message text sent to the server.
    #[arg(
        long,
        default_value = "L*,M*,N*,P*,32",
        env = "CONFLUX_SERVER_MESSAGE_CODEPOINTS"
    )]
    pub server_message_codepoints: String,
    /// Codepoint allow-list for message text forwarded to clients
    /// (unset = no filtering).
    #[arg(long, env = "CONFLUX_CLIENT_MESSAGE_CODEPOINTS")]
    pub client_message_codepoints: Option<String>,
}

/// Runtime server configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on (TCP and UDP share the port).
    pub listen: SocketAddr,
    /// Plain websocket listener, if any.
    pub ws_listen: Option<SocketAddr>,
    /// TLS websocket listener, if any.
    pub wss_listen: Option<SocketAddr>,
    /// PEM certificate chain path.
    pub tls_cert: PathBuf,
    /// PEM private key path.
    pub tls_key: PathBuf,
    /// Welcome text sent to every accepted client.
    pub welcome: String,
    /// Per-client upload cap in bytes per second.
    pub upload_cap: Option<u64>,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Handshake timeout in seconds.
    pub handshake_timeout: u64,
    /// Ping interval in seconds.
    pub ping_interval: u64,
    /// Pong timeout in seconds.
    pub pong_timeout: u64,
    /// Allow-list specification for client names.
    pub name_codepoints: String,
    /// Allow-list specification for channel names.
    pub channel_codepoints: String,
    /// Allow-list specification for server-bound message text.
    pub server_message_codepoints: String,
    /// Allow-list specification for client-bound message text.
    pub client_message_codepoints: Option<String>,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending value.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.upload_cap == Some(0) {
            return Err("upload_cap must be greater than 0 when set".to_string());
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.pong_timeout < self.ping_interval {
            return Err("pong_timeout must be at least ping_interval".to_string());
        }
        if self.pong_timeout > 86_400 {
            return Err("pong_timeout exceeds reasonable limit (86400 seconds)".to_string());
        }

        if self.welcome.len() > 512 {
            return Err("welcome message exceeds 512 bytes".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            ws_listen: args.ws_listen,
            wss_listen: args.wss_listen,
            tls_cert: args.tls_cert,
            tls_key: args.tls_key,
            welcome: args.welcome,
            upload_cap: args.upload_cap,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            handshake_timeout: args.handshake_timeout,
            ping_interval: args.ping_interval,
            pong_timeout: args.pong_timeout,
            name_codepoints: args.name_codepoints,
            channel_codepoints: args.channel_codepoints,
            server_message_codepoints: args.server_message_codepoints,
            client_message_codepoints: args.client_message_codepoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:6121".parse().unwrap(),
            ws_listen: None,
            wss_listen: None,
            tls_cert: "./fullchain.pem".into(),
            tls_key: "./privkey.pem".into(),
            welcome: "hello".into(),
            upload_cap: None,
            max_conns: 1000,
            max_conns_ip: 10,
            handshake_timeout: 30,
            ping_interval: 30,
            pong_timeout: 60,
            name_codepoints: "L*,M*,N*,P*,32".into(),
            channel_codepoints: "L*,M*,N*,P*,32".into(),
            server_message_codepoints: "L*,M*,N*,P*,32".into(),
            client_message_codepoints: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn max_conns_zero() {
        let mut c = valid_config();
        c.max_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn max_conns_ip_exceeds_max_conns() {
        let mut c = valid_config();
        c.max_conns_ip = c.max_conns + 1;
        assert!(c.validate().unwrap_err().contains("max_conns_ip"));
    }

    #[test]
    fn upload_cap_zero_rejected() {
        let mut c = valid_config();
        c.upload_cap = Some(0);
        assert!(c.validate().unwrap_err().contains("upload_cap"));
    }

    #[test]
    fn handshake_timeout_bounds() {
        let mut c = valid_config();
        c.handshake_timeout = 0;
        assert!(c.validate().unwrap_err().contains("handshake_timeout"));
        c.handshake_timeout = 301;
        assert!(c.validate().unwrap_err().contains("handshake_timeout"));
    }

    #[test]
    fn pong_timeout_must_cover_ping_interval() {
        let mut c = valid_config();
        c.ping_interval = 30;
        c.pong_timeout = 29;
        assert!(c.validate().unwrap_err().contains("pong_timeout"));
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.max_conns = 1;
        c.max_conns_ip = 1;
        c.handshake_timeout = 1;
        c.ping_interval = 1;
        c.pong_timeout = 1;
        assert!(c.validate().is_ok());
    }
}
