//! Declarative bind/accept policy for server sockets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket, UdpSocket};

use crate::error::RelayError;

/// Address family pin for a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

/// A declarative socket policy: where to bind and which remote
/// endpoints to accept traffic from.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    local_ip: Option<IpAddr>,
    local_port: u16,
    remote: Option<SocketAddr>,
    family: Option<AddressFamily>,
    reuse_addr: bool,
}

impl Filter {
    /// A filter binding the given local port on all interfaces.
    #[must_use]
    pub fn local_port(port: u16) -> Self {
        Self {
            local_port: port,
            ..Self::default()
        }
    }

    /// Pins the local bind address (and implicitly the family).
    #[must_use]
    pub fn with_local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    /// Restricts accepted traffic to one remote endpoint. A restriction
    /// port of 0 matches any source port on that address.
    #[must_use]
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Pins the address family.
    #[must_use]
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = Some(family);
        self
    }

    /// Requests `SO_REUSEADDR` on the bound socket.
    #[must_use]
    pub fn with_reuse_addr(mut self, reuse: bool) -> Self {
        self.reuse_addr = reuse;
        self
    }

    /// The configured remote restriction, if any.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Whether `addr` passes the remote restriction.
    #[must_use]
    pub fn matches_remote(&self, addr: &SocketAddr) -> bool {
        match self.remote {
            None => true,
            Some(r) => r.ip() == addr.ip() && (r.port() == 0 || r.port() == addr.port()),
        }
    }

    /// Resolves the effective local bind address.
    ///
    /// # Errors
    ///
    /// Returns a [`RelayError::BadAddress`] when the family pin
    /// contradicts the pinned local address.
    pub fn bind_addr(&self) -> Result<SocketAddr, RelayError> {
        let ip = match (self.local_ip, self.family) {
            (Some(ip @ IpAddr::V4(_)), None | Some(AddressFamily::V4)) => ip,
            (Some(ip @ IpAddr::V6(_)), None | Some(AddressFamily::V6)) => ip,
            (Some(ip), Some(_)) => {
                return Err(RelayError::BadAddress(format!(
                    "local address {ip} contradicts the pinned address family"
                )))
            }
            (None, Some(AddressFamily::V6)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            (None, _) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(ip, self.local_port))
    }

    /// Binds a TCP listener according to this filter.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BadAddress`] for a contradictory filter
    /// or [`RelayError::Transport`] when binding fails.
    pub fn bind_tcp(&self) -> Result<TcpListener, RelayError> {
        let addr = self.bind_addr()?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if self.reuse_addr {
            socket.set_reuseaddr(true)?;
        }
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }

    /// Binds a UDP socket according to this filter.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BadAddress`] for a contradictory filter
    /// or [`RelayError::Transport`] when binding fails.
    pub async fn bind_udp(&self) -> Result<UdpSocket, RelayError> {
        let addr = self.bind_addr()?;
        Ok(UdpSocket::bind(addr).await?)
    }
}
