/// Mixer connectivity: subnet discovery and a self-healing TCP session to a
/// CQ mixer.
///
/// - `discovery`: finds the mixer by probing a subnet, and keeps watching
///   for it to move.
/// - `connection`: owns the single TCP session (connect with retry,
///   keepalive, reconnect on failure, serialized sends).
/// - `settings` / `config`: typed settings and the TOML sections that
///   produce them.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod probe;
pub mod settings;
pub mod subnet;

pub use connection::{ConnectionManager, Connector, MixerStream, TcpConnector};
pub use discovery::{DiscoveryResult, DiscoveryScanner};
pub use probe::{DeviceProbe, TcpProbe};
pub use settings::{DiscoverySettings, LinkSettings, SubnetSetting};
pub use subnet::{resolve_local_subnet, Subnet};

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Candidate or active mixer location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Lifecycle of the mixer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no attempt in progress
    Disconnected,
    /// Resolving the address and opening the socket
    Connecting,
    /// Session open; keepalive running and sends permitted
    Connected,
    /// Session lost, stale socket being torn down
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}
