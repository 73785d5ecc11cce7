/// IPv4 CIDR blocks and local-subnet detection for discovery scans.

use std::fmt;
use std::net::{Ipv4Addr, UdpSocket};
use std::str::FromStr;

use tracing::{debug, warn};

/// Subnet scanned when the local interface cannot be determined.
pub const FALLBACK_SUBNET: Subnet = Subnet {
    network: Ipv4Addr::new(192, 168, 1, 0),
    prefix: 24,
};

/// Narrowest prefix we are willing to scan (65534 hosts).
pub const MIN_SCAN_PREFIX: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Build a subnet from any address inside it. Host bits are masked off.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        let network = u32::from(address) & Self::mask_for(prefix);
        Some(Self {
            network: Ipv4Addr::from(network),
            prefix,
        })
    }

    /// The /24 containing `address`.
    pub fn slash24(address: Ipv4Addr) -> Self {
        let [a, b, c, _] = address.octets();
        Self {
            network: Ipv4Addr::new(a, b, c, 0),
            prefix: 24,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Usable host addresses in ascending order. Network and broadcast
    /// addresses are skipped except for /31 and /32, where every address is
    /// a host.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.network) as u64;
        let size = 1u64 << (32 - self.prefix as u32);
        let (start, end) = if self.prefix >= 31 {
            (base, base + size)
        } else {
            (base + 1, base + size - 1)
        };
        (start..end).map(|ip| Ipv4Addr::from(ip as u32))
    }

    pub fn host_count(&self) -> usize {
        let size = 1usize << (32 - self.prefix as u32);
        if self.prefix >= 31 {
            size
        } else {
            size - 2
        }
    }

    fn mask_for(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("'{s}' is not in CIDR notation (a.b.c.d/prefix)"))?;
        let address: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("invalid subnet address '{addr}': {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid prefix length '{prefix}': {e}"))?;
        Subnet::new(address, prefix).ok_or_else(|| format!("prefix length {prefix} exceeds 32"))
    }
}

/// Best-effort detection of the local /24.
///
/// "Connects" a UDP socket towards a public address so the OS picks the
/// outbound interface; no packet is sent. Falls back to [`FALLBACK_SUBNET`].
pub fn resolve_local_subnet() -> Subnet {
    match local_ipv4() {
        Some(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
            let subnet = Subnet::slash24(ip);
            debug!(local_ip = %ip, subnet = %subnet, "Resolved local subnet");
            subnet
        }
        other => {
            warn!(
                local_ip = ?other,
                fallback = %FALLBACK_SUBNET,
                "Could not determine local subnet, using fallback"
            );
            FALLBACK_SUBNET
        }
    }
}

fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}
