/// Validated settings consumed by the connectivity core. Built once from the
/// configuration file (see `config`) and never looked up with defaults
/// afterwards.

use std::net::Ipv4Addr;
use std::time::Duration;

use cq_protocol::{DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_MIXER_PORT};

use crate::subnet::Subnet;

#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Static mixer address. `None` means discovery locates the mixer.
    pub mixer_ip: Option<Ipv4Addr>,
    pub mixer_port: u16,
    /// Mixer drops the session if keepalives stop; 300ms is what it expects.
    pub keepalive_interval: Duration,
    /// Bounds both TCP connect and every write.
    pub connection_timeout: Duration,
    /// Wait between failed connect cycles.
    pub reconnect_delay: Duration,
    /// MIDI channel (0-15) used for every outgoing message.
    pub midi_channel: u8,
    /// Pacing applied to the caller after each message.
    pub send_delay: Duration,
    /// Flush the socket after each message.
    pub buffer_flush: bool,
    /// Present only when discovery is in use.
    pub discovery: Option<DiscoverySettings>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            mixer_ip: None,
            mixer_port: DEFAULT_MIXER_PORT,
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            connection_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            midi_channel: 0,
            send_delay: Duration::from_millis(10),
            buffer_flush: true,
            discovery: Some(DiscoverySettings::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub subnet: SubnetSetting,
    /// How often the last known address is re-probed.
    pub check_interval: Duration,
    /// How often a full rescan runs regardless.
    pub scan_interval: Duration,
    /// Per-host TCP connect timeout.
    pub probe_timeout: Duration,
    /// How long a verified candidate must keep the connection open.
    pub verify_window: Duration,
    /// Probes in flight at once.
    pub concurrency: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            subnet: SubnetSetting::Auto,
            check_interval: Duration::from_secs(30),
            scan_interval: Duration::from_secs(300),
            probe_timeout: Duration::from_millis(500),
            verify_window: Duration::from_millis(500),
            concurrency: 20,
        }
    }
}

/// Which subnet discovery scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetSetting {
    /// The /24 of the outbound interface, resolved on every scan.
    Auto,
    Fixed(Subnet),
}

impl SubnetSetting {
    pub fn resolve(&self) -> Subnet {
        match self {
            Self::Auto => crate::subnet::resolve_local_subnet(),
            Self::Fixed(subnet) => *subnet,
        }
    }
}
