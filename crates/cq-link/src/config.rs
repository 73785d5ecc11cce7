/// TOML sections understood by the connectivity core, and their validation
/// into [`LinkSettings`].
///
/// ```toml
/// [network]
/// mixer_ip = "192.168.1.50"   # omit to discover the mixer
/// mixer_port = 51325
/// keepalive_interval_ms = 300
/// connection_timeout_ms = 5000
/// reconnect_delay_ms = 2000
///
/// [discovery]
/// enabled = true
/// subnet = "auto"             # or CIDR, e.g. "10.0.0.0/24"
/// check_interval_secs = 30
/// scan_interval_secs = 300
/// probe_timeout_ms = 500
/// verify_window_ms = 500
/// concurrency = 20
///
/// [advanced]
/// midi_channel = 0
/// send_delay_ms = 10
/// buffer_flush = true
/// ```

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use serde::Deserialize;

use cq_protocol::{DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_MIXER_PORT, MAX_CHANNEL};

use crate::settings::{DiscoverySettings, LinkSettings, SubnetSetting};
use crate::subnet::{Subnet, MIN_SCAN_PREFIX};

/// The link-related part of a configuration file. Unknown sections are
/// ignored so binaries can share one file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub advanced: AdvancedSection,
}

impl LinkConfig {
    pub fn settings(&self) -> anyhow::Result<LinkSettings> {
        build_settings(&self.network, &self.discovery, &self.advanced)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub mixer_ip: Option<String>,
    #[serde(default = "default_mixer_port")]
    pub mixer_port: u16,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            mixer_ip: None,
            mixer_port: default_mixer_port(),
            keepalive_interval_ms: default_keepalive_interval(),
            connection_timeout_ms: default_connection_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_subnet")]
    pub subnet: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_verify_window")]
    pub verify_window_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            subnet: default_subnet(),
            check_interval_secs: default_check_interval(),
            scan_interval_secs: default_scan_interval(),
            probe_timeout_ms: default_probe_timeout(),
            verify_window_ms: default_verify_window(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvancedSection {
    #[serde(default)]
    pub midi_channel: u8,
    #[serde(default = "default_send_delay")]
    pub send_delay_ms: u64,
    #[serde(default = "default_true")]
    pub buffer_flush: bool,
}

impl Default for AdvancedSection {
    fn default() -> Self {
        Self {
            midi_channel: 0,
            send_delay_ms: default_send_delay(),
            buffer_flush: true,
        }
    }
}

fn default_mixer_port() -> u16 { DEFAULT_MIXER_PORT }
fn default_keepalive_interval() -> u64 { DEFAULT_KEEPALIVE_INTERVAL_MS }
fn default_connection_timeout() -> u64 { 5000 }
fn default_reconnect_delay() -> u64 { 2000 }
fn default_subnet() -> String { "auto".to_string() }
fn default_check_interval() -> u64 { 30 }
fn default_scan_interval() -> u64 { 300 }
fn default_probe_timeout() -> u64 { 500 }
fn default_verify_window() -> u64 { 500 }
fn default_concurrency() -> usize { 20 }
fn default_send_delay() -> u64 { 10 }
fn default_true() -> bool { true }

/// Validate the raw sections into settings the core can use unchecked.
pub fn build_settings(
    network: &NetworkSection,
    discovery: &DiscoverySection,
    advanced: &AdvancedSection,
) -> anyhow::Result<LinkSettings> {
    let mixer_ip = match network.mixer_ip.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(ip) => Some(
            ip.parse::<Ipv4Addr>()
                .with_context(|| format!("network.mixer_ip '{ip}' is not an IPv4 address"))?,
        ),
    };

    ensure!(network.mixer_port != 0, "network.mixer_port must be non-zero");
    ensure!(
        network.keepalive_interval_ms > 0,
        "network.keepalive_interval_ms must be greater than zero"
    );
    ensure!(
        network.connection_timeout_ms > 0,
        "network.connection_timeout_ms must be greater than zero"
    );
    ensure!(
        network.reconnect_delay_ms > 0,
        "network.reconnect_delay_ms must be greater than zero"
    );
    ensure!(
        advanced.midi_channel <= MAX_CHANNEL,
        "advanced.midi_channel {} is out of range (0-15)",
        advanced.midi_channel
    );

    // A static address always wins; discovery is only set up without one.
    let discovery = match (mixer_ip, discovery.enabled) {
        (Some(_), _) => None,
        (None, false) => {
            bail!("network.mixer_ip is not set and discovery is disabled; nothing to connect to")
        }
        (None, true) => Some(discovery_settings(discovery)?),
    };

    Ok(LinkSettings {
        mixer_ip,
        mixer_port: network.mixer_port,
        keepalive_interval: Duration::from_millis(network.keepalive_interval_ms),
        connection_timeout: Duration::from_millis(network.connection_timeout_ms),
        reconnect_delay: Duration::from_millis(network.reconnect_delay_ms),
        midi_channel: advanced.midi_channel,
        send_delay: Duration::from_millis(advanced.send_delay_ms),
        buffer_flush: advanced.buffer_flush,
        discovery,
    })
}

/// Validate `[discovery]` on its own, whether or not a static address
/// makes the link skip it.
pub fn discovery_settings(section: &DiscoverySection) -> anyhow::Result<DiscoverySettings> {
    Ok(DiscoverySettings {
        subnet: parse_subnet_setting(&section.subnet)?,
        check_interval: positive_secs(
            section.check_interval_secs,
            "discovery.check_interval_secs",
        )?,
        scan_interval: positive_secs(section.scan_interval_secs, "discovery.scan_interval_secs")?,
        probe_timeout: positive_ms(section.probe_timeout_ms, "discovery.probe_timeout_ms")?,
        verify_window: positive_ms(section.verify_window_ms, "discovery.verify_window_ms")?,
        concurrency: {
            ensure!(section.concurrency > 0, "discovery.concurrency must be at least 1");
            section.concurrency
        },
    })
}

/// Parse `"auto"` or a CIDR block no wider than a /16.
pub fn parse_subnet_setting(raw: &str) -> anyhow::Result<SubnetSetting> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("auto") {
        return Ok(SubnetSetting::Auto);
    }
    let subnet: Subnet = raw
        .parse()
        .map_err(|e| anyhow::anyhow!("discovery.subnet: {e}"))?;
    ensure!(
        subnet.prefix() >= MIN_SCAN_PREFIX,
        "discovery.subnet {subnet} is too large to scan \
         (prefix must be /{MIN_SCAN_PREFIX} or longer)"
    );
    Ok(SubnetSetting::Fixed(subnet))
}

fn positive_secs(value: u64, name: &str) -> anyhow::Result<Duration> {
    ensure!(value > 0, "{name} must be greater than zero");
    Ok(Duration::from_secs(value))
}

fn positive_ms(value: u64, name: &str) -> anyhow::Result<Duration> {
    ensure!(value > 0, "{name} must be greater than zero");
    Ok(Duration::from_millis(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> LinkConfig {
        toml::from_str(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_empty_file_means_discovery_with_defaults() {
        let settings = parse("").settings().unwrap();
        assert!(settings.mixer_ip.is_none());
        assert_eq!(settings.mixer_port, 51325);
        assert_eq!(settings.keepalive_interval, Duration::from_millis(300));

        let discovery = settings.discovery.expect("discovery enabled by default");
        assert_eq!(discovery.subnet, SubnetSetting::Auto);
        assert_eq!(discovery.concurrency, 20);
        assert_eq!(discovery.check_interval, Duration::from_secs(30));
        assert_eq!(discovery.scan_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_static_address_disables_discovery() {
        let config = parse(
            r#"
            [network]
            mixer_ip = "192.168.1.50"
            reconnect_delay_ms = 750

            [advanced]
            midi_channel = 3
            "#,
        );
        let settings = config.settings().unwrap();
        assert_eq!(settings.mixer_ip, Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(settings.reconnect_delay, Duration::from_millis(750));
        assert_eq!(settings.midi_channel, 3);
        assert!(settings.discovery.is_none());
    }

    #[test]
    fn test_fixed_subnet() {
        let config = parse(
            r#"
            [discovery]
            subnet = "10.0.0.0/24"
            concurrency = 8
            "#,
        );
        let discovery = config.settings().unwrap().discovery.unwrap();
        assert_eq!(
            discovery.subnet,
            SubnetSetting::Fixed("10.0.0.0/24".parse().unwrap())
        );
        assert_eq!(discovery.concurrency, 8);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let bad = [
            "[network]\nmixer_ip = \"mixer.local\"",
            "[network]\nkeepalive_interval_ms = 0",
            "[advanced]\nmidi_channel = 16",
            "[discovery]\nenabled = false",
            "[discovery]\nsubnet = \"10.0.0.0/8\"",
            "[discovery]\nsubnet = \"not-a-subnet\"",
            "[discovery]\nconcurrency = 0",
        ];
        for case in bad {
            assert!(parse(case).settings().is_err(), "should reject: {case}");
        }
    }

    #[test]
    fn test_discovery_section_validates_on_its_own() {
        let config = parse(
            r#"
            [network]
            mixer_ip = "192.168.1.50"

            [discovery]
            subnet = "10.1.0.0/16"
            probe_timeout_ms = 150
            "#,
        );
        assert!(config.settings().unwrap().discovery.is_none());

        let discovery = discovery_settings(&config.discovery).unwrap();
        assert_eq!(discovery.probe_timeout, Duration::from_millis(150));
        assert_eq!(
            discovery.subnet,
            SubnetSetting::Fixed("10.1.0.0/16".parse().unwrap())
        );
        assert!(discovery_settings(&parse("[discovery]\nconcurrency = 0").discovery).is_err());
    }

    #[test]
    fn test_blank_mixer_ip_is_treated_as_unset() {
        let settings = parse("[network]\nmixer_ip = \"\"").settings().unwrap();
        assert!(settings.mixer_ip.is_none());
        assert!(settings.discovery.is_some());
    }
}
