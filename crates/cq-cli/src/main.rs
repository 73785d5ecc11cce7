use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use cq_bridge::config::MidiInputSection;
use cq_link::config::{discovery_settings, parse_subnet_setting, LinkConfig};
use cq_link::{ConnectionManager, DiscoveryScanner, DiscoverySettings, Endpoint, LinkSettings};
use cq_protocol::{
    ParameterAddress, ProtocolMessage, KEEPALIVE_BYTE, MAX_DATA_BYTE, MAX_NRPN_VALUE,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_WINDOW: Duration = Duration::from_secs(1);
/// Upper bound on discovery plus connect for one-shot commands.
const SESSION_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "cq", about = "CQ mixer link diagnostics")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Bridge configuration file; the network and MIDI input sections are
    /// read
    #[arg(short, long, default_value = "config/bridge.toml", global = true)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a TCP session, send one keepalive and show any reply
    TestConnection {
        /// Mixer address (defaults to network.mixer_ip)
        #[arg(long)]
        ip: Option<Ipv4Addr>,
        /// Mixer port (defaults to network.mixer_port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Scan a subnet for the mixer
    Scan {
        /// "auto" or CIDR (defaults to discovery.subnet)
        #[arg(long)]
        subnet: Option<String>,
    },
    /// Send one NRPN parameter change
    Nrpn {
        /// Parameter MSB, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_byte)]
        msb: u8,
        /// Parameter LSB, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_byte)]
        lsb: u8,
        /// 14-bit value (0-16383)
        #[arg(long)]
        value: u16,
        /// Mixer address (skips discovery)
        #[arg(long)]
        ip: Option<Ipv4Addr>,
    },
    /// Press and release a soft key
    SoftKey {
        /// Note assigned to the soft key, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_byte)]
        note: u8,
        /// Mixer address (skips discovery)
        #[arg(long)]
        ip: Option<Ipv4Addr>,
    },
    /// List MIDI inputs and print what the foot controller sends
    MidiMonitor {
        /// Exact port name (defaults to midi_input.port, then the name
        /// patterns)
        #[arg(long)]
        port: Option<String>,
    },
}

/// The parts of the bridge file the CLI reads.
#[derive(Debug, Clone, Default, Deserialize)]
struct CliConfig {
    #[serde(flatten)]
    link: LinkConfig,
    #[serde(default)]
    midi_input: MidiInputSection,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args.config)?;
    let network = &config.link.network;

    match args.command {
        Commands::TestConnection { ip, port } => {
            let configured: Option<Ipv4Addr> =
                network.mixer_ip.as_deref().and_then(|s| s.trim().parse().ok());
            let ip = ip
                .or(configured)
                .context("no mixer address: pass --ip or set network.mixer_ip")?;
            let endpoint = Endpoint::new(ip, port.unwrap_or(network.mixer_port));
            if !test_connection(endpoint).await? {
                bail!("connection test failed");
            }
        }
        Commands::Scan { subnet } => {
            let settings = scan_settings(&config.link, subnet.as_deref())?;
            let target = settings.subnet.resolve();
            let scanner = DiscoveryScanner::with_tcp_probe(settings, network.mixer_port);

            println!("Mixer Scan");
            println!("══════════════════════════════");
            println!("  Subnet:  {target} ({} hosts)", target.host_count());
            match scanner.scan_subnet(target).await {
                Some(endpoint) => println!("  Found:   {endpoint}"),
                None => {
                    println!("  No mixer found");
                    bail!("no mixer on {target}");
                }
            }
        }
        Commands::Nrpn { msb, lsb, value, ip } => {
            let address = ParameterAddress::new(msb, lsb);
            ensure!(address.is_valid(), "parameter {address} has a byte above 0x7F");
            ensure!(value <= MAX_NRPN_VALUE, "value {value} exceeds 16383");

            let settings = one_shot_settings(&config.link, ip)?;
            let message =
                ProtocolMessage::parameter_change(address, value, settings.midi_channel);
            send_once(settings, message).await?;
            println!("  Sent NRPN {address} = {value}");
        }
        Commands::SoftKey { note, ip } => {
            ensure!(note <= MAX_DATA_BYTE, "note {note} is above 127");

            let settings = one_shot_settings(&config.link, ip)?;
            let message = ProtocolMessage::trigger(note, settings.midi_channel);
            send_once(settings, message).await?;
            println!("  Sent soft key {note:#04X}");
        }
        Commands::MidiMonitor { port } => {
            let mut section = config.midi_input.clone();
            if let Some(port) = port {
                section.port = port;
            }
            midi_monitor(&section).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<CliConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "No config file found, using defaults");
        return Ok(CliConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

/// `[discovery]` as configured, even when `network.mixer_ip` makes the
/// bridge skip it. `--subnet` replaces only the subnet.
fn scan_settings(config: &LinkConfig, subnet: Option<&str>) -> anyhow::Result<DiscoverySettings> {
    let mut settings = discovery_settings(&config.discovery)?;
    if let Some(raw) = subnet {
        settings.subnet = parse_subnet_setting(raw)?;
    }
    Ok(settings)
}

/// Settings from the file, with `--ip` replacing both the configured
/// address and discovery.
fn one_shot_settings(config: &LinkConfig, ip: Option<Ipv4Addr>) -> anyhow::Result<LinkSettings> {
    let mut config = config.clone();
    if let Some(ip) = ip {
        config.network.mixer_ip = Some(ip.to_string());
    }
    config.settings()
}

async fn send_once(settings: LinkSettings, message: ProtocolMessage) -> anyhow::Result<()> {
    let link = ConnectionManager::new(settings);

    println!("Mixer Command");
    println!("══════════════════════════════");
    let connected = timeout(SESSION_DEADLINE, link.connect()).await;
    let result = match connected {
        Ok(Ok(())) => {
            if let Some(endpoint) = link.current_endpoint() {
                println!("  Mixer:   {endpoint}");
            }
            if link.send_message(&message).await {
                Ok(())
            } else {
                Err(anyhow::anyhow!("mixer dropped the session while sending"))
            }
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!(
            "mixer not reachable within {}s",
            SESSION_DEADLINE.as_secs()
        )),
    };

    link.shutdown().await;
    result
}

async fn test_connection(endpoint: Endpoint) -> anyhow::Result<bool> {
    println!("Connection Test");
    println!("══════════════════════════════");
    println!("  Mixer:   {endpoint}");

    let connecting = TcpStream::connect(endpoint.socket_addr());
    let mut stream = match timeout(CONNECT_TIMEOUT, connecting).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            println!("  Connection failed: {e}");
            return Ok(false);
        }
        Err(_) => {
            println!("  Connection timed out after {}s", CONNECT_TIMEOUT.as_secs());
            return Ok(false);
        }
    };
    println!("  Connected");

    stream.write_all(&[KEEPALIVE_BYTE]).await?;
    println!("  Keepalive sent");

    let mut buf = [0u8; 1024];
    match timeout(REPLY_WINDOW, stream.read(&mut buf)).await {
        Ok(Ok(0)) => println!("  Peer closed the connection"),
        Ok(Ok(n)) => println!("  Received {n} bytes: {}", hex(&buf[..n])),
        Ok(Err(e)) => println!("  Read error: {e}"),
        Err(_) => println!("  No immediate reply (normal for a CQ mixer)"),
    }

    let _ = stream.shutdown().await;
    println!("  Passed");
    Ok(true)
}

#[cfg(feature = "midi-input")]
async fn midi_monitor(section: &MidiInputSection) -> anyhow::Result<()> {
    use cq_bridge::midi_input::{input_port_names, open_monitor};
    use tokio::sync::mpsc;

    println!("MIDI Monitor");
    println!("══════════════════════════════");
    let names = input_port_names()?;
    if names.is_empty() {
        println!("  No MIDI input ports");
        bail!("no MIDI input ports; check the controller is paired and powered on");
    }
    for (i, name) in names.iter().enumerate() {
        println!("  {i}: {name}");
    }

    let (tx, mut messages) = mpsc::unbounded_channel();
    let input = open_monitor(section, tx)?;
    println!("  Listening on {} (Ctrl-C to stop)", input.port_name);
    println!();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            message = messages.recv() => match message {
                Some(message) => println!("  {message}"),
                None => bail!("MIDI port {} closed", input.port_name),
            },
        }
    }
    Ok(())
}

#[cfg(not(feature = "midi-input"))]
async fn midi_monitor(_section: &MidiInputSection) -> anyhow::Result<()> {
    bail!("cq was built without the midi-input feature")
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_byte(raw: &str) -> Result<u8, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(digits) => u8::from_str_radix(digits, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("'{raw}' is not a byte: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte() {
        assert_eq!(parse_byte("48"), Ok(48));
        assert_eq!(parse_byte("0x30"), Ok(0x30));
        assert_eq!(parse_byte("0X7f"), Ok(0x7F));
        assert!(parse_byte("0x100").is_err());
        assert!(parse_byte("foot").is_err());
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0xB0, 0x63, 0x05]), "B0 63 05");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn test_ip_override_disables_discovery() {
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        let settings = one_shot_settings(&LinkConfig::default(), Some(ip)).unwrap();
        assert_eq!(settings.mixer_ip, Some(ip));
        assert!(settings.discovery.is_none());
    }

    const BRIDGE_FILE: &str = r#"
        [network]
        mixer_ip = "192.168.1.50"

        [discovery]
        subnet = "10.2.0.0/24"
        concurrency = 5
        probe_timeout_ms = 120

        [midi_input]
        port = "FootCtl:0"

        [buttons]
        recording = 64
    "#;

    #[test]
    fn test_config_reads_link_and_midi_sections() {
        let config: CliConfig = toml::from_str(BRIDGE_FILE).unwrap();
        assert_eq!(config.link.network.mixer_ip.as_deref(), Some("192.168.1.50"));
        assert_eq!(config.link.discovery.concurrency, 5);
        assert_eq!(config.midi_input.port, "FootCtl:0");
        assert_eq!(config.midi_input.name_patterns.len(), 3);
    }

    #[test]
    fn test_scan_keeps_discovery_section_with_static_address() {
        let config: CliConfig = toml::from_str(BRIDGE_FILE).unwrap();

        let settings = scan_settings(&config.link, None).unwrap();
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.probe_timeout, Duration::from_millis(120));
        assert_eq!(settings.subnet.resolve().to_string(), "10.2.0.0/24");

        let settings = scan_settings(&config.link, Some("192.168.7.0/24")).unwrap();
        assert_eq!(settings.subnet.resolve().to_string(), "192.168.7.0/24");
        assert_eq!(settings.concurrency, 5);

        assert!(scan_settings(&config.link, Some("10.0.0.0/8")).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let args = Args::try_parse_from([
            "cq", "nrpn", "--msb", "0x5A", "--lsb", "16", "--value", "200",
        ])
        .unwrap();
        match args.command {
            Commands::Nrpn { msb, lsb, value, ip } => {
                assert_eq!((msb, lsb, value, ip), (0x5A, 16, 200, None));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = Args::try_parse_from(["cq", "midi-monitor", "--port", "FootCtl:0"]).unwrap();
        match args.command {
            Commands::MidiMonitor { port } => assert_eq!(port.as_deref(), Some("FootCtl:0")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut byte = [0u8; 1];
            socket.read_exact(&mut byte).await.unwrap();
            byte[0]
        });

        assert!(test_connection(Endpoint::new(Ipv4Addr::LOCALHOST, port)).await.unwrap());
        assert_eq!(server.await.unwrap(), KEEPALIVE_BYTE);
    }
}
