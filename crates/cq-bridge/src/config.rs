/// Bridge configuration file.
///
/// The `[network]`, `[discovery]` and `[advanced]` sections belong to the
/// link library and are validated there. Everything else describes the
/// foot controller and what its buttons do on the mixer.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, ensure, Context};
use serde::Deserialize;

use cq_link::config::{build_settings, AdvancedSection, DiscoverySection, NetworkSection};
use cq_link::LinkSettings;
use cq_protocol::{ParameterAddress, MAX_DATA_BYTE, MAX_NRPN_VALUE};

use crate::dispatcher::{AuxPreset, ButtonMap, DispatchPlan, FxMute, GroupCommand};

/// Break mode writes these to mute groups.
pub const MUTE_ON: u16 = 127;
pub const MUTE_OFF: u16 = 0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub advanced: AdvancedSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub midi_input: MidiInputSection,
    #[serde(default)]
    pub buttons: ButtonsSection,
    #[serde(default)]
    pub recording: RecordingSection,
    pub aux_monitor: Option<AuxMonitorSection>,
    pub fx_mute: Option<FxMuteSection>,
    #[serde(default)]
    pub break_mode: BreakModeSection,
    #[serde(default)]
    pub mute_groups: Vec<MuteGroupEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file rotated daily; empty logs to stdout only
    #[serde(default)]
    pub file: String,
    /// Rotated files kept besides the active one
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
            backup_count: default_backup_count(),
        }
    }
}

impl LoggingSection {
    /// Files left on disk after pruning, the active one included.
    pub fn retained_files(&self) -> usize {
        self.backup_count.saturating_add(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MidiInputSection {
    /// Exact port name; wins over the patterns when present
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_name_patterns")]
    pub name_patterns: Vec<String>,
}

impl Default for MidiInputSection {
    fn default() -> Self {
        Self {
            port: String::new(),
            name_patterns: default_name_patterns(),
        }
    }
}

/// Controller (CC or note) number of each footswitch.
#[derive(Debug, Clone, Deserialize)]
pub struct ButtonsSection {
    #[serde(default = "default_recording_button")]
    pub recording: u8,
    #[serde(default = "default_aux_monitor_button")]
    pub aux_monitor: u8,
    #[serde(default = "default_fx_mute_button")]
    pub fx_mute: u8,
    #[serde(default = "default_break_mode_button")]
    pub break_mode: u8,
}

impl Default for ButtonsSection {
    fn default() -> Self {
        Self {
            recording: default_recording_button(),
            aux_monitor: default_aux_monitor_button(),
            fx_mute: default_fx_mute_button(),
            break_mode: default_break_mode_button(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    #[serde(default = "default_soft_key_note")]
    pub soft_key_note: u8,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            soft_key_note: default_soft_key_note(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuxMonitorSection {
    pub address: ParameterAddress,
    #[serde(default = "default_aux_high")]
    pub high: u16,
    #[serde(default = "default_aux_low")]
    pub low: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FxMuteSection {
    #[serde(default = "default_fx_group")]
    pub mute_group: u8,
    #[serde(default = "default_mute_on")]
    pub on: u16,
    #[serde(default)]
    pub off: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakModeSection {
    #[serde(default)]
    pub active: GroupLists,
    #[serde(default)]
    pub inactive: GroupLists,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupLists {
    #[serde(default)]
    pub mute: Vec<u8>,
    #[serde(default)]
    pub unmute: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuteGroupEntry {
    pub group: u8,
    pub address: ParameterAddress,
}

fn default_log_level() -> String { "info".to_string() }
fn default_backup_count() -> usize { 3 }
fn default_name_patterns() -> Vec<String> {
    ["Chocolate", "M-VAVE", "Bluetooth"].map(String::from).to_vec()
}
fn default_recording_button() -> u8 { 20 }
fn default_aux_monitor_button() -> u8 { 21 }
fn default_fx_mute_button() -> u8 { 22 }
fn default_break_mode_button() -> u8 { 23 }
fn default_soft_key_note() -> u8 { 0x30 }
fn default_aux_high() -> u16 { 100 }
fn default_aux_low() -> u16 { 60 }
fn default_fx_group() -> u8 { 1 }
fn default_mute_on() -> u16 { MUTE_ON }

impl BridgeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn link_settings(&self) -> anyhow::Result<LinkSettings> {
        build_settings(&self.network, &self.discovery, &self.advanced)
    }

    /// Resolve button behaviors into the messages they send, rejecting
    /// anything the encoder would refuse.
    pub fn dispatch_plan(&self) -> anyhow::Result<DispatchPlan> {
        let buttons = ButtonMap {
            recording: self.buttons.recording,
            aux_monitor: self.buttons.aux_monitor,
            fx_mute: self.buttons.fx_mute,
            break_mode: self.buttons.break_mode,
        };
        let controllers = [
            buttons.recording,
            buttons.aux_monitor,
            buttons.fx_mute,
            buttons.break_mode,
        ];
        for controller in controllers {
            ensure!(controller <= MAX_DATA_BYTE, "buttons: controller {controller} is above 127");
        }
        ensure!(
            controllers.iter().collect::<HashSet<_>>().len() == controllers.len(),
            "buttons: each footswitch needs its own controller number"
        );

        ensure!(
            self.recording.soft_key_note <= MAX_DATA_BYTE,
            "recording.soft_key_note {} is above 127",
            self.recording.soft_key_note
        );

        let groups = self.mute_group_addresses()?;
        let group_address = |group: u8, context: &str| -> anyhow::Result<ParameterAddress> {
            groups.get(&group).copied().with_context(|| {
                format!(
                    "{context} refers to mute group {group}, which has no [[mute_groups]] entry"
                )
            })
        };

        let aux_monitor = match &self.aux_monitor {
            Some(aux) => {
                check_address(aux.address, "aux_monitor.address")?;
                check_value(aux.high, "aux_monitor.high")?;
                check_value(aux.low, "aux_monitor.low")?;
                Some(AuxPreset {
                    address: aux.address,
                    high: aux.high,
                    low: aux.low,
                })
            }
            None => None,
        };

        let fx_mute = match &self.fx_mute {
            Some(fx) => {
                check_value(fx.on, "fx_mute.on")?;
                check_value(fx.off, "fx_mute.off")?;
                Some(FxMute {
                    group: fx.mute_group,
                    address: group_address(fx.mute_group, "fx_mute.mute_group")?,
                    on: fx.on,
                    off: fx.off,
                })
            }
            None => None,
        };

        let commands = |lists: &GroupLists, context: &str| -> anyhow::Result<Vec<GroupCommand>> {
            let mutes = lists.mute.iter().map(|g| (*g, MUTE_ON));
            let unmutes = lists.unmute.iter().map(|g| (*g, MUTE_OFF));
            mutes
                .chain(unmutes)
                .map(|(group, value)| -> anyhow::Result<GroupCommand> {
                    Ok(GroupCommand {
                        group,
                        address: group_address(group, context)?,
                        value,
                    })
                })
                .collect()
        };

        Ok(DispatchPlan {
            channel: self.advanced.midi_channel,
            buttons,
            soft_key_note: self.recording.soft_key_note,
            aux_monitor,
            fx_mute,
            break_active: commands(&self.break_mode.active, "break_mode.active")?,
            break_inactive: commands(&self.break_mode.inactive, "break_mode.inactive")?,
        })
    }

    fn mute_group_addresses(&self) -> anyhow::Result<HashMap<u8, ParameterAddress>> {
        let mut groups = HashMap::new();
        for entry in &self.mute_groups {
            check_address(entry.address, &format!("mute group {} address", entry.group))?;
            if groups.insert(entry.group, entry.address).is_some() {
                bail!("mute group {} is defined more than once", entry.group);
            }
        }
        Ok(groups)
    }
}

fn check_address(address: ParameterAddress, name: &str) -> anyhow::Result<()> {
    ensure!(address.is_valid(), "{name} {address} has a byte above 0x7F");
    Ok(())
}

fn check_value(value: u16, name: &str) -> anyhow::Result<()> {
    ensure!(value <= MAX_NRPN_VALUE, "{name} {value} exceeds the 14-bit range (0-16383)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [network]
        mixer_ip = "192.168.1.50"

        [logging]
        level = "debug"

        [buttons]
        recording = 64
        aux_monitor = 65
        fx_mute = 66
        break_mode = 67

        [recording]
        soft_key_note = 0x31

        [aux_monitor]
        address = { msb = 0x45, lsb = 0x02 }
        high = 12000
        low = 4000

        [fx_mute]
        mute_group = 2

        [break_mode]
        active = { mute = [1, 2], unmute = [3] }
        inactive = { unmute = [1, 2] }

        [[mute_groups]]
        group = 1
        address = { msb = 0x04, lsb = 0x00 }

        [[mute_groups]]
        group = 2
        address = { msb = 0x04, lsb = 0x01 }

        [[mute_groups]]
        group = 3
        address = { msb = 0x04, lsb = 0x02 }
    "#;

    fn parse(toml_str: &str) -> BridgeConfig {
        toml::from_str(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_defaults() {
        let config = parse("[network]\nmixer_ip = \"10.0.0.5\"");
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_empty());
        assert_eq!(config.logging.backup_count, 3);
        assert_eq!(config.logging.retained_files(), 4);
        assert_eq!(config.midi_input.name_patterns, vec!["Chocolate", "M-VAVE", "Bluetooth"]);

        let plan = config.dispatch_plan().unwrap();
        assert_eq!(plan.buttons.recording, 20);
        assert_eq!(plan.buttons.break_mode, 23);
        assert_eq!(plan.soft_key_note, 0x30);
        assert!(plan.aux_monitor.is_none());
        assert!(plan.fx_mute.is_none());
        assert!(plan.break_active.is_empty());
    }

    #[test]
    fn test_full_config_resolves() {
        let config = parse(FULL);
        assert_eq!(config.logging.level, "debug");
        assert!(config.link_settings().unwrap().discovery.is_none());

        let plan = config.dispatch_plan().unwrap();
        assert_eq!(plan.soft_key_note, 0x31);

        let aux = plan.aux_monitor.unwrap();
        assert_eq!(aux.address, ParameterAddress::new(0x45, 0x02));
        assert_eq!((aux.high, aux.low), (12000, 4000));

        let fx = plan.fx_mute.unwrap();
        assert_eq!(fx.address, ParameterAddress::new(0x04, 0x01));
        assert_eq!((fx.on, fx.off), (127, 0));

        let active: Vec<_> = plan.break_active.iter().map(|c| (c.group, c.value)).collect();
        assert_eq!(active, vec![(1, 127), (2, 127), (3, 0)]);
        let inactive: Vec<_> = plan.break_inactive.iter().map(|c| (c.group, c.value)).collect();
        assert_eq!(inactive, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn test_log_retention() {
        let config = parse("[logging]\nfile = \"logs/cq.log\"\nbackup_count = 0");
        assert_eq!(config.logging.file, "logs/cq.log");
        assert_eq!(config.logging.retained_files(), 1);

        let config = parse("[logging]\nbackup_count = 7");
        assert_eq!(config.logging.retained_files(), 8);
    }

    #[test]
    fn test_unknown_mute_group_is_rejected() {
        let config = parse(
            r#"
            [fx_mute]
            mute_group = 4

            [[mute_groups]]
            group = 1
            address = { msb = 0x04, lsb = 0x00 }
            "#,
        );
        let err = config.dispatch_plan().unwrap_err().to_string();
        assert!(err.contains("mute group 4"), "{err}");
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let bad = [
            "[recording]\nsoft_key_note = 128",
            "[aux_monitor]\naddress = { msb = 1, lsb = 2 }\nhigh = 16384",
            "[aux_monitor]\naddress = { msb = 0x80, lsb = 2 }",
            "[buttons]\nrecording = 21",
            concat!(
                "[[mute_groups]]\ngroup = 1\naddress = { msb = 1, lsb = 1 }\n",
                "[[mute_groups]]\ngroup = 1\naddress = { msb = 1, lsb = 2 }",
            ),
            "[break_mode]\nactive = { mute = [9] }",
        ];
        for case in bad {
            assert!(parse(case).dispatch_plan().is_err(), "should reject: {case}");
        }
    }

    #[test]
    fn test_example_config_parses() {
        let raw = include_str!("../config/bridge.toml");
        let config: BridgeConfig = toml::from_str(raw).unwrap();
        config.link_settings().unwrap();
        config.dispatch_plan().unwrap();
    }
}
