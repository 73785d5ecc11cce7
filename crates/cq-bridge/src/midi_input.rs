/// Foot controller input.
///
/// Parsing and port selection are plain functions. Opening a port needs
/// the OS MIDI stack and is only built with the `midi-input` feature.

use std::fmt;

use cq_protocol::{MAX_DATA_BYTE, STATUS_CONTROL_CHANGE, STATUS_NOTE_OFF, STATUS_NOTE_ON};

/// A button press or release: controller (or note) number and value (or
/// velocity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerEvent {
    pub controller: u8,
    pub value: u8,
}

/// Channel voice messages a foot controller sends. Channels are 0-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMessage {
    ControlChange { channel: u8, controller: u8, value: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
}

impl InputMessage {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let &[status, data1, data2, ..] = bytes else {
            return None;
        };
        if data1 > MAX_DATA_BYTE || data2 > MAX_DATA_BYTE {
            return None;
        }

        let channel = status & 0x0F;
        match status & 0xF0 {
            STATUS_CONTROL_CHANGE => Some(Self::ControlChange {
                channel,
                controller: data1,
                value: data2,
            }),
            STATUS_NOTE_ON => Some(Self::NoteOn {
                channel,
                note: data1,
                velocity: data2,
            }),
            STATUS_NOTE_OFF => Some(Self::NoteOff {
                channel,
                note: data1,
                velocity: data2,
            }),
            _ => None,
        }
    }

    /// Control changes map directly. Note-ons count too, since some
    /// footswitches send notes instead of CCs.
    pub fn controller_event(&self) -> Option<ControllerEvent> {
        match *self {
            Self::ControlChange { controller, value, .. } => {
                Some(ControllerEvent { controller, value })
            }
            Self::NoteOn { note, velocity, .. } => Some(ControllerEvent {
                controller: note,
                value: velocity,
            }),
            Self::NoteOff { .. } => None,
        }
    }
}

impl fmt::Display for InputMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, channel, first, second) = match *self {
            Self::ControlChange { channel, controller, value } => (
                "CC      ",
                channel,
                format!("controller {controller:>3}"),
                format!("value {value:>3}"),
            ),
            Self::NoteOn { channel, note, velocity } => {
                ("Note on ", channel, format!("note {note:>3}"), format!("velocity {velocity:>3}"))
            }
            Self::NoteOff { channel, note, velocity } => {
                ("Note off", channel, format!("note {note:>3}"), format!("velocity {velocity:>3}"))
            }
        };
        write!(f, "ch {:>2}  {kind}  {first}  {second}", channel + 1)
    }
}

/// Button events the dispatcher acts on. Note-offs and everything else
/// are ignored.
pub fn parse_controller_event(bytes: &[u8]) -> Option<ControllerEvent> {
    InputMessage::parse(bytes)?.controller_event()
}

/// Pick the controller port: the configured name if it exists, otherwise
/// the first port containing any pattern (case-insensitive).
pub fn select_port<'a>(ports: &'a [String], manual: &str, patterns: &[String]) -> Option<&'a str> {
    let manual = manual.trim();
    if !manual.is_empty() {
        if let Some(port) = ports.iter().find(|p| p.as_str() == manual) {
            return Some(port.as_str());
        }
    }

    let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
    ports
        .iter()
        .find(|port| {
            let name = port.to_lowercase();
            patterns.iter().any(|p| !p.is_empty() && name.contains(p.as_str()))
        })
        .map(String::as_str)
}

#[cfg(feature = "midi-input")]
pub use port::{input_port_names, open_controller, open_monitor, ControllerInput};

#[cfg(feature = "midi-input")]
mod port {
    use anyhow::{anyhow, Context};
    use midir::{Ignore, MidiInput, MidiInputConnection};
    use tokio::sync::mpsc;
    use tracing::{info, trace};

    use super::{parse_controller_event, select_port, ControllerEvent, InputMessage};
    use crate::config::MidiInputSection;

    const CLIENT_NAME: &str = "cq-bridge";

    /// Open controller port. Input stops when this is dropped.
    pub struct ControllerInput {
        pub port_name: String,
        _connection: MidiInputConnection<()>,
    }

    fn midi_input() -> anyhow::Result<MidiInput> {
        let mut midi_in = MidiInput::new(CLIENT_NAME).context("initialising MIDI input")?;
        midi_in.ignore(Ignore::All);
        Ok(midi_in)
    }

    /// Names of the MIDI input ports currently visible.
    pub fn input_port_names() -> anyhow::Result<Vec<String>> {
        let midi_in = midi_input()?;
        Ok(midi_in
            .ports()
            .iter()
            .filter_map(|port| midi_in.port_name(port).ok())
            .collect())
    }

    /// Find and open the foot controller, forwarding parsed events on
    /// `events`. Callbacks run on midir's thread.
    pub fn open_controller(
        section: &MidiInputSection,
        events: mpsc::UnboundedSender<ControllerEvent>,
    ) -> anyhow::Result<ControllerInput> {
        let input = open_port(section, move |message| {
            if let Some(event) = parse_controller_event(message) {
                let _ = events.send(event);
            }
        })?;
        info!(port = %input.port_name, "Listening for footswitch presses");
        Ok(input)
    }

    /// Like [`open_controller`], but forwards every CC, note-on and
    /// note-off, for finding out what a controller sends.
    pub fn open_monitor(
        section: &MidiInputSection,
        messages: mpsc::UnboundedSender<InputMessage>,
    ) -> anyhow::Result<ControllerInput> {
        open_port(section, move |message| {
            if let Some(message) = InputMessage::parse(message) {
                let _ = messages.send(message);
            }
        })
    }

    fn open_port<F>(section: &MidiInputSection, mut forward: F) -> anyhow::Result<ControllerInput>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let midi_in = midi_input()?;
        let ports = midi_in.ports();
        let names: Vec<String> = ports
            .iter()
            .filter_map(|port| midi_in.port_name(port).ok())
            .collect();
        info!(ports = ?names, "Available MIDI input ports");

        let port_name = select_port(&names, &section.port, &section.name_patterns)
            .ok_or_else(|| {
                anyhow!(
                    "foot controller not found among MIDI ports {names:?}; \
                     check pairing and midi_input.name_patterns"
                )
            })?
            .to_string();

        let port = ports
            .iter()
            .find(|port| midi_in.port_name(port).ok().as_deref() == Some(port_name.as_str()))
            .cloned()
            .with_context(|| format!("MIDI port '{port_name}' disappeared"))?;

        let connection = midi_in
            .connect(
                &port,
                CLIENT_NAME,
                move |_stamp, message, _| {
                    trace!(bytes = ?message, "MIDI input");
                    forward(message);
                },
                (),
            )
            .map_err(|e| anyhow!("failed to open MIDI port '{port_name}': {e}"))?;

        Ok(ControllerInput {
            port_name,
            _connection: connection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_change_any_channel() {
        assert_eq!(
            parse_controller_event(&[0xB0, 20, 127]),
            Some(ControllerEvent { controller: 20, value: 127 })
        );
        assert_eq!(
            parse_controller_event(&[0xB5, 21, 0]),
            Some(ControllerEvent { controller: 21, value: 0 })
        );
    }

    #[test]
    fn test_parse_note_on_as_controller() {
        assert_eq!(
            parse_controller_event(&[0x90, 60, 100]),
            Some(ControllerEvent { controller: 60, value: 100 })
        );
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        assert_eq!(parse_controller_event(&[0x80, 60, 0]), None); // note off
        assert_eq!(parse_controller_event(&[0xC0, 5]), None); // program change
        assert_eq!(parse_controller_event(&[0xF8]), None); // clock
        assert_eq!(parse_controller_event(&[]), None);
        assert_eq!(parse_controller_event(&[0xB0, 0x80, 1]), None);
    }

    #[test]
    fn test_input_message_keeps_note_off_and_channel() {
        assert_eq!(
            InputMessage::parse(&[0x83, 60, 64]),
            Some(InputMessage::NoteOff { channel: 3, note: 60, velocity: 64 })
        );
        assert_eq!(
            InputMessage::parse(&[0xBF, 22, 127]),
            Some(InputMessage::ControlChange { channel: 15, controller: 22, value: 127 })
        );
        assert_eq!(InputMessage::parse(&[0xE0, 0, 64]), None); // pitch bend
    }

    #[test]
    fn test_input_message_display() {
        let cc = InputMessage::ControlChange { channel: 0, controller: 20, value: 127 };
        assert_eq!(cc.to_string(), "ch  1  CC        controller  20  value 127");
        let off = InputMessage::NoteOff { channel: 9, note: 36, velocity: 0 };
        assert_eq!(off.to_string(), "ch 10  Note off  note  36  velocity   0");
    }

    #[cfg(feature = "midi-input")]
    #[test]
    fn test_open_controller_without_matching_port_fails() {
        let section = crate::config::MidiInputSection {
            port: String::new(),
            name_patterns: vec!["no-such-foot-controller".to_string()],
        };
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        // Either no MIDI stack on this machine or no port matches
        assert!(open_controller(&section, tx).is_err());
    }

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn patterns() -> Vec<String> {
        ports(&["Chocolate", "M-VAVE", "Bluetooth"])
    }

    #[test]
    fn test_select_manual_port() {
        let available = ports(&["Midi Through:0", "FootCtl:0", "Chocolate Plus:0"]);
        assert_eq!(select_port(&available, "FootCtl:0", &patterns()), Some("FootCtl:0"));
    }

    #[test]
    fn test_select_falls_back_to_patterns() {
        let available = ports(&["Midi Through:0", "m-vave chocolate:0"]);
        // Manual name missing from the list
        assert_eq!(
            select_port(&available, "Gone:0", &patterns()),
            Some("m-vave chocolate:0")
        );
        assert_eq!(select_port(&available, "", &patterns()), Some("m-vave chocolate:0"));
    }

    #[test]
    fn test_select_none_matching() {
        let available = ports(&["Midi Through:0", "USB Keyboard:0"]);
        assert_eq!(select_port(&available, "", &patterns()), None);
        assert_eq!(select_port(&[], "", &patterns()), None);
    }
}
