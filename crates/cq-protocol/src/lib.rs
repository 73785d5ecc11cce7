pub mod message;
pub mod nrpn;

pub use message::ProtocolMessage;
pub use nrpn::{decode_parameter_change, encode_parameter_change, encode_trigger, ParameterAddress};

use std::time::Duration;

/// TCP port the CQ mixer listens on for MIDI-over-network
pub const DEFAULT_MIXER_PORT: u16 = 51325;

/// Keepalive byte (MIDI Active Sensing). The mixer drops the session if it
/// stops arriving.
pub const KEEPALIVE_BYTE: u8 = 0xFE;

/// Keepalive defaults
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 300;

/// Gap between the note-on and note-off halves of a trigger
pub const TRIGGER_GAP: Duration = Duration::from_millis(50);

/// Largest 14-bit NRPN data value
pub const MAX_NRPN_VALUE: u16 = 0x3FFF;

/// Highest MIDI channel (0-indexed)
pub const MAX_CHANNEL: u8 = 15;

/// Largest MIDI data byte
pub const MAX_DATA_BYTE: u8 = 0x7F;

// -- Status nibbles --

pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;

// -- NRPN controller numbers --

pub const CC_NRPN_MSB: u8 = 0x63;
pub const CC_NRPN_LSB: u8 = 0x62;
pub const CC_DATA_ENTRY_MSB: u8 = 0x06;
pub const CC_DATA_ENTRY_LSB: u8 = 0x26;
