/// NRPN parameter changes and soft-key triggers, as the CQ mixer expects
/// them on its TCP MIDI port.
///
/// A parameter change is four Control Change groups on one channel:
///
///   [B0|ch 63 param_msb] [B0|ch 62 param_lsb] [B0|ch 06 value_msb] [B0|ch 26 value_lsb]
///
/// where the 14-bit value is split into bits 7–13 and bits 0–6.
/// A trigger is a Note On (velocity 127) followed by a Note Off (velocity 0).
///
/// Out-of-range arguments are programming errors in the mapping layer and
/// panic instead of being clamped.

use serde::Deserialize;

use crate::{
    CC_DATA_ENTRY_LSB, CC_DATA_ENTRY_MSB, CC_NRPN_LSB, CC_NRPN_MSB, MAX_CHANNEL, MAX_DATA_BYTE,
    MAX_NRPN_VALUE, STATUS_CONTROL_CHANGE, STATUS_NOTE_OFF, STATUS_NOTE_ON,
};

/// Size of an encoded parameter change (4 groups × 3 bytes).
pub const PARAMETER_CHANGE_SIZE: usize = 12;

/// Destination control on the mixer, identified by its NRPN number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct ParameterAddress {
    pub msb: u8,
    pub lsb: u8,
}

impl ParameterAddress {
    pub const fn new(msb: u8, lsb: u8) -> Self {
        Self { msb, lsb }
    }

    /// Both halves fit in a MIDI data byte.
    pub fn is_valid(&self) -> bool {
        self.msb <= MAX_DATA_BYTE && self.lsb <= MAX_DATA_BYTE
    }
}

impl std::fmt::Display for ParameterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}/{:02X}", self.msb, self.lsb)
    }
}

/// Encode a 14-bit NRPN parameter change.
///
/// # Panics
///
/// If `value > 16383`, `channel > 15`, or either address byte is above 0x7F.
#[rustfmt::skip]
pub fn encode_parameter_change(
    address: ParameterAddress,
    value: u16,
    channel: u8,
) -> [u8; PARAMETER_CHANGE_SIZE] {
    assert!(
        value <= MAX_NRPN_VALUE,
        "NRPN value {value} exceeds 14-bit range"
    );
    assert!(channel <= MAX_CHANNEL, "MIDI channel {channel} out of range");
    assert!(
        address.is_valid(),
        "NRPN parameter {address} has a byte above 0x7F"
    );

    let status = STATUS_CONTROL_CHANGE | channel;
    let value_msb = (value >> 7) as u8;
    let value_lsb = (value & 0x7F) as u8;

    [
        status, CC_NRPN_MSB, address.msb,
        status, CC_NRPN_LSB, address.lsb,
        status, CC_DATA_ENTRY_MSB, value_msb,
        status, CC_DATA_ENTRY_LSB, value_lsb,
    ]
}

/// Encode a momentary press/release pair for a soft key.
///
/// Returns `(note_on, note_off)`. The caller is responsible for leaving
/// [`crate::TRIGGER_GAP`] between the two.
///
/// # Panics
///
/// If `note > 127` or `channel > 15`.
pub fn encode_trigger(note: u8, channel: u8) -> ([u8; 3], [u8; 3]) {
    assert!(note <= MAX_DATA_BYTE, "note {note} out of range");
    assert!(channel <= MAX_CHANNEL, "MIDI channel {channel} out of range");

    (
        [STATUS_NOTE_ON | channel, note, 0x7F],
        [STATUS_NOTE_OFF | channel, note, 0x00],
    )
}

/// Decode a 12-byte parameter change back into `(address, value, channel)`.
///
/// Returns None unless the data is exactly the four NRPN groups, in order,
/// on one channel.
pub fn decode_parameter_change(data: &[u8]) -> Option<(ParameterAddress, u16, u8)> {
    if data.len() != PARAMETER_CHANGE_SIZE {
        return None;
    }

    let status = data[0];
    if status & 0xF0 != STATUS_CONTROL_CHANGE {
        return None;
    }
    let channel = status & 0x0F;

    let expected = [CC_NRPN_MSB, CC_NRPN_LSB, CC_DATA_ENTRY_MSB, CC_DATA_ENTRY_LSB];
    for (group, controller) in data.chunks_exact(3).zip(expected) {
        if group[0] != status || group[1] != controller || group[2] > MAX_DATA_BYTE {
            return None;
        }
    }

    let address = ParameterAddress::new(data[2], data[5]);
    let value = ((data[8] as u16) << 7) | data[11] as u16;
    Some((address, value, channel))
}
