use crate::nrpn::{encode_parameter_change, encode_trigger, ParameterAddress, PARAMETER_CHANGE_SIZE};

/// One complete operation on the wire. Built per send and never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMessage {
    Keepalive,
    ParameterChange([u8; PARAMETER_CHANGE_SIZE]),
    /// Soft-key press and release. The two halves must be sent in order,
    /// separated by [`crate::TRIGGER_GAP`], with nothing in between.
    Trigger { on: [u8; 3], off: [u8; 3] },
}

impl ProtocolMessage {
    /// See [`encode_parameter_change`] for the panic conditions.
    pub fn parameter_change(address: ParameterAddress, value: u16, channel: u8) -> Self {
        Self::ParameterChange(encode_parameter_change(address, value, channel))
    }

    /// See [`encode_trigger`] for the panic conditions.
    pub fn trigger(note: u8, channel: u8) -> Self {
        let (on, off) = encode_trigger(note, channel);
        Self::Trigger { on, off }
    }

    /// Total bytes this message puts on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Keepalive => 1,
            Self::ParameterChange(bytes) => bytes.len(),
            Self::Trigger { on, off } => on.len() + off.len(),
        }
    }
}
