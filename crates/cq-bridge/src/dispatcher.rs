/// Footswitch presses to mixer messages.
///
/// Each of the four buttons toggles one piece of state and sends whatever
/// the new state calls for. Releases (value 0) are ignored, so a momentary
/// footswitch toggles once per press.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use cq_link::ConnectionManager;
use cq_protocol::{ParameterAddress, ProtocolMessage};

use crate::midi_input::ControllerEvent;

/// Where dispatched messages go.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Returns whether the message reached the mixer.
    async fn deliver(&self, message: ProtocolMessage) -> bool;
}

#[async_trait]
impl MessageSink for ConnectionManager {
    async fn deliver(&self, message: ProtocolMessage) -> bool {
        self.send_message(&message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Recording,
    AuxMonitor,
    FxMute,
    BreakMode,
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Recording => "recording",
            Self::AuxMonitor => "aux_monitor",
            Self::FxMute => "fx_mute",
            Self::BreakMode => "break_mode",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonMap {
    pub recording: u8,
    pub aux_monitor: u8,
    pub fx_mute: u8,
    pub break_mode: u8,
}

impl ButtonMap {
    pub fn behavior_for(&self, controller: u8) -> Option<Behavior> {
        match controller {
            c if c == self.recording => Some(Behavior::Recording),
            c if c == self.aux_monitor => Some(Behavior::AuxMonitor),
            c if c == self.fx_mute => Some(Behavior::FxMute),
            c if c == self.break_mode => Some(Behavior::BreakMode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxPreset {
    pub address: ParameterAddress,
    pub high: u16,
    pub low: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FxMute {
    pub group: u8,
    pub address: ParameterAddress,
    pub on: u16,
    pub off: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCommand {
    pub group: u8,
    pub address: ParameterAddress,
    pub value: u16,
}

/// Validated button behaviors, built by `BridgeConfig::dispatch_plan`.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub channel: u8,
    pub buttons: ButtonMap,
    pub soft_key_note: u8,
    pub aux_monitor: Option<AuxPreset>,
    pub fx_mute: Option<FxMute>,
    pub break_active: Vec<GroupCommand>,
    pub break_inactive: Vec<GroupCommand>,
}

/// Toggle state of every button. All off at startup; the mixer's actual
/// state is never read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub recording: bool,
    pub aux_high: bool,
    pub fx_muted: bool,
    pub break_active: bool,
}

pub struct ControlDispatcher<S> {
    plan: DispatchPlan,
    state: ControllerState,
    sink: S,
}

impl<S: MessageSink> ControlDispatcher<S> {
    pub fn new(plan: DispatchPlan, sink: S) -> Self {
        Self {
            plan,
            state: ControllerState::default(),
            sink,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Act on one controller event. Returns the behavior that ran.
    ///
    /// State toggles even when the mixer is unreachable, matching what the
    /// performer pressed rather than what the mixer acknowledged.
    pub async fn handle(&mut self, event: ControllerEvent) -> Option<Behavior> {
        if event.value == 0 {
            return None;
        }

        let Some(behavior) = self.plan.buttons.behavior_for(event.controller) else {
            debug!(controller = event.controller, value = event.value, "Unmapped controller");
            return None;
        };

        match behavior {
            Behavior::Recording => self.toggle_recording().await,
            Behavior::AuxMonitor => self.toggle_aux_monitor().await,
            Behavior::FxMute => self.toggle_fx_mute().await,
            Behavior::BreakMode => self.toggle_break_mode().await,
        }
        Some(behavior)
    }

    async fn toggle_recording(&mut self) {
        self.state.recording = !self.state.recording;
        let message = ProtocolMessage::trigger(self.plan.soft_key_note, self.plan.channel);
        let sent = self.sink.deliver(message).await;
        info!(
            recording = if self.state.recording { "started" } else { "stopped" },
            sent = sent,
            "Recording toggled"
        );
    }

    async fn toggle_aux_monitor(&mut self) {
        self.state.aux_high = !self.state.aux_high;
        let Some(aux) = self.plan.aux_monitor else {
            warn!("AUX monitor button pressed but [aux_monitor] is not configured");
            return;
        };

        let value = if self.state.aux_high { aux.high } else { aux.low };
        let sent = self.send_parameter(aux.address, value).await;
        info!(
            level = if self.state.aux_high { "high" } else { "low" },
            value = value,
            sent = sent,
            "AUX monitor toggled"
        );
    }

    async fn toggle_fx_mute(&mut self) {
        self.state.fx_muted = !self.state.fx_muted;
        let Some(fx) = self.plan.fx_mute else {
            warn!("FX mute button pressed but [fx_mute] is not configured");
            return;
        };

        let value = if self.state.fx_muted { fx.on } else { fx.off };
        let sent = self.send_parameter(fx.address, value).await;
        info!(
            group = fx.group,
            muted = self.state.fx_muted,
            sent = sent,
            "FX mute toggled"
        );
    }

    async fn toggle_break_mode(&mut self) {
        self.state.break_active = !self.state.break_active;
        let commands = if self.state.break_active {
            &self.plan.break_active
        } else {
            &self.plan.break_inactive
        };

        let mut delivered = 0;
        for command in commands {
            let (address, value) = (command.address, command.value);
            let message = ProtocolMessage::parameter_change(address, value, self.plan.channel);
            if self.sink.deliver(message).await {
                delivered += 1;
            }
        }
        info!(
            active = self.state.break_active,
            groups = commands.len(),
            delivered = delivered,
            "Break mode toggled"
        );
    }

    async fn send_parameter(&self, address: ParameterAddress, value: u16) -> bool {
        self.sink
            .deliver(ProtocolMessage::parameter_change(address, value, self.plan.channel))
            .await
    }
}
