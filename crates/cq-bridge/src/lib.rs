/// Bluetooth foot controller to CQ mixer bridge.
///
/// The mixer link itself lives in `cq-link`; this crate adds the controller
/// side: reading footswitch presses and turning them into mixer messages.

pub mod config;
pub mod dispatcher;
pub mod midi_input;

pub use config::BridgeConfig;
pub use dispatcher::{ControlDispatcher, ControllerState, DispatchPlan, MessageSink};
pub use midi_input::{parse_controller_event, ControllerEvent, InputMessage};
