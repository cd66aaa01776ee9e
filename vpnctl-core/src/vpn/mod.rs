//! VPN connection module
//!
//! Tunnel process control, the connection session state machine and the
//! status fan-out front-ends listen to.

pub mod history;
pub mod output_parser;
pub mod process;
pub mod session;
pub mod state;
pub mod status;
pub mod system;
pub mod tunnel;

// Public re-exports
pub use history::LastKnownGoodStore;
pub use output_parser::{OutputParser, TransportEvent};
pub use process::{ProcessTunnelController, TunnelConfig};
pub use session::{ConnectionSession, SessionConfig};
pub use state::{FailureReason, LastKnownGood, SessionState};
pub use status::{StatusPublisher, StatusStream};
pub use system::{
    configurator_from_config, HookConfig, HookConfigurator, NetworkLease, NoopConfigurator,
    SystemConfigurator, SystemContext,
};
pub use tunnel::{
    ExitReason, TunnelController, TunnelEvent, TunnelEventKind, TunnelHandle, TunnelStatus,
};
