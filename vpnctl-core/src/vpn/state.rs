//! VPN session state
//!
//! Defines the states a connection session moves through and the
//! last-known-good record used for reconnect.

use crate::error::TunnelError;
use crate::types::{Protocol, Server};
use crate::vpn::tunnel::ExitReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a session ended up in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The controller refused or failed an operation
    #[error("{0}")]
    Tunnel(#[from] TunnelError),

    /// The tunnel went down without being asked to
    #[error("tunnel {0}")]
    Exited(ExitReason),

    /// A transition did not finish in time
    #[error("{phase} did not complete within {seconds} seconds")]
    Watchdog { phase: String, seconds: u64 },
}

/// VPN session states
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected
    #[default]
    Disconnected,

    /// Tunnel launched, waiting for it to come up
    Connecting,

    /// Tunnel is up
    Connected {
        server: Server,
        protocol: Protocol,
        started_at: DateTime<Utc>,
    },

    /// Tearing the tunnel down
    Disconnecting,

    /// A transition failed; always followed by `Disconnected`
    Failed { reason: FailureReason },
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }

    /// Whether a transition is in flight
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Disconnecting
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed { .. })
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected {
                server, protocol, ..
            } => write!(f, "connected to {} over {}", server.id, protocol),
            SessionState::Disconnecting => write!(f, "disconnecting"),
            SessionState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Last server/protocol pair that reached `Connected`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastKnownGood {
    pub server_id: String,
    pub protocol: Protocol,
    pub connected_at: DateTime<Utc>,
}
