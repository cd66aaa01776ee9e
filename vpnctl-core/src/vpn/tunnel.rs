//! Tunnel controller contract
//!
//! The session talks to the transport only through [`TunnelController`]:
//! start a tunnel, stop it, poll its status and listen for up/down events.
//! Handles are opaque and unique per started tunnel so late events from an
//! old tunnel can be told apart from the current one.

use crate::error::TunnelError;
use crate::types::{Protocol, Server};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque reference to one tunnel-process instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelHandle {
    id: u64,
    server_id: String,
    protocol: Protocol,
}

impl TunnelHandle {
    /// Allocate a fresh handle for a tunnel to `server`
    pub fn allocate(server: &Server, protocol: Protocol) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            server_id: server.id.clone(),
            protocol,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}/{}", self.id, self.server_id, self.protocol)
    }
}

/// Why a tunnel is down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Stopped on request, or no longer tracked by the controller
    Stopped,
    /// The transport process exited on its own
    Exited { code: Option<i32> },
    /// The transport reported rejected credentials
    AuthenticationFailed,
    /// The transport reported a fatal error before exiting
    Fatal { message: String },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Stopped => write!(f, "stopped"),
            ExitReason::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            ExitReason::Exited { code: None } => write!(f, "killed by signal"),
            ExitReason::AuthenticationFailed => write!(f, "authentication failed"),
            ExitReason::Fatal { message } => write!(f, "fatal error: {}", message),
        }
    }
}

/// Last observed state of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Starting,
    Up,
    Down(ExitReason),
}

/// What happened to a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEventKind {
    Up,
    Down(ExitReason),
}

/// Event emitted by a controller's watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub handle: TunnelHandle,
    pub kind: TunnelEventKind,
}

impl TunnelEvent {
    pub fn up(handle: TunnelHandle) -> Self {
        Self {
            handle,
            kind: TunnelEventKind::Up,
        }
    }

    pub fn down(handle: TunnelHandle, reason: ExitReason) -> Self {
        Self {
            handle,
            kind: TunnelEventKind::Down(reason),
        }
    }
}

/// Owns the transport for at most one live tunnel
#[async_trait]
pub trait TunnelController: Send + Sync {
    /// Launch a tunnel; fails with `AlreadyRunning` while another is live
    async fn start(&self, server: &Server, protocol: Protocol) -> Result<TunnelHandle, TunnelError>;

    /// Terminate the tunnel and release its system resources
    async fn stop(&self, handle: &TunnelHandle) -> Result<(), TunnelError>;

    /// Last observed status, never blocks
    fn status(&self, handle: &TunnelHandle) -> TunnelStatus;

    /// Receive up/down events for every tunnel this controller starts
    fn subscribe(&self) -> broadcast::Receiver<TunnelEvent>;
}
