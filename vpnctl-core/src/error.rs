//! Error types for the vpnctl session manager
//!
//! Every layer has its own error enum. Lower-layer errors are carried
//! unchanged by the layers above them so a caller can always see the
//! controller or catalog failure that caused a session-level error.

use crate::types::Protocol;
use thiserror::Error;

/// Main error type for the vpnctl application
#[derive(Error, Debug)]
pub enum VpnctlError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors related to keyring operations
    #[error("Keyring error: {0}")]
    Keyring(#[from] KeyringError),

    /// Errors raised by the server catalog
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Errors raised by the tunnel process controller
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Errors raised by the connection session
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// System keyring operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyringError {
    #[error("Keyring service unavailable")]
    ServiceUnavailable,

    #[error("Failed to store credential in keyring")]
    StoreFailed,

    #[error("Failed to retrieve credential from keyring")]
    RetrieveFailed,

    #[error("API token not found in keyring")]
    TokenNotFound,
}

/// Server catalog errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Failed to fetch server list: {reason}")]
    FetchFailed { reason: String },

    #[error("No server available for protocol {protocol}")]
    NoServerAvailable { protocol: Protocol },

    #[error("Server not found: {id}")]
    NotFound { id: String },

    #[error("Server {id} requires plan tier {tier}")]
    TierRestricted { id: String, tier: u8 },
}

impl CatalogError {
    /// Whether a catalog refresh could plausibly resolve this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::NoServerAvailable { .. } | CatalogError::NotFound { .. }
        )
    }
}

/// Reasons the transport process could not be launched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("transport binary not found: {binary}")]
    BinaryMissing { binary: String },

    #[error("insufficient privileges to launch the transport")]
    PrivilegeDenied,

    #[error("failed to spawn transport: {reason}")]
    SpawnFailed { reason: String },

    #[error("system configuration failed: {reason}")]
    SystemConfig { reason: String },
}

/// Tunnel process controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("A tunnel is already running")]
    AlreadyRunning,

    #[error("No tunnel is running for this handle")]
    NotRunning,

    #[error("Transport did not exit within {seconds} seconds")]
    ShutdownTimeout { seconds: u64 },

    #[error("Failed to release system configuration: {reason}")]
    ReleaseFailed { reason: String },
}

/// Connection session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid connection request: {0}")]
    InvalidRequest(CatalogError),

    #[error("Another connection transition is in progress")]
    Busy,

    #[error("No previous successful connection to reconnect to")]
    NoPriorConnection,

    #[error("Connection attempt was cancelled")]
    Cancelled,

    #[error("Tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Tunnel went down: {0}")]
    TunnelDown(crate::vpn::ExitReason),

    #[error("{phase} did not complete within {seconds} seconds")]
    WatchdogExpired { phase: String, seconds: u64 },

    #[error("Session has shut down")]
    Closed,
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, VpnctlError>;
