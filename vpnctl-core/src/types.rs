//! Shared domain types
//!
//! Servers, protocols and connection requests, plus the secret wrapper for
//! the catalog API token.

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol used for the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Udp
    }
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{}', expected tcp or udp", other)),
        }
    }
}

/// Optional server capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    SecureCore,
    Tor,
    P2p,
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "secure-core" | "securecore" => Ok(Feature::SecureCore),
            "tor" => Ok(Feature::Tor),
            "p2p" => Ok(Feature::P2p),
            other => Err(format!("unknown feature '{}'", other)),
        }
    }
}

/// Feature flags advertised by a server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFeatures {
    #[serde(default)]
    pub secure_core: bool,
    #[serde(default)]
    pub tor: bool,
    #[serde(default)]
    pub p2p: bool,
}

impl ServerFeatures {
    pub fn has(&self, feature: Feature) -> bool {
        match feature {
            Feature::SecureCore => self.secure_core,
            Feature::Tor => self.tor,
            Feature::P2p => self.p2p,
        }
    }
}

/// A VPN server as advertised by the catalog
///
/// Servers are immutable once fetched; a refresh replaces the whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Unique server name, e.g. "CH#4"
    pub id: String,

    /// Country or location tag
    pub country: String,

    /// Current load in percent (0-100)
    pub load: u8,

    /// Reported latency in milliseconds, used as a tie-breaker
    #[serde(default)]
    pub latency_ms: u32,

    /// Protocols the server accepts
    pub protocols: Vec<Protocol>,

    #[serde(default)]
    pub features: ServerFeatures,

    /// Minimum plan tier needed to use this server
    #[serde(default)]
    pub tier: u8,
}

impl Server {
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, load {}%)", self.id, self.country, self.load)
    }
}

/// What a connection request points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// A specific server by id
    Server(String),
    /// Least loaded eligible server
    Fastest,
    /// Uniformly random eligible server
    Random,
    /// The last server that reached Connected
    Last,
}

/// A single user action asking for a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub target: ConnectionTarget,
    pub protocol: Protocol,
}

impl ConnectionRequest {
    pub fn new(target: ConnectionTarget, protocol: Protocol) -> Self {
        Self { target, protocol }
    }

    pub fn fastest(protocol: Protocol) -> Self {
        Self::new(ConnectionTarget::Fastest, protocol)
    }

    pub fn random(protocol: Protocol) -> Self {
        Self::new(ConnectionTarget::Random, protocol)
    }

    pub fn server(id: impl Into<String>, protocol: Protocol) -> Self {
        Self::new(ConnectionTarget::Server(id.into()), protocol)
    }
}

/// Opaque credential used to fetch the server catalog
///
/// The session layer passes this through untouched; only the catalog source
/// ever exposes it, and only to put it in a request header.
#[derive(Clone, Debug)]
pub struct CatalogToken(Secret<String>);

impl CatalogToken {
    pub fn new(token: String) -> Self {
        Self(Secret::new(token))
    }

    /// Expose the token value (use with caution!)
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for CatalogToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// Keyring service name for the catalog API token
pub const KEYRING_SERVICE_TOKEN: &str = "vpnctl-api-token";
