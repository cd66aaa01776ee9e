//! Configuration module
//!
//! User preferences (protocol, DNS, plan, killswitch, split tunnel) and the
//! TOML file that carries them together with the per-component settings.

use crate::types::Protocol;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

pub mod toml_config;

/// Maximum number of custom DNS servers accepted
pub const MAX_CUSTOM_DNS: usize = 3;

/// DNS handling while the tunnel is up
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum DnsPreference {
    /// Route all lookups through the VPN provider's resolver
    #[default]
    LeakProtection,
    /// Use the given resolvers instead
    Custom { servers: Vec<IpAddr> },
    /// Leave system DNS untouched
    None,
}

impl DnsPreference {
    /// Value passed to system configuration hooks
    pub fn to_env(&self) -> String {
        match self {
            DnsPreference::LeakProtection => "leak-protection".to_string(),
            DnsPreference::None => "none".to_string(),
            DnsPreference::Custom { servers } => {
                let list: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
                format!("custom:{}", list.join(","))
            }
        }
    }
}

/// Subscription plan; bounds which server tiers are eligible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Basic,
    Plus,
    Visionary,
}

impl Plan {
    /// Highest server tier this plan may use
    pub fn tier(&self) -> u8 {
        match self {
            Plan::Free => 0,
            Plan::Basic => 1,
            Plan::Plus | Plan::Visionary => 2,
        }
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "basic" => Ok(Plan::Basic),
            "plus" => Ok(Plan::Plus),
            "visionary" => Ok(Plan::Visionary),
            other => Err(format!("unknown plan '{}'", other)),
        }
    }
}

/// User-facing connection preferences
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// Protocol used when a request does not name one
    #[serde(default)]
    pub default_protocol: Protocol,

    #[serde(default)]
    pub plan: Plan,

    /// Block non-tunnel traffic while a session is active
    #[serde(default)]
    pub killswitch: bool,

    /// Addresses or CIDR blocks routed outside the tunnel
    #[serde(default)]
    pub split_tunnel: Vec<String>,

    #[serde(default)]
    pub dns: DnsPreference,
}

impl Preferences {
    /// Validate the preferences
    pub fn validate(&self) -> Result<(), String> {
        if let DnsPreference::Custom { servers } = &self.dns {
            if servers.is_empty() {
                return Err("Custom DNS requires at least one server".to_string());
            }
            if servers.len() > MAX_CUSTOM_DNS {
                return Err(format!(
                    "At most {} custom DNS servers are supported",
                    MAX_CUSTOM_DNS
                ));
            }
        }

        for entry in &self.split_tunnel {
            if !is_valid_network(entry) {
                return Err(format!("Invalid split tunnel entry: {}", entry));
            }
        }

        Ok(())
    }
}

/// Accepts a bare IP address or an address with a prefix length
fn is_valid_network(entry: &str) -> bool {
    match entry.split_once('/') {
        None => entry.parse::<IpAddr>().is_ok(),
        Some((addr, prefix)) => {
            let Ok(addr) = addr.parse::<IpAddr>() else {
                return false;
            };
            let max = if addr.is_ipv4() { 32 } else { 128 };
            prefix.parse::<u8>().map(|p| p <= max).unwrap_or(false)
        }
    }
}
