//! TOML configuration file I/O
//!
//! Handles loading and saving the vpnctl configuration to/from TOML files
//! in the user's configuration directory.

use crate::catalog::CatalogConfig;
use crate::config::Preferences;
use crate::error::{ConfigError, VpnctlError};
use crate::vpn::process::TunnelConfig;
use crate::vpn::session::SessionConfig;
use crate::vpn::system::HookConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Complete TOML configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub preferences: Preferences,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub system: HookConfig,
}

impl TomlConfig {
    /// Validate every section and the constraints between them
    pub fn validate(&self) -> Result<(), ConfigError> {
        let section = |name: &str, result: Result<(), String>| {
            result.map_err(|e| ConfigError::ValidationError {
                message: format!("[{}] {}", name, e),
            })
        };

        section("preferences", self.preferences.validate())?;
        section("catalog", self.catalog.validate())?;
        section("tunnel", self.tunnel.validate())?;
        section("session", self.session.validate())?;
        section("system", self.system.validate())?;

        if self.session.disconnect_timeout_secs <= self.tunnel.grace_period_secs {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "session.disconnect_timeout_secs ({}) must exceed tunnel.grace_period_secs ({})",
                    self.session.disconnect_timeout_secs, self.tunnel.grace_period_secs
                ),
            });
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, VpnctlError> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            },
            _ => ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            },
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            }
        })?;

        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), VpnctlError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        std::fs::write(path, contents).map_err(|_| ConfigError::SaveFailed {
            path: path.to_string_lossy().to_string(),
        })?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// File holding the last-known-good connection
const HISTORY_FILE_NAME: &str = "last_connection.toml";

/// File holding the cached server list
const SERVER_CACHE_FILE_NAME: &str = "servers.json";

/// Get the default configuration directory
///
/// Returns ~/.config/vpnctl, or VPNCTL_CONFIG_DIR if set. When running under
/// sudo the invoking user's home directory is used.
pub fn get_config_dir() -> Result<PathBuf, VpnctlError> {
    if let Ok(config_dir) = std::env::var("VPNCTL_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        std::env::var("SUDO_HOME").unwrap_or_else(|_| format!("/home/{}", sudo_user))
    } else {
        std::env::var("HOME").map_err(|_| ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })?
    };

    Ok(PathBuf::from(home).join(".config").join("vpnctl"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, VpnctlError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the path of the last-known-good connection record
pub fn get_history_path() -> Result<PathBuf, VpnctlError> {
    Ok(get_config_dir()?.join(HISTORY_FILE_NAME))
}

/// Get the path of the cached server list
pub fn get_server_cache_path() -> Result<PathBuf, VpnctlError> {
    Ok(get_config_dir()?.join(SERVER_CACHE_FILE_NAME))
}

/// Load configuration from the default location, falling back to defaults
/// when no file has been written yet
pub fn load_config() -> Result<TomlConfig, VpnctlError> {
    let path = get_config_path()?;
    load_config_from_path(&path)
}

/// Load configuration from a specific file, falling back to defaults when
/// the file does not exist
pub fn load_config_from_path<P: AsRef<Path>>(path: P) -> Result<TomlConfig, VpnctlError> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "No configuration file, using defaults");
        return Ok(TomlConfig::default());
    }
    TomlConfig::from_file(path)
}

/// Save configuration to the default location
pub fn save_config(config: &TomlConfig) -> Result<(), VpnctlError> {
    let path = get_config_path()?;
    config.to_file(&path)
}

/// Check if a configuration file exists
pub fn config_exists() -> Result<bool, VpnctlError> {
    Ok(get_config_path()?.exists())
}

/// Remove the configuration directory with everything in it
///
/// Returns whether anything was removed.
pub fn purge_config() -> Result<bool, VpnctlError> {
    let dir = get_config_dir()?;
    purge_config_dir(&dir)
}

/// Remove a specific configuration directory
pub fn purge_config_dir(dir: &Path) -> Result<bool, VpnctlError> {
    if !dir.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(dir).map_err(|e| ConfigError::IoError {
        message: format!("Failed to remove {}: {}", dir.display(), e),
    })?;
    info!("Purged configuration directory {:?}", dir);
    Ok(true)
}
