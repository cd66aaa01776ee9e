//! Persistence of the last-known-good connection
//!
//! The record survives restarts so `reconnect` and the `Last` target work
//! across invocations. Stored as a small TOML file next to the config.

use crate::error::{ConfigError, VpnctlError};
use crate::vpn::state::LastKnownGood;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the last-known-good record lives
#[derive(Debug, Clone, Default)]
pub struct LastKnownGoodStore {
    path: Option<PathBuf>,
}

impl LastKnownGoodStore {
    /// Store backed by a file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the record, `None` if nothing was saved yet
    pub fn load(&self) -> Result<Option<LastKnownGood>, VpnctlError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConfigError::LoadFailed {
                    path: format!("{}: {}", path.display(), e),
                }
                .into())
            }
        };

        let record: LastKnownGood = toml::from_str(&content)?;
        Ok(Some(record))
    }

    pub fn save(&self, record: &LastKnownGood) -> Result<(), VpnctlError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(record)?;
        fs::write(path, content).map_err(|e| ConfigError::SaveFailed {
            path: format!("{}: {}", path.display(), e),
        })?;

        debug!(path = %path.display(), server = %record.server_id, "Saved last-known-good connection");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), VpnctlError> {
        if let Some(path) = &self.path {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
