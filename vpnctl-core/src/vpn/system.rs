//! System configuration around a tunnel
//!
//! Routing, DNS and killswitch setup are delegated to a
//! [`SystemConfigurator`]. The controller acquires a [`NetworkLease`] before
//! spawning the transport and releases it once the transport is gone. Both
//! steps run under a deadline; a lease dropped without an explicit release
//! hands the release to the runtime.

use crate::config::{DnsPreference, Preferences};
use crate::error::LaunchError;
use crate::types::{Protocol, Server};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// What the system configuration is being applied for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemContext {
    pub server_id: String,
    pub country: String,
    pub protocol: Protocol,
    pub dns: DnsPreference,
    pub killswitch: bool,
    pub split_tunnel: Vec<String>,
}

impl SystemContext {
    pub fn new(server: &Server, protocol: Protocol, preferences: &Preferences) -> Self {
        Self {
            server_id: server.id.clone(),
            country: server.country.clone(),
            protocol,
            dns: preferences.dns.clone(),
            killswitch: preferences.killswitch,
            split_tunnel: preferences.split_tunnel.clone(),
        }
    }

    /// Environment handed to hook commands
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("VPNCTL_SERVER", self.server_id.clone()),
            ("VPNCTL_COUNTRY", self.country.clone()),
            ("VPNCTL_PROTOCOL", self.protocol.to_string()),
            ("VPNCTL_DNS", self.dns.to_env()),
            ("VPNCTL_KILLSWITCH", u8::from(self.killswitch).to_string()),
            ("VPNCTL_SPLIT_TUNNEL", self.split_tunnel.join(",")),
        ]
    }
}

/// Applies and reverts routing/DNS/killswitch configuration
///
/// Either future may be dropped at its deadline; implementations must not
/// leave work running past that point.
#[async_trait]
pub trait SystemConfigurator: Send + Sync {
    async fn apply(&self, context: &SystemContext) -> Result<(), String>;

    /// Must be safe to call after a partial or failed `apply`
    async fn release(&self, context: &SystemContext) -> Result<(), String>;
}

/// Leaves the system untouched
pub struct NoopConfigurator;

#[async_trait]
impl SystemConfigurator for NoopConfigurator {
    async fn apply(&self, _context: &SystemContext) -> Result<(), String> {
        Ok(())
    }

    async fn release(&self, _context: &SystemContext) -> Result<(), String> {
        Ok(())
    }
}

/// External commands run around the tunnel's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Run before the transport starts; a non-zero exit aborts the launch
    #[serde(default)]
    pub up_command: Vec<String>,

    /// Run after the transport is gone, whatever the outcome
    #[serde(default)]
    pub down_command: Vec<String>,
}

impl HookConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, command) in [("up_command", &self.up_command), ("down_command", &self.down_command)] {
            if command.first().is_some_and(|program| program.trim().is_empty()) {
                return Err(format!("{} has an empty program name", name));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.up_command.is_empty() && self.down_command.is_empty()
    }
}

/// Runs the configured hook commands with the context in the environment
pub struct HookConfigurator {
    hooks: HookConfig,
}

impl HookConfigurator {
    pub fn new(hooks: HookConfig) -> Self {
        Self { hooks }
    }

    async fn run(command: &[String], context: &SystemContext) -> Result<(), String> {
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };

        debug!(program = %program, "Running system hook");
        // Killed if the lease's deadline drops this future.
        let status = Command::new(program)
            .args(args)
            .envs(context.env())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| format!("failed to run {}: {}", program, e))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {}", program, status))
        }
    }
}

#[async_trait]
impl SystemConfigurator for HookConfigurator {
    async fn apply(&self, context: &SystemContext) -> Result<(), String> {
        Self::run(&self.hooks.up_command, context).await
    }

    async fn release(&self, context: &SystemContext) -> Result<(), String> {
        Self::run(&self.hooks.down_command, context).await
    }
}

/// Build the configurator described by the hook configuration
pub fn configurator_from_config(hooks: &HookConfig) -> Arc<dyn SystemConfigurator> {
    if hooks.is_empty() {
        Arc::new(NoopConfigurator)
    } else {
        Arc::new(HookConfigurator::new(hooks.clone()))
    }
}

/// System configuration held for the lifetime of one tunnel
pub struct NetworkLease {
    configurator: Arc<dyn SystemConfigurator>,
    context: SystemContext,
    timeout: Duration,
    released: bool,
}

impl NetworkLease {
    /// Apply the configuration within `timeout`, releasing it again if
    /// applying fails or overruns
    pub async fn acquire(
        configurator: Arc<dyn SystemConfigurator>,
        context: SystemContext,
        timeout: Duration,
    ) -> Result<Self, LaunchError> {
        let applied = tokio::time::timeout(timeout, configurator.apply(&context))
            .await
            .unwrap_or_else(|_| Err(overrun("apply", timeout)));

        let lease = Self {
            configurator,
            context,
            timeout,
            released: false,
        };

        if let Err(reason) = applied {
            if let Err(e) = lease.release().await {
                warn!("Failed to undo partial system configuration: {}", e);
            }
            return Err(LaunchError::SystemConfig { reason });
        }

        debug!(server = %lease.context.server_id, "System configuration applied");
        Ok(lease)
    }

    /// Revert the configuration, giving up after the lease's timeout
    pub async fn release(mut self) -> Result<(), String> {
        self.released = true;
        tokio::time::timeout(self.timeout, self.configurator.release(&self.context))
            .await
            .unwrap_or_else(|_| Err(overrun("release", self.timeout)))?;

        info!(server = %self.context.server_id, "System configuration released");
        Ok(())
    }
}

fn overrun(step: &str, timeout: Duration) -> String {
    format!(
        "system configuration {} did not finish within {} seconds",
        step,
        timeout.as_secs()
    )
}

impl Drop for NetworkLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let configurator = Arc::clone(&self.configurator);
        let context = self.context.clone();
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let released = tokio::time::timeout(timeout, configurator.release(&context))
                        .await
                        .unwrap_or_else(|_| Err(overrun("release", timeout)));
                    match released {
                        Ok(()) => info!(server = %context.server_id, "System configuration released"),
                        Err(e) => warn!(server = %context.server_id, "System release failed: {}", e),
                    }
                });
            }
            Err(_) => warn!(
                server = %self.context.server_id,
                "No runtime left to release system configuration"
            ),
        }
    }
}
