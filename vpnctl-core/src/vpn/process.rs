//! Transport process management
//!
//! [`ProcessTunnelController`] runs the tunnel transport as a child process.
//! Each tunnel gets a watcher task that parses the transport's output,
//! notices when the process exits, and performs the SIGTERM/SIGKILL
//! shutdown when asked to stop. The watcher owns the child and the
//! [`NetworkLease`] and releases the system configuration before reporting
//! the tunnel down.

use crate::config::Preferences;
use crate::error::{ConfigError, LaunchError, TunnelError, VpnctlError};
use crate::types::{Protocol, Server};
use crate::vpn::output_parser::{OutputParser, TransportEvent, DEFAULT_UP_PATTERN};
use crate::vpn::system::{NetworkLease, SystemConfigurator, SystemContext};
use crate::vpn::tunnel::{
    ExitReason, TunnelController, TunnelEvent, TunnelHandle, TunnelStatus,
};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// How long to wait for the process to die after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How long to keep reading buffered output after the process exited
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Capacity of the tunnel event channel
const EVENT_BUFFER: usize = 64;

/// How the transport process is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Transport executable
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Arguments; `{server}`, `{country}`, `{protocol}` and `{profile_dir}`
    /// are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Directory holding per-server transport profiles
    #[serde(default = "default_profile_dir")]
    pub profile_dir: PathBuf,

    /// Refuse to launch unless running as root
    #[serde(default = "default_require_root")]
    pub require_root: bool,

    /// Seconds between SIGTERM and SIGKILL on stop
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Output line meaning the tunnel is up
    #[serde(default = "default_up_pattern")]
    pub up_pattern: String,

    /// Seconds allowed for applying or releasing system configuration
    #[serde(default = "default_system_timeout")]
    pub system_timeout_secs: u64,
}

fn default_binary() -> String {
    "openvpn".to_string()
}
fn default_args() -> Vec<String> {
    vec![
        "--config".to_string(),
        "{profile_dir}/{server}.{protocol}.ovpn".to_string(),
    ]
}
fn default_profile_dir() -> PathBuf {
    PathBuf::from("/etc/vpnctl/profiles")
}
fn default_require_root() -> bool {
    true
}
fn default_grace_period() -> u64 {
    5
}
fn default_up_pattern() -> String {
    DEFAULT_UP_PATTERN.to_string()
}
fn default_system_timeout() -> u64 {
    5
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            profile_dir: default_profile_dir(),
            require_root: default_require_root(),
            grace_period_secs: default_grace_period(),
            up_pattern: default_up_pattern(),
            system_timeout_secs: default_system_timeout(),
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.binary.trim().is_empty() {
            return Err("binary cannot be empty".to_string());
        }
        if self.grace_period_secs == 0 || self.grace_period_secs > 60 {
            return Err(format!(
                "grace_period_secs must be between 1 and 60, got: {}",
                self.grace_period_secs
            ));
        }
        if self.system_timeout_secs == 0 || self.system_timeout_secs > 60 {
            return Err(format!(
                "system_timeout_secs must be between 1 and 60, got: {}",
                self.system_timeout_secs
            ));
        }
        OutputParser::with_up_pattern(&self.up_pattern)
            .map_err(|e| format!("invalid up_pattern: {}", e))?;
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn system_timeout(&self) -> Duration {
        Duration::from_secs(self.system_timeout_secs)
    }

    /// Upper bound on `stop`: signalling, killing and releasing the system
    /// configuration
    pub fn stop_budget(&self) -> Duration {
        self.grace_period() + KILL_WAIT * 2 + self.system_timeout()
    }

    /// Arguments with placeholders filled in for one tunnel
    pub fn render_args(&self, server: &Server, protocol: Protocol) -> Vec<String> {
        let profile_dir = self.profile_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{profile_dir}", &profile_dir)
                    .replace("{server}", &server.id)
                    .replace("{country}", &server.country)
                    .replace("{protocol}", protocol.as_str())
            })
            .collect()
    }
}

/// Request handed to a watcher to shut its process down
struct StopRequest {
    grace: Duration,
    reply: oneshot::Sender<Result<(), TunnelError>>,
}

/// Bookkeeping for the one live tunnel
struct ActiveTunnel {
    handle: TunnelHandle,
    status: Arc<Mutex<TunnelStatus>>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
}

/// Runs the transport as a child process, one tunnel at a time
pub struct ProcessTunnelController {
    config: TunnelConfig,
    preferences: Preferences,
    configurator: Arc<dyn SystemConfigurator>,
    parser: Arc<OutputParser>,
    active: Mutex<Option<ActiveTunnel>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl ProcessTunnelController {
    /// Create a controller; the preferences decide DNS/killswitch handling
    pub fn new(
        config: TunnelConfig,
        preferences: Preferences,
        configurator: Arc<dyn SystemConfigurator>,
    ) -> Result<Self, VpnctlError> {
        let parser = OutputParser::with_up_pattern(&config.up_pattern).map_err(|e| {
            ConfigError::ValidationError {
                message: format!("invalid up_pattern: {}", e),
            }
        })?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            config,
            preferences,
            configurator,
            parser: Arc::new(parser),
            active: Mutex::new(None),
            events,
        })
    }

    fn active(&self) -> std::sync::MutexGuard<'_, Option<ActiveTunnel>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the single tunnel slot for `handle`
    fn reserve(&self, handle: &TunnelHandle) -> Result<Arc<Mutex<TunnelStatus>>, TunnelError> {
        let mut active = self.active();
        if let Some(current) = active.as_ref() {
            let status = current.status.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if !matches!(status, TunnelStatus::Down(_)) {
                return Err(TunnelError::AlreadyRunning);
            }
            debug!(handle = %current.handle, "Reaping exited tunnel");
        }

        let status = Arc::new(Mutex::new(TunnelStatus::Starting));
        *active = Some(ActiveTunnel {
            handle: handle.clone(),
            status: Arc::clone(&status),
            stop_tx: None,
        });
        Ok(status)
    }

    /// Give the slot back if it still belongs to `handle`
    fn release_slot(&self, handle: &TunnelHandle) {
        let mut active = self.active();
        if active.as_ref().is_some_and(|a| a.handle == *handle) {
            *active = None;
        }
    }

    fn check_launchable(&self) -> Result<(), LaunchError> {
        which::which(&self.config.binary).map_err(|_| LaunchError::BinaryMissing {
            binary: self.config.binary.clone(),
        })?;

        if self.config.require_root && !nix::unistd::geteuid().is_root() {
            return Err(LaunchError::PrivilegeDenied);
        }
        Ok(())
    }

    fn spawn_process(&self, server: &Server, protocol: Protocol) -> Result<Child, LaunchError> {
        let args = self.config.render_args(server, protocol);
        debug!(binary = %self.config.binary, ?args, "Spawning transport");

        Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LaunchError::BinaryMissing {
                    binary: self.config.binary.clone(),
                },
                std::io::ErrorKind::PermissionDenied => LaunchError::PrivilegeDenied,
                _ => LaunchError::SpawnFailed {
                    reason: e.to_string(),
                },
            })
    }

    async fn launch(
        &self,
        handle: &TunnelHandle,
        server: &Server,
        protocol: Protocol,
        status: Arc<Mutex<TunnelStatus>>,
    ) -> Result<(), TunnelError> {
        self.check_launchable()?;

        let configurator = Arc::clone(&self.configurator);
        let context = SystemContext::new(server, protocol, &self.preferences);
        let lease = NetworkLease::acquire(configurator, context, self.config.system_timeout()).await?;

        let child = match self.spawn_process(server, protocol) {
            Ok(child) => child,
            Err(e) => {
                if let Err(reason) = lease.release().await {
                    warn!("Failed to release system configuration: {}", reason);
                }
                return Err(e.into());
            }
        };
        info!(handle = %handle, pid = ?child.id(), "Transport process started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = TunnelWatcher {
            handle: handle.clone(),
            status,
            events: self.events.clone(),
            parser: Arc::clone(&self.parser),
            fatal: None,
            default_grace: self.config.grace_period(),
        };
        tokio::spawn(watcher.run(child, lease, stop_rx));

        if let Some(active) = self.active().as_mut() {
            if active.handle == *handle {
                active.stop_tx = Some(stop_tx);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelController for ProcessTunnelController {
    #[tracing::instrument(skip_all, fields(server = %server.id, protocol = %protocol))]
    async fn start(&self, server: &Server, protocol: Protocol) -> Result<TunnelHandle, TunnelError> {
        let handle = TunnelHandle::allocate(server, protocol);
        let status = self.reserve(&handle)?;

        if let Err(e) = self.launch(&handle, server, protocol, status).await {
            warn!("Failed to launch transport: {}", e);
            self.release_slot(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    #[tracing::instrument(skip_all, fields(handle = %handle))]
    async fn stop(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        let stop_tx = {
            let mut active = self.active();
            match active.as_mut() {
                Some(current) if current.handle == *handle => current.stop_tx.take(),
                _ => return Err(TunnelError::NotRunning),
            }
        };

        let Some(stop_tx) = stop_tx else {
            // Already being stopped by another caller.
            return Err(TunnelError::NotRunning);
        };

        let grace = self.config.grace_period();
        let (reply_tx, reply_rx) = oneshot::channel();
        let result = if stop_tx
            .send(StopRequest {
                grace,
                reply: reply_tx,
            })
            .is_err()
        {
            debug!("Watcher already finished, transport has exited");
            Ok(())
        } else {
            match tokio::time::timeout(self.config.stop_budget(), reply_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Ok(()),
                Err(_) => Err(TunnelError::ShutdownTimeout {
                    seconds: grace.as_secs(),
                }),
            }
        };

        self.release_slot(handle);
        result
    }

    fn status(&self, handle: &TunnelHandle) -> TunnelStatus {
        match self.active().as_ref() {
            Some(current) if current.handle == *handle => current
                .status
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            _ => TunnelStatus::Down(ExitReason::Stopped),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }
}

/// Background task owning one transport process
struct TunnelWatcher {
    handle: TunnelHandle,
    status: Arc<Mutex<TunnelStatus>>,
    events: broadcast::Sender<TunnelEvent>,
    parser: Arc<OutputParser>,
    fatal: Option<ExitReason>,
    default_grace: Duration,
}

impl TunnelWatcher {
    async fn run(
        mut self,
        mut child: Child,
        lease: NetworkLease,
        mut stop_rx: oneshot::Receiver<StopRequest>,
    ) {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let reason = loop {
            tokio::select! {
                Some(line) = line_rx.recv() => self.on_line(&line),

                exit = child.wait() => {
                    self.drain(&mut line_rx).await;
                    let reason = match exit {
                        Ok(status) => ExitReason::Exited { code: status.code() },
                        Err(e) => {
                            error!("Failed to wait for transport: {}", e);
                            ExitReason::Exited { code: None }
                        }
                    };
                    let reason = self.fatal.take().unwrap_or(reason);
                    warn!(handle = %self.handle, %reason, "Transport exited");
                    break reason;
                }

                request = &mut stop_rx => {
                    let (grace, reply) = match request {
                        Ok(StopRequest { grace, reply }) => (grace, Some(reply)),
                        // Controller dropped: never leave the process behind.
                        Err(_) => (self.default_grace, None),
                    };
                    let mut result = terminate_child(&mut child, grace).await;
                    self.set_status(TunnelStatus::Down(ExitReason::Stopped));
                    if let Err(reason) = lease.release().await {
                        warn!(handle = %self.handle, "Failed to release system configuration: {}", reason);
                        if result.is_ok() {
                            result = Err(TunnelError::ReleaseFailed { reason });
                        }
                    }
                    let _ = self.events.send(TunnelEvent::down(self.handle.clone(), ExitReason::Stopped));
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    return;
                }
            }
        };

        self.set_status(TunnelStatus::Down(reason.clone()));
        if let Err(e) = lease.release().await {
            warn!(handle = %self.handle, "Failed to release system configuration: {}", e);
        }
        let _ = self.events.send(TunnelEvent::down(self.handle.clone(), reason));
    }

    fn on_line(&mut self, line: &str) {
        match self.parser.parse_line(line) {
            TransportEvent::Up => {
                let was_starting = {
                    let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
                    let starting = *status == TunnelStatus::Starting;
                    if starting {
                        *status = TunnelStatus::Up;
                    }
                    starting
                };
                if was_starting {
                    info!(handle = %self.handle, "Tunnel is up");
                    let _ = self.events.send(TunnelEvent::up(self.handle.clone()));
                }
            }
            TransportEvent::AuthenticationFailed => {
                warn!(handle = %self.handle, "Transport reported authentication failure");
                self.fatal = Some(ExitReason::AuthenticationFailed);
            }
            TransportEvent::Fatal { message } => {
                warn!(handle = %self.handle, %message, "Transport reported fatal error");
                if self.fatal.is_none() {
                    self.fatal = Some(ExitReason::Fatal { message });
                }
            }
            TransportEvent::DeviceOpened { device } => {
                debug!(handle = %self.handle, %device, "Tunnel device opened");
            }
            TransportEvent::PeerConnected { remote } => {
                debug!(handle = %self.handle, %remote, "Peer connection initiated");
            }
            TransportEvent::Output { line } => {
                debug!("transport: {}", line);
            }
        }
    }

    /// Consume output still buffered after the process exited
    async fn drain(&mut self, line_rx: &mut mpsc::UnboundedReceiver<String>) {
        let _ = tokio::time::timeout(OUTPUT_DRAIN, async {
            while let Some(line) = line_rx.recv().await {
                self.on_line(&line);
            }
        })
        .await;
    }

    fn set_status(&self, status: TunnelStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

async fn forward_lines<R>(reader: R, line_tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line_tx.send(line).is_err() {
            break;
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate_child(child: &mut Child, grace: Duration) -> Result<(), TunnelError> {
    if let Some(pid) = child.id() {
        info!("Sending SIGTERM to transport process {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        info!("Transport process terminated gracefully");
        return Ok(());
    }

    warn!("Graceful shutdown timed out, sending SIGKILL");
    if let Err(e) = child.start_kill() {
        debug!("SIGKILL failed: {}", e);
    }

    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(_) => Ok(()),
        Err(_) => Err(TunnelError::ShutdownTimeout {
            seconds: grace.as_secs(),
        }),
    }
}

/// Check whether `pid` is a live process running `binary`
pub fn is_process_alive(pid: u32, binary: &str) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    let name = std::path::Path::new(binary)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| binary.to_string());

    std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|comm| comm.trim() == name)
        .unwrap_or(false)
}

/// PIDs of running processes named like the transport binary
pub fn find_transport_processes(binary: &str) -> Vec<u32> {
    let name = std::path::Path::new(binary)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| binary.to_string());

    let output = std::process::Command::new("pgrep").arg("-x").arg(&name).output();
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Terminate a process gracefully, escalating to SIGKILL after `grace`
pub async fn terminate_process(pid: u32, grace: Duration) -> Result<(), TunnelError> {
    let target = Pid::from_raw(pid as i32);

    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => return Ok(()),
        Err(nix::errno::Errno::EPERM) => return Err(LaunchError::PrivilegeDenied.into()),
        Err(e) => {
            warn!("Failed to send SIGTERM to {}: {}", pid, e);
            return Err(TunnelError::NotRunning);
        }
    }

    let polls = (grace.as_millis() / 250).max(1);
    for _ in 0..polls {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if kill(target, None).is_err() {
            return Ok(());
        }
    }

    warn!("Process {} did not respond to SIGTERM, sending SIGKILL", pid);
    let _ = kill(target, Signal::SIGKILL);
    tokio::time::sleep(Duration::from_millis(500)).await;

    if kill(target, None).is_err() {
        Ok(())
    } else {
        Err(TunnelError::ShutdownTimeout {
            seconds: grace.as_secs(),
        })
    }
}

/// Terminate every transport process left behind by earlier sessions
///
/// Returns the PIDs that were terminated.
pub async fn cleanup_orphaned_processes(binary: &str, grace: Duration) -> Vec<u32> {
    let pids = find_transport_processes(binary);
    if pids.is_empty() {
        debug!("No {} processes found", binary);
        return pids;
    }

    info!("Found {} {} process(es) to clean up: {:?}", pids.len(), binary, pids);
    let mut terminated = Vec::new();
    for pid in pids {
        match terminate_process(pid, grace).await {
            Ok(()) => terminated.push(pid),
            Err(e) => warn!("Failed to terminate process {}: {}", pid, e),
        }
    }
    terminated
}
