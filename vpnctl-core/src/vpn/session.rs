//! Connection session state machine
//!
//! [`ConnectionSession`] is a cloneable handle to an actor task that owns
//! the session state. Commands are answered one at a time; a command that
//! arrives while a transition is in flight gets `Busy` instead of waiting.
//! Catalog resolution, tunnel start and tunnel stop run in spawned tasks
//! that report back to the actor, so it keeps reacting to tunnel events and
//! watchdogs while they run.

use crate::catalog::ServerCatalog;
use crate::error::{CatalogError, SessionError, TunnelError};
use crate::types::{ConnectionRequest, ConnectionTarget, Protocol, Server};
use crate::vpn::history::LastKnownGoodStore;
use crate::vpn::state::{FailureReason, LastKnownGood, SessionState};
use crate::vpn::status::{StatusPublisher, StatusStream, DEFAULT_STATUS_BUFFER};
use crate::vpn::tunnel::{TunnelController, TunnelEvent, TunnelEventKind, TunnelHandle, TunnelStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 16;

/// Timeouts and buffering for a connection session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a connect may spend between launching and tunnel-up
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds a disconnect may take before the session gives up on it
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,

    /// States buffered per status subscriber
    #[serde(default = "default_status_buffer")]
    pub status_buffer: usize,
}

fn default_connect_timeout() -> u64 {
    30
}
fn default_disconnect_timeout() -> u64 {
    15
}
fn default_status_buffer() -> usize {
    DEFAULT_STATUS_BUFFER
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            disconnect_timeout_secs: default_disconnect_timeout(),
            status_buffer: default_status_buffer(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_secs == 0 || self.connect_timeout_secs > 600 {
            return Err(format!(
                "connect_timeout_secs must be between 1 and 600, got: {}",
                self.connect_timeout_secs
            ));
        }
        if self.disconnect_timeout_secs == 0 || self.disconnect_timeout_secs > 300 {
            return Err(format!(
                "disconnect_timeout_secs must be between 1 and 300, got: {}",
                self.disconnect_timeout_secs
            ));
        }
        if self.status_buffer == 0 || self.status_buffer > 4096 {
            return Err(format!(
                "status_buffer must be between 1 and 4096, got: {}",
                self.status_buffer
            ));
        }
        Ok(())
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }
}

type Reply = oneshot::Sender<Result<SessionState, SessionError>>;

enum Command {
    Connect {
        request: ConnectionRequest,
        reply: Reply,
    },
    Reconnect {
        reply: Reply,
    },
    Disconnect {
        reply: Reply,
    },
    LastKnownGood {
        reply: oneshot::Sender<Option<LastKnownGood>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results reported back by the actor's spawned tasks
enum Completion {
    Resolved {
        attempt: u64,
        result: Result<Server, CatalogError>,
    },
    Started {
        attempt: u64,
        result: Result<TunnelHandle, TunnelError>,
    },
    Stopped {
        handle: TunnelHandle,
        result: Result<(), TunnelError>,
    },
}

/// Handle to a running connection session
///
/// Cloning is cheap; every clone drives the same session. The session
/// stops its tunnel and exits once the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionSession {
    commands: mpsc::Sender<Command>,
    publisher: StatusPublisher,
}

impl ConnectionSession {
    /// Start the session actor on the current tokio runtime
    pub fn spawn(
        catalog: Arc<ServerCatalog>,
        controller: Arc<dyn TunnelController>,
        history: LastKnownGoodStore,
        config: SessionConfig,
    ) -> Self {
        let publisher = StatusPublisher::new(config.status_buffer);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let last_known_good = match history.load() {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable last-known-good record: {}", e);
                None
            }
        };

        let actor = SessionActor {
            events: controller.subscribe(),
            events_open: true,
            catalog,
            controller,
            history,
            config,
            publisher: publisher.clone(),
            commands: commands_rx,
            completions_tx,
            completions: completions_rx,
            phase: Phase::Idle,
            connected: None,
            attempt: 0,
            last_known_good,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            publisher,
        }
    }

    /// Connect to the server selected by `request`
    ///
    /// Resolves once the tunnel is up, or with the reason it is not.
    /// While connected this switches to the newly selected server.
    pub async fn connect(&self, request: ConnectionRequest) -> Result<SessionState, SessionError> {
        self.request(|reply| Command::Connect { request, reply }).await
    }

    /// Connect again to the last server that reached `Connected`
    pub async fn reconnect(&self) -> Result<SessionState, SessionError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Tear down the tunnel; cancels a connect that has not completed yet
    pub async fn disconnect(&self) -> Result<SessionState, SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub fn subscribe(&self) -> StatusStream {
        self.publisher.subscribe()
    }

    pub fn current(&self) -> SessionState {
        self.publisher.current()
    }

    pub fn publisher(&self) -> &StatusPublisher {
        &self.publisher
    }

    pub async fn last_known_good(&self) -> Option<LastKnownGood> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::LastKnownGood { reply }).await.is_err() {
            return None;
        }
        response.await.ok().flatten()
    }

    /// Stop any live tunnel and end the session
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = response.await;
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<SessionState, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }
}

/// What to do once a stop completes
enum AfterStop {
    /// Answer the disconnect that asked for it
    Disconnect(Reply),
    /// Start the tunnel a connect asked for
    Switch {
        server: Server,
        protocol: Protocol,
        reply: Reply,
    },
    /// Clean up after a failure that was already reported
    Settle,
}

/// Transition currently in flight
enum Phase {
    /// Nothing in flight; connected or disconnected
    Idle,
    Resolving {
        attempt: u64,
        protocol: Protocol,
        reply: Reply,
    },
    Starting {
        attempt: u64,
        server: Server,
        protocol: Protocol,
        reply: Reply,
        deadline: Instant,
    },
    Connecting {
        handle: TunnelHandle,
        server: Server,
        protocol: Protocol,
        reply: Reply,
        deadline: Instant,
    },
    /// Disconnect arrived while the controller was still starting the tunnel
    Cancelling {
        attempt: u64,
        reply: Reply,
        deadline: Instant,
    },
    Stopping {
        handle: TunnelHandle,
        after: AfterStop,
        deadline: Instant,
    },
}

impl Phase {
    fn is_idle(&self) -> bool {
        matches!(self, Phase::Idle)
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            Phase::Idle | Phase::Resolving { .. } => None,
            Phase::Starting { deadline, .. }
            | Phase::Connecting { deadline, .. }
            | Phase::Cancelling { deadline, .. }
            | Phase::Stopping { deadline, .. } => Some(*deadline),
        }
    }
}

/// The tunnel behind a `Connected` state
struct Established {
    handle: TunnelHandle,
    server: Server,
}

struct SessionActor {
    catalog: Arc<ServerCatalog>,
    controller: Arc<dyn TunnelController>,
    history: LastKnownGoodStore,
    config: SessionConfig,
    publisher: StatusPublisher,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Receiver<TunnelEvent>,
    events_open: bool,
    phase: Phase,
    connected: Option<Established>,
    attempt: u64,
    last_known_good: Option<LastKnownGood>,
}

impl SessionActor {
    async fn run(mut self) {
        debug!("Connection session started");

        loop {
            let deadline = self.phase.deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect { request, reply }) => self.on_connect(request, reply),
                    Some(Command::Reconnect { reply }) => self.on_reconnect(reply),
                    Some(Command::Disconnect { reply }) => self.on_disconnect(reply),
                    Some(Command::LastKnownGood { reply }) => {
                        let _ = reply.send(self.last_known_good.clone());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                Some(completion) = self.completions.recv() => match completion {
                    Completion::Resolved { attempt, result } => self.on_resolved(attempt, result),
                    Completion::Started { attempt, result } => self.on_started(attempt, result),
                    Completion::Stopped { handle, result } => self.on_stopped(handle, result),
                },

                event = self.events.recv(), if self.events_open => match event {
                    Ok(event) => self.on_tunnel_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Tunnel events lagged, polling tunnel status");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Tunnel controller closed its event channel");
                        self.events_open = false;
                    }
                },

                _ = watchdog(deadline) => self.on_watchdog(),
            }
        }

        debug!("Connection session stopped");
    }

    fn publish(&self, state: SessionState) {
        debug!(state = %state, "Session state changed");
        self.publisher.publish(state);
    }

    /// Publish `Failed` followed by the automatic return to `Disconnected`
    fn fail(&self, reason: FailureReason) {
        self.publish(SessionState::Failed { reason });
        self.publish(SessionState::Disconnected);
    }

    fn connect_deadline(&self) -> Instant {
        Instant::now() + self.config.connect_timeout()
    }

    fn stop_deadline(&self) -> Instant {
        Instant::now() + self.config.disconnect_timeout()
    }

    fn on_connect(&mut self, request: ConnectionRequest, reply: Reply) {
        if !self.phase.is_idle() {
            debug!("Rejecting connect while a transition is in flight");
            let _ = reply.send(Err(SessionError::Busy));
            return;
        }

        let target = match request.target {
            ConnectionTarget::Last => match &self.last_known_good {
                Some(record) => ConnectionTarget::Server(record.server_id.clone()),
                None => {
                    let _ = reply.send(Err(SessionError::NoPriorConnection));
                    return;
                }
            },
            target => target,
        };

        self.begin_resolve(target, request.protocol, reply);
    }

    fn on_reconnect(&mut self, reply: Reply) {
        if !self.phase.is_idle() {
            debug!("Rejecting reconnect while a transition is in flight");
            let _ = reply.send(Err(SessionError::Busy));
            return;
        }

        let Some(record) = self.last_known_good.clone() else {
            let _ = reply.send(Err(SessionError::NoPriorConnection));
            return;
        };

        info!(server = %record.server_id, protocol = %record.protocol, "Reconnecting to last known good server");
        self.begin_resolve(ConnectionTarget::Server(record.server_id), record.protocol, reply);
    }

    fn on_disconnect(&mut self, reply: Reply) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => match self.connected.take() {
                Some(established) => {
                    info!(server = %established.server.id, "Disconnecting");
                    self.begin_stop(established.handle, AfterStop::Disconnect(reply));
                }
                None => {
                    debug!("Disconnect requested while already disconnected");
                    let _ = reply.send(Ok(SessionState::Disconnected));
                }
            },
            Phase::Resolving { reply: pending, .. } => {
                info!("Connect cancelled during server selection");
                let _ = pending.send(Err(SessionError::Cancelled));
                self.on_disconnect(reply);
            }
            Phase::Starting {
                attempt,
                reply: pending,
                ..
            } => {
                info!("Connect cancelled while the tunnel is starting");
                let _ = pending.send(Err(SessionError::Cancelled));
                self.publish(SessionState::Disconnecting);
                self.phase = Phase::Cancelling {
                    attempt,
                    reply,
                    deadline: self.stop_deadline(),
                };
            }
            Phase::Connecting {
                handle,
                reply: pending,
                ..
            } => {
                info!(handle = %handle, "Connect cancelled before the tunnel came up");
                let _ = pending.send(Err(SessionError::Cancelled));
                self.begin_stop(handle, AfterStop::Disconnect(reply));
            }
            phase @ (Phase::Cancelling { .. } | Phase::Stopping { .. }) => {
                self.phase = phase;
                debug!("Rejecting disconnect while a transition is in flight");
                let _ = reply.send(Err(SessionError::Busy));
            }
        }
    }

    fn begin_resolve(&mut self, target: ConnectionTarget, protocol: Protocol, reply: Reply) {
        self.attempt += 1;
        let attempt = self.attempt;
        let catalog = Arc::clone(&self.catalog);
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            let result = resolve(&catalog, &target, protocol).await;
            let _ = completions.send(Completion::Resolved { attempt, result });
        });

        self.phase = Phase::Resolving {
            attempt,
            protocol,
            reply,
        };
    }

    fn on_resolved(&mut self, attempt: u64, result: Result<Server, CatalogError>) {
        let (protocol, reply) = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Resolving {
                attempt: current,
                protocol,
                reply,
            } if current == attempt => (protocol, reply),
            phase => {
                self.phase = phase;
                debug!(attempt, "Ignoring stale server selection");
                return;
            }
        };

        let server = match result {
            Ok(server) => server,
            Err(e) => {
                warn!("Connection request rejected: {}", e);
                let _ = reply.send(Err(SessionError::InvalidRequest(e)));
                return;
            }
        };

        match self.connected.take() {
            Some(established) => {
                info!(from = %established.server.id, to = %server.id, "Switching servers");
                self.begin_stop(
                    established.handle,
                    AfterStop::Switch {
                        server,
                        protocol,
                        reply,
                    },
                );
            }
            None => self.begin_start(server, protocol, reply),
        }
    }

    fn begin_start(&mut self, server: Server, protocol: Protocol, reply: Reply) {
        self.attempt += 1;
        let attempt = self.attempt;
        info!(server = %server.id, %protocol, "Connecting");
        self.publish(SessionState::Connecting);

        let controller = Arc::clone(&self.controller);
        let completions = self.completions_tx.clone();
        let target = server.clone();
        tokio::spawn(async move {
            let result = controller.start(&target, protocol).await;
            let _ = completions.send(Completion::Started { attempt, result });
        });

        self.phase = Phase::Starting {
            attempt,
            server,
            protocol,
            reply,
            deadline: self.connect_deadline(),
        };
    }

    fn on_started(&mut self, attempt: u64, result: Result<TunnelHandle, TunnelError>) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Starting {
                attempt: current,
                server,
                protocol,
                reply,
                deadline,
            } if current == attempt => match result {
                Ok(handle) => {
                    debug!(handle = %handle, "Tunnel launched, waiting for it to come up");
                    self.phase = Phase::Connecting {
                        handle: handle.clone(),
                        server,
                        protocol,
                        reply,
                        deadline,
                    };
                    // Events for this handle may have arrived before its start finished.
                    self.sync_status(&handle);
                }
                Err(e) => {
                    warn!("Failed to start tunnel: {}", e);
                    self.fail(FailureReason::Tunnel(e.clone()));
                    let _ = reply.send(Err(SessionError::Tunnel(e)));
                }
            },
            Phase::Cancelling {
                attempt: current,
                reply,
                deadline,
            } if current == attempt => match result {
                Ok(handle) => {
                    self.spawn_stop(handle.clone());
                    self.phase = Phase::Stopping {
                        handle,
                        after: AfterStop::Disconnect(reply),
                        deadline,
                    };
                }
                Err(e) => {
                    debug!("Cancelled tunnel failed to start: {}", e);
                    self.publish(SessionState::Disconnected);
                    let _ = reply.send(Ok(SessionState::Disconnected));
                }
            },
            phase => {
                self.phase = phase;
                if let Ok(handle) = result {
                    warn!(handle = %handle, "Stopping tunnel from an abandoned connect attempt");
                    self.spawn_stop(handle);
                }
            }
        }
    }

    fn begin_stop(&mut self, handle: TunnelHandle, after: AfterStop) {
        self.publish(SessionState::Disconnecting);
        self.spawn_stop(handle.clone());
        self.phase = Phase::Stopping {
            handle,
            after,
            deadline: self.stop_deadline(),
        };
    }

    fn spawn_stop(&self, handle: TunnelHandle) {
        let controller = Arc::clone(&self.controller);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = controller.stop(&handle).await;
            let _ = completions.send(Completion::Stopped { handle, result });
        });
    }

    fn on_stopped(&mut self, handle: TunnelHandle, result: Result<(), TunnelError>) {
        let after = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Stopping {
                handle: current,
                after,
                ..
            } if current == handle => after,
            phase => {
                self.phase = phase;
                match result {
                    Ok(()) => debug!(handle = %handle, "Stale tunnel stopped"),
                    Err(e) => warn!(handle = %handle, "Failed to stop stale tunnel: {}", e),
                }
                return;
            }
        };

        // The tunnel may have exited on its own while we were stopping it.
        let result = match result {
            Err(TunnelError::NotRunning) => Ok(()),
            other => other,
        };

        match (after, result) {
            (AfterStop::Disconnect(reply), Ok(())) => {
                info!("Disconnected");
                self.publish(SessionState::Disconnected);
                let _ = reply.send(Ok(SessionState::Disconnected));
            }
            (AfterStop::Switch { server, protocol, reply }, Ok(())) => {
                self.publish(SessionState::Disconnected);
                self.begin_start(server, protocol, reply);
            }
            (AfterStop::Disconnect(reply) | AfterStop::Switch { reply, .. }, Err(e)) => {
                warn!(handle = %handle, "Failed to stop tunnel: {}", e);
                self.fail(FailureReason::Tunnel(e.clone()));
                let _ = reply.send(Err(SessionError::Tunnel(e)));
            }
            (AfterStop::Settle, result) => {
                if let Err(e) = result {
                    warn!(handle = %handle, "Failed to stop tunnel: {}", e);
                }
                self.publish(SessionState::Disconnected);
            }
        }
    }

    fn on_tunnel_event(&mut self, event: TunnelEvent) {
        let TunnelEvent { handle, kind } = event;

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting {
                handle: current,
                server,
                protocol,
                reply,
                ..
            } if current == handle => match kind {
                TunnelEventKind::Up => self.on_connected(handle, server, protocol, reply),
                TunnelEventKind::Down(reason) => {
                    warn!(handle = %handle, %reason, "Tunnel failed before coming up");
                    self.fail(FailureReason::Exited(reason.clone()));
                    let _ = reply.send(Err(SessionError::TunnelDown(reason)));
                }
            },
            phase => {
                self.phase = phase;
                let is_live = self
                    .connected
                    .as_ref()
                    .is_some_and(|established| established.handle == handle);

                match kind {
                    TunnelEventKind::Down(reason) if is_live => {
                        warn!(handle = %handle, %reason, "Tunnel went down unexpectedly");
                        self.connected = None;
                        self.fail(FailureReason::Exited(reason));
                    }
                    _ => debug!(handle = %handle, "Ignoring event for a tunnel that is not current"),
                }
            }
        }
    }

    fn on_connected(&mut self, handle: TunnelHandle, server: Server, protocol: Protocol, reply: Reply) {
        let started_at = Utc::now();
        let record = LastKnownGood {
            server_id: server.id.clone(),
            protocol,
            connected_at: started_at,
        };
        if let Err(e) = self.history.save(&record) {
            warn!("Failed to persist last known good connection: {}", e);
        }
        self.last_known_good = Some(record);

        info!(server = %server.id, %protocol, "Connected");
        let state = SessionState::Connected {
            server: server.clone(),
            protocol,
            started_at,
        };
        self.connected = Some(Established { handle, server });
        self.publish(state.clone());
        let _ = reply.send(Ok(state));
    }

    /// Poll the controller for a tunnel whose events may have been missed
    fn sync_status(&mut self, handle: &TunnelHandle) {
        match self.controller.status(handle) {
            TunnelStatus::Starting => {}
            TunnelStatus::Up => self.on_tunnel_event(TunnelEvent::up(handle.clone())),
            TunnelStatus::Down(reason) => {
                self.on_tunnel_event(TunnelEvent::down(handle.clone(), reason))
            }
        }
    }

    fn resync(&mut self) {
        let handle = match &self.phase {
            Phase::Connecting { handle, .. } => Some(handle.clone()),
            _ => self.connected.as_ref().map(|established| established.handle.clone()),
        };
        if let Some(handle) = handle {
            self.sync_status(&handle);
        }
    }

    fn on_watchdog(&mut self) {
        let connect_secs = self.config.connect_timeout_secs;
        let disconnect_secs = self.config.disconnect_timeout_secs;

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Starting { reply, .. } => {
                warn!("Tunnel did not start within {} seconds", connect_secs);
                // The late start result is stopped as an abandoned attempt.
                self.fail(watchdog_reason("connecting", connect_secs));
                let _ = reply.send(Err(watchdog_error("connecting", connect_secs)));
            }
            Phase::Connecting { handle, reply, .. } => {
                warn!(handle = %handle, "Tunnel did not come up within {} seconds", connect_secs);
                self.publish(SessionState::Failed {
                    reason: watchdog_reason("connecting", connect_secs),
                });
                let _ = reply.send(Err(watchdog_error("connecting", connect_secs)));

                // Failed is held until the half-started tunnel is gone.
                self.spawn_stop(handle.clone());
                self.phase = Phase::Stopping {
                    handle,
                    after: AfterStop::Settle,
                    deadline: self.stop_deadline(),
                };
            }
            Phase::Cancelling { reply, .. } => {
                warn!("Cancelled tunnel did not finish starting within {} seconds", disconnect_secs);
                self.fail(watchdog_reason("disconnecting", disconnect_secs));
                let _ = reply.send(Err(watchdog_error("disconnecting", disconnect_secs)));
            }
            Phase::Stopping { handle, after, .. } => {
                warn!(handle = %handle, "Tunnel did not stop within {} seconds", disconnect_secs);
                match after {
                    // Failed was already published for this attempt.
                    AfterStop::Settle => self.publish(SessionState::Disconnected),
                    AfterStop::Disconnect(reply) | AfterStop::Switch { reply, .. } => {
                        self.fail(watchdog_reason("disconnecting", disconnect_secs));
                        let _ = reply.send(Err(watchdog_error("disconnecting", disconnect_secs)));
                    }
                }
            }
            phase @ (Phase::Idle | Phase::Resolving { .. }) => self.phase = phase,
        }
    }

    /// Stop whatever tunnel is live before the actor exits
    async fn shutdown(&mut self) {
        let mut live = self.connected.take().map(|established| established.handle);

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Resolving { reply, .. } => {
                let _ = reply.send(Err(SessionError::Closed));
            }
            Phase::Starting {
                attempt,
                reply,
                deadline,
                ..
            } => {
                let _ = reply.send(Err(SessionError::Closed));
                live = self.wait_for_start(attempt, deadline).await;
            }
            Phase::Cancelling {
                attempt,
                reply,
                deadline,
            } => {
                let _ = reply.send(Err(SessionError::Closed));
                live = self.wait_for_start(attempt, deadline).await;
            }
            Phase::Connecting { handle, reply, .. } => {
                let _ = reply.send(Err(SessionError::Closed));
                live = Some(handle);
            }
            Phase::Stopping {
                handle, deadline, ..
            } => {
                self.wait_for_stop(&handle, deadline).await;
            }
        }

        if let Some(handle) = live {
            info!(handle = %handle, "Stopping tunnel before shutdown");
            self.publish(SessionState::Disconnecting);
            if let Err(e) = self.controller.stop(&handle).await {
                warn!(handle = %handle, "Failed to stop tunnel during shutdown: {}", e);
            }
        }

        if self.publisher.current() != SessionState::Disconnected {
            self.publish(SessionState::Disconnected);
        }
    }

    async fn wait_for_start(&mut self, attempt: u64, deadline: Instant) -> Option<TunnelHandle> {
        let completions = &mut self.completions;
        let wait = async {
            while let Some(completion) = completions.recv().await {
                if let Completion::Started {
                    attempt: current,
                    result,
                } = completion
                {
                    if current == attempt {
                        return result.ok();
                    }
                }
            }
            None
        };
        tokio::time::timeout_at(deadline, wait).await.ok().flatten()
    }

    async fn wait_for_stop(&mut self, handle: &TunnelHandle, deadline: Instant) {
        let completions = &mut self.completions;
        let wait = async {
            while let Some(completion) = completions.recv().await {
                if matches!(&completion, Completion::Stopped { handle: current, .. } if current == handle) {
                    return;
                }
            }
        };
        if tokio::time::timeout_at(deadline, wait).await.is_err() {
            warn!(handle = %handle, "Tunnel still stopping at shutdown");
        }
    }
}

/// Pick the server a request targets, refreshing the catalog once if needed
async fn resolve(
    catalog: &ServerCatalog,
    target: &ConnectionTarget,
    protocol: Protocol,
) -> Result<Server, CatalogError> {
    match select(catalog, target, protocol) {
        Err(e) if e.is_retryable() => {
            info!("{}; refreshing server list and retrying", e);
            if let Err(refresh_error) = catalog.refresh().await {
                warn!("Server list refresh failed: {}", refresh_error);
                return Err(e);
            }
            select(catalog, target, protocol)
        }
        result => result,
    }
}

fn select(
    catalog: &ServerCatalog,
    target: &ConnectionTarget,
    protocol: Protocol,
) -> Result<Server, CatalogError> {
    match target {
        ConnectionTarget::Fastest => catalog.fastest(protocol),
        ConnectionTarget::Random => catalog.random(protocol),
        ConnectionTarget::Server(id) => {
            let server = catalog.by_id(id)?;
            if server.supports(protocol) {
                Ok(server)
            } else {
                Err(CatalogError::NoServerAvailable { protocol })
            }
        }
        // Rewritten to an explicit server before resolution starts
        ConnectionTarget::Last => Err(CatalogError::NotFound {
            id: "last".to_string(),
        }),
    }
}

fn watchdog_reason(phase: &str, seconds: u64) -> FailureReason {
    FailureReason::Watchdog {
        phase: phase.to_string(),
        seconds,
    }
}

fn watchdog_error(phase: &str, seconds: u64) -> SessionError {
    SessionError::WatchdogExpired {
        phase: phase.to_string(),
        seconds,
    }
}

async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
