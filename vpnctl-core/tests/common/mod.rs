//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use vpnctl_core::catalog::ServerCatalog;
use vpnctl_core::error::TunnelError;
use vpnctl_core::types::{Protocol, Server, ServerFeatures};
use vpnctl_core::vpn::{
    ConnectionSession, ExitReason, LastKnownGoodStore, SessionConfig, SessionState, StatusStream,
    TunnelController, TunnelEvent, TunnelHandle, TunnelStatus,
};

pub fn server(id: &str, load: u8, latency_ms: u32, protocols: &[Protocol]) -> Server {
    Server {
        id: id.to_string(),
        country: id.split('#').next().unwrap_or(id).to_string(),
        load,
        latency_ms,
        protocols: protocols.to_vec(),
        features: ServerFeatures::default(),
        tier: 0,
    }
}

/// A:80 tcp, B:20 tcp+udp, C:20 udp (C answers faster than B)
pub fn sample_servers() -> Vec<Server> {
    vec![
        server("A#1", 80, 15, &[Protocol::Tcp]),
        server("B#1", 20, 30, &[Protocol::Tcp, Protocol::Udp]),
        server("C#1", 20, 10, &[Protocol::Udp]),
    ]
}

#[derive(Default)]
struct MockState {
    starts: usize,
    stopped: Vec<TunnelHandle>,
    live: Option<(TunnelHandle, TunnelStatus)>,
    fail_start: Option<TunnelError>,
    start_delay: Option<Duration>,
    stop_delay: Option<Duration>,
}

/// In-memory tunnel controller that records every call
///
/// With `auto_up` every started tunnel reports up immediately; otherwise
/// the test drives it with [`MockController::emit_up`] and
/// [`MockController::emit_down`].
pub struct MockController {
    auto_up: bool,
    state: Mutex<MockState>,
    events: broadcast::Sender<TunnelEvent>,
}

impl MockController {
    pub fn new(auto_up: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            auto_up,
            state: Mutex::new(MockState::default()),
            events,
        })
    }

    pub fn fail_next_start(&self, error: TunnelError) {
        self.state.lock().unwrap().fail_start = Some(error);
    }

    /// Make every `start` take `delay` before it answers
    pub fn delay_start(&self, delay: Duration) {
        self.state.lock().unwrap().start_delay = Some(delay);
    }

    /// Make every `stop` take `delay` before it answers
    pub fn delay_stop(&self, delay: Duration) {
        self.state.lock().unwrap().stop_delay = Some(delay);
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stopped(&self) -> Vec<TunnelHandle> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn live_handle(&self) -> Option<TunnelHandle> {
        self.state
            .lock()
            .unwrap()
            .live
            .as_ref()
            .map(|(handle, _)| handle.clone())
    }

    /// Wait until a tunnel has been started
    pub async fn wait_for_live(&self) -> TunnelHandle {
        for _ in 0..200 {
            if let Some(handle) = self.live_handle() {
                return handle;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no tunnel was started");
    }

    pub fn emit_up(&self, handle: &TunnelHandle) {
        self.set_status(handle, TunnelStatus::Up);
        let _ = self.events.send(TunnelEvent::up(handle.clone()));
    }

    pub fn emit_down(&self, handle: &TunnelHandle, reason: ExitReason) {
        self.set_status(handle, TunnelStatus::Down(reason.clone()));
        let _ = self.events.send(TunnelEvent::down(handle.clone(), reason));
    }

    fn set_status(&self, handle: &TunnelHandle, status: TunnelStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some((live, current)) = state.live.as_mut() {
            if live == handle {
                *current = status;
            }
        }
    }
}

#[async_trait]
impl TunnelController for MockController {
    async fn start(&self, server: &Server, protocol: Protocol) -> Result<TunnelHandle, TunnelError> {
        let delay = self.state.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handle = {
            let mut state = self.state.lock().unwrap();
            if matches!(state.live, Some((_, ref status)) if !matches!(status, TunnelStatus::Down(_))) {
                return Err(TunnelError::AlreadyRunning);
            }
            if let Some(error) = state.fail_start.take() {
                return Err(error);
            }

            state.starts += 1;
            let handle = TunnelHandle::allocate(server, protocol);
            state.live = Some((handle.clone(), TunnelStatus::Starting));
            handle
        };

        if self.auto_up {
            self.emit_up(&handle);
        }
        Ok(handle)
    }

    async fn stop(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        let delay = self.state.lock().unwrap().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.stopped.push(handle.clone());
            match &state.live {
                Some((live, _)) if live == handle => state.live = None,
                _ => return Err(TunnelError::NotRunning),
            }
        }
        let _ = self
            .events
            .send(TunnelEvent::down(handle.clone(), ExitReason::Stopped));
        Ok(())
    }

    fn status(&self, handle: &TunnelHandle) -> TunnelStatus {
        match &self.state.lock().unwrap().live {
            Some((live, status)) if live == handle => status.clone(),
            _ => TunnelStatus::Down(ExitReason::Stopped),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }
}

pub fn spawn_session(
    servers: Vec<Server>,
    controller: Arc<MockController>,
    history: LastKnownGoodStore,
) -> ConnectionSession {
    let catalog = Arc::new(ServerCatalog::with_servers(servers, 0));
    ConnectionSession::spawn(catalog, controller, history, SessionConfig::default())
}

/// Next published state, failing the test if none arrives in time
pub async fn next_state(stream: &mut StatusStream) -> SessionState {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for a state")
        .expect("status stream closed")
}
