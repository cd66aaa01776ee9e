//! Connection session state machine tests
//!
//! Drive a session against the in-memory controller and check both the
//! operation results and the exact sequence of published states.

mod common;

use common::{next_state, sample_servers, server, spawn_session, MockController};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vpnctl_core::catalog::ServerCatalog;
use vpnctl_core::error::{CatalogError, LaunchError, SessionError, TunnelError};
use vpnctl_core::types::{ConnectionRequest, ConnectionTarget, Protocol};
use vpnctl_core::vpn::{
    ConnectionSession, ExitReason, FailureReason, LastKnownGoodStore, SessionConfig, SessionState,
};

#[tokio::test]
async fn test_connect_fastest_reaches_connected() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let state = session.connect(ConnectionRequest::fastest(Protocol::Tcp)).await.unwrap();

    match &state {
        SessionState::Connected { server, protocol, .. } => {
            assert_eq!(server.id, "B#1");
            assert_eq!(*protocol, Protocol::Tcp);
        }
        other => panic!("expected Connected, got {:?}", other),
    }
    assert_eq!(next_state(&mut stream).await, SessionState::Connecting);
    assert_eq!(next_state(&mut stream).await, state);
    assert_eq!(session.current(), state);
    assert_eq!(controller.start_count(), 1);

    let record = session.last_known_good().await.unwrap();
    assert_eq!(record.server_id, "B#1");
    assert_eq!(record.protocol, Protocol::Tcp);
}

#[tokio::test]
async fn test_disconnect_twice_is_idempotent() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());

    session.connect(ConnectionRequest::fastest(Protocol::Udp)).await.unwrap();
    let mut stream = session.subscribe();

    assert_eq!(session.disconnect().await.unwrap(), SessionState::Disconnected);
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnecting);
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnected);

    assert_eq!(session.disconnect().await.unwrap(), SessionState::Disconnected);
    assert!(stream.try_next().is_none());
    assert_eq!(controller.stopped().len(), 1);
}

#[tokio::test]
async fn test_connect_while_connecting_is_busy() {
    let controller = MockController::new(false);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(ConnectionRequest::fastest(Protocol::Udp)).await })
    };
    let handle = controller.wait_for_live().await;

    let second = session.connect(ConnectionRequest::random(Protocol::Udp)).await;
    assert_eq!(second, Err(SessionError::Busy));
    assert_eq!(session.reconnect().await, Err(SessionError::Busy));
    assert_eq!(controller.start_count(), 1);

    controller.emit_up(&handle);
    let state = first.await.unwrap().unwrap();
    assert!(state.is_connected());
    assert_eq!(controller.start_count(), 1);
}

#[tokio::test]
async fn test_disconnect_before_tunnel_up_cancels_connect() {
    let controller = MockController::new(false);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(ConnectionRequest::fastest(Protocol::Tcp)).await })
    };
    let handle = controller.wait_for_live().await;

    assert_eq!(session.disconnect().await.unwrap(), SessionState::Disconnected);
    assert_eq!(connect.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(controller.stopped(), vec![handle]);
    assert_eq!(session.current(), SessionState::Disconnected);
    assert!(session.last_known_good().await.is_none());
}

#[tokio::test]
async fn test_reconnect_without_prior_connection() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    assert_eq!(session.reconnect().await, Err(SessionError::NoPriorConnection));
    assert_eq!(
        session
            .connect(ConnectionRequest::new(ConnectionTarget::Last, Protocol::Udp))
            .await,
        Err(SessionError::NoPriorConnection)
    );

    assert_eq!(session.current(), SessionState::Disconnected);
    assert!(stream.try_next().is_none());
    assert_eq!(controller.start_count(), 0);
}

#[tokio::test]
async fn test_unknown_server_is_rejected_without_state_change() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let result = session.connect(ConnectionRequest::server("ZZ#9", Protocol::Tcp)).await;
    assert_eq!(
        result,
        Err(SessionError::InvalidRequest(CatalogError::NotFound {
            id: "ZZ#9".to_string()
        }))
    );

    // C#1 does not offer tcp
    let result = session.connect(ConnectionRequest::server("C#1", Protocol::Tcp)).await;
    assert!(matches!(result, Err(SessionError::InvalidRequest(_))));

    assert!(stream.try_next().is_none());
    assert_eq!(controller.start_count(), 0);
}

#[tokio::test]
async fn test_server_above_plan_tier_is_rejected() {
    let mut servers = sample_servers();
    servers[1].tier = 2;
    let controller = MockController::new(true);
    let session = spawn_session(servers, controller.clone(), LastKnownGoodStore::in_memory());

    let result = session.connect(ConnectionRequest::server("B#1", Protocol::Tcp)).await;
    assert_eq!(
        result,
        Err(SessionError::InvalidRequest(CatalogError::TierRestricted {
            id: "B#1".to_string(),
            tier: 2
        }))
    );

    // B is no longer eligible, so fastest tcp falls back to A
    let state = session.connect(ConnectionRequest::fastest(Protocol::Tcp)).await.unwrap();
    assert!(matches!(state, SessionState::Connected { ref server, .. } if server.id == "A#1"));
}

#[tokio::test]
async fn test_stale_down_event_does_not_disturb_new_connection() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());

    session.connect(ConnectionRequest::server("A#1", Protocol::Tcp)).await.unwrap();
    let old = controller.live_handle().unwrap();
    session.disconnect().await.unwrap();

    let state = session.connect(ConnectionRequest::server("B#1", Protocol::Udp)).await.unwrap();
    let current = controller.live_handle().unwrap();
    assert_ne!(old, current);

    controller.emit_down(&old, ExitReason::Exited { code: Some(1) });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.current(), state);
}

#[tokio::test]
async fn test_unexpected_tunnel_down_while_connected() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());

    session.connect(ConnectionRequest::fastest(Protocol::Udp)).await.unwrap();
    let handle = controller.live_handle().unwrap();
    let mut stream = session.subscribe();

    let reason = ExitReason::Exited { code: Some(1) };
    controller.emit_down(&handle, reason.clone());

    assert_eq!(
        next_state(&mut stream).await,
        SessionState::Failed {
            reason: FailureReason::Exited(reason)
        }
    );
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnected);

    // Disconnected again, so a new connect is accepted
    assert_eq!(session.disconnect().await.unwrap(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_tunnel_failing_before_up() {
    let controller = MockController::new(false);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(ConnectionRequest::fastest(Protocol::Tcp)).await })
    };
    let handle = controller.wait_for_live().await;
    controller.emit_down(&handle, ExitReason::AuthenticationFailed);

    assert_eq!(
        connect.await.unwrap(),
        Err(SessionError::TunnelDown(ExitReason::AuthenticationFailed))
    );
    assert_eq!(next_state(&mut stream).await, SessionState::Connecting);
    assert_eq!(
        next_state(&mut stream).await,
        SessionState::Failed {
            reason: FailureReason::Exited(ExitReason::AuthenticationFailed)
        }
    );
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnected);
    assert!(session.last_known_good().await.is_none());
}

#[tokio::test]
async fn test_launch_error_is_carried_unchanged() {
    let controller = MockController::new(true);
    let launch = TunnelError::Launch(LaunchError::BinaryMissing {
        binary: "openvpn".to_string(),
    });
    controller.fail_next_start(launch.clone());

    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let result = session.connect(ConnectionRequest::fastest(Protocol::Tcp)).await;
    assert_eq!(result, Err(SessionError::Tunnel(launch.clone())));

    assert_eq!(next_state(&mut stream).await, SessionState::Connecting);
    assert_eq!(
        next_state(&mut stream).await,
        SessionState::Failed {
            reason: FailureReason::Tunnel(launch)
        }
    );
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnected);
}

#[tokio::test]
async fn test_connect_while_connected_switches_servers() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());

    session.connect(ConnectionRequest::fastest(Protocol::Tcp)).await.unwrap();
    let first = controller.live_handle().unwrap();
    let mut stream = session.subscribe();

    let state = session.connect(ConnectionRequest::server("C#1", Protocol::Udp)).await.unwrap();

    assert_eq!(next_state(&mut stream).await, SessionState::Disconnecting);
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnected);
    assert_eq!(next_state(&mut stream).await, SessionState::Connecting);
    assert_eq!(next_state(&mut stream).await, state);

    assert_eq!(controller.stopped(), vec![first]);
    assert_eq!(controller.start_count(), 2);
    assert_eq!(session.last_known_good().await.unwrap().server_id, "C#1");
}

#[tokio::test]
async fn test_reconnect_uses_last_known_good_across_restarts() {
    let dir = TempDir::new().unwrap();
    let history_path = dir.path().join("last_connection.toml");

    let controller = MockController::new(true);
    let session = spawn_session(
        sample_servers(),
        controller.clone(),
        LastKnownGoodStore::new(&history_path),
    );
    session.connect(ConnectionRequest::server("A#1", Protocol::Tcp)).await.unwrap();
    session.shutdown().await;
    assert_eq!(controller.stopped().len(), 1);

    let record = LastKnownGoodStore::new(&history_path).load().unwrap().unwrap();
    assert_eq!(record.server_id, "A#1");

    let controller = MockController::new(true);
    let session = spawn_session(
        sample_servers(),
        controller.clone(),
        LastKnownGoodStore::new(&history_path),
    );
    let state = session.reconnect().await.unwrap();

    match state {
        SessionState::Connected { server, protocol, .. } => {
            assert_eq!(server.id, "A#1");
            assert_eq!(protocol, Protocol::Tcp);
        }
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_server_triggers_catalog_refresh() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join("servers.json");
    std::fs::write(
        &cache,
        serde_json::json!({ "servers": [server("NL#7", 30, 12, &[Protocol::Udp])] }).to_string(),
    )
    .unwrap();

    let catalog = Arc::new(ServerCatalog::new(
        Box::new(vpnctl_core::catalog::FileServerSource::new(&cache)),
        0,
    ));
    assert!(catalog.is_empty());

    let controller = MockController::new(true);
    let session = ConnectionSession::spawn(
        catalog.clone(),
        controller,
        LastKnownGoodStore::in_memory(),
        SessionConfig::default(),
    );

    let state = session.connect(ConnectionRequest::server("NL#7", Protocol::Udp)).await;
    tokio_test::assert_ok!(&state);
    assert_eq!(catalog.servers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_watchdog_forces_failure() {
    let controller = MockController::new(false);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let result = session.connect(ConnectionRequest::fastest(Protocol::Udp)).await;
    assert_eq!(
        result,
        Err(SessionError::WatchdogExpired {
            phase: "connecting".to_string(),
            seconds: 30
        })
    );

    assert_eq!(stream.next().await, Some(SessionState::Connecting));
    assert!(matches!(
        stream.next().await,
        Some(SessionState::Failed {
            reason: FailureReason::Watchdog { .. }
        })
    ));
    assert_eq!(stream.next().await, Some(SessionState::Disconnected));

    // The half-started tunnel was stopped
    assert_eq!(controller.stopped().len(), 1);
    assert!(controller.live_handle().is_none());
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_tunnel() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    session.connect(ConnectionRequest::fastest(Protocol::Tcp)).await.unwrap();
    drop(session);

    let mut last = None;
    while let Some(state) = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
    {
        last = Some(state);
    }
    assert_eq!(last, Some(SessionState::Disconnected));
    assert_eq!(controller.stopped().len(), 1);
}

#[tokio::test]
async fn test_disconnect_while_start_is_running_stops_late_tunnel() {
    let controller = MockController::new(true);
    controller.delay_start(Duration::from_millis(300));
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(ConnectionRequest::fastest(Protocol::Udp)).await })
    };
    assert_eq!(next_state(&mut stream).await, SessionState::Connecting);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.start_count(), 0);

    assert_eq!(session.disconnect().await.unwrap(), SessionState::Disconnected);
    assert_eq!(connect.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnecting);
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnected);

    // The tunnel that finished starting after the cancel was torn down
    assert_eq!(controller.start_count(), 1);
    assert_eq!(controller.stopped().len(), 1);
    assert!(controller.live_handle().is_none());
    assert!(session.last_known_good().await.is_none());
}

#[tokio::test]
async fn test_start_failing_after_cancel_still_disconnects() {
    let controller = MockController::new(true);
    controller.delay_start(Duration::from_millis(300));
    controller.fail_next_start(TunnelError::Launch(LaunchError::PrivilegeDenied));
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let connect = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(ConnectionRequest::fastest(Protocol::Udp)).await })
    };
    assert_eq!(next_state(&mut stream).await, SessionState::Connecting);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.disconnect().await.unwrap(), SessionState::Disconnected);
    assert_eq!(connect.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnecting);
    assert_eq!(next_state(&mut stream).await, SessionState::Disconnected);

    // Nothing was started, so nothing needed stopping
    assert!(controller.stopped().is_empty());
    assert_eq!(session.current(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_watchdog_forces_failure() {
    let controller = MockController::new(true);
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    session.connect(ConnectionRequest::fastest(Protocol::Udp)).await.unwrap();

    controller.delay_stop(Duration::from_secs(120));
    let mut stream = session.subscribe();

    assert_eq!(
        session.disconnect().await,
        Err(SessionError::WatchdogExpired {
            phase: "disconnecting".to_string(),
            seconds: 15
        })
    );
    assert_eq!(stream.next().await, Some(SessionState::Disconnecting));
    assert_eq!(
        stream.next().await,
        Some(SessionState::Failed {
            reason: FailureReason::Watchdog {
                phase: "disconnecting".to_string(),
                seconds: 15
            }
        })
    );
    assert_eq!(stream.next().await, Some(SessionState::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_stop_after_connect_watchdog_fails_once() {
    let controller = MockController::new(false);
    controller.delay_stop(Duration::from_secs(120));
    let session = spawn_session(sample_servers(), controller.clone(), LastKnownGoodStore::in_memory());
    let mut stream = session.subscribe();

    let result = session.connect(ConnectionRequest::fastest(Protocol::Udp)).await;
    assert!(matches!(result, Err(SessionError::WatchdogExpired { .. })));

    assert_eq!(stream.next().await, Some(SessionState::Connecting));
    assert!(matches!(
        stream.next().await,
        Some(SessionState::Failed {
            reason: FailureReason::Watchdog { .. }
        })
    ));
    // The stop watchdog settles the session without a second failure
    assert_eq!(stream.next().await, Some(SessionState::Disconnected));
    assert!(
        tokio::time::timeout(Duration::from_secs(300), stream.next())
            .await
            .is_err()
    );
    assert_eq!(session.current(), SessionState::Disconnected);
}
