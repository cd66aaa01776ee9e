//! Foreground connection commands
//!
//! Runs a connection session until Ctrl+C or until the tunnel drops,
//! printing every status transition.

use super::{build_catalog, runtime};
use colored::Colorize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use vpnctl_core::{
    config::toml_config::{get_history_path, load_config, TomlConfig},
    error::VpnctlError,
    types::{ConnectionRequest, ConnectionTarget, Protocol},
    vpn::{
        configurator_from_config, ConnectionSession, LastKnownGoodStore, ProcessTunnelController,
        SessionState,
    },
};

/// Run the connect command
pub fn run_connect(target: ConnectionTarget, protocol: Option<Protocol>) -> Result<(), VpnctlError> {
    let config = load_config()?;
    let protocol = protocol.unwrap_or(config.preferences.default_protocol);
    let request = ConnectionRequest::new(target, protocol);

    runtime()?.block_on(run_session(config, Some(request)))
}

/// Run the reconnect command
pub fn run_reconnect() -> Result<(), VpnctlError> {
    let config = load_config()?;
    runtime()?.block_on(run_session(config, None))
}

async fn run_session(
    config: TomlConfig,
    request: Option<ConnectionRequest>,
) -> Result<(), VpnctlError> {
    let catalog = Arc::new(build_catalog(&config)?);
    let controller = Arc::new(ProcessTunnelController::new(
        config.tunnel.clone(),
        config.preferences.clone(),
        configurator_from_config(&config.system),
    )?);
    let history = LastKnownGoodStore::new(get_history_path()?);

    let session = ConnectionSession::spawn(catalog, controller, history, config.session.clone());

    let mut stream = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(state) = stream.next().await {
            print_state(&state);
        }
    });

    let result = match request {
        Some(request) => session.connect(request).await,
        None => session.reconnect().await,
    };

    if let Err(e) = result {
        session.shutdown().await;
        drop(session);
        let _ = printer.await;
        return Err(e.into());
    }

    println!("Press Ctrl+C to disconnect");
    let mut states = session.publisher().watch();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, disconnecting");
            session.disconnect().await?;
        }
        _ = wait_until_disconnected(&mut states) => {
            info!("Tunnel is gone, leaving");
        }
    }

    session.shutdown().await;
    drop(session);
    let _ = printer.await;
    Ok(())
}

async fn wait_until_disconnected(states: &mut watch::Receiver<SessionState>) {
    while states.changed().await.is_ok() {
        if *states.borrow_and_update() == SessionState::Disconnected {
            return;
        }
    }
}

fn print_state(state: &SessionState) {
    match state {
        SessionState::Connecting => println!("{}", "⏳ Connecting...".yellow()),
        SessionState::Connected {
            server, protocol, ..
        } => println!(
            "{} {} ({}) over {}, load {}%",
            "✓ Connected to".green().bold(),
            server.id.bold(),
            server.country,
            protocol,
            server.load
        ),
        SessionState::Disconnecting => println!("{}", "⏳ Disconnecting...".yellow()),
        SessionState::Disconnected => println!("{}", "● Disconnected".dimmed()),
        SessionState::Failed { reason } => println!("{} {}", "✗ Failed:".red().bold(), reason),
    }
}
