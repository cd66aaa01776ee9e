//! Status and cleanup commands

use super::runtime;
use chrono::{Local, Utc};
use colored::Colorize;
use vpnctl_core::{
    config::toml_config::{get_history_path, load_config},
    error::VpnctlError,
    vpn::{
        process::{cleanup_orphaned_processes, find_transport_processes, is_process_alive},
        LastKnownGoodStore,
    },
};

/// Run the status command
pub fn run_status() -> Result<(), VpnctlError> {
    let config = load_config()?;
    let pids: Vec<u32> = find_transport_processes(&config.tunnel.binary)
        .into_iter()
        .filter(|pid| is_process_alive(*pid, &config.tunnel.binary))
        .collect();

    if pids.is_empty() {
        println!("{} no {} process running", "●".dimmed(), config.tunnel.binary);
    } else {
        println!(
            "{} {} running (PID {})",
            "●".green(),
            config.tunnel.binary,
            pids.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
        );
    }

    match LastKnownGoodStore::new(get_history_path()?).load()? {
        Some(record) => {
            let minutes = (Utc::now() - record.connected_at).num_minutes();
            println!(
                "Last connection: {} over {} at {} ({} min ago)",
                record.server_id.bold(),
                record.protocol,
                record.connected_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                minutes
            );
        }
        None => println!("No successful connection recorded yet"),
    }

    println!(
        "Plan: {:?}, protocol: {}, killswitch: {}",
        config.preferences.plan,
        config.preferences.default_protocol,
        if config.preferences.killswitch { "on" } else { "off" }
    );

    Ok(())
}

/// Run the cleanup command
pub fn run_cleanup() -> Result<(), VpnctlError> {
    let config = load_config()?;
    let binary = config.tunnel.binary.clone();
    let grace = config.tunnel.grace_period();

    let terminated = runtime()?.block_on(cleanup_orphaned_processes(&binary, grace));

    if terminated.is_empty() {
        println!("No {} processes to clean up", binary);
    } else {
        println!(
            "{} Terminated {} {} process(es): {:?}",
            "✓".green(),
            terminated.len(),
            binary,
            terminated
        );
    }
    Ok(())
}
