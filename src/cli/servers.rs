//! Server listing command

use super::{build_catalog, runtime};
use colored::Colorize;
use tracing::warn;
use vpnctl_core::{
    config::toml_config::load_config,
    error::VpnctlError,
    types::{Feature, Protocol, Server},
};

/// Run the servers command
pub fn run_servers(
    refresh: bool,
    protocol: Option<Protocol>,
    feature: Option<Feature>,
    json: bool,
) -> Result<(), VpnctlError> {
    let config = load_config()?;
    let catalog = build_catalog(&config)?;

    runtime()?.block_on(async {
        if let Err(e) = catalog.refresh().await {
            if refresh || catalog.is_empty() {
                return Err(VpnctlError::Catalog(e));
            }
            warn!("Using cached server list: {}", e);
        }
        Ok(())
    })?;

    let max_tier = config.preferences.plan.tier();
    let mut servers: Vec<Server> = match feature {
        // Feature listings only offer servers the plan can connect to
        Some(feature) => protocol
            .map_or_else(|| vec![Protocol::Udp, Protocol::Tcp], |p| vec![p])
            .into_iter()
            .flat_map(|p| catalog.with_feature(feature, p))
            .collect(),
        None => catalog
            .servers()
            .iter()
            .filter(|s| protocol.map_or(true, |p| s.supports(p)))
            .cloned()
            .collect(),
    };
    servers.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)));
    servers.dedup_by(|a, b| a.id == b.id);

    if json {
        let output = serde_json::to_string_pretty(&servers).map_err(|e| {
            VpnctlError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        println!("{}", output);
        return Ok(());
    }

    if servers.is_empty() {
        println!("No matching servers");
        return Ok(());
    }

    println!(
        "{:<12} {:<8} {:>5} {:>8}  {:<8} {}",
        "SERVER", "COUNTRY", "LOAD", "LATENCY", "PROTO", "FEATURES"
    );
    for server in &servers {
        let protocols: Vec<&str> = server.protocols.iter().map(|p| p.as_str()).collect();
        let mut features = Vec::new();
        if server.features.secure_core {
            features.push("secure-core");
        }
        if server.features.tor {
            features.push("tor");
        }
        if server.features.p2p {
            features.push("p2p");
        }

        let line = format!(
            "{:<12} {:<8} {:>4}% {:>6}ms  {:<8} {}",
            server.id,
            server.country,
            server.load,
            server.latency_ms,
            protocols.join(","),
            features.join(",")
        );
        if server.tier > max_tier {
            println!("{} {}", line.dimmed(), "(plan upgrade required)".dimmed());
        } else {
            println!("{}", line);
        }
    }

    Ok(())
}
