//! vpnctl - VPN session manager
//!
//! Command-line front-end for the vpnctl session manager: picks a server
//! from the catalog, drives the tunnel transport and reports every status
//! transition.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use vpnctl_core::{
    config::Plan,
    error::{LaunchError, SessionError, TunnelError, VpnctlError},
    init_logging,
    types::{ConnectionTarget, Feature, Protocol},
};

mod cli;

#[derive(Parser)]
#[command(name = "vpnctl")]
#[command(about = "VPN session manager with server selection and status reporting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the server catalog API token in the system keyring
    Login,
    /// List servers from the catalog
    Servers {
        /// Fetch a fresh server list first
        #[arg(long)]
        refresh: bool,
        /// Only servers supporting this protocol
        #[arg(long)]
        protocol: Option<Protocol>,
        /// Only servers with this feature (secure-core, tor, p2p)
        #[arg(long)]
        feature: Option<Feature>,
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect and stay in the foreground until Ctrl+C
    Connect {
        /// Connect to this server
        #[arg(long, conflicts_with_all = ["fastest", "random", "last"])]
        server: Option<String>,
        /// Least loaded server (default)
        #[arg(long)]
        fastest: bool,
        /// Random eligible server
        #[arg(long, conflicts_with = "fastest")]
        random: bool,
        /// Server of the last successful connection
        #[arg(long, conflicts_with_all = ["fastest", "random"])]
        last: bool,
        /// Protocol to use instead of the configured default
        #[arg(long)]
        protocol: Option<Protocol>,
    },
    /// Connect to the last server and protocol that worked
    Reconnect,
    /// Show the last connection and whether a transport is running
    Status,
    /// Terminate transport processes left behind by earlier sessions
    Cleanup,
    /// Manage preferences
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the current configuration
    Show,
    /// Set the default protocol
    SetProtocol { protocol: Protocol },
    /// Set DNS handling: leak-protection, none, or custom followed by up to three addresses
    SetDns {
        mode: String,
        servers: Vec<IpAddr>,
    },
    /// Set the subscription plan (free, basic, plus, visionary)
    SetPlan { plan: Plan },
    /// Turn the killswitch on or off
    SetKillswitch {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Exclude addresses or CIDR ranges from the tunnel; no arguments clears the list
    SetSplitTunnel { entries: Vec<String> },
    /// Remove the configuration directory and stored token
    Purge {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Login => cli::login::run_login(),
        Commands::Servers {
            refresh,
            protocol,
            feature,
            json,
        } => cli::servers::run_servers(refresh, protocol, feature, json),
        Commands::Connect {
            server,
            fastest: _,
            random,
            last,
            protocol,
        } => {
            let target = match (server, random, last) {
                (Some(id), _, _) => ConnectionTarget::Server(id),
                (None, true, _) => ConnectionTarget::Random,
                (None, _, true) => ConnectionTarget::Last,
                _ => ConnectionTarget::Fastest,
            };
            cli::connect::run_connect(target, protocol)
        }
        Commands::Reconnect => cli::connect::run_reconnect(),
        Commands::Status => cli::status::run_status(),
        Commands::Cleanup => cli::status::run_cleanup(),
        Commands::Config { action } => match action {
            ConfigCommands::Show => cli::config::run_show(),
            ConfigCommands::SetProtocol { protocol } => cli::config::run_set_protocol(protocol),
            ConfigCommands::SetDns { mode, servers } => cli::config::run_set_dns(&mode, servers),
            ConfigCommands::SetPlan { plan } => cli::config::run_set_plan(plan),
            ConfigCommands::SetKillswitch { enabled } => cli::config::run_set_killswitch(enabled),
            ConfigCommands::SetSplitTunnel { entries } => {
                cli::config::run_set_split_tunnel(entries)
            }
            ConfigCommands::Purge { yes } => cli::config::run_purge(yes),
        },
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(exit_code(&e));
        }
    }
}

/// Configuration and credential problems exit with 2, runtime failures with 1
fn exit_code(error: &VpnctlError) -> i32 {
    match error {
        VpnctlError::Config(_) | VpnctlError::Toml(_) | VpnctlError::TomlSerialize(_) => 2,
        VpnctlError::Keyring(_) => 2,
        VpnctlError::Tunnel(TunnelError::Launch(launch))
        | VpnctlError::Session(SessionError::Tunnel(TunnelError::Launch(launch))) => match launch {
            LaunchError::BinaryMissing { .. } | LaunchError::PrivilegeDenied => 2,
            LaunchError::SpawnFailed { .. } | LaunchError::SystemConfig { .. } => 1,
        },
        VpnctlError::Catalog(_)
        | VpnctlError::Tunnel(_)
        | VpnctlError::Session(_)
        | VpnctlError::Io(_) => 1,
    }
}
