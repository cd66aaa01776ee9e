//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands.

pub mod config;
pub mod connect;
pub mod login;
pub mod servers;
pub mod status;

use std::io::{self, Write};
use tracing::warn;
use vpnctl_core::{
    auth::keyring,
    catalog::{source_from_config, ServerCatalog},
    config::toml_config::{get_server_cache_path, TomlConfig},
    error::{KeyringError, VpnctlError},
};

/// Keyring account the API token is stored under
pub const TOKEN_ACCOUNT: &str = "default";

/// Runtime for the commands that need async I/O
pub fn runtime() -> Result<tokio::runtime::Runtime, VpnctlError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(VpnctlError::Io)
}

/// Build the server catalog described by the configuration
///
/// The catalog starts empty; it is filled on the first refresh.
pub fn build_catalog(config: &TomlConfig) -> Result<ServerCatalog, VpnctlError> {
    // Only the API needs the token
    let token = match config.catalog.endpoint {
        Some(_) => match keyring::retrieve_token(TOKEN_ACCOUNT) {
            Ok(token) => Some(token),
            Err(VpnctlError::Keyring(KeyringError::TokenNotFound)) => None,
            Err(e) => {
                warn!("Continuing without API token: {}", e);
                None
            }
        },
        None => None,
    };

    let source = source_from_config(&config.catalog, token, get_server_cache_path()?)?;
    Ok(ServerCatalog::new(source, config.preferences.plan.tier()))
}

/// Prompt for yes/no with default
pub fn prompt_yes_no(prompt: &str, default_yes: bool) -> Result<bool, VpnctlError> {
    let default_indicator = if default_yes { "[Y/n]" } else { "[y/N]" };
    let prompt_text = format!("{} {}: ", prompt, default_indicator);

    loop {
        let input = prompt_input(&prompt_text)?.to_lowercase();

        match input.as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            "" => return Ok(default_yes),
            _ => {
                println!("Please enter 'y' for yes or 'n' for no.");
                continue;
            }
        }
    }
}

/// Low-level input prompting
pub fn prompt_input(prompt: &str) -> Result<String, VpnctlError> {
    print!("{}", prompt);
    io::stdout().flush().map_err(VpnctlError::Io)?;

    let mut input = String::new();
    io::stdin().read_line(&mut input).map_err(VpnctlError::Io)?;

    Ok(input.trim_end().to_string())
}
