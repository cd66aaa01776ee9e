//! Preference management commands

use super::{prompt_yes_no, TOKEN_ACCOUNT};
use colored::Colorize;
use std::net::IpAddr;
use vpnctl_core::{
    auth::keyring,
    config::{
        toml_config::{get_config_path, load_config, purge_config, save_config, TomlConfig},
        DnsPreference, Plan,
    },
    error::{ConfigError, VpnctlError},
    types::Protocol,
};

/// Run the config show command
pub fn run_show() -> Result<(), VpnctlError> {
    let config = load_config()?;
    println!("# {}", get_config_path()?.display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn run_set_protocol(protocol: Protocol) -> Result<(), VpnctlError> {
    update(|config| config.preferences.default_protocol = protocol)?;
    println!("{} Default protocol set to {}", "✓".green(), protocol);
    Ok(())
}

pub fn run_set_dns(mode: &str, servers: Vec<IpAddr>) -> Result<(), VpnctlError> {
    let dns = parse_dns(mode, servers)?;
    let description = dns.to_env();
    update(|config| config.preferences.dns = dns)?;
    println!("{} DNS set to {}", "✓".green(), description);
    Ok(())
}

pub fn run_set_plan(plan: Plan) -> Result<(), VpnctlError> {
    update(|config| config.preferences.plan = plan)?;
    println!("{} Plan set to {:?}", "✓".green(), plan);
    Ok(())
}

pub fn run_set_killswitch(enabled: bool) -> Result<(), VpnctlError> {
    update(|config| config.preferences.killswitch = enabled)?;
    println!(
        "{} Killswitch {}",
        "✓".green(),
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Replace the split tunnelling exclusions; no entries clears the list
pub fn run_set_split_tunnel(entries: Vec<String>) -> Result<(), VpnctlError> {
    let count = entries.len();
    update(|config| config.preferences.split_tunnel = entries)?;
    if count == 0 {
        println!("{} Split tunnelling disabled", "✓".green());
    } else {
        println!("{} {} address(es) excluded from the tunnel", "✓".green(), count);
    }
    Ok(())
}

/// Run the config purge command
pub fn run_purge(yes: bool) -> Result<(), VpnctlError> {
    if !yes && !prompt_yes_no("Remove all vpnctl configuration and the stored token?", false)? {
        println!("Purge cancelled.");
        return Ok(());
    }

    let removed = purge_config()?;
    keyring::delete_token(TOKEN_ACCOUNT)?;

    if removed {
        println!("{} Configuration purged", "✓".green());
    } else {
        println!("Nothing to purge");
    }
    Ok(())
}

/// Load, modify and save the configuration; validation happens on save
fn update(change: impl FnOnce(&mut TomlConfig)) -> Result<(), VpnctlError> {
    let mut config = load_config()?;
    change(&mut config);
    save_config(&config)
}

fn parse_dns(mode: &str, servers: Vec<IpAddr>) -> Result<DnsPreference, VpnctlError> {
    let invalid = |message: String| VpnctlError::Config(ConfigError::ValidationError { message });

    match mode {
        "custom" => Ok(DnsPreference::Custom { servers }),
        "leak-protection" | "none" if !servers.is_empty() => Err(invalid(format!(
            "DNS mode '{}' does not take server addresses",
            mode
        ))),
        "leak-protection" => Ok(DnsPreference::LeakProtection),
        "none" => Ok(DnsPreference::None),
        other => Err(invalid(format!(
            "unknown DNS mode '{}', expected leak-protection, none or custom",
            other
        ))),
    }
}
