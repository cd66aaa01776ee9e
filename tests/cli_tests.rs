//! Integration tests for the preference commands
//!
//! Each test points the binary at its own configuration directory through
//! VPNCTL_CONFIG_DIR, so they can run in parallel.

use std::fs;
use std::process::{Command, Output};
use tempfile::TempDir;

fn vpnctl(config_dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vpnctl"))
        .args(args)
        .env("VPNCTL_CONFIG_DIR", config_dir.path())
        .env("VPNCTL_LOG", "warn")
        .env_remove("JOURNAL_STREAM")
        .output()
        .expect("Failed to execute vpnctl")
}

#[test]
fn test_set_protocol_persists() {
    let dir = TempDir::new().unwrap();

    let output = vpnctl(&dir, &["config", "set-protocol", "tcp"]);
    assert!(output.status.success(), "{:?}", output);

    let saved = fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(saved.contains("default_protocol = \"tcp\""), "{}", saved);

    let output = vpnctl(&dir, &["config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("default_protocol = \"tcp\""));
}

#[test]
fn test_custom_dns_limit_is_a_config_error() {
    let dir = TempDir::new().unwrap();

    let output = vpnctl(
        &dir,
        &["config", "set-dns", "custom", "1.1.1.1", "8.8.8.8", "9.9.9.9", "4.4.4.4"],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(!dir.path().join("config.toml").exists());
}

#[test]
fn test_invalid_config_file_exits_with_2() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.toml"), "[session]\nstatus_buffer = 0\n").unwrap();

    let output = vpnctl(&dir, &["config", "show"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_plan_and_killswitch() {
    let dir = TempDir::new().unwrap();

    assert!(vpnctl(&dir, &["config", "set-plan", "plus"]).status.success());
    assert!(vpnctl(&dir, &["config", "set-killswitch", "true"]).status.success());

    let saved = fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(saved.contains("plan = \"plus\""));
    assert!(saved.contains("killswitch = true"));
}

#[test]
fn test_split_tunnel_entries_are_validated() {
    let dir = TempDir::new().unwrap();

    let output = vpnctl(
        &dir,
        &["config", "set-split-tunnel", "192.168.0.0/16", "10.1.2.3"],
    );
    assert!(output.status.success(), "{:?}", output);
    let saved = fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(
        saved.contains(r#"split_tunnel = ["192.168.0.0/16", "10.1.2.3"]"#),
        "{}",
        saved
    );

    let output = vpnctl(&dir, &["config", "set-split-tunnel", "10.0.0.0/33"]);
    assert_eq!(output.status.code(), Some(2));
    let unchanged = fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert_eq!(unchanged, saved);

    assert!(vpnctl(&dir, &["config", "set-split-tunnel"]).status.success());
    let saved = fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(saved.contains("split_tunnel = []"), "{}", saved);
}

#[test]
fn test_feature_listing_respects_plan_tier() {
    let dir = TempDir::new().unwrap();
    let servers = serde_json::json!({
        "servers": [
            { "id": "CH#1", "country": "CH", "load": 50, "protocols": ["udp"], "features": { "p2p": true }, "tier": 0 },
            { "id": "CH#2", "country": "CH", "load": 10, "protocols": ["udp", "tcp"], "features": { "p2p": true }, "tier": 2 },
            { "id": "SE#1", "country": "SE", "load": 5, "protocols": ["udp"], "tier": 0 }
        ]
    });
    fs::write(dir.path().join("servers.json"), servers.to_string()).unwrap();

    let output = vpnctl(&dir, &["servers", "--feature", "p2p", "--json"]);
    assert!(output.status.success(), "{:?}", output);
    let listed: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = listed.iter().filter_map(|s| s["id"].as_str()).collect();
    assert_eq!(ids, vec!["CH#1"]);

    assert!(vpnctl(&dir, &["config", "set-plan", "plus"]).status.success());
    let output = vpnctl(&dir, &["servers", "--feature", "p2p", "--json"]);
    let listed: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = listed.iter().filter_map(|s| s["id"].as_str()).collect();
    assert_eq!(ids, vec!["CH#2", "CH#1"]);
}

#[cfg(target_os = "linux")]
#[test]
fn test_status_lists_running_transport() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.toml"), "[tunnel]\nbinary = \"sleep\"\n").unwrap();
    let mut transport = Command::new("sleep").arg("30").spawn().unwrap();

    let output = vpnctl(&dir, &["status"]);
    let _ = transport.kill();
    let _ = transport.wait();

    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sleep running"), "{}", stdout);
    assert!(stdout.contains(&transport.id().to_string()), "{}", stdout);
    assert!(stdout.contains("No successful connection recorded yet"));
}
