//! Loading configuration files from disk.

use std::fs;

use tempfile::TempDir;

use menu_sync::error::ConfigError;
use menu_sync::Config;

#[test]
fn test_load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("menu-sync.toml");
    fs::write(
        &path,
        r#"
[store]
data_dir = "/var/lib/menu-sync"

[server]
base_url = "https://pos.example.com/api"
request_timeout_ms = 5000

[sync]
refresh_interval_secs = 120

[recovery]
max_attempts = 3
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.store.data_dir.to_str(), Some("/var/lib/menu-sync"));
    assert_eq!(config.server.request_timeout_ms, 5_000);
    assert_eq!(config.sync.refresh_interval_secs, 120);
    assert_eq!(config.retry_policy().max_attempts, 3);
    assert_eq!(config.recovery.tick_interval_secs, 30);
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_malformed_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[server\nbase_url = 1").unwrap();
    assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));

    fs::write(&path, "[recovery]\nmax_attempts = 0\n").unwrap();
    assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
}
