use dacp::config::{AppConfig, ConfigManager};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

// Helper to create a temporary config directory for testing
fn setup_test_config_dir() -> (TempDir, ConfigManager) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_manager = ConfigManager::with_dir(temp_dir.path().to_path_buf());
    (temp_dir, config_manager)
}

#[test]
fn test_default_config() {
    let config = AppConfig::default();

    assert_eq!(config.version, "0.1");

    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 3101);
    assert_eq!(config.external_port(), 3101);
    assert_eq!(config.server.max_decoding_message_mb, 64);

    assert_eq!(config.storage.backend, "local");
    assert_eq!(config.catalog.access_mode, "local");
    assert!(config.cache.enabled);
    assert!(config.auth.allow_anonymous);

    assert_eq!(config.client.max_connections, 20);
    assert_eq!(config.client.default_chunk_size, 1000);
    assert_eq!(config.client.stream_chunk_bytes, 5 * 1024 * 1024);
    assert_eq!(config.client.list_chunk_size, 50_000);

    assert_eq!(config.logging.level, "info");
    assert!(!config.logging.json);

    assert!(config.validate().is_ok());
}

#[test]
fn test_generate_default_config() {
    let (_temp_dir, config_manager) = setup_test_config_dir();

    let template = config_manager.generate_default_config();

    for section in [
        "[server]",
        "[storage]",
        "[catalog]",
        "[cache]",
        "[auth]",
        "[client]",
        "[logging]",
    ] {
        assert!(template.contains(section), "missing {}", section);
    }
    assert!(template.contains("version = \"0.1\""));
}

#[test]
fn test_default_template_parses_to_defaults() {
    let (_temp_dir, config_manager) = setup_test_config_dir();
    let path = config_manager.write_default_config(false).unwrap();
    let parsed = AppConfig::load_from_path(&path).unwrap();
    assert_eq!(parsed, AppConfig::default());
}

#[test]
fn test_write_config_without_force_fails_if_exists() {
    let (_temp_dir, config_manager) = setup_test_config_dir();

    config_manager
        .write_default_config(false)
        .expect("First write should succeed");

    let result = config_manager.write_default_config(false);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("already exists"));
}

#[test]
fn test_write_config_with_force_overwrites() {
    let (_temp_dir, config_manager) = setup_test_config_dir();

    let first_path = config_manager
        .write_default_config(false)
        .expect("First write should succeed");
    fs::write(&first_path, "garbage").unwrap();

    let second_path = config_manager
        .write_default_config(true)
        .expect("Second write with force should succeed");

    assert_eq!(first_path, second_path);
    assert!(fs::read_to_string(&second_path).unwrap().contains("[server]"));
}

#[test]
fn test_load_layered_with_no_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = AppConfig::load_layered(&temp_dir.path().join("config.toml")).unwrap();
    assert_eq!(config, AppConfig::default());
}

#[test]
fn test_partial_file_overrides_defaults() {
    let (_temp_dir, config_manager) = setup_test_config_dir();
    config_manager.ensure_config_dir().unwrap();
    let path = config_manager.config_path("config.toml");
    fs::write(
        &path,
        r#"
[server]
port = 4000
external_host = "data.example.org"

[storage]
local_path = "/srv/dacp"

[auth.users]
ann = "secret"

[client]
default_chunk_size = 250
"#,
    )
    .unwrap();

    let config = AppConfig::load_layered(&path).unwrap();
    assert_eq!(config.server.port, 4000);
    assert_eq!(config.external_port(), 4000);
    assert_eq!(config.server.external_host, "data.example.org");
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.storage.local_path, PathBuf::from("/srv/dacp"));
    assert_eq!(config.auth.users.get("ann").map(String::as_str), Some("secret"));
    assert_eq!(config.client.default_chunk_size, 250);
    assert_eq!(config.client.max_connections, 20);
}

#[test]
fn test_external_collaborator_backends_rejected() {
    let mut config = AppConfig::default();
    config.storage.backend = "ftp".to_string();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("ftp"));

    let mut config = AppConfig::default();
    config.catalog.access_mode = "neo4j".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.storage.backend = "s3".to_string();
    assert!(config.validate().unwrap_err().to_string().contains("Invalid storage backend"));
}

#[test]
fn test_zero_sizes_rejected() {
    let mut config = AppConfig::default();
    config.client.default_chunk_size = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.client.max_connections = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.server.max_decoding_message_mb = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_unsupported_version_rejected() {
    let mut config = AppConfig::default();
    config.version = "0.9".to_string();
    assert!(config
        .validate()
        .unwrap_err()
        .to_string()
        .contains("Unsupported config version"));
}

#[test]
fn test_cache_root_prefers_configured_path() {
    let mut config = AppConfig::default();
    config.cache.root = Some(PathBuf::from("/tmp/dacp-cache"));
    assert_eq!(config.cache_root(), Some(PathBuf::from("/tmp/dacp-cache")));
}
