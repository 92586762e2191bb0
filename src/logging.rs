//! Subscriber setup and the access log.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Target of per-request access events, filterable on its own (`dacp::access=off`).
pub const ACCESS_TARGET: &str = "dacp::access";

/// Install the global subscriber. Returns `false` if one was already installed.
///
/// The filter comes from `RUST_LOG` when set, otherwise from `config.level`.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = build_filter(&config.level)?;
    let file = match &config.file {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };
    let builder = tracing_subscriber::fmt().with_target(true);
    let installed = match (config.json, file) {
        (true, Some(file)) => builder
            .json()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .try_init(),
        (true, None) => builder
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        (false, Some(file)) => builder
            .with_ansi(false)
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .try_init(),
        (false, None) => builder
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    Ok(installed.is_ok())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    let directives = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) if !env.trim().is_empty() => env,
        _ => level.to_string(),
    };
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Validation(format!("invalid log filter '{}': {}", directives, e)))
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// One access event for a dataframe-touching request.
pub fn access(dataframe: &str, action: &str, client_ip: &str, username: &str) {
    tracing::info!(
        target: ACCESS_TARGET,
        dataframe,
        action,
        client_ip,
        username,
        "access"
    );
}

/// Access event for one chunk of a raw byte stream.
pub fn access_bytes(dataframe: &str, action: &str, client_ip: &str, username: &str, bytes: usize) {
    tracing::info!(
        target: ACCESS_TARGET,
        dataframe,
        action,
        client_ip,
        username,
        bytes,
        "access"
    );
}
