use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use dacp::parser::cache::ParseCache;
use dacp::{AppConfig, ConfigManager, APP_NAME};
use dacp_cli::ServerArgs;

fn handle_early_exit_flags(args: &ServerArgs, config: &AppConfig) -> Result<Option<()>> {
    if args.generate_config {
        let manager = ConfigManager::new(APP_NAME)?;
        let path = manager.write_default_config(args.force)?;
        println!("Configuration written to {}", path.display());
        return Ok(Some(()));
    }

    if args.clear_cache {
        match config.cache_root() {
            Some(root) => {
                if let Err(e) = ParseCache::new(&root).clear() {
                    eprintln!("Error clearing cache: {}", e);
                    std::process::exit(1);
                }
                println!("Cache cleared successfully");
            }
            None => println!("No cache to clear"),
        }
        return Ok(Some(()));
    }

    Ok(None)
}

fn load_config(args: &ServerArgs) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                return Err(eyre!("Config file {} does not exist", path.display()));
            }
            AppConfig::load_layered(path)?
        }
        None => AppConfig::load(APP_NAME)?,
    };

    // CLI flags win over the file.
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(root) = &args.storage_root {
        config.storage.local_path = root.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.log_json {
        config.logging.json = true;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = ServerArgs::parse();
    color_eyre::install()?;

    let config = load_config(&args)?;
    if let Some(()) = handle_early_exit_flags(&args, &config)? {
        return Ok(());
    }

    dacp::logging::init(&config.logging)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dacp::start_server(config))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 4000\nhost = \"0.0.0.0\"\n").unwrap();
        let args = ServerArgs::parse_from([
            "dacp-server",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "5000",
            "--storage-root",
            "/srv/data",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.local_path, PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = ServerArgs::parse_from(["dacp-server", "--config", "/nonexistent/dacp.toml"]);
        assert!(load_config(&args).is_err());
    }
}
