use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "dacp";

/// Manages config directory and config file operations
#[derive(Clone)]
pub struct ConfigManager {
    pub(crate) config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager with a custom config directory (primarily for testing)
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// Create a new ConfigManager for the given app name
    pub fn new(app_name: &str) -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| eyre!("Could not determine config directory"))?
            .join(app_name);

        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get path to a specific config file or subdirectory
    pub fn config_path(&self, path: &str) -> PathBuf {
        self.config_dir.join(path)
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        if !self.config_dir.exists() {
            std::fs::create_dir_all(&self.config_dir)?;
        }
        Ok(())
    }

    /// Generate default configuration template as a string
    pub fn generate_default_config(&self) -> String {
        DEFAULT_CONFIG_TEMPLATE.to_string()
    }

    /// Write default configuration to config file
    pub fn write_default_config(&self, force: bool) -> Result<PathBuf> {
        let config_path = self.config_path("config.toml");

        if config_path.exists() && !force {
            return Err(eyre!(
                "Config file already exists at {}. Use --force to overwrite.",
                config_path.display()
            ));
        }

        self.ensure_config_dir()?;
        std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)?;

        Ok(config_path)
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Configuration format version (for future compatibility)
    pub version: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub external_host: String,
    /// Defaults to `port` when unset.
    pub external_port: Option<u16>,
    pub max_decoding_message_mb: usize,
    pub instrument_info: String,
    pub network_link_info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    pub access_mode: String,
    pub metacat_url: Option<String>,
    pub metacat_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub allow_anonymous: bool,
    pub users: HashMap<String, String>,
    pub trusted_domains: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub max_connections: usize,
    pub default_chunk_size: usize,
    pub stream_chunk_bytes: usize,
    pub list_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: "0.1".to_string(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            catalog: CatalogConfig::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3101,
            external_host: "localhost".to_string(),
            external_port: None,
            max_decoding_message_mb: 64,
            instrument_info: String::new(),
            network_link_info: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            local_path: PathBuf::from("data"),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            access_mode: "local".to_string(),
            metacat_url: None,
            metacat_token: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            users: HashMap::new(),
            trusted_domains: HashMap::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            default_chunk_size: 1000,
            stream_chunk_bytes: 5 * 1024 * 1024,
            list_chunk_size: 50_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

// Configuration loading and merging
impl AppConfig {
    /// Load configuration from all layers (default → user)
    pub fn load(app_name: &str) -> Result<Self> {
        let config_manager = ConfigManager::new(app_name)?;
        let config_path = config_manager.config_path("config.toml");
        Self::load_layered(&config_path)
    }

    /// Defaults, then the file at `path` if it exists.
    pub fn load_layered(path: &Path) -> Result<Self> {
        let mut config = AppConfig::default();
        if path.exists() {
            config.merge(Self::load_from_path(path)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse one config file without layering or validation.
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read config file at {}: {}", path.display(), e))?;

        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file at {}: {}", path.display(), e))
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: AppConfig) {
        if other.version != AppConfig::default().version {
            self.version = other.version;
        }

        self.server.merge(other.server);
        self.storage.merge(other.storage);
        self.catalog.merge(other.catalog);
        self.cache.merge(other.cache);
        self.auth.merge(other.auth);
        self.client.merge(other.client);
        self.logging.merge(other.logging);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.version.starts_with("0.1") {
            return Err(eyre!(
                "Unsupported config version: {}. Expected 0.1.x",
                self.version
            ));
        }

        match self.storage.backend.as_str() {
            "local" => {}
            "ftp" | "catalog" => {
                return Err(eyre!(
                    "storage backend '{}' is served by an external collaborator; only 'local' is built in",
                    self.storage.backend
                ))
            }
            other => {
                return Err(eyre!(
                    "Invalid storage backend: {}. Must be 'local', 'ftp' or 'catalog'",
                    other
                ))
            }
        }

        match self.catalog.access_mode.as_str() {
            "local" => {}
            "interface" | "mongodb" | "neo4j" => {
                return Err(eyre!(
                    "catalog access_mode '{}' is served by an external collaborator; only 'local' is built in",
                    self.catalog.access_mode
                ))
            }
            other => {
                return Err(eyre!(
                    "Invalid catalog access_mode: {}. Must be 'local', 'interface', 'mongodb' or 'neo4j'",
                    other
                ))
            }
        }

        if self.server.max_decoding_message_mb == 0 {
            return Err(eyre!("max_decoding_message_mb must be greater than 0"));
        }
        if self.client.max_connections == 0 {
            return Err(eyre!("max_connections must be greater than 0"));
        }
        if self.client.default_chunk_size == 0 {
            return Err(eyre!("default_chunk_size must be greater than 0"));
        }
        if self.client.stream_chunk_bytes == 0 {
            return Err(eyre!("stream_chunk_bytes must be greater than 0"));
        }
        if self.client.list_chunk_size == 0 {
            return Err(eyre!("list_chunk_size must be greater than 0"));
        }

        Ok(())
    }

    pub fn external_port(&self) -> u16 {
        self.server.external_port.unwrap_or(self.server.port)
    }

    /// Parse cache root, falling back to the platform cache directory.
    pub fn cache_root(&self) -> Option<PathBuf> {
        self.cache
            .root
            .clone()
            .or_else(crate::parser::cache::ParseCache::default_root)
    }
}

// Merge implementations for each config section
impl ServerConfig {
    pub fn merge(&mut self, other: Self) {
        let default = ServerConfig::default();
        if other.host != default.host {
            self.host = other.host;
        }
        if other.port != default.port {
            self.port = other.port;
        }
        if other.external_host != default.external_host {
            self.external_host = other.external_host;
        }
        if other.external_port.is_some() {
            self.external_port = other.external_port;
        }
        if other.max_decoding_message_mb != default.max_decoding_message_mb {
            self.max_decoding_message_mb = other.max_decoding_message_mb;
        }
        if !other.instrument_info.is_empty() {
            self.instrument_info = other.instrument_info;
        }
        if !other.network_link_info.is_empty() {
            self.network_link_info = other.network_link_info;
        }
    }
}

impl StorageConfig {
    pub fn merge(&mut self, other: Self) {
        let default = StorageConfig::default();
        if other.backend != default.backend {
            self.backend = other.backend;
        }
        if other.local_path != default.local_path {
            self.local_path = other.local_path;
        }
    }
}

impl CatalogConfig {
    pub fn merge(&mut self, other: Self) {
        let default = CatalogConfig::default();
        if other.access_mode != default.access_mode {
            self.access_mode = other.access_mode;
        }
        if other.metacat_url.is_some() {
            self.metacat_url = other.metacat_url;
        }
        if other.metacat_token.is_some() {
            self.metacat_token = other.metacat_token;
        }
    }
}

impl CacheConfig {
    pub fn merge(&mut self, other: Self) {
        let default = CacheConfig::default();
        if other.enabled != default.enabled {
            self.enabled = other.enabled;
        }
        if other.root.is_some() {
            self.root = other.root;
        }
    }
}

impl AuthConfig {
    pub fn merge(&mut self, other: Self) {
        let default = AuthConfig::default();
        if other.allow_anonymous != default.allow_anonymous {
            self.allow_anonymous = other.allow_anonymous;
        }
        self.users.extend(other.users);
        self.trusted_domains.extend(other.trusted_domains);
    }
}

impl ClientConfig {
    pub fn merge(&mut self, other: Self) {
        let default = ClientConfig::default();
        if other.max_connections != default.max_connections {
            self.max_connections = other.max_connections;
        }
        if other.default_chunk_size != default.default_chunk_size {
            self.default_chunk_size = other.default_chunk_size;
        }
        if other.stream_chunk_bytes != default.stream_chunk_bytes {
            self.stream_chunk_bytes = other.stream_chunk_bytes;
        }
        if other.list_chunk_size != default.list_chunk_size {
            self.list_chunk_size = other.list_chunk_size;
        }
    }
}

impl LoggingConfig {
    pub fn merge(&mut self, other: Self) {
        let default = LoggingConfig::default();
        if other.level != default.level {
            self.level = other.level;
        }
        if other.json != default.json {
            self.json = other.json;
        }
        if other.file.is_some() {
            self.file = other.file;
        }
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../config/default.toml");
