//! Arrow Flight server: sessions, credential checks, catalog and the Flight service.

pub mod auth;
pub mod catalog;
pub mod service;
pub mod session;

pub use auth::{Identity, IdentityVerifier, StaticVerifier};
pub use catalog::{Catalog, DataframeEntry, DatasetMeta, LocalCatalog};
pub use service::DacpFlightService;
pub use session::{Session, SessionRegistry};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::parser::cache::ParseCache;
use crate::parser::ParserRegistry;
use crate::uri::DataframeUri;
use arrow_flight::flight_service_server::FlightServiceServer;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

/// Everything a request handler needs, shared by all requests.
pub struct ServerState {
    pub config: AppConfig,
    pub sessions: SessionRegistry,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub catalog: Arc<dyn Catalog>,
    pub registry: Arc<ParserRegistry>,
    pub storage_root: PathBuf,
    /// `get_dataset` answers, by requested dataset name.
    pub datasets: DashMap<String, DatasetMeta>,
}

impl ServerState {
    /// Local catalog, config-backed verifier and the parse cache when enabled.
    pub fn from_config(config: AppConfig) -> Self {
        let storage_root = config.storage.local_path.clone();
        let cache = if config.cache.enabled {
            config.cache_root().map(ParseCache::new)
        } else {
            None
        };
        let catalog = LocalCatalog::new(
            &storage_root,
            &config.server.external_host,
            config.external_port(),
        );
        Self {
            verifier: Arc::new(StaticVerifier::from_config(&config.auth)),
            catalog: Arc::new(catalog),
            registry: Arc::new(ParserRegistry::new(&storage_root, cache)),
            sessions: SessionRegistry::new(),
            datasets: DashMap::new(),
            storage_root,
            config,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// File or directory behind a dataframe identity.
    pub fn source_path(&self, dataframe_name: &str) -> Result<PathBuf> {
        DataframeUri::parse(dataframe_name)?.absolute_path(&self.storage_root)
    }

    fn max_message_bytes(&self) -> usize {
        self.config
            .server
            .max_decoding_message_mb
            .saturating_mul(1024 * 1024)
    }
}

fn flight_server(state: Arc<ServerState>) -> FlightServiceServer<DacpFlightService> {
    let limit = state.max_message_bytes();
    FlightServiceServer::new(DacpFlightService::new(state))
        .max_decoding_message_size(limit)
        .max_encoding_message_size(limit)
}

/// Bind `[server] host:port` and serve until the process is stopped.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| {
            Error::Validation(format!(
                "invalid listen address {}:{}: {}",
                config.server.host, config.server.port, e
            ))
        })?;
    let listener = TcpListener::bind(addr).await?;
    let state = Arc::new(ServerState::from_config(config));
    tracing::info!(
        %addr,
        storage_root = %state.storage_root.display(),
        "dacp flight server listening"
    );
    serve_with_listener(state, listener, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_listener<F>(
    state: Arc<ServerState>,
    listener: TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send,
{
    Server::builder()
        .add_service(flight_server(state))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;
    tracing::info!("dacp flight server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
