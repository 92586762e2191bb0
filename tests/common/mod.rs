#![allow(dead_code)]

use dacp::server::{serve_with_listener, ServerState};
use dacp::AppConfig;
use polars::prelude::*;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const DATASET: &str = "ocean";

fn write_csv(path: &Path, df: &mut DataFrame) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = File::create(path).unwrap();
    CsvWriter::new(&mut file).finish(df).unwrap();
}

/// Storage root with one dataset:
///
/// - `sample.csv`: 100 rows of `a..e`
/// - `small.csv`: `a = 1, 2, 3`
/// - `large.csv`: 10 000 rows of `id, value`
/// - `notes/readme.txt`
pub fn create_storage() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join(DATASET);

    let mut sample = df!(
        "a" => (0..100).collect::<Vec<i32>>(),
        "b" => (0..100).map(|i| format!("text_{}", i)).collect::<Vec<String>>(),
        "c" => (0..100).map(|i| i % 3).collect::<Vec<i32>>(),
        "d" => (0..100).map(|i| i % 5).collect::<Vec<i32>>(),
        "e" => (0..100).map(|i| i as f64 * 0.5).collect::<Vec<f64>>()
    )
    .unwrap();
    write_csv(&root.join("sample.csv"), &mut sample);

    let mut small = df!("a" => [1i64, 2, 3]).unwrap();
    write_csv(&root.join("small.csv"), &mut small);

    let mut large = df!(
        "id" => (0..10_000).collect::<Vec<i64>>(),
        "value" => (0..10_000).map(|i| (i % 97) as f64).collect::<Vec<f64>>()
    )
    .unwrap();
    write_csv(&root.join("large.csv"), &mut large);

    fs::create_dir_all(root.join("notes")).unwrap();
    fs::write(root.join("notes/readme.txt"), b"field notes").unwrap();
    dir
}

pub fn test_config(storage: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.local_path = storage.to_path_buf();
    config.server.host = "127.0.0.1".to_string();
    config.server.external_host = "127.0.0.1".to_string();
    config.cache.enabled = false;
    config
}

/// A Flight server on an ephemeral port, stopped when dropped.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub storage: TempDir,
    pub state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    pub async fn start_with(customize: impl FnOnce(AppConfig) -> AppConfig) -> Self {
        let storage = create_storage();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = test_config(storage.path());
        config.server.port = port;
        let state = Arc::new(ServerState::from_config(customize(config)));
        let (tx, rx) = oneshot::channel::<()>();
        let server_state = state.clone();
        tokio::spawn(async move {
            serve_with_listener(server_state, listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        Self {
            url: format!("dacp://127.0.0.1:{}", port),
            port,
            storage,
            state,
            shutdown: Some(tx),
        }
    }

    /// Identity of a file under the test dataset.
    pub fn identity(&self, relative: &str) -> String {
        format!("{}/{}/{}", self.url, DATASET, relative)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
