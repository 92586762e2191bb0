//! Serverless access: parse local files straight into resident handles.

use crate::config::AppConfig;
use crate::dataframe::DataFrame;
use crate::error::{Error, Result};
use crate::parser::cache::ParseCache;
use crate::parser::dir::{walk, ListingEntry};
use crate::parser::ParserRegistry;
use crate::server::catalog::dataset_dirs;
use crate::uri::is_plain_segment;
use std::path::{Path, PathBuf};

/// Parse `path` with the default parse cache.
///
/// Directories become listings whose `path` values are relative to the
/// directory's parent, so `collect_blob` can find the files again.
pub fn open(path: impl AsRef<Path>) -> Result<DataFrame> {
    let path = path.as_ref();
    let root = storage_root_of(path);
    let registry = ParserRegistry::new(&root, ParseCache::default_root().map(ParseCache::new));
    open_with(&registry, &root, path)
}

/// Parse `path` with an explicit registry. `storage_root` anchors listing paths.
pub fn open_with(registry: &ParserRegistry, storage_root: &Path, path: &Path) -> Result<DataFrame> {
    if !path.exists() {
        return Err(Error::NotFound(format!("'{}' does not exist", path.display())));
    }
    let parser = registry.for_path(path)?;
    tracing::debug!(path = %path.display(), parser = parser.name(), "opening local dataframe");
    let table = parser.parse(path)?;
    let id = path.to_string_lossy().into_owned();
    Ok(DataFrame::new(id, table).with_storage_root(storage_root))
}

fn storage_root_of(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Dataset names under `[storage] local_path`, sorted.
pub fn list_datasets(config: &AppConfig) -> Result<Vec<String>> {
    let mut names = dataset_dirs(&config.storage.local_path)?;
    names.sort();
    Ok(names)
}

/// Every file of one dataset, recursively, with paths relative to the storage root.
pub fn list_dataframes(config: &AppConfig, dataset: &str) -> Result<Vec<ListingEntry>> {
    let root = &config.storage.local_path;
    let name = dataset.trim_matches('/');
    if !is_plain_segment(name) {
        return Err(Error::Validation(format!("'{}' is not a dataset name", dataset)));
    }
    walk(root, &root.join(name))
}
