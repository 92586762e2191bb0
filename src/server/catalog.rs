//! Dataset catalog: which datasets exist, what they contain, who may read them.

use crate::error::{Error, Result};
use crate::parser::dir::{self, ListingEntry};
use crate::uri::{is_plain_segment, DataframeUri, SCHEME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const IGNORED_NAMES: &[&str] = &[".DS_Store"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub name: String,
    pub identity: String,
    pub dataframe_count: usize,
    pub total_bytes: i64,
    pub modified: Option<String>,
}

/// A listing entry plus the identity to open it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataframeEntry {
    #[serde(flatten)]
    pub entry: ListingEntry,
    #[serde(rename = "dataframeName")]
    pub dataframe_name: String,
}

pub trait Catalog: Send + Sync {
    /// Dataset identities, `page` counted from 1.
    fn list_datasets(&self, token: Option<&str>, page: usize, limit: usize) -> Result<Vec<String>>;

    fn dataset(&self, token: Option<&str>, dataset: &str) -> Result<DatasetMeta>;

    fn dataframes(&self, token: Option<&str>, dataset: &str) -> Result<Vec<DataframeEntry>>;

    fn user_dataframes(&self, username: &str) -> Result<Vec<String>>;

    fn check_permission(&self, dataset: &str, username: &str) -> Result<bool>;
}

/// Catalog over a storage root holding one directory per dataset.
///
/// Every dataset is readable by every principal.
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    storage_root: PathBuf,
    external_host: String,
    external_port: u16,
}

impl LocalCatalog {
    pub fn new(storage_root: impl Into<PathBuf>, external_host: &str, external_port: u16) -> Self {
        Self {
            storage_root: storage_root.into(),
            external_host: external_host.to_string(),
            external_port,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    fn identity(&self, dataset: &str) -> String {
        format!(
            "{}://{}:{}/{}",
            SCHEME, self.external_host, self.external_port, dataset
        )
    }

    fn dataset_names(&self) -> Result<Vec<String>> {
        let mut names = dataset_dirs(&self.storage_root)?;
        names.sort();
        Ok(names)
    }

    fn dataset_dir(&self, dataset: &str) -> Result<PathBuf> {
        let name = dataset_key(dataset)?;
        let dir = self.storage_root.join(&name);
        if !is_plain_segment(&name) || !dir.is_dir() {
            return Err(Error::NotFound(format!("dataset '{}' does not exist", dataset)));
        }
        Ok(dir)
    }
}

/// Accepts a bare dataset name or any identity inside the dataset.
fn dataset_key(dataset: &str) -> Result<String> {
    if dataset.contains("://") {
        Ok(DataframeUri::parse(dataset)?.dataset_name().to_string())
    } else {
        Ok(dataset.trim_matches('/').to_string())
    }
}

/// Top-level directories of `root`, unsorted.
pub fn dataset_dirs(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(Error::NotFound(format!(
            "storage root '{}' does not exist",
            root.display()
        )));
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if IGNORED_NAMES.contains(&name.as_str()) || !entry.file_type()?.is_dir() {
            continue;
        }
        names.push(name);
    }
    Ok(names)
}

impl Catalog for LocalCatalog {
    fn list_datasets(&self, _token: Option<&str>, page: usize, limit: usize) -> Result<Vec<String>> {
        let skip = page.saturating_sub(1).saturating_mul(limit);
        Ok(self
            .dataset_names()?
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|name| self.identity(&name))
            .collect())
    }

    fn dataset(&self, _token: Option<&str>, dataset: &str) -> Result<DatasetMeta> {
        let dir = self.dataset_dir(dataset)?;
        let entries = dir::walk(&self.storage_root, &dir)?;
        let name = dataset_key(dataset)?;
        Ok(DatasetMeta {
            identity: self.identity(&name),
            dataframe_count: entries.len(),
            total_bytes: entries.iter().map(|e| e.size).sum(),
            modified: entries.iter().filter_map(|e| e.time.clone()).max(),
            name,
        })
    }

    fn dataframes(&self, _token: Option<&str>, dataset: &str) -> Result<Vec<DataframeEntry>> {
        let dir = self.dataset_dir(dataset)?;
        let prefix = format!(
            "{}://{}:{}",
            SCHEME, self.external_host, self.external_port
        );
        Ok(dir::walk(&self.storage_root, &dir)?
            .into_iter()
            .map(|entry| DataframeEntry {
                dataframe_name: format!("{}{}", prefix, entry.path),
                entry,
            })
            .collect())
    }

    fn user_dataframes(&self, _username: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for name in self.dataset_names()? {
            out.extend(self.dataframes(None, &name)?.into_iter().map(|d| d.dataframe_name));
        }
        Ok(out)
    }

    fn check_permission(&self, dataset: &str, _username: &str) -> Result<bool> {
        Ok(self.dataset_dir(dataset).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn storage() -> (TempDir, LocalCatalog) {
        let root = TempDir::new().unwrap();
        for ds in ["alpha", "beta", "gamma"] {
            fs::create_dir_all(root.path().join(ds)).unwrap();
        }
        fs::write(root.path().join("alpha/a.csv"), "x\n1\n").unwrap();
        fs::write(root.path().join("alpha/b.csv"), "x\n1\n2\n").unwrap();
        fs::write(root.path().join(".DS_Store"), "").unwrap();
        let catalog = LocalCatalog::new(root.path(), "example.org", 3101);
        (root, catalog)
    }

    #[test]
    fn test_list_datasets_paginates() {
        let (_root, catalog) = storage();
        assert_eq!(
            catalog.list_datasets(None, 1, 2).unwrap(),
            ["dacp://example.org:3101/alpha", "dacp://example.org:3101/beta"]
        );
        assert_eq!(
            catalog.list_datasets(None, 2, 2).unwrap(),
            ["dacp://example.org:3101/gamma"]
        );
        assert!(catalog.list_datasets(None, 3, 2).unwrap().is_empty());
    }

    #[test]
    fn test_dataframes_carry_openable_identity() {
        let (_root, catalog) = storage();
        let frames = catalog.dataframes(None, "alpha").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].dataframe_name, "dacp://example.org:3101/alpha/a.csv");
        let uri = DataframeUri::parse(&frames[0].dataframe_name).unwrap();
        assert_eq!(uri.dataset_name(), "alpha");
    }

    #[test]
    fn test_dataset_meta_and_permission() {
        let (_root, catalog) = storage();
        let meta = catalog.dataset(None, "dacp://example.org:3101/alpha").unwrap();
        assert_eq!(meta.dataframe_count, 2);
        assert_eq!(meta.total_bytes, 10);
        assert!(catalog.check_permission("alpha", "ann").unwrap());
        assert!(!catalog.check_permission("missing", "ann").unwrap());
        assert!(catalog.dataset(None, "missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_parent_directory_is_not_a_dataset() {
        let (_root, catalog) = storage();
        assert!(catalog.dataset(None, "..").unwrap_err().is_not_found());
        assert!(catalog.dataframes(None, ".").is_err());
        assert!(!catalog.check_permission("..", "ann").unwrap());
    }
}
