//! Directory listings as tables.
//!
//! A dataset directory parses to one row per regular file beneath it, with
//! the schema `name, path, suffix, type, size, time, blob`. `path` is relative
//! to the storage root and starts with `/`; `blob` stays null until a client
//! asks for the bytes.

use super::{sample_metadata, FormatParser, SAMPLE_ROWS};
use crate::error::{Error, Result};
use crate::table::Table;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const NAME: &str = "name";
pub const PATH: &str = "path";
pub const BLOB: &str = "blob";

/// Files the listing never reports.
const IGNORED_NAMES: &[&str] = &[".DS_Store"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    pub path: String,
    pub suffix: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: i64,
    pub time: Option<String>,
}

/// Recursively list regular files under `dir`, sorted by path.
pub fn walk(storage_root: &Path, dir: &Path) -> Result<Vec<ListingEntry>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!(
            "directory '{}' does not exist",
            dir.display()
        )));
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if IGNORED_NAMES.contains(&name.as_str()) {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let time = meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
        entries.push(ListingEntry {
            suffix: entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            path: storage_relative(storage_root, entry.path()),
            name,
            kind: "file".to_string(),
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
            time,
        });
    }
    Ok(entries)
}

/// `/`-prefixed path of `path` under `root`, or the full path when outside it.
pub fn storage_relative(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => {
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            format!("/{}", parts.join("/"))
        }
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// Absolute location of a listing `path` value.
pub fn resolve_listing_path(root: &Path, path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in path.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
        out.push(part);
    }
    out
}

pub fn listing_table(entries: &[ListingEntry]) -> Result<Table> {
    let n = entries.len();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    let suffixes: Vec<&str> = entries.iter().map(|e| e.suffix.as_str()).collect();
    let kinds: Vec<&str> = entries.iter().map(|e| e.kind.as_str()).collect();
    let sizes: Vec<i64> = entries.iter().map(|e| e.size).collect();
    let times: Vec<Option<&str>> = entries.iter().map(|e| e.time.as_deref()).collect();
    let frame = DataFrame::new(vec![
        Column::new(NAME.into(), names),
        Column::new(PATH.into(), paths),
        Column::new("suffix".into(), suffixes),
        Column::new("type".into(), kinds),
        Column::new("size".into(), sizes),
        Column::new("time".into(), times),
        Column::full_null(BLOB.into(), n, &DataType::Binary),
    ])?;
    Ok(Table::new(frame))
}

/// Replace the `blob` column with the bytes behind each row's `path`.
///
/// A file that cannot be read leaves a null blob; the rest of the listing
/// is still returned.
pub fn fill_blobs(table: &Table, storage_root: &Path) -> Result<Table> {
    let paths = table
        .frame()
        .column(PATH)
        .map_err(|_| {
            Error::Validation(format!(
                "blob collection needs a directory listing with a '{}' column",
                PATH
            ))
        })?
        .str()?;
    let blobs: BinaryChunked = paths
        .into_iter()
        .map(|path| {
            let path = path?;
            let file = resolve_listing_path(storage_root, path);
            match std::fs::read(&file) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::error!(path, error = %e, "failed to read blob");
                    None
                }
            }
        })
        .collect();
    let mut frame = table.frame().clone();
    frame.with_column(blobs.with_name(BLOB.into()).into_series())?;
    Ok(table.replace_frame(frame))
}

/// Parser for dataset directories.
#[derive(Debug, Clone)]
pub struct DirParser {
    storage_root: PathBuf,
}

impl DirParser {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
        }
    }
}

impl FormatParser for DirParser {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn parse(&self, path: &Path) -> Result<Table> {
        listing_table(&walk(&self.storage_root, path)?)
    }

    fn sample(&self, path: &Path) -> Result<Table> {
        let mut entries = walk(&self.storage_root, path)?;
        let total = entries.len();
        entries.truncate(SAMPLE_ROWS);
        let mut table = listing_table(&entries)?;
        *table.metadata_mut() = sample_metadata(entries.len(), Some(total));
        Ok(table)
    }

    /// Listings report no row count.
    fn count(&self, _path: &Path) -> Result<Option<usize>> {
        Ok(None)
    }

    fn write(&self, _table: &Table, _output: &Path) -> Result<()> {
        Err(Error::NotImplemented(
            "directory listings cannot be written back".to_string(),
        ))
    }
}
