use crate::error::Result;
use crate::table::{Metadata, Table};
use fs2::FileExt;
use polars::prelude::{IpcReader, IpcWriter, SerReader, SerWriter};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const ARTIFACT_EXTENSION: &str = "arrow";
const SIDECAR_SUFFIX: &str = ".metadata.json";
const LOCK_SUFFIX: &str = ".lock";

/// Describes the source an artifact was built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Sidecar {
    source: PathBuf,
    /// Source modification time in milliseconds since the epoch.
    source_modified: Option<u64>,
    #[serde(default)]
    metadata: Metadata,
}

/// Parsed tables stored as Arrow IPC files under `{root}/{format}/{stem}-{hash}.arrow`,
/// where `hash` is taken over the canonical source path.
///
/// Each artifact has a `.arrow.metadata.json` sidecar recording the source
/// path, its modification time and the table metadata. An artifact is only
/// served while the sidecar still matches the source on disk. A `.arrow.lock`
/// file serializes writers against readers of the same entry.
#[derive(Debug, Clone)]
pub struct ParseCache {
    root: PathBuf,
}

impl ParseCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.cache/dacp/dataframe` (platform cache dir).
    pub fn default_root() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("dacp").join("dataframe"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, format: &str, source: &Path) -> PathBuf {
        let source = canonical(source);
        let stem = source
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let digest = hex::encode(Sha256::digest(source.as_os_str().as_encoded_bytes()));
        self.root
            .join(format)
            .join(format!("{}-{}.{}", stem, &digest[..16], ARTIFACT_EXTENSION))
    }

    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    /// Cached table for `source`, or `None` when missing or stale.
    pub fn load(&self, format: &str, source: &Path) -> Result<Option<Table>> {
        let artifact = self.artifact_path(format, source);
        if !artifact.is_file() {
            return Ok(None);
        }
        let _lock = EntryLock::shared(&artifact)?;
        let Some(sidecar) = read_sidecar(&Self::sidecar_path(&artifact))? else {
            return Ok(None);
        };
        if sidecar.source != canonical(source) || sidecar.source_modified != modified_millis(source) {
            tracing::debug!(artifact = %artifact.display(), "stale parse cache entry");
            return Ok(None);
        }
        let frame = IpcReader::new(fs::File::open(&artifact)?).finish()?;
        tracing::debug!(artifact = %artifact.display(), "parse cache hit");
        Ok(Some(Table::with_metadata(frame, sidecar.metadata)))
    }

    /// Publish `table` as the artifact for `source`.
    ///
    /// The artifact is written to a temporary file in the same directory and
    /// renamed into place, so readers never observe a partial file.
    pub fn store(&self, format: &str, source: &Path, table: &Table) -> Result<PathBuf> {
        let artifact = self.artifact_path(format, source);
        let dir = artifact
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)?;
        let _lock = EntryLock::exclusive(&artifact)?;

        let mut temp = tempfile::Builder::new()
            .suffix(&format!(".{}", ARTIFACT_EXTENSION))
            .tempfile_in(&dir)?;
        let mut frame = table.frame().clone();
        IpcWriter::new(temp.as_file_mut()).finish(&mut frame)?;
        temp.as_file_mut().flush()?;
        temp.persist(&artifact).map_err(|e| e.error)?;

        let sidecar = Sidecar {
            source: canonical(source),
            source_modified: modified_millis(source),
            metadata: table.metadata().clone(),
        };
        write_locked_json(&Self::sidecar_path(&artifact), &sidecar)?;
        tracing::debug!(artifact = %artifact.display(), rows = table.num_rows(), "stored parse cache entry");
        Ok(artifact)
    }

    /// Metadata recorded when `source` was last parsed, even if the artifact is stale.
    pub fn metadata_for(&self, format: &str, source: &Path) -> Result<Option<Metadata>> {
        let artifact = self.artifact_path(format, source);
        Ok(read_sidecar(&Self::sidecar_path(&artifact))?
            .filter(|s| s.source == canonical(source))
            .map(|s| s.metadata))
    }

    /// Remove every artifact and sidecar.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

/// Held for the duration of one load or store of an entry.
struct EntryLock(fs::File);

impl EntryLock {
    fn open(artifact: &Path) -> Result<fs::File> {
        let mut name = artifact.as_os_str().to_owned();
        name.push(LOCK_SUFFIX);
        Ok(fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(name))?)
    }

    fn shared(artifact: &Path) -> Result<Self> {
        let file = Self::open(artifact)?;
        file.lock_shared()?;
        Ok(Self(file))
    }

    fn exclusive(artifact: &Path) -> Result<Self> {
        let file = Self::open(artifact)?;
        file.lock_exclusive()?;
        Ok(Self(file))
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn modified_millis(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let millis = modified.duration_since(UNIX_EPOCH).ok()?.as_millis();
    u64::try_from(millis).ok()
}

fn read_sidecar(path: &Path) -> Result<Option<Sidecar>> {
    read_locked_json(path)
}

/// `None` when the file is missing or not valid JSON for `T`.
fn read_locked_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    file.lock_shared()?;
    let mut text = String::new();
    let read = file.read_to_string(&mut text);
    file.unlock()?;
    read?;
    match serde_json::from_str(&text) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable metadata sidecar");
            Ok(None)
        }
    }
}

fn write_locked_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.lock_exclusive()?;
    let written = file.write_all(json.as_bytes()).and_then(|_| file.flush());
    file.unlock()?;
    written?;
    Ok(())
}

/// Write `metadata` next to an output file as `{output}.metadata.json`.
pub fn write_output_sidecar(output: &Path, metadata: &Metadata) -> Result<Option<PathBuf>> {
    if metadata.is_empty() {
        return Ok(None);
    }
    let path = ParseCache::sidecar_path(output);
    write_locked_json(&path, metadata)?;
    Ok(Some(path))
}

/// Metadata previously written next to `output` by [`write_output_sidecar`].
pub fn read_output_sidecar(output: &Path) -> Result<Option<Metadata>> {
    read_locked_json(&ParseCache::sidecar_path(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::sample_table;
    use tempfile::TempDir;

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("obs.csv");
        fs::write(&source, "a\n1\n").unwrap();
        let cache = ParseCache::new(dir.path().join("cache"));

        let mut table = sample_table();
        table.metadata_mut().insert("units".into(), "m/s".into());
        let artifact = cache.store("csv", &source, &table).unwrap();
        assert_eq!(artifact.parent(), Some(dir.path().join("cache/csv").as_path()));
        let name = artifact.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("obs-") && name.ends_with(".arrow"), "{name}");
        assert_eq!(artifact, cache.artifact_path("csv", &source));
        assert!(ParseCache::sidecar_path(&artifact).is_file());

        let loaded = cache.load("csv", &source).unwrap().unwrap();
        assert!(loaded.same_data(&table));
        assert_eq!(loaded.metadata().get("units").map(String::as_str), Some("m/s"));
    }

    #[test]
    fn test_other_source_with_same_name_misses() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("x")).unwrap();
        fs::create_dir_all(dir.path().join("y")).unwrap();
        let first = dir.path().join("x/obs.csv");
        let second = dir.path().join("y/obs.csv");
        fs::write(&first, "a\n1\n").unwrap();
        fs::write(&second, "a\n2\n").unwrap();
        let cache = ParseCache::new(dir.path().join("cache"));
        cache.store("csv", &first, &sample_table()).unwrap();
        assert!(cache.load("csv", &second).unwrap().is_none());
        assert!(cache.metadata_for("csv", &second).unwrap().is_none());
    }

    #[test]
    fn test_sources_sharing_a_stem_keep_separate_entries() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("x")).unwrap();
        fs::create_dir_all(dir.path().join("y")).unwrap();
        let first = dir.path().join("x/obs.csv");
        let second = dir.path().join("y/obs.csv");
        fs::write(&first, "a\n1\n").unwrap();
        fs::write(&second, "a\n2\n").unwrap();
        let cache = ParseCache::new(dir.path().join("cache"));
        assert_ne!(cache.artifact_path("csv", &first), cache.artifact_path("csv", &second));

        let full = sample_table();
        let head = full.replace_frame(full.frame().head(Some(2)));
        let writers: Vec<_> = [(first.clone(), full.clone()), (second.clone(), head.clone())]
            .into_iter()
            .map(|(source, table)| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        cache.store("csv", &source, &table).unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..20 {
            if let Some(hit) = cache.load("csv", &first).unwrap() {
                assert!(hit.same_data(&full));
            }
            if let Some(hit) = cache.load("csv", &second).unwrap() {
                assert!(hit.same_data(&head));
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert!(cache.load("csv", &first).unwrap().unwrap().same_data(&full));
        assert!(cache.load("csv", &second).unwrap().unwrap().same_data(&head));
    }

    #[test]
    fn test_clear_removes_root() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("obs.csv");
        fs::write(&source, "a\n1\n").unwrap();
        let cache = ParseCache::new(dir.path().join("cache"));
        cache.store("csv", &source, &sample_table()).unwrap();
        cache.clear().unwrap();
        assert!(!cache.root().exists());
        assert!(cache.load("csv", &source).unwrap().is_none());
    }

    #[test]
    fn test_output_sidecar_skipped_when_empty() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.csv");
        assert!(write_output_sidecar(&out, &Metadata::new()).unwrap().is_none());
        let mut meta = Metadata::new();
        meta.insert("k".into(), "v".into());
        let path = write_output_sidecar(&out, &meta).unwrap().unwrap();
        assert_eq!(path, dir.path().join("out.csv.metadata.json"));
        assert_eq!(read_output_sidecar(&out).unwrap(), Some(meta));
    }
}
