//! Format parsers: files and directories to [`Table`]s and back.
//!
//! [`ParserRegistry`] picks a parser from the path: directories (or paths
//! without an extension) get the listing parser, everything else is chosen by
//! extension through [`FileFormat`].

pub mod cache;
pub mod dir;

use crate::error::{Error, Result};
use crate::table::{Metadata, Table};
use cache::{read_output_sidecar, write_output_sidecar, ParseCache};
pub use dacp_cli::FileFormat;
use dir::DirParser;
use polars::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Row cap for previews.
pub const SAMPLE_ROWS: usize = 10;

pub const SAMPLE_ROWS_KEY: &str = "dacp.sample.rows";
pub const SAMPLE_TOTAL_KEY: &str = "dacp.sample.total";
pub const SAMPLE_NOTE_KEY: &str = "dacp.sample.note";

/// Metadata attached to every sample so it cannot be mistaken for the full table.
pub fn sample_metadata(rows: usize, total: Option<usize>) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(SAMPLE_ROWS_KEY.into(), rows.to_string());
    if let Some(total) = total {
        meta.insert(SAMPLE_TOTAL_KEY.into(), total.to_string());
    }
    meta.insert(
        SAMPLE_NOTE_KEY.into(),
        format!("preview of the first {} rows; open the dataframe for full data", SAMPLE_ROWS),
    );
    meta
}

pub trait FormatParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Full materialization.
    fn parse(&self, path: &Path) -> Result<Table>;

    /// At most [`SAMPLE_ROWS`] rows, with [`sample_metadata`] attached.
    fn sample(&self, path: &Path) -> Result<Table>;

    /// Row count, or `None` when the source has no meaningful count.
    fn count(&self, path: &Path) -> Result<Option<usize>>;

    fn write(&self, table: &Table, output: &Path) -> Result<()>;
}

/// Parser for the single-file formats the engine reads natively.
#[derive(Debug, Clone)]
pub struct FileParser {
    format: FileFormat,
    cache: Option<ParseCache>,
}

impl FileParser {
    pub fn new(format: FileFormat, cache: Option<ParseCache>) -> Self {
        Self { format, cache }
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Text formats are worth caching; columnar ones are already cheap to scan.
    fn cacheable(&self) -> bool {
        matches!(self.format, FileFormat::Csv | FileFormat::Json | FileFormat::Jsonl)
    }

    fn scan(&self, path: &Path) -> Result<LazyFrame> {
        if !path.is_file() {
            return Err(Error::NotFound(format!(
                "file '{}' does not exist",
                path.display()
            )));
        }
        let pl_path = PlPath::Local(Arc::from(path));
        let lf = match self.format {
            FileFormat::Csv => LazyCsvReader::new(pl_path)
                .with_has_header(true)
                .with_infer_schema_length(Some(10_000))
                .finish()?,
            FileFormat::Parquet => LazyFrame::scan_parquet(pl_path, Default::default())?,
            FileFormat::Arrow => {
                LazyFrame::scan_ipc(pl_path, Default::default(), Default::default())?
            }
            FileFormat::Jsonl => LazyJsonLineReader::new(pl_path).finish()?,
            FileFormat::Json => JsonReader::new(File::open(path)?)
                .with_json_format(JsonFormat::Json)
                .finish()?
                .lazy(),
        };
        Ok(lf)
    }

    /// Metadata stored alongside the source: schema metadata for Arrow files,
    /// a `.metadata.json` sidecar for everything else.
    fn source_metadata(&self, path: &Path) -> Result<Metadata> {
        if self.format == FileFormat::Arrow {
            let reader = arrow::ipc::reader::FileReader::try_new(File::open(path)?, None)?;
            return Ok(reader
                .schema()
                .metadata()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect());
        }
        Ok(read_output_sidecar(path)?.unwrap_or_default())
    }

    fn read_source(&self, path: &Path) -> Result<Table> {
        let frame = self
            .scan(path)?
            .collect()
            .map_err(|e| Error::Parser(format!("{}: {}", path.display(), e)))?;
        Ok(Table::with_metadata(frame, self.source_metadata(path)?))
    }
}

impl FormatParser for FileParser {
    fn name(&self) -> &'static str {
        self.format.extension()
    }

    fn parse(&self, path: &Path) -> Result<Table> {
        let cache = self.cache.as_ref().filter(|_| self.cacheable());
        if let Some(cache) = cache {
            match cache.load(self.name(), path) {
                Ok(Some(table)) => return Ok(table),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "parse cache read failed"),
            }
        }
        let table = self.read_source(path)?;
        if let Some(cache) = cache {
            if let Err(e) = cache.store(self.name(), path, &table) {
                tracing::warn!(path = %path.display(), error = %e, "parse cache write failed");
            }
        }
        Ok(table)
    }

    fn sample(&self, path: &Path) -> Result<Table> {
        let frame = self
            .scan(path)?
            .limit(SAMPLE_ROWS as IdxSize)
            .collect()
            .map_err(|e| Error::Parser(format!("{}: {}", path.display(), e)))?;
        let total = self.count(path)?;
        let rows = frame.height();
        Ok(Table::with_metadata(frame, sample_metadata(rows, total)))
    }

    fn count(&self, path: &Path) -> Result<Option<usize>> {
        let counted = self
            .scan(path)?
            .select([len().alias("count")])
            .collect()
            .map_err(|e| Error::Parser(format!("{}: {}", path.display(), e)))?;
        let value = counted.column("count")?.get(0)?;
        Ok(value.extract::<u64>().and_then(|n| usize::try_from(n).ok()))
    }

    fn write(&self, table: &Table, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut frame = table.frame().clone();
        match self.format {
            FileFormat::Csv => {
                CsvWriter::new(File::create(output)?).finish(&mut frame)?;
            }
            FileFormat::Parquet => {
                let mut writer = BufWriter::new(File::create(output)?);
                ParquetWriter::new(&mut writer).finish(&mut frame)?;
            }
            FileFormat::Json => {
                JsonWriter::new(File::create(output)?)
                    .with_json_format(JsonFormat::Json)
                    .finish(&mut frame)?;
            }
            FileFormat::Jsonl => {
                JsonWriter::new(File::create(output)?)
                    .with_json_format(JsonFormat::JsonLines)
                    .finish(&mut frame)?;
            }
            FileFormat::Arrow => {
                // Arrow's own writer so the metadata lands in the file schema.
                let (schema, batches) = table.to_record_batches()?;
                let file = BufWriter::new(File::create(output)?);
                let mut writer = arrow::ipc::writer::FileWriter::try_new(file, &schema)?;
                for batch in &batches {
                    writer.write(batch)?;
                }
                writer.finish()?;
                return Ok(());
            }
        }
        write_output_sidecar(output, table.metadata())?;
        Ok(())
    }
}

/// Strategy table from path to parser.
#[derive(Clone)]
pub struct ParserRegistry {
    dir: Arc<DirParser>,
    files: HashMap<FileFormat, Arc<FileParser>>,
    cache: Option<ParseCache>,
}

impl ParserRegistry {
    pub fn new(storage_root: impl Into<PathBuf>, cache: Option<ParseCache>) -> Self {
        let files = FileFormat::ALL
            .iter()
            .map(|f| (*f, Arc::new(FileParser::new(*f, cache.clone()))))
            .collect();
        Self {
            dir: Arc::new(DirParser::new(storage_root)),
            files,
            cache,
        }
    }

    pub fn cache(&self) -> Option<&ParseCache> {
        self.cache.as_ref()
    }

    pub fn for_format(&self, format: FileFormat) -> Result<Arc<dyn FormatParser>> {
        self.files
            .get(&format)
            .map(|p| p.clone() as Arc<dyn FormatParser>)
            .ok_or_else(|| Error::Validation(format!("no parser for format '{:?}'", format)))
    }

    pub fn for_path(&self, path: &Path) -> Result<Arc<dyn FormatParser>> {
        let extension = path.extension().and_then(|e| e.to_str());
        if path.is_dir() || extension.is_none() {
            return Ok(self.dir.clone());
        }
        let extension = extension.unwrap_or_default();
        match FileFormat::from_extension(extension) {
            Some(format) => self.for_format(format),
            None => Err(unsupported_format(extension)),
        }
    }

    /// Metadata recorded for `source` by an earlier parse or write, if any.
    pub fn recorded_metadata(&self, source: &Path) -> Result<Option<Metadata>> {
        let Some(format) = FileFormat::from_path(source) else {
            return Ok(None);
        };
        if let Some(cache) = &self.cache {
            if let Some(meta) = cache.metadata_for(format.extension(), source)? {
                return Ok(Some(meta));
            }
        }
        if source.is_file() {
            let meta = FileParser::new(format, None).source_metadata(source)?;
            return Ok(Some(meta).filter(|m| !m.is_empty()));
        }
        Ok(None)
    }
}

pub fn unsupported_format(extension: &str) -> Error {
    Error::Validation(format!(
        "unsupported file format '{}'; supported formats: {}",
        extension,
        FileFormat::supported_list()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::sample_table;
    use std::fs;
    use tempfile::TempDir;

    fn write_csv(dir: &Path, name: &str, rows: usize) -> PathBuf {
        let mut text = String::from("id,value\n");
        for i in 0..rows {
            text.push_str(&format!("{},{}\n", i, i * 2));
        }
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_selects_parser_by_extension() {
        let dir = TempDir::new().unwrap();
        let registry = ParserRegistry::new(dir.path(), None);
        assert_eq!(registry.for_path(Path::new("a/b.CSV")).unwrap().name(), "csv");
        assert_eq!(registry.for_path(Path::new("b.feather")).unwrap().name(), "arrow");
        assert_eq!(registry.for_path(Path::new("b.ndjson")).unwrap().name(), "jsonl");
        assert_eq!(registry.for_path(dir.path()).unwrap().name(), "dir");
        assert_eq!(registry.for_path(Path::new("noext")).unwrap().name(), "dir");
    }

    #[test]
    fn test_unknown_extension_names_supported_set() {
        let registry = ParserRegistry::new("/tmp", None);
        match registry.for_path(Path::new("grid.nc")) {
            Err(Error::Validation(msg)) => {
                assert!(msg.contains("'nc'"));
                assert!(msg.contains("parquet"));
            }
            other => panic!("unexpected {:?}", other.map(|p| p.name())),
        }
    }

    #[test]
    fn test_csv_parse_sample_count() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(dir.path(), "obs.csv", 25);
        let registry = ParserRegistry::new(dir.path(), None);
        let parser = registry.for_path(&path).unwrap();

        let table = parser.parse(&path).unwrap();
        assert_eq!(table.num_rows(), 25);
        assert_eq!(table.column_names(), ["id", "value"]);

        let sample = parser.sample(&path).unwrap();
        assert_eq!(sample.num_rows(), SAMPLE_ROWS);
        assert_eq!(sample.metadata().get(SAMPLE_TOTAL_KEY).map(String::as_str), Some("25"));

        assert_eq!(parser.count(&path).unwrap(), Some(25));
    }

    #[test]
    fn test_parse_populates_cache() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(dir.path(), "obs.csv", 3);
        let cache = ParseCache::new(dir.path().join("cache"));
        let registry = ParserRegistry::new(dir.path(), Some(cache.clone()));
        let parser = registry.for_path(&path).unwrap();
        let first = parser.parse(&path).unwrap();
        assert!(cache.artifact_path("csv", &path).is_file());
        let second = parser.parse(&path).unwrap();
        assert!(first.same_data(&second));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let registry = ParserRegistry::new("/tmp", None);
        let parser = registry.for_format(FileFormat::Parquet).unwrap();
        let err = parser.parse(Path::new("/definitely/not/here.parquet")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_arrow_write_embeds_metadata() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.arrow");
        let registry = ParserRegistry::new(dir.path(), None);
        let parser = registry.for_path(&out).unwrap();
        let table = sample_table();
        parser.write(&table, &out).unwrap();

        let back = parser.parse(&out).unwrap();
        assert!(back.same_data(&table));
        assert_eq!(back.metadata(), table.metadata());
        assert!(!ParseCache::sidecar_path(&out).exists());
    }

    #[test]
    fn test_csv_write_uses_sidecar() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested/out.csv");
        let registry = ParserRegistry::new(dir.path(), None);
        let parser = registry.for_path(&out).unwrap();
        parser.write(&sample_table(), &out).unwrap();
        let back = parser.parse(&out).unwrap();
        assert_eq!(back.num_rows(), 5);
        assert_eq!(back.metadata().get("source").map(String::as_str), Some("unit"));
        assert_eq!(
            registry.recorded_metadata(&out).unwrap().unwrap().get("source").map(String::as_str),
            Some("unit")
        );
    }
}
