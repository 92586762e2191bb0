//! Lazy dataframe handles.
//!
//! A [`DataFrame`] is either resident (it owns a [`Table`]) or remote (it
//! names a dataframe opened in a server session). Transformations only append
//! to the handle's action log and return a new handle; terminal operations
//! run the log locally or ship it to the server.

use crate::action::{ensure_remote_safe, Action, LocalFn, MapFunction, SortOrder};
use crate::client::{DacpClient, FrameInfo};
use crate::error::{Error, Result};
use crate::format::{format_table, DisplayOptions};
use crate::interpreter::{self, Reduction};
use crate::parser::cache::ParseCache;
use crate::parser::dir::{self, fill_blobs};
use crate::parser::{FileFormat, ParserRegistry};
use crate::protocol::{DataframeRef, DataframeTicket, TicketKind};
use crate::table::{ColumnValues, SchemaFields, Table};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataFrame {
    id: String,
    data: Option<Table>,
    actions: Vec<Action>,
    client: Option<DacpClient>,
    /// Root that listing `path` values are relative to, for blob collection.
    storage_root: Option<PathBuf>,
}

impl DataFrame {
    /// Resident handle over an in-memory table.
    pub fn new(id: impl Into<String>, table: Table) -> Self {
        Self {
            id: id.into(),
            data: Some(table),
            actions: Vec::new(),
            client: None,
            storage_root: None,
        }
    }

    pub(crate) fn remote(id: impl Into<String>, client: DacpClient) -> Self {
        Self {
            id: id.into(),
            data: None,
            actions: Vec::new(),
            client: Some(client),
            storage_root: None,
        }
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Actions not yet applied to the resident table (or sent to the server).
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn is_resident(&self) -> bool {
        self.data.is_some()
    }

    pub fn client(&self) -> Option<&DacpClient> {
        self.client.as_ref()
    }

    fn derive(&self, action: Action) -> Self {
        let mut next = self.clone();
        next.actions.push(action);
        next
    }

    pub fn limit(&self, count: usize) -> Self {
        self.derive(Action::Limit { count })
    }

    /// Rows from `offset`, `length` of them or all remaining ones.
    pub fn slice(&self, offset: usize, length: Option<usize>) -> Self {
        self.derive(Action::Slice { offset, length })
    }

    pub fn select<I, S>(&self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.derive(Action::Select {
            columns: columns.into_iter().map(Into::into).collect(),
        })
    }

    /// Keep rows where `expression` is true, e.g. `a > 2 and b != 'x'`.
    pub fn filter(&self, expression: &str) -> Self {
        self.derive(Action::Filter {
            expression: expression.to_string(),
        })
    }

    /// New column from an expression over `_` (the mapped value) and other
    /// columns. Named `{column}_mapped` unless `new_column_name` is given.
    pub fn map(&self, column: &str, expression: &str, new_column_name: Option<&str>) -> Self {
        self.derive(Action::Map {
            column: column.to_string(),
            function: MapFunction::Expression(expression.to_string()),
            new_column_name: new_column_name.map(str::to_string),
        })
    }

    /// Like [`DataFrame::map`] with an in-process function. Only runs on
    /// resident data; remote handles must `collect` first.
    pub fn map_fn<F>(&self, column: &str, f: F, new_column_name: Option<&str>) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.derive(Action::Map {
            column: column.to_string(),
            function: MapFunction::Local(LocalFn::new(f)),
            new_column_name: new_column_name.map(str::to_string),
        })
    }

    pub fn sort(&self, column: &str, order: SortOrder) -> Self {
        self.derive(Action::Sort {
            column: column.to_string(),
            order,
        })
    }

    /// Run `statement` against the current result, bound as `dataframe`.
    pub fn sql(&self, statement: &str) -> Self {
        self.derive(Action::Sql {
            sql_str: statement.to_string(),
        })
    }

    /// Resident table with the pending log applied, or `None` for remote handles.
    fn local_table(&self) -> Result<Option<Table>> {
        match &self.data {
            Some(table) if self.actions.is_empty() => Ok(Some(table.clone())),
            Some(table) => interpreter::apply(table, &self.actions).map(Some),
            None => Ok(None),
        }
    }

    /// Client and wire reference for a remote handle. Fails before any I/O
    /// when the log holds an in-process function.
    fn remote_target(&self) -> Result<(&DacpClient, DataframeRef)> {
        ensure_remote_safe(&self.actions)?;
        let client = self.client.as_ref().ok_or_else(|| {
            Error::Validation(format!(
                "dataframe '{}' has neither data nor a session",
                self.id
            ))
        })?;
        Ok((client, client.dataframe_ref(&self.id, &self.actions)))
    }

    /// Materialize the result and keep it. Later calls reuse the table.
    pub async fn collect(&mut self) -> Result<&Table> {
        if self.data.is_none() {
            let (client, dataframe) = self.remote_target()?;
            let mut ticket = DataframeTicket::new(dataframe);
            ticket.max_chunksize = Some(client.config().default_chunk_size);
            let table = client.fetch_table(&ticket).await?;
            self.data = Some(table);
            self.actions.clear();
        } else if !self.actions.is_empty() {
            let table = self.local_table()?;
            self.data = table;
            self.actions.clear();
        }
        self.data
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("dataframe '{}' has no data", self.id)))
    }

    /// Chunks of at most `chunk_size` rows, in row order.
    pub async fn get_stream(&self, chunk_size: usize) -> Result<BoxStream<'static, Result<Table>>> {
        if chunk_size == 0 {
            return Err(Error::Validation("chunk size must be at least 1".to_string()));
        }
        if let Some(table) = self.local_table()? {
            let chunks: Vec<Table> = table.chunks(chunk_size).collect();
            return Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed());
        }
        let (client, dataframe) = self.remote_target()?;
        let mut ticket = DataframeTicket::new(dataframe);
        ticket.max_chunksize = Some(chunk_size);
        client.fetch_stream(&ticket).await
    }

    /// One row as column name to value.
    pub async fn row(&self, index: usize) -> Result<serde_json::Map<String, Value>> {
        if let Some(table) = self.local_table()? {
            return table.row_values(index);
        }
        let (client, dataframe) = self.remote_target()?;
        let mut ticket = DataframeTicket::new(dataframe);
        ticket.row_index = Some(index);
        client.fetch_table(&ticket).await?.row_values(0)
    }

    pub async fn column(&self, name: &str) -> Result<Vec<Value>> {
        if let Some(table) = self.local_table()? {
            return table.column_values(name);
        }
        let (client, dataframe) = self.remote_target()?;
        let mut ticket = DataframeTicket::new(dataframe);
        ticket.column_name = Some(name.to_string());
        client.fetch_table(&ticket).await?.column_values(name)
    }

    async fn reduce(&self, column: &str, reduction: Reduction) -> Result<Value> {
        if let Some(table) = self.local_table()? {
            return interpreter::reduce(&table, column, reduction);
        }
        let (client, dataframe) = self.remote_target()?;
        client.compute(dataframe, column, reduction).await
    }

    pub async fn sum(&self, column: &str) -> Result<Value> {
        self.reduce(column, Reduction::Sum).await
    }

    pub async fn mean(&self, column: &str) -> Result<Value> {
        self.reduce(column, Reduction::Mean).await
    }

    pub async fn min(&self, column: &str) -> Result<Value> {
        self.reduce(column, Reduction::Min).await
    }

    pub async fn max(&self, column: &str) -> Result<Value> {
        self.reduce(column, Reduction::Max).await
    }

    /// Schema, row count and size. Remote handles ask the server without fetching rows.
    pub async fn info(&self) -> Result<FrameInfo> {
        if let Some(table) = self.local_table()? {
            return Ok(FrameInfo {
                fields: table.schema_fields(),
                num_rows: table.num_rows(),
                total_bytes: table.estimated_bytes(),
            });
        }
        let (client, dataframe) = self.remote_target()?;
        client.frame_info(dataframe).await
    }

    pub async fn schema(&self) -> Result<SchemaFields> {
        Ok(self.info().await?.fields)
    }

    pub async fn num_rows(&self) -> Result<usize> {
        Ok(self.info().await?.num_rows)
    }

    pub async fn num_cols(&self) -> Result<usize> {
        Ok(self.info().await?.fields.len())
    }

    /// `(rows, columns)`.
    pub async fn shape(&self) -> Result<(usize, usize)> {
        let info = self.info().await?;
        Ok((info.num_rows, info.fields.len()))
    }

    pub async fn column_names(&self) -> Result<Vec<String>> {
        Ok(self
            .info()
            .await?
            .fields
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    pub async fn total_bytes(&self) -> Result<usize> {
        Ok(self.info().await?.total_bytes)
    }

    /// Formatted view; remote handles are formatted by the server.
    pub async fn to_string_with(&self, options: &DisplayOptions) -> Result<String> {
        if let Some(table) = self.local_table()? {
            return format_table(&table, options);
        }
        let (client, dataframe) = self.remote_target()?;
        client.remote_to_string(dataframe, options).await
    }

    /// Column name to values, for the whole result.
    pub async fn to_dict(&mut self) -> Result<ColumnValues> {
        self.collect().await?.to_columns()
    }

    /// Listing with the `blob` column filled from the files it names.
    ///
    /// Resident data that is not a listing under a known storage root comes
    /// back unchanged.
    pub async fn collect_blob(&self) -> Result<Table> {
        if let Some(table) = self.local_table()? {
            return match &self.storage_root {
                Some(root) if table.frame().column(dir::PATH).is_ok() => fill_blobs(&table, root),
                _ => Ok(table),
            };
        }
        let (client, dataframe) = self.remote_target()?;
        let mut ticket = DataframeTicket::new(dataframe);
        ticket.kind = Some(TicketKind::CollectBlob);
        client.fetch_table(&ticket).await
    }

    /// Write the result to `output` using the default parse cache for
    /// metadata recorded against `source_path`.
    pub async fn write(
        &mut self,
        output: &Path,
        source_path: Option<&Path>,
        format: Option<FileFormat>,
    ) -> Result<()> {
        let root = self.storage_root.clone().unwrap_or_else(|| PathBuf::from("."));
        let registry = ParserRegistry::new(root, ParseCache::default_root().map(ParseCache::new));
        self.write_with(&registry, output, source_path, format).await
    }

    /// Write the result to `output`. The format comes from `format` or the
    /// output extension. Metadata recorded for `source_path` is restored
    /// underneath the table's own metadata.
    pub async fn write_with(
        &mut self,
        registry: &ParserRegistry,
        output: &Path,
        source_path: Option<&Path>,
        format: Option<FileFormat>,
    ) -> Result<()> {
        let mut table = self.collect().await?.clone();
        let registry = registry.clone();
        let output = output.to_path_buf();
        let source = source_path.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || {
            let parser = match format {
                Some(format) => registry.for_format(format)?,
                None => registry.for_path(&output)?,
            };
            if let Some(source) = &source {
                if let Some(mut merged) = registry.recorded_metadata(source)? {
                    merged.extend(std::mem::take(table.metadata_mut()));
                    *table.metadata_mut() = merged;
                }
            }
            tracing::debug!(output = %output.display(), parser = parser.name(), "writing dataframe");
            parser.write(&table, &output)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_table() {
            Ok(Some(table)) => match format_table(&table, &DisplayOptions::default()) {
                Ok(text) => f.write_str(&text),
                Err(e) => write!(f, "DataFrame({}) <{}>", self.id, e),
            },
            Ok(None) => write!(
                f,
                "DataFrame({}, remote, {} pending actions)",
                self.id,
                self.actions.len()
            ),
            Err(e) => write!(f, "DataFrame({}) <{}>", self.id, e),
        }
    }
}
