//! Columnar table: a polars frame plus a string metadata map.
//!
//! The metadata map rides along every transformation that keeps the columns'
//! meaning and travels over Flight inside the Arrow schema metadata.

use crate::error::{Error, Result};
use arrow::datatypes::{Schema as ArrowSchema, SchemaRef};
use arrow::record_batch::RecordBatch;
use polars::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;

pub type Metadata = BTreeMap<String, String>;

/// Column name and dtype pairs, in column order.
pub type SchemaFields = Vec<(String, String)>;

/// Column name and values pairs, in column order.
pub type ColumnValues = Vec<(String, Vec<Value>)>;

#[derive(Debug, Clone)]
pub struct Table {
    frame: DataFrame,
    metadata: Metadata,
}

impl Table {
    pub fn new(frame: DataFrame) -> Self {
        Self {
            frame,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(frame: DataFrame, metadata: Metadata) -> Self {
        Self { frame, metadata }
    }

    pub fn empty() -> Self {
        Self::new(DataFrame::empty())
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    pub fn into_parts(self) -> (DataFrame, Metadata) {
        (self.frame, self.metadata)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Same metadata, different rows or columns.
    pub fn replace_frame(&self, frame: DataFrame) -> Self {
        Self {
            frame,
            metadata: self.metadata.clone(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.frame.height()
    }

    pub fn num_cols(&self) -> usize {
        self.frame.width()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .into_iter()
            .map(|n| n.to_string())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.column(name).is_ok()
    }

    pub fn schema_fields(&self) -> SchemaFields {
        self.columns()
            .map(|c| (c.name().to_string(), c.dtype().to_string()))
            .collect()
    }

    fn columns(&self) -> impl Iterator<Item = &Column> + '_ {
        self.frame
            .get_column_names()
            .into_iter()
            .filter_map(|name| self.frame.column(name.as_str()).ok())
    }

    pub fn estimated_bytes(&self) -> usize {
        self.frame.estimated_size()
    }

    /// Rows `[offset, offset + len)`, clipped to the table.
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        let offset = offset.min(self.num_rows());
        let len = len.min(self.num_rows() - offset);
        self.replace_frame(self.frame.slice(offset as i64, len))
    }

    /// Consecutive slices of at most `chunk_size` rows, built one at a time.
    pub fn chunks(&self, chunk_size: usize) -> TableChunks<'_> {
        TableChunks {
            table: self,
            chunk_size: chunk_size.max(1),
            offset: 0,
            done: false,
        }
    }

    pub fn row(&self, index: usize) -> Result<Self> {
        if index >= self.num_rows() {
            return Err(Error::NotFound(format!(
                "row {} is out of range for a table of {} rows",
                index,
                self.num_rows()
            )));
        }
        Ok(self.slice(index, 1))
    }

    /// One-column table holding `name`.
    pub fn column_table(&self, name: &str) -> Result<Self> {
        let column = self.column_ref(name)?.clone();
        let frame = DataFrame::new(vec![column])?;
        Ok(self.replace_frame(frame))
    }

    pub fn row_values(&self, index: usize) -> Result<serde_json::Map<String, Value>> {
        if index >= self.num_rows() {
            return Err(Error::NotFound(format!(
                "row {} is out of range for a table of {} rows",
                index,
                self.num_rows()
            )));
        }
        let mut row = serde_json::Map::new();
        for column in self.columns() {
            row.insert(column.name().to_string(), any_value_to_json(&column.get(index)?));
        }
        Ok(row)
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<Value>> {
        let column = self.column_ref(name)?;
        series_values(column.as_materialized_series())
    }

    pub fn to_columns(&self) -> Result<ColumnValues> {
        self.columns()
            .map(|c| Ok((c.name().to_string(), series_values(c.as_materialized_series())?)))
            .collect()
    }

    /// Value at `(row, column)`; used for single-cell reduction results.
    pub fn scalar(&self, row: usize, name: &str) -> Result<Value> {
        let column = self.column_ref(name)?;
        Ok(any_value_to_json(&column.get(row)?))
    }

    fn column_ref(&self, name: &str) -> Result<&Column> {
        self.frame
            .column(name)
            .map_err(|_| Error::NotFound(format!("column '{}' does not exist", name)))
    }

    /// Row-wise concatenation; metadata comes from the first part.
    pub fn concat(parts: Vec<Table>) -> Result<Self> {
        let mut iter = parts.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Self::empty());
        };
        let (mut frame, metadata) = first.into_parts();
        for part in iter {
            frame = frame.vstack(part.frame())?;
        }
        Ok(Self::with_metadata(frame, metadata))
    }

    /// Same columns, same values, nulls compared equal. Metadata is ignored.
    pub fn same_data(&self, other: &Table) -> bool {
        self.frame.equals_missing(&other.frame)
    }

    /// Engine IPC stream bytes, using the widest-compatible Arrow layout.
    pub fn to_ipc_stream(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut frame = self.frame.clone();
        IpcStreamWriter::new(&mut buf)
            .with_compat_level(CompatLevel::oldest())
            .finish(&mut frame)?;
        Ok(buf)
    }

    pub fn from_ipc_stream(bytes: &[u8], metadata: Metadata) -> Result<Self> {
        let frame = IpcStreamReader::new(Cursor::new(bytes)).finish()?;
        Ok(Self::with_metadata(frame, metadata))
    }

    /// Arrow schema (with metadata attached) and record batches for Flight.
    pub fn to_record_batches(&self) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let bytes = self.to_ipc_stream()?;
        let reader = arrow::ipc::reader::StreamReader::try_new(Cursor::new(bytes), None)?;
        let base = reader.schema();
        let metadata: HashMap<String, String> = self
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let schema: SchemaRef =
            Arc::new(ArrowSchema::new(base.fields().clone()).with_metadata(metadata));
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?.with_schema(schema.clone())?);
        }
        Ok((schema, batches))
    }

    /// Inverse of [`Table::to_record_batches`]; metadata is read back from the schema.
    pub fn from_record_batches(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Self> {
        let mut buf = Vec::new();
        {
            let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut buf, &schema)?;
            for batch in batches {
                writer.write(batch)?;
            }
            writer.finish()?;
        }
        let metadata: Metadata = schema
            .metadata()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self::from_ipc_stream(&buf, metadata)
    }
}

pub struct TableChunks<'a> {
    table: &'a Table,
    chunk_size: usize,
    offset: usize,
    done: bool,
}

impl Iterator for TableChunks<'_> {
    type Item = Table;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let total = self.table.num_rows();
        // An empty table still yields one empty chunk so consumers see the schema.
        if total == 0 {
            self.done = true;
            return Some(self.table.slice(0, 0));
        }
        if self.offset >= total {
            self.done = true;
            return None;
        }
        let chunk = self.table.slice(self.offset, self.chunk_size);
        self.offset += self.chunk_size;
        Some(chunk)
    }
}

fn series_values(series: &Series) -> Result<Vec<Value>> {
    (0..series.len())
        .map(|i| Ok(any_value_to_json(&series.get(i)?)))
        .collect()
}

fn float_to_json(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

/// Engine scalar to JSON. NaN and infinities become strings.
pub fn any_value_to_json(value: &AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(*b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        AnyValue::Int8(v) => Value::from(*v),
        AnyValue::Int16(v) => Value::from(*v),
        AnyValue::Int32(v) => Value::from(*v),
        AnyValue::Int64(v) => Value::from(*v),
        AnyValue::UInt8(v) => Value::from(*v),
        AnyValue::UInt16(v) => Value::from(*v),
        AnyValue::UInt32(v) => Value::from(*v),
        AnyValue::UInt64(v) => Value::from(*v),
        AnyValue::Float32(v) => float_to_json(*v as f64),
        AnyValue::Float64(v) => float_to_json(*v),
        AnyValue::Binary(b) => Value::from(b.to_vec()),
        AnyValue::BinaryOwned(b) => Value::from(b.clone()),
        other => Value::String(other.to_string()),
    }
}

/// Build a series from JSON scalars, picking the narrowest common type.
pub fn json_values_to_series(name: &str, values: &[Value]) -> Result<Series> {
    let non_null = || values.iter().filter(|v| !v.is_null());
    let name: PlSmallStr = name.into();

    if non_null().next().is_none() {
        return Ok(Series::full_null(name, values.len(), &DataType::Null));
    }
    if non_null().all(Value::is_boolean) {
        let v: Vec<Option<bool>> = values.iter().map(Value::as_bool).collect();
        return Ok(Series::new(name, v));
    }
    if non_null().all(|v| v.is_i64()) {
        let v: Vec<Option<i64>> = values.iter().map(Value::as_i64).collect();
        return Ok(Series::new(name, v));
    }
    if non_null().all(Value::is_number) {
        let v: Vec<Option<f64>> = values.iter().map(Value::as_f64).collect();
        return Ok(Series::new(name, v));
    }
    let v: Vec<Option<String>> = values
        .iter()
        .map(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect();
    Ok(Series::new(name, v))
}

pub fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
    )
}
