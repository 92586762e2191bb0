//! Flight client: connect with a principal, browse the catalog, open dataframes.

pub mod pool;

pub use pool::{ConnectionPool, PooledConnection};

use crate::action::Action;
use crate::config::ClientConfig;
use crate::dataframe::DataFrame;
use crate::error::{Error, Result};
use crate::format::DisplayOptions;
use crate::interpreter::Reduction;
use crate::protocol::*;
use crate::server::{DataframeEntry, DatasetMeta};
use crate::table::Table;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::error::FlightError;
use arrow_flight::{Empty, FlightDescriptor, FlightInfo, Ticket};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Schema, row count and size of a dataframe, without its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub fields: Vec<(String, String)>,
    pub num_rows: usize,
    pub total_bytes: usize,
}

/// A session on one server. Cheap to clone; clones share the session and the pool.
#[derive(Debug, Clone)]
pub struct DacpClient {
    pool: ConnectionPool,
    connection_id: Arc<str>,
    token: Option<Arc<str>>,
    config: ClientConfig,
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8], action: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Transport(format!("malformed {} response: {}", action, e)))
}

fn first<T: DeserializeOwned>(results: Vec<Bytes>, action: &str) -> Result<T> {
    match results.first() {
        Some(body) => parse_json(body, action),
        None => Err(Error::Transport(format!("empty {} response", action))),
    }
}

struct ChunkState {
    batches: FlightRecordBatchStream,
    yielded: bool,
    _conn: PooledConnection,
}

/// Next chunk of a `do_get` stream. A result without rows still yields one
/// empty table so the caller sees its schema.
async fn next_chunk(state: Option<ChunkState>) -> Result<Option<(Table, Option<ChunkState>)>> {
    let Some(mut state) = state else {
        return Ok(None);
    };
    match state.batches.try_next().await? {
        Some(batch) => {
            state.yielded = true;
            let table = Table::from_record_batches(batch.schema(), &[batch])?;
            Ok(Some((table, Some(state))))
        }
        None if !state.yielded => match state.batches.schema().cloned() {
            Some(schema) => Ok(Some((Table::from_record_batches(schema, &[])?, None))),
            None => Ok(None),
        },
        None => Ok(None),
    }
}

impl DacpClient {
    /// Connect with the default client settings.
    pub async fn connect(url: &str, credentials: Credentials) -> Result<Self> {
        Self::connect_with_config(url, credentials, &ClientConfig::default()).await
    }

    pub async fn connect_with_config(
        url: &str,
        credentials: Credentials,
        config: &ClientConfig,
    ) -> Result<Self> {
        let pool = ConnectionPool::new(url, config.max_connections)?;
        let request = ConnectRequest {
            client_ip: None,
            credentials,
        };
        let results = Self::call(&pool, CONNECT_SERVER, serde_json::to_vec(&request)?).await?;
        let response: ConnectResponse = first(results, CONNECT_SERVER)?;
        tracing::debug!(connection_id = response.connection_id.as_str(), "connected");
        Ok(Self {
            pool,
            connection_id: Arc::from(response.connection_id),
            token: response.token.map(Arc::from),
            config: config.clone(),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Token handed out for password principals.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn call(pool: &ConnectionPool, action: &str, body: Vec<u8>) -> Result<Vec<Bytes>> {
        let mut conn = pool.acquire().await?;
        let request = arrow_flight::Action {
            r#type: action.to_string(),
            body: body.into(),
        };
        let stream = match conn.do_action(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(conn.fail(status)),
        };
        stream
            .map_ok(|r| r.body)
            .map_err(Error::from)
            .try_collect()
            .await
    }

    /// Results of an action as they arrive. The connection stays checked out
    /// until the stream is exhausted or dropped.
    async fn action_stream<B: Serialize>(
        &self,
        action: &str,
        body: &B,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let mut conn = self.pool.acquire().await?;
        let request = arrow_flight::Action {
            r#type: action.to_string(),
            body: serde_json::to_vec(body)?.into(),
        };
        let stream = match conn.do_action(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(conn.fail(status)),
        };
        Ok(stream
            .map(move |item| {
                let _held = &conn;
                item.map(|r| r.body).map_err(Error::from)
            })
            .boxed())
    }

    async fn action<B: Serialize>(&self, action: &str, body: &B) -> Result<Vec<Bytes>> {
        Self::call(&self.pool, action, serde_json::to_vec(body)?).await
    }

    async fn action_json<B: Serialize, T: DeserializeOwned>(
        &self,
        action: &str,
        body: &B,
    ) -> Result<T> {
        first(self.action(action, body).await?, action)
    }

    async fn action_text<B: Serialize>(&self, action: &str, body: &B) -> Result<String> {
        let results = self.action(action, body).await?;
        let bytes = results
            .first()
            .ok_or_else(|| Error::Transport(format!("empty {} response", action)))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Transport(format!("{} response is not UTF-8: {}", action, e)))
    }

    pub async fn instrument_info(&self) -> Result<String> {
        self.action_text(GET_INSTRUMENT_INFO, &serde_json::json!({}))
            .await
    }

    pub async fn network_link_info(&self) -> Result<String> {
        self.action_text(GET_NETWORK_LINK_INFO, &serde_json::json!({}))
            .await
    }

    /// Every action the server advertises, as `(name, description)`.
    pub async fn list_actions(&self) -> Result<Vec<(String, String)>> {
        let mut conn = self.pool.acquire().await?;
        let stream = match conn.list_actions(Empty {}).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(conn.fail(status)),
        };
        stream
            .map_ok(|a| (a.r#type, a.description))
            .map_err(Error::from)
            .try_collect()
            .await
    }

    /// Dataset identities, `page` counted from 1.
    pub async fn list_datasets(&self, page: usize, limit: usize) -> Result<Vec<String>> {
        let request = ListDatasetsRequest {
            token: self.token.as_deref().map(str::to_string),
            page,
            limit,
        };
        self.action_json(LIST_DATASETS, &request).await
    }

    pub async fn get_dataset(&self, dataset_name: &str) -> Result<DatasetMeta> {
        let request = DatasetRequest {
            token: self.token.as_deref().map(str::to_string),
            dataset_name: dataset_name.to_string(),
        };
        self.action_json(GET_DATASET, &request).await
    }

    /// Pages of dataframes as the server produces them.
    pub async fn list_dataframes_stream(
        &self,
        dataset_name: &str,
        page_size: Option<usize>,
    ) -> Result<BoxStream<'static, Result<Vec<DataframeEntry>>>> {
        let request = ListDataframesRequest {
            token: self.token.as_deref().map(str::to_string),
            dataset_name: dataset_name.to_string(),
            max_chunksize: Some(page_size.unwrap_or(self.config.list_chunk_size)),
        };
        let pages = self.action_stream(LIST_DATAFRAMES, &request).await?;
        Ok(pages
            .and_then(|bytes| async move { parse_json(&bytes, LIST_DATAFRAMES) })
            .boxed())
    }

    pub async fn list_dataframes(&self, dataset_name: &str) -> Result<Vec<DataframeEntry>> {
        let pages: Vec<Vec<DataframeEntry>> = self
            .list_dataframes_stream(dataset_name, None)
            .await?
            .try_collect()
            .await?;
        Ok(pages.into_iter().flatten().collect())
    }

    pub async fn list_user_auth_dataframes(&self, username: &str) -> Result<Vec<String>> {
        let request = UserRequest {
            username: username.to_string(),
        };
        self.action_json(LIST_USER_AUTH_DATAFRAMES, &request).await
    }

    pub async fn check_permission(&self, dataset_name: &str, username: &str) -> Result<bool> {
        let request = PermissionRequest {
            dataset_name: dataset_name.to_string(),
            username: username.to_string(),
        };
        let answer = self.action_text(CHECK_PERMISSION, &request).await?;
        Ok(answer.trim() == "True")
    }

    fn dataframe_request(&self, dataframe_name: &str) -> DataframeRequest {
        DataframeRequest {
            connection_id: self.connection_id.to_string(),
            dataframe_name: dataframe_name.to_string(),
        }
    }

    /// First rows of a dataframe, read straight from the source.
    pub async fn sample(&self, dataframe_name: &str) -> Result<SampleResponse> {
        self.action_json(SAMPLE, &self.dataframe_request(dataframe_name))
            .await
    }

    /// Row count of the source; `None` for directory listings.
    pub async fn count(&self, dataframe_name: &str) -> Result<Option<usize>> {
        let response: CountResponse = self
            .action_json(COUNT, &self.dataframe_request(dataframe_name))
            .await?;
        Ok(response.total_count)
    }

    /// Parse the dataframe into this session and return a remote handle to it.
    pub async fn open(&self, dataframe_name: &str) -> Result<DataFrame> {
        self.action(OPEN, &self.dataframe_request(dataframe_name))
            .await?;
        Ok(DataFrame::remote(dataframe_name, self.clone()))
    }

    /// Raw bytes of the source file, in chunks of `chunk_bytes`.
    pub async fn get_dataframe_stream(
        &self,
        dataframe_name: &str,
        chunk_bytes: Option<usize>,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let request = StreamRequest {
            connection_id: self.connection_id.to_string(),
            dataframe_name: dataframe_name.to_string(),
            max_chunksize: Some(chunk_bytes.unwrap_or(self.config.stream_chunk_bytes)),
        };
        self.action_stream(GET_DATAFRAME_STREAM, &request).await
    }

    /// Drop the session and everything opened in it.
    pub async fn close(&self) -> Result<()> {
        let request = CloseRequest {
            connection_id: self.connection_id.to_string(),
        };
        self.action(CLOSE_CONNECTION, &request).await?;
        Ok(())
    }

    pub(crate) fn dataframe_ref(&self, id: &str, actions: &[Action]) -> DataframeRef {
        DataframeRef {
            id: id.to_string(),
            connection_id: self.connection_id.to_string(),
            actions: actions.to_vec(),
        }
    }

    pub(crate) async fn frame_info(&self, dataframe: DataframeRef) -> Result<FrameInfo> {
        let ticket = DataframeTicket::new(dataframe);
        let descriptor = FlightDescriptor::new_cmd(serde_json::to_vec(&ticket)?);
        let mut conn = self.pool.acquire().await?;
        let info: FlightInfo = match conn.get_flight_info(descriptor).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(conn.fail(status)),
        };
        drop(conn);
        let num_rows = usize::try_from(info.total_records).unwrap_or_default();
        let total_bytes = usize::try_from(info.total_bytes).unwrap_or_default();
        let schema = info.try_decode_schema()?;
        let empty = Table::from_record_batches(Arc::new(schema), &[])?;
        Ok(FrameInfo {
            fields: empty.schema_fields(),
            num_rows,
            total_bytes,
        })
    }

    async fn do_get(
        &self,
        ticket: &DataframeTicket,
    ) -> Result<(PooledConnection, FlightRecordBatchStream)> {
        let body = serde_json::to_vec(ticket)?;
        let mut conn = self.pool.acquire().await?;
        let response = match conn.do_get(Ticket { ticket: body.into() }).await {
            Ok(response) => response,
            Err(status) => return Err(conn.fail(status)),
        };
        let batches = FlightRecordBatchStream::new_from_flight_data(
            response.into_inner().map_err(FlightError::from),
        );
        Ok((conn, batches))
    }

    /// Whole result of a ticket as one table.
    pub(crate) async fn fetch_table(&self, ticket: &DataframeTicket) -> Result<Table> {
        let (_conn, mut stream) = self.do_get(ticket).await?;
        let mut batches = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            batches.push(batch);
        }
        let schema = match (stream.schema(), batches.first()) {
            (Some(schema), _) => schema.clone(),
            (None, Some(batch)) => batch.schema(),
            (None, None) => return Ok(Table::empty()),
        };
        Table::from_record_batches(schema, &batches)
    }

    /// One table per chunk, fetched as the consumer asks for them.
    pub(crate) async fn fetch_stream(
        &self,
        ticket: &DataframeTicket,
    ) -> Result<BoxStream<'static, Result<Table>>> {
        let (conn, batches) = self.do_get(ticket).await?;
        let state = ChunkState {
            batches,
            yielded: false,
            _conn: conn,
        };
        Ok(futures::stream::try_unfold(Some(state), next_chunk).boxed())
    }

    pub(crate) async fn compute(
        &self,
        dataframe: DataframeRef,
        column: &str,
        reduction: Reduction,
    ) -> Result<Value> {
        let request = ComputeRequest {
            dataframe,
            column: column.to_string(),
        };
        let action = format!("{}{}", COMPUTE_PREFIX, reduction.name());
        let response: ComputeResponse = self.action_json(&action, &request).await?;
        Ok(response.result)
    }

    pub(crate) async fn remote_to_string(
        &self,
        dataframe: DataframeRef,
        options: &DisplayOptions,
    ) -> Result<String> {
        let request = ToStringRequest {
            dataframe,
            options: *options,
        };
        self.action_text(TO_STRING, &request).await
    }
}
