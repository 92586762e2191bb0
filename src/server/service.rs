//! Arrow Flight service.
//!
//! Protocol:
//!   do_action(Action { type, body: json })      → one or more JSON/text results
//!   get_flight_info(FlightDescriptor { cmd })   → schema, row count and size of an opened dataframe
//!   do_get(Ticket { ticket: DataframeTicket })  → record batches of a whole table, one row or one column
//!   list_actions()                              → every action name with a description

use super::session::Session;
use super::ServerState;
use crate::error::{Error, Result};
use crate::format::format_table;
use crate::interpreter::{self, Reduction};
use crate::logging;
use crate::parser::dir::fill_blobs;
use crate::parser::SAMPLE_TOTAL_KEY;
use crate::protocol::{self, *};
use crate::table::Table;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::FlightService;
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint,
    FlightInfo, HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaResult, Ticket,
};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tonic::{Request, Response, Status, Streaming};

type ResultStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;

fn parse_body<T: DeserializeOwned>(body: &[u8], action: &str) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("malformed {} request: {}", action, e)))
}

fn json_result<T: Serialize + ?Sized>(value: &T) -> Result<arrow_flight::Result> {
    Ok(arrow_flight::Result {
        body: serde_json::to_vec(value)?.into(),
    })
}

fn text_result(text: impl Into<String>) -> arrow_flight::Result {
    arrow_flight::Result {
        body: Bytes::from(text.into()),
    }
}

fn single(result: arrow_flight::Result) -> ResultStream {
    futures::stream::once(futures::future::ready(Ok(result))).boxed()
}

fn nothing() -> ResultStream {
    futures::stream::empty().boxed()
}

/// Run parsing and interpretation off the request threads.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Encode an Arrow Schema as IPC bytes (for FlightInfo / SchemaResult).
fn schema_ipc_bytes(schema: &arrow::datatypes::Schema) -> Bytes {
    let ipc_opts = arrow::ipc::writer::IpcWriteOptions::default();
    let data_gen = arrow::ipc::writer::IpcDataGenerator::default();
    let mut dict_tracker = arrow::ipc::writer::DictionaryTracker::new(false);
    let encoded =
        data_gen.schema_to_bytes_with_dictionary_tracker(schema, &mut dict_tracker, &ipc_opts);
    encoded.ipc_message.into()
}

/// Stream `table` as Flight data, building each chunk only when the client pulls it.
///
/// Every chunk travels as exactly one record batch of at most `chunk_rows` rows.
fn encode_table(
    table: Table,
    chunk_rows: Option<usize>,
) -> Result<BoxStream<'static, Result<FlightData, Status>>> {
    let (schema, _) = table.slice(0, 0).to_record_batches()?;
    let rows = table.num_rows();
    let chunk = chunk_rows.unwrap_or(rows).max(1);
    let batch_schema = schema.clone();
    let batches = futures::stream::iter((0..rows).step_by(chunk))
        .map(move |offset| {
            let (_, parts) = table.slice(offset, chunk).to_record_batches()?;
            Ok::<_, Error>(arrow::compute::concat_batches(&batch_schema, &parts)?)
        })
        .map_err(|e: Error| FlightError::ExternalError(Box::new(e)));
    Ok(FlightDataEncoderBuilder::new()
        .with_schema(schema)
        .with_max_flight_data_size(usize::MAX)
        .build(batches)
        .map_err(|e| Error::from(e).into_status())
        .boxed())
}

/// Who touched which dataframe, for the access log.
#[derive(Debug, Clone)]
struct Access {
    dataframe: String,
    action: &'static str,
    client_ip: String,
    username: String,
}

impl Access {
    fn new(session: &Session, dataframe: &str, action: &'static str) -> Self {
        Self {
            dataframe: dataframe.to_string(),
            action,
            client_ip: session.client_ip().to_string(),
            username: session.display_user().to_string(),
        }
    }

    fn record(&self) {
        logging::access(&self.dataframe, self.action, &self.client_ip, &self.username);
    }

    fn record_bytes(&self, bytes: usize) {
        logging::access_bytes(
            &self.dataframe,
            self.action,
            &self.client_ip,
            &self.username,
            bytes,
        );
    }
}

/// Raw file bytes in fixed-size chunks. Dropping the stream closes the file.
fn file_chunks(file: tokio::fs::File, chunk: usize, access: Access) -> ResultStream {
    futures::stream::try_unfold(file, move |mut file| {
        let access = access.clone();
        async move {
            let mut buf = vec![0u8; chunk];
            let mut filled = 0;
            while filled < chunk {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(None);
            }
            buf.truncate(filled);
            access.record_bytes(filled);
            let result = arrow_flight::Result {
                body: Bytes::from(buf),
            };
            Ok::<_, std::io::Error>(Some((result, file)))
        }
    })
    .map_err(|e: std::io::Error| Error::Io(e).into_status())
    .boxed()
}

pub struct DacpFlightService {
    state: Arc<ServerState>,
}

impl DacpFlightService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Session plus the dataframe after its pending actions.
    async fn resolve(&self, dataframe: &DataframeRef) -> Result<(Arc<Session>, Table)> {
        let session = self.state.sessions.get(&dataframe.connection_id)?;
        let opened = session.table(&dataframe.id)?;
        let actions = dataframe.actions.clone();
        let table = blocking(move || interpreter::apply(&opened, &actions)).await?;
        Ok((session, table))
    }

    async fn flight_info(&self, descriptor: FlightDescriptor) -> Result<FlightInfo> {
        let ticket: DataframeTicket = parse_body(&descriptor.cmd, "get_flight_info")?;
        let (session, table) = self.resolve(&ticket.dataframe).await?;
        Access::new(&session, &ticket.dataframe.id, "get_flight_info").record();

        let (schema, _) = table.slice(0, 0).to_record_batches()?;
        let endpoint = FlightEndpoint {
            ticket: Some(Ticket {
                ticket: descriptor.cmd.clone(),
            }),
            location: vec![],
            expiration_time: None,
            app_metadata: Default::default(),
        };
        Ok(FlightInfo {
            schema: schema_ipc_bytes(&schema),
            flight_descriptor: Some(descriptor),
            endpoint: vec![endpoint],
            total_records: i64::try_from(table.num_rows()).unwrap_or(i64::MAX),
            total_bytes: i64::try_from(table.estimated_bytes()).unwrap_or(i64::MAX),
            ordered: true,
            app_metadata: Default::default(),
        })
    }

    async fn get(&self, ticket: Ticket) -> Result<BoxStream<'static, Result<FlightData, Status>>> {
        let ticket: DataframeTicket = parse_body(&ticket.ticket, "do_get")?;
        let (session, table) = self.resolve(&ticket.dataframe).await?;
        Access::new(&session, &ticket.dataframe.id, "do_get").record();

        if ticket.kind == Some(TicketKind::CollectBlob) {
            let root = self.state.storage_root.clone();
            let table = blocking(move || fill_blobs(&table, &root)).await?;
            return encode_table(table, ticket.max_chunksize);
        }
        if let Some(index) = ticket.row_index {
            return encode_table(table.row(index)?, None);
        }
        if let Some(column) = &ticket.column_name {
            return encode_table(table.column_table(column)?, None);
        }
        encode_table(table, ticket.max_chunksize)
    }

    async fn dispatch(
        &self,
        action_type: &str,
        body: Bytes,
        remote: Option<SocketAddr>,
    ) -> Result<ResultStream> {
        match action_type {
            protocol::CONNECT_SERVER => self.connect(&body, remote).await,
            protocol::CLOSE_CONNECTION => {
                let req: CloseRequest = parse_body(&body, action_type)?;
                self.state.sessions.close(&req.connection_id)?;
                Ok(nothing())
            }
            protocol::GET_INSTRUMENT_INFO => Ok(single(text_result(
                self.state.config.server.instrument_info.clone(),
            ))),
            protocol::GET_NETWORK_LINK_INFO => Ok(single(text_result(
                self.state.config.server.network_link_info.clone(),
            ))),
            protocol::LIST_DATASETS => {
                let req: ListDatasetsRequest = parse_body(&body, action_type)?;
                let catalog = self.state.catalog.clone();
                let datasets = blocking(move || {
                    catalog.list_datasets(req.token.as_deref(), req.page, req.limit)
                })
                .await?;
                Ok(single(json_result(&datasets)?))
            }
            protocol::GET_DATASET => self.get_dataset(&body).await,
            protocol::LIST_DATAFRAMES => self.list_dataframes(&body).await,
            protocol::LIST_USER_AUTH_DATAFRAMES => {
                let req: UserRequest = parse_body(&body, action_type)?;
                let catalog = self.state.catalog.clone();
                let frames = blocking(move || catalog.user_dataframes(&req.username)).await?;
                Ok(single(json_result(&frames)?))
            }
            protocol::CHECK_PERMISSION => {
                let req: PermissionRequest = parse_body(&body, action_type)?;
                let catalog = self.state.catalog.clone();
                let allowed =
                    blocking(move || catalog.check_permission(&req.dataset_name, &req.username))
                        .await?;
                Ok(single(text_result(if allowed { "True" } else { "False" })))
            }
            protocol::SAMPLE => self.sample(&body).await,
            protocol::COUNT => self.count(&body).await,
            protocol::OPEN => self.open(&body).await,
            protocol::GET_DATAFRAME_STREAM => self.dataframe_stream(&body).await,
            protocol::TO_STRING => {
                let req: ToStringRequest = parse_body(&body, action_type)?;
                let (session, table) = self.resolve(&req.dataframe).await?;
                Access::new(&session, &req.dataframe.id, "to_string").record();
                let options = req.options;
                let text = blocking(move || format_table(&table, &options)).await?;
                Ok(single(text_result(text)))
            }
            other if other.starts_with(protocol::COMPUTE_PREFIX) => {
                let reduction = Reduction::from_action(other)
                    .ok_or_else(|| Error::Validation(format!("unknown action '{}'", other)))?;
                let req: ComputeRequest = parse_body(&body, other)?;
                let (session, table) = self.resolve(&req.dataframe).await?;
                Access::new(&session, &req.dataframe.id, "compute").record();
                let column = req.column;
                let result =
                    blocking(move || interpreter::reduce(&table, &column, reduction)).await?;
                Ok(single(json_result(&ComputeResponse { result })?))
            }
            other => Err(Error::Validation(format!("unknown action '{}'", other))),
        }
    }

    async fn connect(&self, body: &[u8], remote: Option<SocketAddr>) -> Result<ResultStream> {
        let req: ConnectRequest = parse_body(body, protocol::CONNECT_SERVER)?;
        let verifier = self.state.verifier.clone();
        let credentials = req.credentials;
        let identity = blocking(move || verifier.verify(&credentials)).await?;
        let client_ip = req
            .client_ip
            .or_else(|| remote.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let token = identity.token.clone();
        let session = self.state.sessions.create(identity, client_ip);
        Ok(single(json_result(&ConnectResponse {
            token,
            connection_id: session.id().to_string(),
        })?))
    }

    async fn get_dataset(&self, body: &[u8]) -> Result<ResultStream> {
        let req: DatasetRequest = parse_body(body, protocol::GET_DATASET)?;
        if let Some(meta) = self.state.datasets.get(&req.dataset_name) {
            return Ok(single(json_result(meta.value())?));
        }
        let catalog = self.state.catalog.clone();
        let name = req.dataset_name.clone();
        let meta = blocking(move || catalog.dataset(req.token.as_deref(), &name)).await?;
        let result = json_result(&meta)?;
        self.state.datasets.insert(req.dataset_name, meta);
        Ok(single(result))
    }

    /// One result per page, so large datasets list without one giant message.
    async fn list_dataframes(&self, body: &[u8]) -> Result<ResultStream> {
        let req: ListDataframesRequest = parse_body(body, protocol::LIST_DATAFRAMES)?;
        let page = req
            .max_chunksize
            .unwrap_or(self.state.config.client.list_chunk_size)
            .max(1);
        let catalog = self.state.catalog.clone();
        let entries =
            blocking(move || catalog.dataframes(req.token.as_deref(), &req.dataset_name)).await?;
        let pages = entries
            .chunks(page)
            .map(json_result)
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(entries = entries.len(), pages = pages.len(), "listing dataframes");
        Ok(futures::stream::iter(pages.into_iter().map(Ok)).boxed())
    }

    async fn sample(&self, body: &[u8]) -> Result<ResultStream> {
        let req: DataframeRequest = parse_body(body, protocol::SAMPLE)?;
        let session = self.state.sessions.get(&req.connection_id)?;
        let path = self.state.source_path(&req.dataframe_name)?;
        let registry = self.state.registry.clone();
        let table = blocking(move || registry.for_path(&path)?.sample(&path)).await?;
        Access::new(&session, &req.dataframe_name, "sample").record();

        let (schema_names, schema_types) = table.schema_fields().into_iter().unzip();
        let total_count = table
            .metadata()
            .get(SAMPLE_TOTAL_KEY)
            .and_then(|v| v.parse().ok());
        let sample_data = table
            .to_columns()?
            .into_iter()
            .map(|(name, values)| (name, serde_json::Value::Array(values)))
            .collect();
        Ok(single(json_result(&SampleResponse {
            schema_names,
            schema_types,
            sample_data,
            total_count,
        })?))
    }

    async fn count(&self, body: &[u8]) -> Result<ResultStream> {
        let req: DataframeRequest = parse_body(body, protocol::COUNT)?;
        let session = self.state.sessions.get(&req.connection_id)?;
        let path = self.state.source_path(&req.dataframe_name)?;
        let registry = self.state.registry.clone();
        let total_count = blocking(move || registry.for_path(&path)?.count(&path)).await?;
        Access::new(&session, &req.dataframe_name, "count").record();
        Ok(single(json_result(&CountResponse { total_count })?))
    }

    async fn open(&self, body: &[u8]) -> Result<ResultStream> {
        let req: DataframeRequest = parse_body(body, protocol::OPEN)?;
        let session = self.state.sessions.get(&req.connection_id)?;
        let path = self.state.source_path(&req.dataframe_name)?;
        let registry = self.state.registry.clone();
        let table = blocking(move || registry.for_path(&path)?.parse(&path)).await?;
        tracing::debug!(
            dataframe = req.dataframe_name.as_str(),
            rows = table.num_rows(),
            cols = table.num_cols(),
            "opened dataframe"
        );
        session.insert_table(&req.dataframe_name, table);
        Access::new(&session, &req.dataframe_name, "open").record();
        Ok(nothing())
    }

    async fn dataframe_stream(&self, body: &[u8]) -> Result<ResultStream> {
        let req: StreamRequest = parse_body(body, protocol::GET_DATAFRAME_STREAM)?;
        let session = self.state.sessions.get(&req.connection_id)?;
        let path = self.state.source_path(&req.dataframe_name)?;
        let chunk = req
            .max_chunksize
            .unwrap_or(self.state.config.client.stream_chunk_bytes)
            .max(1);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("file '{}' does not exist", req.dataframe_name))
            } else {
                Error::Io(e)
            }
        })?;
        let access = Access::new(&session, &req.dataframe_name, "get_dataframe_stream");
        Ok(file_chunks(file, chunk, access))
    }
}

fn log_failure(operation: &str, err: Error) -> Status {
    tracing::warn!(operation, error = %err, "request failed");
    err.into_status()
}

#[tonic::async_trait]
impl FlightService for DacpFlightService {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoActionStream = ResultStream;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;

    // Sessions are created by the connect_server action instead.
    async fn handshake(
        &self,
        _req: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Ok(Response::new(futures::stream::empty().boxed()))
    }

    async fn list_flights(
        &self,
        _req: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Ok(Response::new(futures::stream::empty().boxed()))
    }

    async fn get_flight_info(
        &self,
        req: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        self.flight_info(req.into_inner())
            .await
            .map(Response::new)
            .map_err(|e| log_failure("get_flight_info", e))
    }

    async fn poll_flight_info(
        &self,
        req: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        let info = self.get_flight_info(req).await?.into_inner();
        Ok(Response::new(PollInfo {
            info: Some(info),
            flight_descriptor: None,
            progress: Some(1.0),
            expiration_time: None,
        }))
    }

    async fn get_schema(
        &self,
        req: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let info = self.get_flight_info(req).await?.into_inner();
        Ok(Response::new(SchemaResult {
            schema: info.schema,
        }))
    }

    async fn do_get(&self, req: Request<Ticket>) -> Result<Response<Self::DoGetStream>, Status> {
        self.get(req.into_inner())
            .await
            .map(Response::new)
            .map_err(|e| log_failure("do_get", e))
    }

    async fn do_put(
        &self,
        _req: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Error::NotImplemented("do_put".to_string()).into_status())
    }

    async fn do_exchange(
        &self,
        _req: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Error::NotImplemented("do_exchange".to_string()).into_status())
    }

    async fn do_action(
        &self,
        req: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let remote = req.remote_addr();
        let action = req.into_inner();
        tracing::debug!(action = action.r#type.as_str(), "do_action");
        self.dispatch(&action.r#type, action.body, remote)
            .await
            .map(Response::new)
            .map_err(|e| log_failure(&action.r#type, e))
    }

    async fn list_actions(
        &self,
        _req: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = protocol::ACTIONS.iter().map(|(name, description)| {
            Ok::<_, Status>(ActionType {
                r#type: name.to_string(),
                description: description.to_string(),
            })
        });
        Ok(Response::new(futures::stream::iter(actions).boxed()))
    }
}
