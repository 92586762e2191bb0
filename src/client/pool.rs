//! Bounded pool of Flight connections.

use crate::error::{Error, Result};
use arrow_flight::flight_service_client::FlightServiceClient;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

/// Largest message either side may send, matching the server default.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type FlightClient = FlightServiceClient<Channel>;

struct Inner {
    endpoint: Endpoint,
    idle: Mutex<Vec<FlightClient>>,
    permits: Arc<Semaphore>,
    max_connections: usize,
}

/// At most `max_connections` connections exist at once; [`ConnectionPool::acquire`]
/// waits for a free one when all are in use.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("uri", self.inner.endpoint.uri())
            .field("max_connections", &self.inner.max_connections)
            .field("available", &self.available())
            .finish()
    }
}

/// Rewrite a `dacp://` or `grpc://` address to the `http://` form the transport expects.
pub fn endpoint_url(url: &str) -> Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::Validation(format!("'{}' is not a server address", url)))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(Error::Validation(format!("'{}' has no host", url)));
    }
    match scheme {
        "http" | "https" => Ok(format!("{}://{}", scheme, authority)),
        "dacp" | "grpc" | "grpc+tcp" => Ok(format!("http://{}", authority)),
        "grpc+tls" => Ok(format!("https://{}", authority)),
        other => Err(Error::Validation(format!(
            "unsupported address scheme '{}'",
            other
        ))),
    }
}

impl ConnectionPool {
    /// Connections are opened lazily, on first acquisition.
    pub fn new(url: &str, max_connections: usize) -> Result<Self> {
        if max_connections == 0 {
            return Err(Error::Validation(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        let endpoint = Endpoint::from_shared(endpoint_url(url)?)?
            .tcp_nodelay(true)
            .connect_timeout(CONNECT_TIMEOUT);
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(max_connections)),
                max_connections,
            }),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    /// Connections that could be handed out without waiting.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Transport("connection pool is closed".to_string()))?;
        let reused = self.inner.idle.lock().pop();
        let client = match reused {
            Some(client) => client,
            None => {
                tracing::debug!(uri = %self.inner.endpoint.uri(), "opening connection");
                let channel = self.inner.endpoint.connect().await?;
                FlightServiceClient::new(channel)
                    .max_decoding_message_size(MAX_MESSAGE_BYTES)
                    .max_encoding_message_size(MAX_MESSAGE_BYTES)
            }
        };
        Ok(PooledConnection {
            client,
            pool: self.inner.clone(),
            discarded: false,
            _permit: permit,
        })
    }
}

/// A checked-out connection. Returned to the pool when dropped, whether or
/// not the call using it succeeded.
pub struct PooledConnection {
    client: FlightClient,
    pool: Arc<Inner>,
    discarded: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Close this connection instead of returning it, e.g. after a transport failure.
    pub fn discard(mut self) {
        self.discarded = true;
    }

    /// Convert a failed call's status, dropping the connection if the transport is gone.
    pub fn fail(self, status: Status) -> Error {
        if status.code() == Code::Unavailable {
            tracing::debug!(uri = %self.pool.endpoint.uri(), error = %status.message(), "discarding connection");
            self.discard();
        }
        Error::from(status)
    }
}

impl Deref for PooledConnection {
    type Target = FlightClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.discarded {
            // Clones share the underlying channel.
            self.pool.idle.lock().push(self.client.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("dacp://10.0.0.1:3101").unwrap(), "http://10.0.0.1:3101");
        assert_eq!(
            endpoint_url("grpc+tcp://localhost:3101/ignored/path").unwrap(),
            "http://localhost:3101"
        );
        assert_eq!(endpoint_url("http://h:1").unwrap(), "http://h:1");
        assert!(endpoint_url("localhost:3101").is_err());
        assert!(endpoint_url("ftp://h:1").is_err());
    }

    #[tokio::test]
    async fn test_zero_connections_rejected() {
        assert!(matches!(
            ConnectionPool::new("dacp://localhost:1", 0),
            Err(Error::Validation(_))
        ));
    }

    async fn checked_out(pool: &ConnectionPool) -> PooledConnection {
        let permit = pool.inner.permits.clone().acquire_owned().await.unwrap();
        PooledConnection {
            client: FlightServiceClient::new(pool.inner.endpoint.connect_lazy()),
            pool: pool.inner.clone(),
            discarded: false,
            _permit: permit,
        }
    }

    #[tokio::test]
    async fn test_unavailable_connection_is_not_reused() {
        let pool = ConnectionPool::new("dacp://127.0.0.1:1", 2).unwrap();

        let conn = checked_out(&pool).await;
        assert_eq!(pool.available(), 1);
        let err = conn.fail(Status::unavailable("connection reset"));
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(pool.available(), 2);
        assert!(pool.inner.idle.lock().is_empty());

        let conn = checked_out(&pool).await;
        let err = conn.fail(Status::not_found("no such dataframe"));
        assert!(err.is_not_found());
        assert_eq!(pool.inner.idle.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_permit() {
        // Nothing listens on port 1.
        let pool = ConnectionPool::new("dacp://127.0.0.1:1", 2).unwrap();
        assert!(matches!(pool.acquire().await, Err(Error::Transport(_))));
        assert_eq!(pool.available(), 2);
    }
}
