//! Per-client sessions and the tables they hold open.
//!
//! A session is created by `connect_server`, owns every table opened through
//! it, and is destroyed by `close_connection`. Tables are never shared
//! between sessions, even when two sessions open the same identity.

use super::auth::Identity;
use crate::error::{Error, Result};
use crate::table::Table;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct Session {
    id: String,
    client_ip: String,
    identity: Identity,
    created_at: DateTime<Utc>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Session {
    fn new(identity: Identity, client_ip: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_ip,
            identity,
            created_at: Utc::now(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Username for access logs; `anonymous` when none was verified.
    pub fn display_user(&self) -> &str {
        self.identity.username.as_deref().unwrap_or("anonymous")
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Store a freshly parsed table, replacing any earlier open of the same identity.
    pub fn insert_table(&self, dataframe: &str, table: Table) -> Arc<Table> {
        let table = Arc::new(table);
        self.tables
            .write()
            .insert(dataframe.to_string(), table.clone());
        table
    }

    pub fn table(&self, dataframe: &str) -> Result<Arc<Table>> {
        self.tables.read().get(dataframe).cloned().ok_or_else(|| {
            Error::NotFound(format!(
                "dataframe '{}' is not open in this session",
                dataframe
            ))
        })
    }

    pub fn open_count(&self) -> usize {
        self.tables.read().len()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, identity: Identity, client_ip: impl Into<String>) -> Arc<Session> {
        let session = Arc::new(Session::new(identity, client_ip.into()));
        self.sessions
            .insert(session.id().to_string(), session.clone());
        tracing::info!(
            connection_id = session.id(),
            client_ip = session.client_ip(),
            username = session.display_user(),
            "session opened"
        );
        session
    }

    pub fn get(&self, connection_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(connection_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::NotFound(format!("connection '{}' does not exist", connection_id)))
    }

    /// Remove the session; its tables are dropped once in-flight requests finish.
    pub fn close(&self, connection_id: &str) -> Result<()> {
        match self.sessions.remove(connection_id) {
            Some((_, session)) => {
                tracing::info!(
                    connection_id,
                    open_tables = session.open_count(),
                    "session closed"
                );
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "connection '{}' does not exist",
                connection_id
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
