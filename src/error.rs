//! Error taxonomy shared by the client, the server and the interpreter.
//!
//! Errors cross the wire as a gRPC [`Status`] whose details carry an
//! [`ErrorPayload`], so the receiving side can rebuild the same variant.

use serde::{Deserialize, Serialize};
use tonic::{Code, Status};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed parameters, unsupported formats, missing request fields.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown dataset, dataframe, column or session.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credential verification failed. Never carries verifier internals.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Server-side interpretation failed at a specific action node.
    #[error("remote action #{action_index} ({action}) failed: {message}")]
    RemoteExecution {
        action_index: usize,
        action: String,
        message: String,
    },

    /// Connection, pool or stream failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Underlying format decode error.
    #[error("parser failure: {0}")]
    Parser(String),

    /// A client-local function was about to be sent to a server.
    #[error("action #{action_index} ({action}) cannot be executed remotely; collect() a local copy first")]
    UnsupportedRemoteAction { action_index: usize, action: String },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Failure of one node while interpreting an action log.
    #[error("action #{index} ({action}): {source}")]
    Action {
        index: usize,
        action: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Wire form of an [`Error`], carried in `Status::details`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

macro_rules! validation {
    ($($arg:tt)*) => {
        crate::error::Error::Validation(std::format!($($arg)*))
    };
}
pub(crate) use validation;

impl Error {
    /// Innermost error, skipping action-node context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Action { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound(_) => true,
            Error::Polars(polars::prelude::PolarsError::ColumnNotFound(_)) => true,
            _ => false,
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Error::Validation(_) => Code::InvalidArgument,
            Error::NotFound(_) => Code::NotFound,
            Error::Auth(_) => Code::Unauthenticated,
            Error::RemoteExecution { .. } => Code::Internal,
            Error::Transport(_) => Code::Unavailable,
            Error::Parser(_) => Code::DataLoss,
            Error::UnsupportedRemoteAction { .. } | Error::NotImplemented(_) => Code::Unimplemented,
            Error::Action { source, .. } => source.code(),
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => Code::NotFound,
            Error::Polars(_) | Error::Arrow(_) | Error::Io(_) | Error::Json(_) => Code::Internal,
        }
    }

    fn payload(&self) -> ErrorPayload {
        let message = crate::error_display::user_message(self);
        match self {
            Error::RemoteExecution {
                action_index,
                action,
                message,
            } => ErrorPayload {
                kind: "remote_execution".into(),
                message: message.clone(),
                action_index: Some(*action_index),
                action: Some(action.clone()),
            },
            Error::UnsupportedRemoteAction {
                action_index,
                action,
            } => ErrorPayload {
                kind: "unsupported_remote_action".into(),
                message,
                action_index: Some(*action_index),
                action: Some(action.clone()),
            },
            Error::Action {
                index,
                action,
                source,
            } => {
                // Missing columns stay not-found; everything else names the failing node.
                let kind = if source.is_not_found() {
                    "not_found"
                } else {
                    "remote_execution"
                };
                ErrorPayload {
                    kind: kind.into(),
                    message: crate::error_display::user_message(source),
                    action_index: Some(*index),
                    action: Some(action.clone()),
                }
            }
            other => ErrorPayload {
                kind: other.kind_name().into(),
                message,
                action_index: None,
                action: None,
            },
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Auth(_) => "auth",
            Error::RemoteExecution { .. } | Error::Action { .. } => "remote_execution",
            Error::Transport(_) => "transport",
            Error::Parser(_) => "parser",
            Error::UnsupportedRemoteAction { .. } => "unsupported_remote_action",
            Error::NotImplemented(_) => "not_implemented",
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => "not_found",
            Error::Polars(polars::prelude::PolarsError::ColumnNotFound(_)) => "not_found",
            Error::Polars(_) | Error::Arrow(_) | Error::Io(_) | Error::Json(_) => "internal",
        }
    }

    /// Convert into a gRPC status carrying the typed payload.
    pub fn into_status(self) -> Status {
        let payload = self.payload();
        let code = match payload.kind.as_str() {
            "not_found" => Code::NotFound,
            "remote_execution" => Code::Internal,
            _ => self.code(),
        };
        let details = serde_json::to_vec(&payload).unwrap_or_default();
        Status::with_details(code, payload.message, details.into())
    }

    /// Rebuild a typed error from a status received over the wire.
    pub fn from_status(status: &Status) -> Self {
        if let Ok(p) = serde_json::from_slice::<ErrorPayload>(status.details()) {
            return match p.kind.as_str() {
                "validation" => Error::Validation(p.message),
                "not_found" => match (p.action_index, p.action) {
                    (Some(index), Some(action)) => Error::Action {
                        index,
                        action,
                        source: Box::new(Error::NotFound(p.message)),
                    },
                    _ => Error::NotFound(p.message),
                },
                "auth" => Error::Auth(p.message),
                "remote_execution" => Error::RemoteExecution {
                    action_index: p.action_index.unwrap_or_default(),
                    action: p.action.unwrap_or_default(),
                    message: p.message,
                },
                "parser" => Error::Parser(p.message),
                "unsupported_remote_action" => Error::UnsupportedRemoteAction {
                    action_index: p.action_index.unwrap_or_default(),
                    action: p.action.unwrap_or_default(),
                },
                "not_implemented" => Error::NotImplemented(p.message),
                _ => Error::Transport(p.message),
            };
        }
        let message = status.message().to_string();
        match status.code() {
            Code::InvalidArgument => Error::Validation(message),
            Code::NotFound => Error::NotFound(message),
            Code::Unauthenticated | Code::PermissionDenied => Error::Auth(message),
            Code::Unimplemented => Error::NotImplemented(message),
            Code::DataLoss => Error::Parser(message),
            _ => Error::Transport(format!("{}: {}", status.code(), message)),
        }
    }
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        value.into_status()
    }
}

impl From<Status> for Error {
    fn from(value: Status) -> Self {
        Error::from_status(&value)
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(value: tonic::transport::Error) -> Self {
        Error::Transport(value.to_string())
    }
}

impl From<arrow_flight::error::FlightError> for Error {
    fn from(value: arrow_flight::error::FlightError) -> Self {
        use arrow_flight::error::FlightError;
        match value {
            FlightError::Tonic(status) => Error::from_status(&status),
            FlightError::Arrow(e) => Error::Arrow(e),
            other => Error::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_kind() {
        let status = Error::NotFound("dataframe 'x' is not open".into()).into_status();
        assert_eq!(status.code(), Code::NotFound);
        assert!(matches!(Error::from_status(&status), Error::NotFound(m) if m.contains("'x'")));

        let status = Error::Auth("bad password".into()).into_status();
        assert!(matches!(Error::from_status(&status), Error::Auth(_)));
    }

    #[test]
    fn test_action_failure_becomes_remote_execution() {
        let err = Error::Action {
            index: 2,
            action: "sql".into(),
            source: Box::new(Error::Validation("syntax error near FRM".into())),
        };
        let status = err.into_status();
        match Error::from_status(&status) {
            Error::RemoteExecution {
                action_index,
                action,
                message,
            } => {
                assert_eq!(action_index, 2);
                assert_eq!(action, "sql");
                assert!(message.contains("FRM"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_column_in_action_stays_not_found() {
        let err = Error::Action {
            index: 0,
            action: "select".into(),
            source: Box::new(Error::NotFound("column 'zz'".into())),
        };
        let back = Error::from_status(&err.into_status());
        assert!(back.is_not_found());
        assert!(matches!(back, Error::Action { index: 0, .. }));
    }

    #[test]
    fn test_plain_status_without_details() {
        let status = Status::unavailable("connection refused");
        assert!(matches!(Error::from_status(&status), Error::Transport(_)));
        let status = Status::invalid_argument("bad");
        assert!(matches!(Error::from_status(&status), Error::Validation(_)));
    }
}
