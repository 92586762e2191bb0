//! User-facing error message formatting.
//!
//! Uses typed error matching (PolarsError variants, io::ErrorKind) rather than
//! string parsing to produce actionable, engine-agnostic messages. These are
//! the messages that travel to clients inside a status payload.

use crate::error::Error;
use polars::prelude::PolarsError;
use std::io;

/// Message for any crate error, unwrapping engine and I/O causes.
pub fn user_message(err: &Error) -> String {
    match err {
        Error::Validation(m)
        | Error::NotFound(m)
        | Error::Auth(m)
        | Error::Transport(m)
        | Error::Parser(m)
        | Error::NotImplemented(m) => m.clone(),
        Error::RemoteExecution { message, .. } => message.clone(),
        Error::UnsupportedRemoteAction { .. } => err.to_string(),
        Error::Action {
            index,
            action,
            source,
        } => format!("action #{} ({}): {}", index, action, user_message(source)),
        Error::Polars(e) => user_message_from_polars(e),
        Error::Io(e) => user_message_from_io(e, None),
        Error::Arrow(e) => format!("Arrow error: {}", e),
        Error::Json(e) => format!("Malformed JSON payload: {}", e),
    }
}

/// Format a PolarsError as a user-facing message by matching on its variant.
pub fn user_message_from_polars(err: &PolarsError) -> String {
    use polars::prelude::PolarsError as PE;

    match err {
        PE::ColumnNotFound(msg) => format!(
            "Column not found: {}. Check spelling and that the column exists.",
            msg
        ),
        PE::Duplicate(msg) => format!("Duplicate column in result: {}", msg),
        PE::IO { error, msg } => {
            user_message_from_io(error.as_ref(), msg.as_ref().map(|m| m.as_ref()))
        }
        PE::NoData(msg) => format!("No data: {}", msg),
        PE::SchemaMismatch(msg) => format!("Schema mismatch: {}", msg),
        PE::ShapeMismatch(msg) => format!("Row shape mismatch: {}", msg),
        PE::InvalidOperation(msg) => format!("Operation not allowed: {}", msg),
        PE::OutOfBounds(msg) => format!("Index or row out of bounds: {}", msg),
        PE::SchemaFieldNotFound(msg) => format!("Schema field not found: {}", msg),
        PE::ComputeError(msg) => simplify_compute_message(msg),
        PE::SQLInterface(msg) | PE::SQLSyntax(msg) => format!("SQL error: {}", msg),
        PE::Context { error, msg } => {
            let inner = user_message_from_polars(error);
            format!("{}: {}", msg, inner)
        }
        #[allow(unreachable_patterns)]
        _ => err.to_string(),
    }
}

/// Format an io::Error as a user-facing message by matching on ErrorKind.
pub fn user_message_from_io(err: &io::Error, context: Option<&str>) -> String {
    use std::io::ErrorKind;

    let base: String = match err.kind() {
        ErrorKind::NotFound => "File or directory not found.".to_string(),
        ErrorKind::PermissionDenied => "Permission denied. Check read access.".to_string(),
        ErrorKind::ConnectionRefused => "Connection refused.".to_string(),
        ErrorKind::ConnectionReset => "Connection reset.".to_string(),
        ErrorKind::InvalidData | ErrorKind::InvalidInput => {
            "Invalid or corrupted data.".to_string()
        }
        ErrorKind::UnexpectedEof => "Unexpected end of file.".to_string(),
        ErrorKind::OutOfMemory => "Out of memory.".to_string(),
        _ => err.to_string(),
    };

    match context {
        Some(ctx) if !ctx.is_empty() => format!("{} {}", base, ctx),
        _ => base,
    }
}

/// Strip engine-internal phrasing from compute errors.
fn simplify_compute_message(msg: &str) -> String {
    let lower = msg.to_lowercase();
    if lower.contains(".alias(") || lower.contains("try renaming") {
        return "Duplicate column names in result. Give computed columns distinct names."
            .to_string();
    }
    msg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_from_io_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "No such file");
        let msg = user_message_from_io(&err, None);
        assert!(msg.contains("not found"), "expected 'not found', got: {}", msg);
    }

    #[test]
    fn test_user_message_from_polars_column_not_found() {
        let err = PolarsError::ColumnNotFound("foo".into());
        let msg = user_message_from_polars(&err);
        assert!(msg.contains("foo"), "expected 'foo', got: {}", msg);
        assert!(msg.contains("Column not found"));
    }

    #[test]
    fn test_action_context_is_prefixed() {
        let err = Error::Action {
            index: 1,
            action: "filter".into(),
            source: Box::new(Error::Validation("unexpected token ')'".into())),
        };
        assert_eq!(
            user_message(&err),
            "action #1 (filter): unexpected token ')'"
        );
    }

    #[test]
    fn test_simplify_compute_message_alias_hint() {
        let raw = "projections contained duplicate: 'x'. Try renaming with .alias(\"name\")";
        let msg = simplify_compute_message(raw);
        assert!(!msg.contains(".alias("), "should strip .alias( hint: {}", msg);
    }
}
