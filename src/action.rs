//! Deferred table transformations as data.
//!
//! A pipeline is a `Vec<Action>` applied strictly in order. Everything except
//! [`MapFunction::Local`] serializes to JSON and can be replayed by a server.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum Action {
    Limit {
        #[serde(rename = "rowNum")]
        count: usize,
    },
    Slice {
        offset: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<usize>,
    },
    Select {
        columns: Vec<String>,
    },
    Filter {
        expression: String,
    },
    Map {
        column: String,
        function: MapFunction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_column_name: Option<String>,
    },
    Sort {
        column: String,
        #[serde(default)]
        order: SortOrder,
    },
    Sql {
        sql_str: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Limit { .. } => "limit",
            Action::Slice { .. } => "slice",
            Action::Select { .. } => "select",
            Action::Filter { .. } => "filter",
            Action::Map { .. } => "map",
            Action::Sort { .. } => "sort",
            Action::Sql { .. } => "sql",
        }
    }

    /// False when the node holds client code a server cannot run.
    pub fn is_remote_safe(&self) -> bool {
        !matches!(
            self,
            Action::Map {
                function: MapFunction::Local(_),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn is_descending(&self) -> bool {
        matches!(self, SortOrder::Descending)
    }
}

impl std::str::FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ascending" | "asc" => Ok(SortOrder::Ascending),
            "descending" | "desc" => Ok(SortOrder::Descending),
            other => Err(Error::Validation(format!(
                "sort order must be 'ascending' or 'descending', got '{}'",
                other
            ))),
        }
    }
}

/// Function applied elementwise by a MAP node.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapFunction {
    /// Expression over `_` (the mapped value) and other columns, e.g. `_ * 2 + b`.
    Expression(String),
    /// In-process closure. Only runs on resident tables.
    #[serde(skip)]
    Local(LocalFn),
}

impl fmt::Debug for MapFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapFunction::Expression(e) => f.debug_tuple("Expression").field(e).finish(),
            MapFunction::Local(_) => f.write_str("Local(<fn>)"),
        }
    }
}

type ValueFn = dyn Fn(&Value) -> Value + Send + Sync;

#[derive(Clone)]
pub struct LocalFn(Arc<ValueFn>);

impl LocalFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, value: &Value) -> Value {
        (self.0)(value)
    }
}

impl PartialEq for LocalFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Fail on the first node that cannot leave this process.
pub fn ensure_remote_safe(actions: &[Action]) -> Result<()> {
    match actions.iter().position(|a| !a.is_remote_safe()) {
        Some(index) => Err(Error::UnsupportedRemoteAction {
            action_index: index,
            action: actions[index].name().to_string(),
        }),
        None => Ok(()),
    }
}

/// Decode an action log received as JSON. Unknown tags are validation errors.
pub fn decode_log(value: Value) -> Result<Vec<Action>> {
    serde_json::from_value(value)
        .map_err(|e| Error::Validation(format!("malformed action log: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let log = vec![
            Action::Limit { count: 10 },
            Action::Slice {
                offset: 2,
                length: None,
            },
            Action::Sort {
                column: "a".into(),
                order: SortOrder::Descending,
            },
        ];
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(
            value,
            json!([
                {"type": "limit", "params": {"rowNum": 10}},
                {"type": "slice", "params": {"offset": 2}},
                {"type": "sort", "params": {"column": "a", "order": "descending"}}
            ])
        );
        assert_eq!(decode_log(value).unwrap(), log);
    }

    #[test]
    fn test_map_expression_serializes() {
        let action = Action::Map {
            column: "a".into(),
            function: MapFunction::Expression("_ * 2".into()),
            new_column_name: Some("a2".into()),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["params"]["function"], json!({"expression": "_ * 2"}));
    }

    #[test]
    fn test_local_map_is_not_remote_safe() {
        let log = vec![
            Action::Limit { count: 1 },
            Action::Map {
                column: "a".into(),
                function: MapFunction::Local(LocalFn::new(|v| v.clone())),
                new_column_name: None,
            },
        ];
        match ensure_remote_safe(&log) {
            Err(Error::UnsupportedRemoteAction {
                action_index,
                action,
            }) => {
                assert_eq!(action_index, 1);
                assert_eq!(action, "map");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(serde_json::to_value(&log).is_err());
    }

    #[test]
    fn test_unknown_tag_is_validation_error() {
        let err = decode_log(json!([{"type": "explode", "params": {}}])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_sort_order_from_str() {
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Descending);
        assert!("sideways".parse::<SortOrder>().is_err());
    }
}
