//! Wire vocabulary shared by [`crate::client`] and [`crate::server`].
//!
//! Every request body is JSON. Flight `Action::r#type` carries one of the
//! action names below; `Ticket` and `FlightDescriptor::cmd` carry a
//! [`DataframeTicket`].

use crate::action::Action;
use crate::format::DisplayOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONNECT_SERVER: &str = "connect_server";
pub const CLOSE_CONNECTION: &str = "close_connection";
pub const GET_INSTRUMENT_INFO: &str = "get_instrument_info";
pub const GET_NETWORK_LINK_INFO: &str = "get_network_link_info";
pub const LIST_DATASETS: &str = "list_datasets";
pub const GET_DATASET: &str = "get_dataset";
pub const LIST_DATAFRAMES: &str = "list_dataframes";
pub const LIST_USER_AUTH_DATAFRAMES: &str = "list_user_auth_dataframes";
pub const CHECK_PERMISSION: &str = "check_permission";
pub const SAMPLE: &str = "sample";
pub const COUNT: &str = "count";
pub const OPEN: &str = "open";
pub const GET_DATAFRAME_STREAM: &str = "get_dataframe_stream";
pub const TO_STRING: &str = "to_string";
pub const COMPUTE_PREFIX: &str = "compute_";

/// Every action the server answers, with a one-line description for `list_actions`.
pub const ACTIONS: &[(&str, &str)] = &[
    (CONNECT_SERVER, "Verify a principal and create a session"),
    (CLOSE_CONNECTION, "Close a session and drop its open dataframes"),
    (GET_INSTRUMENT_INFO, "Describe the instrument behind this server"),
    (GET_NETWORK_LINK_INFO, "Describe the network link to this server"),
    (LIST_DATASETS, "List dataset identities, one page at a time"),
    (GET_DATASET, "Metadata of one dataset"),
    (LIST_DATAFRAMES, "List dataframes of a dataset, one result per page"),
    (LIST_USER_AUTH_DATAFRAMES, "List dataframes a user may read"),
    (CHECK_PERMISSION, "Whether a user may read a dataset"),
    (SAMPLE, "Preview of a dataframe with schema and total count"),
    (COUNT, "Row count of a dataframe"),
    (OPEN, "Parse a dataframe into the session"),
    (GET_DATAFRAME_STREAM, "Raw bytes of a dataframe file in chunks"),
    (TO_STRING, "Formatted view of an opened dataframe after its actions"),
    ("compute_sum", "Sum of a column after the dataframe's actions"),
    ("compute_mean", "Mean of a column after the dataframe's actions"),
    ("compute_min", "Minimum of a column after the dataframe's actions"),
    ("compute_max", "Maximum of a column after the dataframe's actions"),
];

/// Password-exchange flavour accepted by `Credentials::OAuth`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Password,
    Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "lowercase")]
pub enum Credentials {
    #[serde(rename = "oauth")]
    OAuth {
        username: String,
        password: String,
        #[serde(default, rename = "type")]
        auth_type: AuthType,
    },
    Controld {
        #[serde(rename = "controld_domain_name")]
        domain: String,
        signature: String,
    },
    Anonymous,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::OAuth {
            username: username.into(),
            password: password.into(),
            auth_type: AuthType::Password,
        }
    }

    pub fn signed_domain(domain: impl Into<String>, signature: impl Into<String>) -> Self {
        Credentials::Controld {
            domain: domain.into(),
            signature: signature.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "clientIp", default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "connectionID")]
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDatasetsRequest {
    #[serde(default)]
    pub token: Option<String>,
    pub page: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRequest {
    #[serde(default)]
    pub token: Option<String>,
    pub dataset_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDataframesRequest {
    #[serde(default)]
    pub token: Option<String>,
    pub dataset_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunksize: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub dataset_name: String,
    pub username: String,
}

/// Body of `sample`, `count` and `open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataframeRequest {
    pub connection_id: String,
    pub dataframe_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub connection_id: String,
    pub dataframe_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunksize: Option<usize>,
}

/// A remote handle as sent over the wire: identity, session and pending log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataframeRef {
    pub id: String,
    pub connection_id: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    CollectBlob,
}

/// `do_get` ticket and `get_flight_info` command.
///
/// At most one of `row_index`, `column_name` and `kind` is set; none means
/// the whole result in chunks of `max_chunksize` rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataframeTicket {
    pub dataframe: DataframeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunksize: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TicketKind>,
}

impl DataframeTicket {
    pub fn new(dataframe: DataframeRef) -> Self {
        Self {
            dataframe,
            max_chunksize: None,
            row_index: None,
            column_name: None,
            kind: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToStringRequest {
    pub dataframe: DataframeRef,
    #[serde(flatten)]
    pub options: DisplayOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub dataframe: DataframeRef,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeResponse {
    pub result: Value,
}

/// `sample` result. `sample_data` maps column name to values; column order
/// is given by `schema_names`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResponse {
    pub schema_names: Vec<String>,
    pub schema_types: Vec<String>,
    pub sample_data: serde_json::Map<String, Value>,
    pub total_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountResponse {
    pub total_count: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_request_shapes() {
        let req = ConnectRequest {
            client_ip: Some("10.1.1.1".into()),
            credentials: Credentials::OAuth {
                username: "ann".into(),
                password: "pw".into(),
                auth_type: AuthType::Password,
            },
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"clientIp": "10.1.1.1", "auth_type": "oauth", "username": "ann", "password": "pw", "type": "password"})
        );
        let anon: ConnectRequest = serde_json::from_value(json!({"auth_type": "anonymous"})).unwrap();
        assert_eq!(anon.credentials, Credentials::Anonymous);
    }

    #[test]
    fn test_ticket_omits_unset_fields() {
        let ticket = DataframeTicket::new(DataframeRef {
            id: "dacp://h:1/ds/a.csv".into(),
            connection_id: "c1".into(),
            actions: vec![Action::Limit { count: 3 }],
        });
        let value = serde_json::to_value(&ticket).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 1);
        let mut blob = ticket.clone();
        blob.kind = Some(TicketKind::CollectBlob);
        assert_eq!(serde_json::to_value(&blob).unwrap()["type"], "collect_blob");
    }

    #[test]
    fn test_to_string_request_flattens_options() {
        let value = json!({
            "dataframe": {"id": "x", "connection_id": "c"},
            "head_rows": 2
        });
        let req: ToStringRequest = serde_json::from_value(value).unwrap();
        assert_eq!(req.options.head_rows, 2);
        assert_eq!(req.options.tail_rows, 5);
        assert!(req.dataframe.actions.is_empty());
    }
}
