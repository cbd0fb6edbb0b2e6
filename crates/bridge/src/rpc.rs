//! JSON-RPC 2.0 framing and the MCP method surface.
//!
//! Messages are classified into the four JSON-RPC shapes. Parsing is
//! presence-based so a `"result": null` response survives the round trip, and
//! tolerant of unknown fields; it rejects frames that lack `jsonrpc` or carry
//! both `result` and `error`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revisions this proxy will negotiate with a backend.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// First code of the server-defined range (-32000..-32099).
pub const SERVER_ERROR: i64 = -32000;

/// MCP method names the bridge recognizes. Everything else is pass-through.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCE_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";

    pub const NOTIFY_TOOLS_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFY_RESOURCES_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFY_RESOURCE_UPDATED: &str = "notifications/resources/updated";
    pub const NOTIFY_PROMPTS_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFY_MESSAGE: &str = "notifications/message";
    pub const NOTIFY_PROGRESS: &str = "notifications/progress";
    pub const NOTIFY_CANCELLED: &str = "notifications/cancelled";
}

/// A request id: string or integer, unique per originator per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: RequestId,
    pub error: RpcError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// One JSON-RPC frame in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
    Notification(Notification),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Message::Response(Response { id, result })
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Message::Error(ErrorResponse { id, error })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// Classify a decoded JSON value into one of the four shapes.
    pub fn from_value(value: Value) -> std::result::Result<Self, String> {
        let Value::Object(obj) = value else {
            return Err("message is not a JSON object".to_string());
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => return Err(format!("unsupported jsonrpc version '{other}'")),
            None => return Err("missing jsonrpc field".to_string()),
        }

        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");
        if has_result && has_error {
            return Err("message carries both result and error".to_string());
        }

        let id: Option<RequestId> = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                serde_json::from_value(v.clone())
                    .map_err(|_| "id must be a string or integer".to_string())?,
            ),
        };

        let method = obj.get("method").and_then(Value::as_str).map(str::to_string);
        let params = obj.get("params").cloned();

        match (id, method, has_result, has_error) {
            (Some(id), Some(method), false, false) => {
                Ok(Message::Request(Request { id, method, params }))
            }
            (None, Some(method), false, false) => {
                Ok(Message::Notification(Notification { method, params }))
            }
            (Some(id), None, true, false) => Ok(Message::Response(Response {
                id,
                result: obj.get("result").cloned().unwrap_or(Value::Null),
            })),
            (Some(id), None, false, true) => {
                let error: RpcError = serde_json::from_value(
                    obj.get("error").cloned().unwrap_or(Value::Null),
                )
                .map_err(|e| format!("malformed error object: {e}"))?;
                Ok(Message::Error(ErrorResponse { id, error }))
            }
            _ => Err("message is not a valid request, response, or notification".to_string()),
        }
    }

    pub fn from_str(text: &str) -> std::result::Result<Self, String> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
        match self {
            Message::Request(r) => {
                obj.insert("id".to_string(), json!(r.id));
                obj.insert("method".to_string(), json!(r.method));
                if let Some(params) = &r.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Message::Response(r) => {
                obj.insert("id".to_string(), json!(r.id));
                obj.insert("result".to_string(), r.result.clone());
            }
            Message::Error(e) => {
                obj.insert("id".to_string(), json!(e.id));
                obj.insert("error".to_string(), json!(e.error));
            }
            Message::Notification(n) => {
                obj.insert("method".to_string(), json!(n.method));
                if let Some(params) = &n.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_all_four_shapes() {
        let req = Message::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(matches!(req, Message::Request(_)));

        let resp = Message::from_str(r#"{"jsonrpc":"2.0","id":"a","result":{"ok":true}}"#).unwrap();
        assert!(matches!(resp, Message::Response(_)));

        let err = Message::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        let Message::Error(e) = err else { panic!() };
        assert_eq!(e.error.code, METHOD_NOT_FOUND);

        let note =
            Message::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(note, Message::Notification(_)));
    }

    #[test]
    fn rejects_missing_jsonrpc() {
        assert!(Message::from_str(r#"{"id":1,"method":"ping"}"#).is_err());
    }

    #[test]
    fn rejects_result_and_error_together() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#;
        assert!(Message::from_str(text).is_err());
    }

    #[test]
    fn tolerates_unknown_fields() {
        let msg = Message::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping","x-vendor":{"trace":"t"}}"#,
        )
        .unwrap();
        assert_eq!(msg.method(), Some("ping"));
    }

    #[test]
    fn null_result_round_trips() {
        let msg = Message::from_str(r#"{"jsonrpc":"2.0","id":7,"result":null}"#).unwrap();
        let Message::Response(resp) = &msg else { panic!() };
        assert_eq!(resp.result, Value::Null);
        let back = Message::from_value(msg.to_value()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn round_trip_preserves_shape() {
        let original = Message::request(
            42,
            "tools/call",
            Some(serde_json::json!({"name":"echo","arguments":{"x":"hi"}})),
        );
        let text = original.to_json();
        let parsed = Message::from_str(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn string_and_number_ids_are_distinct() {
        let a = Message::from_str(r#"{"jsonrpc":"2.0","id":"1","result":1}"#).unwrap();
        let b = Message::from_str(r#"{"jsonrpc":"2.0","id":1,"result":1}"#).unwrap();
        let (Message::Response(a), Message::Response(b)) = (a, b) else {
            panic!()
        };
        assert_ne!(a.id, b.id);
    }
}
