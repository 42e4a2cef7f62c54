//! Wire types: JSON-RPC 2.0 envelopes and the HTTP API envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::OurError;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(Self::PARSE_ERROR, "Parse error").with_data(json!(detail.to_string()))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, "Invalid Request").with_data(json!(detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found").with_data(json!(method))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, "Invalid params").with_data(json!(detail.into()))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(Self::INTERNAL_ERROR, "Internal error").with_data(json!(detail.to_string()))
    }
}

impl From<OurError> for RpcError {
    fn from(err: OurError) -> Self {
        match err {
            OurError::InvalidDevice(device) => {
                Self::invalid_params(format!("invalid device path: {device}"))
            }
            other => Self::internal(other),
        }
    }
}

/// A validated request. `id == None` marks a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

impl RpcRequest {
    /// Validates one request object. On failure the error is paired with
    /// whatever id could be recovered so the response can still be addressed.
    pub fn from_value(value: Value) -> Result<Self, (Value, RpcError)> {
        let Value::Object(mut object) = value else {
            return Err((Value::Null, RpcError::invalid_request("request must be an object")));
        };

        let id = object.remove("id");
        let reply_id = id.clone().unwrap_or(Value::Null);

        if !matches!(&id, None | Some(Value::Null | Value::String(_) | Value::Number(_))) {
            return Err((Value::Null, RpcError::invalid_request("id must be a string, number or null")));
        }
        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err((reply_id, RpcError::invalid_request("jsonrpc must be \"2.0\"")));
        }
        let method = match object.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err((reply_id, RpcError::invalid_request("method must be a string"))),
        };
        let params = object.remove("params");
        if !matches!(&params, None | Some(Value::Object(_) | Value::Array(_))) {
            return Err((reply_id, RpcError::invalid_request("params must be an object or array")));
        }

        Ok(Self { method, params, id })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Looks up a parameter by name, or by position for array params.
    pub fn param(&self, name: &str, position: usize) -> Option<&Value> {
        match &self.params {
            Some(Value::Object(map)) => map.get(name),
            Some(Value::Array(items)) => items.get(position),
            _ => None,
        }
    }
}

/// JSON-RPC response object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".into(), json!(self.jsonrpc));
        if let Some(result) = &self.result {
            object.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            object.insert("error".into(), json!(error));
        }
        object.insert("id".into(), self.id.clone());
        Value::Object(object)
    }
}

/// Serialized server-initiated notification.
pub fn notification(method: &str, params: Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Generic API response
#[derive(Debug, Serialize)]
pub(crate) struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub(crate) fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: "Success".to_string(),
        }
    }

    pub(crate) fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message,
        }
    }
}
