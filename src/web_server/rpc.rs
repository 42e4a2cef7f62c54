//! JSON-RPC 2.0 method dispatch for WebSocket clients.

use super::prelude::*;

use crate::constants::is_device_path;
use crate::protocol::{RpcError, RpcRequest, RpcResponse};
use crate::OurError;

/// Methods a client may call.
pub const SUPPORTED_METHODS: &[&str] = &[
    "ping",
    "echo",
    "get_server_info",
    "get_camera_list",
    "get_camera_status",
    "get_supported_methods",
    "get_monitor_stats",
    "get_recent_events",
    "refresh_capabilities",
];

const DEFAULT_EVENT_LIMIT: usize = 100;

/// Handles one text frame: a single request or a batch.
///
/// Returns the serialized reply, or `None` when nothing is owed (only
/// notifications were received).
pub async fn handle_text(state: &AppState, text: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Unparseable JSON-RPC message: {e}");
            let response = RpcResponse::failure(Value::Null, RpcError::parse_error(e));
            return Some(response.to_value().to_string());
        }
    };

    let reply = match value {
        Value::Array(batch) if batch.is_empty() => Some(
            RpcResponse::failure(Value::Null, RpcError::invalid_request("empty batch")).to_value(),
        ),
        Value::Array(batch) => {
            debug!("JSON-RPC batch of {} requests", batch.len());
            let mut responses = Vec::with_capacity(batch.len());
            for item in batch {
                if let Some(response) = handle_value(state, item).await {
                    responses.push(response);
                }
            }
            (!responses.is_empty()).then_some(Value::Array(responses))
        }
        single => handle_value(state, single).await,
    };

    reply.map(|value| value.to_string())
}

async fn handle_value(state: &AppState, value: Value) -> Option<Value> {
    let request = match RpcRequest::from_value(value) {
        Ok(request) => request,
        Err((id, error)) => {
            debug!("Invalid JSON-RPC request: {}", error.message);
            return Some(RpcResponse::failure(id, error).to_value());
        }
    };

    let outcome = dispatch(state, &request).await;
    if let Err(error) = &outcome {
        debug!("{} failed: {} ({})", request.method, error.message, error.code);
    }

    let id = request.id?;
    let response = match outcome {
        Ok(result) => RpcResponse::success(id, result),
        Err(error) => RpcResponse::failure(id, error),
    };
    Some(response.to_value())
}

/// Runs one validated request.
pub async fn dispatch(state: &AppState, request: &RpcRequest) -> Result<Value, RpcError> {
    debug!("JSON-RPC call: {}", request.method);
    match request.method.as_str() {
        "ping" => Ok(json!("pong")),
        "echo" => request
            .param("message", 0)
            .cloned()
            .ok_or_else(|| RpcError::invalid_params("missing 'message'")),
        "get_server_info" => Ok(state.server_info().await),
        "get_camera_list" => Ok(state.camera_list()),
        "get_camera_status" => {
            let device = device_param(request)?
                .ok_or_else(|| RpcError::invalid_params("missing 'device'"))?;
            Ok(state.camera_status(device)?)
        }
        "get_supported_methods" => Ok(json!(SUPPORTED_METHODS)),
        "get_monitor_stats" => {
            serde_json::to_value(state.monitor.stats()).map_err(RpcError::internal)
        }
        "get_recent_events" => {
            let limit = match request.param("limit", 0) {
                None | Some(Value::Null) => DEFAULT_EVENT_LIMIT,
                Some(value) => value
                    .as_u64()
                    .map(|limit| limit as usize)
                    .ok_or_else(|| RpcError::invalid_params("limit must be a non-negative integer"))?,
            };
            serde_json::to_value(state.registry.recent_events(limit)).map_err(RpcError::internal)
        }
        "refresh_capabilities" => {
            let device = device_param(request)?;
            state.monitor.refresh_capabilities(device);
            Ok(json!({ "refreshed": device.unwrap_or("all") }))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

/// Optional `device` parameter, validated as a device node path.
fn device_param(request: &RpcRequest) -> Result<Option<&str>, RpcError> {
    match request.param("device", 0) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(device)) if is_device_path(device) => Ok(Some(device)),
        Some(Value::String(device)) => Err(OurError::InvalidDevice(device.clone()).into()),
        Some(_) => Err(RpcError::invalid_params("device must be a string")),
    }
}
