use super::prelude::*;

pub(crate) async fn list_cameras(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Value>> {
    Json(ApiResponse::success(state.camera_list()))
}

pub(crate) async fn service_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Value>> {
    let monitor = match serde_json::to_value(state.monitor.stats()) {
        Ok(stats) => stats,
        Err(e) => {
            error!("Failed to serialize monitor stats: {e}");
            return Json(ApiResponse::error(format!(
                "Failed to serialize monitor stats: {e}"
            )));
        }
    };

    let counts: serde_json::Map<String, Value> = state
        .registry
        .counts_by_status()
        .into_iter()
        .map(|(status, count)| (status.to_string(), json!(count)))
        .collect();

    Json(ApiResponse::success(json!({
        "server": state.server_info().await,
        "monitor": monitor,
        "clients": state.hub.stats().await,
        "client_list": state.hub.clients().await,
        "cameras_by_status": counts,
    })))
}
