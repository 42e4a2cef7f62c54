//! Web server implementation using Axum.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broadcast::ClientHub;
use crate::camera_registry::CameraRegistry;
use crate::config::Settings;
use crate::constants::{FALLBACK_DEVICE, SERVER_NAME, SERVER_VERSION, is_device_path};
use crate::models::CameraInfo;
use crate::monitor::CameraMonitor;
use crate::web_server::{api, middleware::no_cache_middleware, ws};
use crate::{OurError, OurResult};

/// Application state shared across handlers
pub struct AppState {
    pub settings: Settings,
    pub registry: Arc<CameraRegistry>,
    pub monitor: Arc<CameraMonitor>,
    pub hub: Arc<ClientHub>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        registry: Arc<CameraRegistry>,
        monitor: Arc<CameraMonitor>,
        hub: Arc<ClientHub>,
    ) -> Self {
        Self {
            settings,
            registry,
            monitor,
            hub,
            started_at: Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub async fn server_info(&self) -> Value {
        let clients = self.hub.stats().await;
        json!({
            "name": SERVER_NAME,
            "version": SERVER_VERSION,
            "started_at": self.started_at,
            "uptime_seconds": self.uptime_seconds(),
            "platform": {
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            },
            "connected_clients": clients.active_clients,
            "total_connections": clients.total_connections,
            "notifications_sent": clients.notifications_sent,
            "monitoring": self.monitor.is_running(),
        })
    }

    pub fn camera_list(&self) -> Value {
        let cameras = self.registry.all_devices();
        let connected = cameras.values().filter(|info| info.connected()).count();
        let payloads: serde_json::Map<String, Value> = cameras
            .iter()
            .map(|(device, info)| (device.clone(), info.status_payload()))
            .collect();
        json!({
            "cameras": payloads,
            "total": cameras.len(),
            "connected": connected,
            "timestamp": Utc::now(),
        })
    }

    /// Detailed payload for a known device, UNKNOWN for an unseen one.
    pub fn camera_status(&self, device: &str) -> OurResult<Value> {
        if !is_device_path(device) {
            return Err(OurError::InvalidDevice(device.to_string()));
        }
        match self.registry.get(device) {
            Some(info) => Ok(info.detailed_payload()),
            None => self
                .registry
                .status_payload(device)
                .ok_or_else(|| OurError::InvalidDevice(device.to_string())),
        }
    }

    /// Status payloads a newly connected client starts from. With nothing
    /// known yet this is the fallback device reported as disconnected.
    pub fn baseline_payloads(&self) -> Vec<Value> {
        let cameras = self.registry.all_devices();
        if !cameras.is_empty() {
            return cameras.values().map(CameraInfo::status_payload).collect();
        }
        match CameraInfo::new(FALLBACK_DEVICE) {
            Ok(mut info) => {
                info.mark_disconnected();
                vec![info.status_payload()]
            }
            Err(_) => Vec::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.settings.websocket_path, get(ws::websocket_handler))
        .route("/api/cameras", get(api::list_cameras))
        .route("/api/status", get(api::service_status))
        .layer(middleware::from_fn(no_cache_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> OurResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| OurError::Server(format!("Server error: {e}")))
}

/// Start the web server
pub async fn start_server(state: Arc<AppState>) -> OurResult<()> {
    let addr = state.settings.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| OurError::Server(format!("Failed to bind to {addr}: {e}")))?;

    info!(
        "Camera server listening on ws://{addr}{}",
        state.settings.websocket_path
    );

    serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    })
    .await
}
