//! Integration tests: the real axum server with a scripted device enumerator

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use camwatch::OurResult;
use camwatch::bridge::EventBridge;
use camwatch::broadcast::ClientHub;
use camwatch::camera_registry::CameraRegistry;
use camwatch::config::{MonitorConfig, Settings};
use camwatch::enumerator::{DeviceEnumerator, DeviceState, Snapshot};
use camwatch::models::{CameraCapabilities, CameraStatus};
use camwatch::monitor::{CameraMonitor, create_monitor};
use camwatch::server::{self, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Enumerator whose device set the test changes at will
#[derive(Default)]
struct FakeDevices {
    present: Mutex<Vec<String>>,
}

impl FakeDevices {
    fn set(&self, devices: &[&str]) {
        *self.present.lock().expect("lock") = devices.iter().map(|d| d.to_string()).collect();
    }
}

fn caps() -> CameraCapabilities {
    CameraCapabilities::new("1920x1080", 30, ["MJPG", "YUYV"])
}

impl DeviceEnumerator for FakeDevices {
    fn enumerate(&self) -> OurResult<Snapshot> {
        let mut snapshot = Snapshot::default();
        for device in self.present.lock().expect("lock").iter() {
            snapshot.devices.insert(device.clone(), Some(caps()));
        }
        Ok(snapshot)
    }

    fn inspect(&self, device: &str) -> OurResult<DeviceState> {
        let present = self.present.lock().expect("lock").iter().any(|d| d == device);
        Ok(if present {
            DeviceState::Present(Some(caps()))
        } else {
            DeviceState::Absent
        })
    }
}

struct TestServer {
    addr: SocketAddr,
    devices: Arc<FakeDevices>,
    state: Arc<AppState>,
    monitor: Arc<CameraMonitor>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(initial: &[&str]) -> Self {
        let devices = Arc::new(FakeDevices::default());
        devices.set(initial);

        let settings = Settings {
            host: "127.0.0.1".to_string(),
            monitor: MonitorConfig {
                poll_interval: Duration::from_millis(20),
                settle_delay: Duration::ZERO,
                error_backoff: Duration::from_millis(20),
                use_event_driven: false,
                ..MonitorConfig::default()
            },
            ..Settings::default()
        };

        let registry = Arc::new(CameraRegistry::new());
        let hub = Arc::new(ClientHub::new());
        let (bridge, receiver) = EventBridge::channel();
        let monitor = Arc::new(create_monitor(
            settings.monitor.clone(),
            devices.clone(),
            registry.clone(),
            bridge,
            None,
        ));
        receiver.spawn(hub.clone());
        monitor.start().expect("monitor starts");

        let state = Arc::new(AppState::new(settings, registry, monitor.clone(), hub));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel();
        let serve_state = state.clone();
        tokio::spawn(async move {
            server::serve(listener, serve_state, async {
                let _ = rx.await;
            })
            .await
            .expect("server runs");
        });

        Self {
            addr,
            devices,
            state,
            monitor,
            shutdown: Some(tx),
        }
    }

    async fn wait_for_status(&self, device: &str, status: CameraStatus) {
        let registry = self.state.registry.clone();
        timeout(Duration::from_secs(5), async {
            while registry.get(device).map(|info| info.status()) != Some(status) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry reaches expected status");
        // let the bridge flush the matching broadcast before clients connect
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn connect(&self) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .expect("websocket connects");
        client
    }

    fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.monitor.stop();
    }
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("message before timeout")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("server sends JSON");
        }
    }
}

/// Next frame that is a response rather than a notification.
async fn next_response(client: &mut Client) -> Value {
    loop {
        let value = next_json(client).await;
        if value.is_array() || value.get("method").is_none() {
            return value;
        }
    }
}

/// Waits for the status update that moves `device` to `status`.
async fn next_update(client: &mut Client, device: &str, status: &str) -> Value {
    loop {
        let value = next_json(client).await;
        if value["method"] == "camera_status_update"
            && value["params"]["device"] == device
            && value["params"]["status"] == status
        {
            return value;
        }
    }
}

async fn send(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string().into()))
        .await
        .expect("send frame");
}

#[tokio::test]
async fn test_client_gets_welcome_and_baseline() {
    let server = TestServer::start(&["/dev/video0"]).await;
    server.wait_for_status("/dev/video0", CameraStatus::Connected).await;

    let mut client = server.connect().await;

    let welcome = next_json(&mut client).await;
    assert_eq!(welcome["jsonrpc"], "2.0");
    assert_eq!(welcome["method"], "server_welcome");
    assert!(welcome.get("id").is_none());
    let methods = welcome["params"]["available_methods"]
        .as_array()
        .expect("method list");
    assert!(methods.contains(&json!("get_camera_status")));

    let baseline = next_json(&mut client).await;
    assert_eq!(baseline["method"], "camera_status_update");
    assert_eq!(baseline["params"]["device"], "/dev/video0");
    assert_eq!(baseline["params"]["status"], "CONNECTED");
    assert_eq!(baseline["params"]["resolution"], "1920x1080");

    server.stop();
}

#[tokio::test]
async fn test_empty_system_reports_fallback_device() {
    let server = TestServer::start(&[]).await;
    server
        .wait_for_status("/dev/video0", CameraStatus::Disconnected)
        .await;

    let mut client = server.connect().await;
    let _welcome = next_json(&mut client).await;
    let baseline = next_json(&mut client).await;
    assert_eq!(baseline["params"]["device"], "/dev/video0");
    assert_eq!(baseline["params"]["status"], "DISCONNECTED");

    server.stop();
}

#[tokio::test]
async fn test_hotplug_changes_are_broadcast() {
    let server = TestServer::start(&["/dev/video0"]).await;
    server.wait_for_status("/dev/video0", CameraStatus::Connected).await;

    let mut first = server.connect().await;
    let mut second = server.connect().await;
    for client in [&mut first, &mut second] {
        let _welcome = next_json(client).await;
        let _baseline = next_json(client).await;
    }

    server.devices.set(&[]);
    for client in [&mut first, &mut second] {
        let update = next_update(client, "/dev/video0", "DISCONNECTED").await;
        assert!(update["params"]["disconnected_at"].is_string());
    }

    server.devices.set(&["/dev/video2"]);
    let update = next_update(&mut first, "/dev/video2", "CONNECTED").await;
    assert_eq!(update["params"]["fps"], 30);
    assert_eq!(update["params"]["formats"], json!(["MJPG", "YUYV"]));

    server.stop();
}

#[tokio::test]
async fn test_rpc_requests() {
    let server = TestServer::start(&["/dev/video0"]).await;
    server.wait_for_status("/dev/video0", CameraStatus::Connected).await;

    let mut client = server.connect().await;
    let _welcome = next_json(&mut client).await;
    let _baseline = next_json(&mut client).await;

    send(&mut client, r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).await;
    let pong = next_response(&mut client).await;
    assert_eq!(pong, json!({"jsonrpc": "2.0", "result": "pong", "id": 1}));

    send(
        &mut client,
        r#"{"jsonrpc":"2.0","method":"echo","params":{"message":"hello"},"id":"abc"}"#,
    )
    .await;
    let echo = next_response(&mut client).await;
    assert_eq!(echo["result"], "hello");
    assert_eq!(echo["id"], "abc");

    send(
        &mut client,
        r#"{"jsonrpc":"2.0","method":"get_camera_status","params":["/dev/video0"],"id":2}"#,
    )
    .await;
    let status = next_response(&mut client).await;
    assert_eq!(status["result"]["status"], "CONNECTED");
    assert_eq!(status["result"]["capabilities"]["formats"], json!(["MJPG", "YUYV"]));

    send(
        &mut client,
        r#"{"jsonrpc":"2.0","method":"get_camera_status","params":{"device":"/dev/video7"},"id":3}"#,
    )
    .await;
    let unknown = next_response(&mut client).await;
    assert_eq!(unknown["result"]["status"], "UNKNOWN");

    send(
        &mut client,
        r#"{"jsonrpc":"2.0","method":"get_camera_status","params":{"device":"/dev/sda"},"id":4}"#,
    )
    .await;
    let invalid = next_response(&mut client).await;
    assert_eq!(invalid["error"]["code"], -32602);

    send(&mut client, r#"{"jsonrpc":"2.0","method":"get_monitor_stats","id":5}"#).await;
    let stats = next_response(&mut client).await;
    assert_eq!(stats["result"]["strategy"], "polling");
    assert_eq!(stats["result"]["connected_cameras"], 1);

    send(&mut client, r#"{"jsonrpc":"2.0","method":"get_recent_events","params":{"limit":1},"id":6}"#)
        .await;
    let events = next_response(&mut client).await;
    let events = events["result"].as_array().expect("event list");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "connected");

    send(&mut client, r#"{"jsonrpc":"2.0","method":"no_such_method","id":7}"#).await;
    let missing = next_response(&mut client).await;
    assert_eq!(missing["error"]["code"], -32601);

    server.stop();
}

#[tokio::test]
async fn test_batches_notifications_and_parse_errors() {
    let server = TestServer::start(&["/dev/video0"]).await;
    server.wait_for_status("/dev/video0", CameraStatus::Connected).await;

    let mut client = server.connect().await;
    let _welcome = next_json(&mut client).await;
    let _baseline = next_json(&mut client).await;

    // notifications get no reply, so the next frame answers the ping
    send(&mut client, r#"{"jsonrpc":"2.0","method":"refresh_capabilities"}"#).await;
    send(&mut client, r#"{"jsonrpc":"2.0","method":"ping","id":10}"#).await;
    assert_eq!(next_response(&mut client).await["id"], 10);

    send(
        &mut client,
        r#"[
            {"jsonrpc":"2.0","method":"ping","id":11},
            {"jsonrpc":"2.0","method":"echo","params":["ignored"]},
            {"jsonrpc":"2.0","method":"nope","id":12},
            {"jsonrpc":"1.0","method":"ping","id":13}
        ]"#,
    )
    .await;
    let batch = next_response(&mut client).await;
    let batch = batch.as_array().expect("batch response");
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0]["result"], "pong");
    assert_eq!(batch[1]["error"]["code"], -32601);
    assert_eq!(batch[2]["error"]["code"], -32600);
    assert_eq!(batch[2]["id"], 13);

    send(&mut client, "[]").await;
    let empty = next_response(&mut client).await;
    assert_eq!(empty["error"]["code"], -32600);

    send(&mut client, "{not json").await;
    let parse_error = next_response(&mut client).await;
    assert_eq!(parse_error["error"]["code"], -32700);
    assert_eq!(parse_error["id"], Value::Null);

    server.stop();
}

#[tokio::test]
async fn test_http_api() {
    let server = TestServer::start(&["/dev/video0"]).await;
    server.wait_for_status("/dev/video0", CameraStatus::Connected).await;

    let mut client = server.connect().await;
    next_json(&mut client).await;

    let app = server::router(server.state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/cameras")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("cache-control"));
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let cameras: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(cameras["success"], true);
    assert_eq!(cameras["data"]["total"], 1);
    assert_eq!(cameras["data"]["connected"], 1);
    assert_eq!(cameras["data"]["cameras"]["/dev/video0"]["status"], "CONNECTED");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let status: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(status["success"], true);
    assert_eq!(status["data"]["monitor"]["strategy"], "polling");
    assert_eq!(status["data"]["cameras_by_status"]["CONNECTED"], 1);
    assert_eq!(status["data"]["server"]["monitoring"], true);
    let listed = status["data"]["client_list"]
        .as_array()
        .expect("client list");
    assert_eq!(listed.len(), 1);
    assert!(listed[0]["addr"].as_str().is_some_and(|addr| addr.starts_with("127.0.0.1")));

    server.stop();
}
