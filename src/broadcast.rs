//! Fan-out of JSON-RPC notifications to connected WebSocket clients.
//!
//! Each client owns an unbounded outbound queue drained by its writer task,
//! so a broadcast never waits on a socket. A closed queue means the client is
//! gone; it is dropped from the hub and the rest are unaffected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::EventSink;
use crate::constants::NOTIFY_CAMERA_STATUS;
use crate::protocol::notification;

struct ClientConnection {
    addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<String>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub id: Uuid,
    pub addr: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub active_clients: usize,
    pub total_connections: u64,
    pub notifications_sent: u64,
    pub failed_sends: u64,
}

#[derive(Default)]
pub struct ClientHub {
    clients: RwLock<HashMap<Uuid, ClientConnection>>,
    total_connections: AtomicU64,
    notifications_sent: AtomicU64,
    failed_sends: AtomicU64,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client and hand back its outbound queue.
    pub async fn register(&self, addr: Option<SocketAddr>) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.clients.write().await.insert(
            id,
            ClientConnection {
                addr,
                connected_at: Utc::now(),
                tx,
            },
        );
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        let peer = addr.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());
        info!("Client {id} connected from {peer}");
        (id, rx)
    }

    pub async fn unregister(&self, id: &Uuid) -> bool {
        let removed = self.clients.write().await.remove(id).is_some();
        if removed {
            info!("Client {id} disconnected");
        }
        removed
    }

    /// Sends `message` to every client registered at call time.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let targets: Vec<(Uuid, mpsc::UnboundedSender<String>)> = {
            let clients = self.clients.read().await;
            clients.iter().map(|(id, c)| (*id, c.tx.clone())).collect()
        };

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.send(message.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    warn!("Failed to send to client {id}, dropping it");
                    report.failed += 1;
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in &dead {
                clients.remove(id);
            }
        }

        self.notifications_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.failed_sends
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Wraps `params` in a notification and broadcasts it. Nothing is
    /// serialized when nobody is listening.
    pub async fn broadcast_notification(&self, method: &str, params: Value) -> BroadcastReport {
        if self.clients.read().await.is_empty() {
            debug!("No clients connected, skipping {method}");
            return BroadcastReport::default();
        }
        self.broadcast(&notification(method, params)).await
    }

    /// Queues a message for one client.
    pub async fn send_to(&self, id: &Uuid, message: String) -> bool {
        let tx = match self.clients.read().await.get(id) {
            Some(client) => client.tx.clone(),
            None => return false,
        };
        if tx.send(message).is_err() {
            warn!("Client {id} queue closed");
            self.unregister(id).await;
            return false;
        }
        true
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn clients(&self) -> Vec<ClientSummary> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(id, c)| ClientSummary {
                id: *id,
                addr: c.addr.map(|a| a.to_string()),
                connected_at: c.connected_at,
            })
            .collect()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            active_clients: self.client_count().await,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for Arc<ClientHub> {
    async fn handle(&self, payload: Value) {
        let device = payload["device"].as_str().unwrap_or("unknown").to_string();
        let report = self.broadcast_notification(NOTIFY_CAMERA_STATUS, payload).await;
        debug!(
            "Camera update for {device} sent to {} clients ({} failed)",
            report.delivered, report.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_failing_client_does_not_stop_others() {
        let hub = ClientHub::new();
        let (_, mut first) = hub.register(None).await;
        let (_, second) = hub.register(None).await;
        let (_, mut third) = hub.register(None).await;
        drop(second);

        let report = hub.broadcast("hello").await;
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        assert_eq!(first.recv().await.as_deref(), Some("hello"));
        assert_eq!(third.recv().await.as_deref(), Some("hello"));

        // the dead client was removed
        assert_eq!(hub.client_count().await, 2);
        let stats = hub.stats().await;
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.failed_sends, 1);
    }

    #[tokio::test]
    async fn test_notification_without_clients_is_noop() {
        let hub = ClientHub::new();
        let report = hub
            .broadcast_notification(NOTIFY_CAMERA_STATUS, json!({"device": "/dev/video0"}))
            .await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_sink_wraps_camera_update() {
        let hub = Arc::new(ClientHub::new());
        let (_, mut rx) = hub.register(None).await;

        hub.handle(json!({"device": "/dev/video0", "status": "CONNECTED"})).await;

        let text = rx.recv().await.expect("notification");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], NOTIFY_CAMERA_STATUS);
        assert_eq!(value["params"]["status"], "CONNECTED");
    }

    #[tokio::test]
    async fn test_send_to_and_unregister() {
        let hub = ClientHub::new();
        let (id, mut rx) = hub.register(None).await;
        assert!(hub.send_to(&id, "direct".to_string()).await);
        assert_eq!(rx.recv().await.as_deref(), Some("direct"));

        assert!(hub.unregister(&id).await);
        assert!(!hub.unregister(&id).await);
        assert!(!hub.send_to(&id, "late".to_string()).await);
        assert!(hub.clients().await.is_empty());
    }
}
