//! Hands camera events from the monitor thread to the async runtime.
//!
//! The monitor thread calls [`EventBridge::deliver`], which never blocks. A
//! single task on the runtime drains the queue and awaits the sink for each
//! payload in turn, so payloads are handled in the order they were handed
//! off and nothing is lost while the runtime is busy.

use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Async consumer of camera status payloads.
pub trait EventSink: Send + Sync + 'static {
    fn handle(&self, payload: Value) -> impl Future<Output = ()> + Send;
}

/// Sending half, owned by the monitor.
#[derive(Debug, Clone)]
pub struct EventBridge {
    tx: mpsc::UnboundedSender<Value>,
}

/// Receiving half, driven on the runtime.
#[derive(Debug)]
pub struct BridgeReceiver {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventBridge {
    pub fn channel() -> (EventBridge, BridgeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBridge { tx }, BridgeReceiver { rx })
    }

    /// Queues `payload` for the runtime. Safe from any thread.
    ///
    /// Returns false when the receiving side has shut down.
    pub fn deliver(&self, payload: Value) -> bool {
        match self.tx.send(payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("Event bridge closed, dropping camera event for {}", e.0["device"]);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl BridgeReceiver {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Feeds every payload to `sink` until all senders are gone.
    pub async fn run<S: EventSink>(mut self, sink: S) {
        while let Some(payload) = self.rx.recv().await {
            sink.handle(payload).await;
        }
        debug!("Event bridge drained, all senders dropped");
    }

    pub fn spawn<S: EventSink>(self, sink: S) -> JoinHandle<()> {
        tokio::spawn(self.run(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    impl EventSink for Recorder {
        async fn handle(&self, payload: Value) {
            // yield so a slow sink interleaves with the sender
            tokio::task::yield_now().await;
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(payload);
            }
        }
    }

    #[tokio::test]
    async fn test_order_preserved_across_threads() {
        let (bridge, receiver) = EventBridge::channel();
        let recorder = Recorder::default();
        let task = receiver.spawn(recorder.clone());

        let producer = thread::spawn(move || {
            for n in 0..50 {
                assert!(bridge.deliver(json!({"device": format!("/dev/video{}", n % 3), "n": n})));
            }
        });
        producer.join().expect("producer thread");

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("bridge drains")
            .expect("task ok");

        let seen = recorder.seen.lock().expect("lock");
        let order: Vec<i64> = seen.iter().filter_map(|v| v["n"].as_i64()).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_deliver_after_receiver_dropped() {
        let (bridge, receiver) = EventBridge::channel();
        drop(receiver);
        assert!(bridge.is_closed());
        assert!(!bridge.deliver(json!({"device": "/dev/video0"})));
    }

    #[tokio::test]
    async fn test_delivered_before_consumer_starts() {
        let (bridge, mut receiver) = EventBridge::channel();
        assert!(bridge.deliver(json!({"device": "/dev/video1"})));
        let payload = receiver.recv().await.expect("queued payload");
        assert_eq!(payload["device"], "/dev/video1");
    }
}
