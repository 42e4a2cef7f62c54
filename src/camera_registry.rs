//! Thread-safe store of known cameras and their recent events.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Value, json};
use tracing::{debug, error};

use crate::constants::{MAX_EVENT_HISTORY, is_device_path};
use crate::models::{CameraEvent, CameraEventKind, CameraInfo, CameraStatus};

#[derive(Debug, Default)]
struct RegistryState {
    cameras: HashMap<String, CameraInfo>,
    events: VecDeque<CameraEvent>,
}

impl RegistryState {
    fn record(&mut self, event: CameraEvent) {
        if self.events.len() >= MAX_EVENT_HISTORY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Every read hands back a copy; callers never hold the lock.
#[derive(Debug, Default)]
pub struct CameraRegistry {
    state: Mutex<RegistryState>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| {
            error!("Camera registry mutex poisoned: {e}");
            e.into_inner()
        })
    }

    /// Stores `camera`, recording a `status_change` event when it replaces an
    /// entry with a different status.
    pub fn upsert(&self, camera: CameraInfo) {
        let mut state = self.state();
        let previous = state
            .cameras
            .get(camera.device())
            .map(|existing| existing.status());

        if let Some(old_status) = previous.filter(|old| *old != camera.status()) {
            debug!(
                "Registry status change for {}: {old_status} -> {}",
                camera.device(),
                camera.status()
            );
            let event = CameraEvent::transition(&camera, CameraEventKind::StatusChange, old_status);
            state.record(event);
        }
        state.cameras.insert(camera.device().to_string(), camera);
    }

    /// Stores a reconciled camera together with the event describing how it
    /// got there.
    pub fn apply_transition(&self, event: CameraEvent, camera: CameraInfo) {
        let mut state = self.state();
        state.cameras.insert(camera.device().to_string(), camera);
        state.record(event);
    }

    pub fn get(&self, device: &str) -> Option<CameraInfo> {
        self.state().cameras.get(device).cloned()
    }

    /// Drops a device and records a `removed` event.
    ///
    /// Returns the entry that was removed, so `is_some()` answers whether the
    /// device was known. Unknown devices record nothing.
    pub fn remove(&self, device: &str) -> Option<CameraInfo> {
        let mut state = self.state();
        let removed = state.cameras.remove(device)?;
        let mut event = CameraEvent::new(device, CameraEventKind::Removed);
        event.old_status = Some(removed.status());
        state.record(event);
        Some(removed)
    }

    pub fn all_devices(&self) -> BTreeMap<String, CameraInfo> {
        self.state()
            .cameras
            .iter()
            .map(|(device, info)| (device.clone(), info.clone()))
            .collect()
    }

    pub fn connected_devices(&self) -> BTreeMap<String, CameraInfo> {
        self.state()
            .cameras
            .iter()
            .filter(|(_, info)| info.connected())
            .map(|(device, info)| (device.clone(), info.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().cameras.is_empty()
    }

    /// Count per status; every status is present, zero or not.
    pub fn counts_by_status(&self) -> BTreeMap<CameraStatus, usize> {
        let mut counts: BTreeMap<CameraStatus, usize> =
            CameraStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for info in self.state().cameras.values() {
            *counts.entry(info.status()).or_default() += 1;
        }
        counts
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<CameraEvent> {
        let state = self.state();
        let skip = state.events.len().saturating_sub(limit);
        state.events.iter().skip(skip).cloned().collect()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Status payload for `device`, or an UNKNOWN placeholder when it has
    /// never been seen. `None` when the path is not a device node.
    pub fn status_payload(&self, device: &str) -> Option<Value> {
        if !is_device_path(device) {
            return None;
        }
        Some(match self.get(device) {
            Some(info) => info.status_payload(),
            None => json!({
                "device": device,
                "status": CameraStatus::Unknown,
                "last_seen": Value::Null,
            }),
        })
    }
}
