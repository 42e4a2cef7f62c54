//! Turns device-presence snapshots into camera state transitions.
//!
//! Each device moves between ABSENT and PRESENT as far as enumeration is
//! concerned. Every edge between the two is exactly one event; staying in
//! the same place is never an event.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::constants::FALLBACK_DEVICE;
use crate::enumerator::{DeviceState, Snapshot};
use crate::models::{CameraCapabilities, CameraEvent, CameraEventKind, CameraInfo, CameraStatus};

/// A state change together with the camera state it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: CameraEvent,
    pub camera: CameraInfo,
}

impl Transition {
    fn new(kind: CameraEventKind, old_status: CameraStatus, camera: &CameraInfo) -> Self {
        Self {
            event: CameraEvent::transition(camera, kind, old_status),
            camera: camera.clone(),
        }
    }
}

/// Known-device map and the rules for updating it.
#[derive(Debug, Default)]
pub struct Reconciler {
    known: BTreeMap<String, CameraInfo>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(&self) -> BTreeMap<String, CameraInfo> {
        self.known.clone()
    }

    pub fn get(&self, device: &str) -> Option<CameraInfo> {
        self.known.get(device).cloned()
    }

    /// Startup pass: reports every present device whether or not it changed,
    /// plus the canonical fallback device when nothing is present.
    pub fn baseline(&mut self, snapshot: &Snapshot) -> Vec<Transition> {
        let mut transitions: Vec<Transition> = snapshot
            .devices
            .iter()
            .filter_map(|(device, capabilities)| self.connect(device, capabilities.clone(), true))
            .collect();
        transitions.extend(self.reconcile_missing(snapshot));

        if snapshot.devices.is_empty() {
            transitions.extend(self.fallback());
        }
        transitions
    }

    /// Steady-state pass: only devices whose state changed produce events.
    pub fn reconcile(&mut self, snapshot: &Snapshot) -> Vec<Transition> {
        let mut transitions: Vec<Transition> = snapshot
            .devices
            .iter()
            .filter_map(|(device, capabilities)| self.connect(device, capabilities.clone(), false))
            .collect();
        transitions.extend(self.reconcile_missing(snapshot));
        transitions
    }

    /// Single-device equivalent of [`Reconciler::reconcile`].
    pub fn apply_device(&mut self, device: &str, state: DeviceState) -> Option<Transition> {
        match state {
            DeviceState::Present(capabilities) => self.connect(device, capabilities, false),
            DeviceState::Absent => self.disconnect(device),
            DeviceState::Failed(message) => self.fail(device, &message),
        }
    }

    fn reconcile_missing(&mut self, snapshot: &Snapshot) -> Vec<Transition> {
        let missing: Vec<String> = self
            .known
            .keys()
            .filter(|device| !snapshot.devices.contains_key(*device))
            .cloned()
            .collect();

        missing
            .into_iter()
            .filter_map(|device| match snapshot.errors.get(&device) {
                Some(message) => self.fail(&device, message),
                None => self.disconnect(&device),
            })
            .collect()
    }

    fn connect(
        &mut self,
        device: &str,
        capabilities: Option<CameraCapabilities>,
        report_unchanged: bool,
    ) -> Option<Transition> {
        if let Some(info) = self.known.get_mut(device) {
            if info.connected() {
                info.touch();
                return report_unchanged
                    .then(|| Transition::new(CameraEventKind::Connected, CameraStatus::Connected, &*info));
            }
        }

        let (mut info, previous) = match self.known.remove(device) {
            Some(info) => {
                let status = info.status();
                (info, status)
            }
            None => match CameraInfo::new(device) {
                Ok(info) => (info, CameraStatus::Unknown),
                Err(e) => {
                    warn!("Ignoring enumerated device: {e}");
                    return None;
                }
            },
        };

        info.mark_connected(capabilities);
        debug!("{device}: {previous} -> {}", info.status());
        let transition = Transition::new(CameraEventKind::Connected, previous, &info);
        self.known.insert(device.to_string(), info);
        Some(transition)
    }

    fn disconnect(&mut self, device: &str) -> Option<Transition> {
        let info = self.known.get_mut(device)?;
        let previous = info.status();
        if !matches!(previous, CameraStatus::Connected | CameraStatus::Error) {
            return None;
        }
        info.mark_disconnected();
        debug!("{device}: {previous} -> {}", info.status());
        Some(Transition::new(CameraEventKind::Disconnected, previous, info))
    }

    fn fail(&mut self, device: &str, message: &str) -> Option<Transition> {
        let info = self.known.get_mut(device)?;
        if !info.connected() {
            return None;
        }
        info.mark_error(message);
        debug!("{device}: CONNECTED -> ERROR ({message})");
        Some(Transition::new(CameraEventKind::StatusChange, CameraStatus::Connected, info))
    }

    /// Synthetic "no camera present" signal.
    fn fallback(&mut self) -> Option<Transition> {
        let mut info = match self.known.remove(FALLBACK_DEVICE) {
            Some(info) => info,
            None => CameraInfo::new(FALLBACK_DEVICE).ok()?,
        };
        let previous = info.status();
        info.mark_disconnected();
        let transition = Transition::new(CameraEventKind::Disconnected, previous, &info);
        self.known.insert(FALLBACK_DEVICE.to_string(), info);
        Some(transition)
    }
}
