//! Device enumeration over the `/dev/videoN` namespace.

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::DeviceRange;
use crate::constants::is_device_path;
use crate::detector::CapabilityDetector;
use crate::models::CameraCapabilities;
use crate::{OurError, OurResult};

/// OS-facing checks for a single device node.
pub trait DeviceProbe: Send + Sync {
    /// Node exists and we may read it.
    fn node_accessible(&self, device: &str) -> bool;

    /// Device answers a liveness query.
    fn responds(&self, device: &str) -> bool;

    /// Full capability detection. `Ok(None)` means the device gave us
    /// nothing usable; `Err` is a failure of the detection itself.
    fn capabilities(&self, device: &str) -> OurResult<Option<CameraCapabilities>>;

    /// Drops cached detection results, for one device or all of them.
    fn invalidate(&self, _device: Option<&str>) {}
}

/// [`DeviceProbe`] backed by the filesystem and `v4l2-ctl`.
#[derive(Debug, Clone)]
pub struct V4l2Probe {
    detector: Arc<CapabilityDetector>,
}

impl V4l2Probe {
    pub fn new(detector: Arc<CapabilityDetector>) -> Self {
        Self { detector }
    }
}

impl DeviceProbe for V4l2Probe {
    fn node_accessible(&self, device: &str) -> bool {
        match File::open(device) {
            Ok(_) => true,
            Err(e) => {
                debug!("{device} not accessible: {e}");
                false
            }
        }
    }

    fn responds(&self, device: &str) -> bool {
        self.detector.probe(device)
    }

    /// Every detection strategy coming up empty is an error here: the
    /// device already passed the liveness check, so it stopped answering.
    fn capabilities(&self, device: &str) -> OurResult<Option<CameraCapabilities>> {
        match self.detector.detect(device) {
            Some(capabilities) => Ok(Some(capabilities)),
            None => Err(OurError::Detection(format!(
                "no capabilities detected for {device}"
            ))),
        }
    }

    fn invalidate(&self, device: Option<&str>) {
        match device {
            Some(device) => self.detector.invalidate(device),
            None => self.detector.clear_cache(),
        }
    }
}

/// Devices present in one enumeration pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Present devices, with capabilities when detection ran and succeeded
    pub devices: BTreeMap<String, Option<CameraCapabilities>>,
    /// Devices that were present but failed detection, with the reason
    pub errors: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn failures(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// What a single-device inspection found.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceState {
    Absent,
    Present(Option<CameraCapabilities>),
    Failed(String),
}

/// Produces device-presence snapshots for the monitor.
pub trait DeviceEnumerator: Send + Sync {
    /// Scans the whole configured range. Per-device failures are recorded in
    /// the snapshot; `Err` means the scan itself failed.
    fn enumerate(&self) -> OurResult<Snapshot>;

    /// Looks at exactly one device.
    fn inspect(&self, device: &str) -> OurResult<DeviceState>;

    fn invalidate(&self, _device: Option<&str>) {}
}

/// Walks a [`DeviceRange`], keeping devices that exist and respond.
pub struct ScanningEnumerator<P> {
    probe: P,
    range: DeviceRange,
    detect_capabilities: bool,
}

impl<P: DeviceProbe> ScanningEnumerator<P> {
    pub fn new(probe: P, range: DeviceRange, detect_capabilities: bool) -> Self {
        Self {
            probe,
            range,
            detect_capabilities,
        }
    }

    fn is_live(&self, device: &str) -> bool {
        if !self.probe.node_accessible(device) {
            return false;
        }
        if !self.probe.responds(device) {
            debug!("{device} exists but does not respond");
            return false;
        }
        true
    }

    /// Device paths in range that are present and responsive, in index order.
    pub fn list_candidate_devices(&self) -> Vec<String> {
        let devices: Vec<String> = self
            .range
            .devices()
            .filter(|device| self.is_live(device))
            .collect();
        debug!("Found {} responsive devices: {devices:?}", devices.len());
        devices
    }

    fn describe(&self, device: &str) -> OurResult<Option<CameraCapabilities>> {
        if !self.detect_capabilities {
            return Ok(None);
        }
        self.probe.capabilities(device)
    }
}

impl<P: DeviceProbe> DeviceEnumerator for ScanningEnumerator<P> {
    fn enumerate(&self) -> OurResult<Snapshot> {
        let mut snapshot = Snapshot::default();
        for device in self.list_candidate_devices() {
            match self.describe(&device) {
                Ok(capabilities) => {
                    snapshot.devices.insert(device, capabilities);
                }
                Err(e) => {
                    warn!("Error detecting camera {device}: {e}");
                    snapshot.errors.insert(device, e.to_string());
                }
            }
        }
        Ok(snapshot)
    }

    fn inspect(&self, device: &str) -> OurResult<DeviceState> {
        if !is_device_path(device) {
            return Err(OurError::InvalidDevice(device.to_string()));
        }
        if !self.is_live(device) {
            return Ok(DeviceState::Absent);
        }
        Ok(match self.describe(device) {
            Ok(capabilities) => DeviceState::Present(capabilities),
            Err(e) => {
                warn!("Error detecting camera {device}: {e}");
                DeviceState::Failed(e.to_string())
            }
        })
    }

    fn invalidate(&self, device: Option<&str>) {
        self.probe.invalidate(device);
    }
}
