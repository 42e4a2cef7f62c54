//! Camera data model.
//!
//! Value types shared by detection, reconciliation, the registry and the
//! JSON-RPC layer. Constructors normalise their inputs so an invalid
//! [`CameraCapabilities`] or [`CameraInfo`] can never exist.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use serde_with::{DisplayFromStr, serde_as};

use crate::constants::{
    DEVICE_PREFIX, FALLBACK_FORMAT, FALLBACK_FPS, FALLBACK_HEIGHT, FALLBACK_WIDTH, is_device_path,
};
use crate::{OurError, OurResult};

/// Resolutions preferred when two candidates are otherwise equal.
pub const COMMON_RESOLUTIONS: [Resolution; 3] = [
    Resolution::new(1920, 1080),
    Resolution::new(1280, 720),
    Resolution::new(640, 480),
];

/// Frame size in pixels, rendered as `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_common(&self) -> bool {
        COMMON_RESOLUTIONS.contains(self)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(FALLBACK_WIDTH, FALLBACK_HEIGHT)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = OurError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || OurError::Detection(format!("malformed resolution '{s}'"));
        let (width, height) = s.trim().split_once('x').ok_or_else(malformed)?;
        let width: u32 = width.trim().parse().map_err(|_| malformed())?;
        let height: u32 = height.trim().parse().map_err(|_| malformed())?;
        if width == 0 || height == 0 {
            return Err(malformed());
        }
        Ok(Self::new(width, height))
    }
}

/// Values substituted when detection cannot tell us something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDefaults {
    pub resolution: Resolution,
    pub fps: u32,
    pub format: String,
}

impl Default for CapabilityDefaults {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            fps: FALLBACK_FPS,
            format: FALLBACK_FORMAT.to_string(),
        }
    }
}

/// Negotiated capabilities of a capture device.
///
/// Immutable once built: the detector replaces a value wholesale rather than
/// editing it. Resolution and fps always hold usable values and `formats` is
/// never empty.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraCapabilities {
    #[serde_as(as = "DisplayFromStr")]
    resolution: Resolution,
    fps: u32,
    formats: Vec<String>,
}

impl CameraCapabilities {
    /// Builds capabilities from loosely typed input using the stock fallbacks.
    pub fn new<I, S>(resolution: &str, fps: u32, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_defaults(resolution, fps, formats, &CapabilityDefaults::default())
    }

    /// Builds capabilities, replacing anything unusable with `defaults`.
    pub fn with_defaults<I, S>(
        resolution: &str,
        fps: u32,
        formats: I,
        defaults: &CapabilityDefaults,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resolution = resolution.parse().unwrap_or(defaults.resolution);
        Self::from_parts(resolution, fps, formats, defaults)
    }

    pub fn from_parts<I, S>(
        resolution: Resolution,
        fps: u32,
        formats: I,
        defaults: &CapabilityDefaults,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resolution = if resolution.width == 0 || resolution.height == 0 {
            defaults.resolution
        } else {
            resolution
        };

        let mut tags: Vec<String> = Vec::new();
        for tag in formats {
            let tag = tag.into().trim().to_string();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        if tags.is_empty() {
            tags.push(defaults.format.clone());
        }

        Self {
            resolution,
            fps: if fps == 0 { defaults.fps } else { fps },
            formats: tags,
        }
    }

    /// What we report for a device that answers but will not describe itself.
    pub fn fallback(defaults: &CapabilityDefaults) -> Self {
        Self::from_parts(
            defaults.resolution,
            defaults.fps,
            [defaults.format.clone()],
            defaults,
        )
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn formats(&self) -> &[String] {
        &self.formats
    }

    /// Full form used by administrative responses.
    pub fn detailed_payload(&self) -> Value {
        json!({
            "resolution": self.resolution.to_string(),
            "width": self.width(),
            "height": self.height(),
            "fps": self.fps,
            "formats": self.formats,
        })
    }
}

/// Camera connection status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraStatus {
    Connected,
    Disconnected,
    Error,
    #[default]
    Unknown,
}

impl CameraStatus {
    pub const ALL: [CameraStatus; 4] = [
        CameraStatus::Connected,
        CameraStatus::Disconnected,
        CameraStatus::Error,
        CameraStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Connected => "CONNECTED",
            CameraStatus::Disconnected => "DISCONNECTED",
            CameraStatus::Error => "ERROR",
            CameraStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one device node.
///
/// `status` only changes through the `mark_*` methods so the timestamp
/// rules hold for every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraInfo {
    device: String,
    status: CameraStatus,
    capabilities: Option<CameraCapabilities>,
    connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    error_message: Option<String>,
    metadata: BTreeMap<String, Value>,
}

impl CameraInfo {
    /// Creates an UNKNOWN entry for `device`, rejecting anything that is not
    /// a `/dev/videoN` node.
    pub fn new(device: impl Into<String>) -> OurResult<Self> {
        let device = device.into();
        if !is_device_path(&device) {
            return Err(OurError::InvalidDevice(device));
        }
        Ok(Self {
            device,
            status: CameraStatus::Unknown,
            capabilities: None,
            connected_at: None,
            disconnected_at: None,
            last_seen: Some(Utc::now()),
            error_message: None,
            metadata: BTreeMap::new(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn status(&self) -> CameraStatus {
        self.status
    }

    pub fn connected(&self) -> bool {
        self.status == CameraStatus::Connected
    }

    pub fn capabilities(&self) -> Option<&CameraCapabilities> {
        self.capabilities.as_ref()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        self.disconnected_at
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Numeric suffix of the node path.
    pub fn device_number(&self) -> Option<u32> {
        self.device.strip_prefix(DEVICE_PREFIX)?.parse().ok()
    }

    pub fn uptime_seconds(&self) -> Option<f64> {
        if !self.connected() {
            return None;
        }
        let since = self.connected_at?;
        Some((Utc::now() - since).num_milliseconds() as f64 / 1000.0)
    }

    pub fn mark_connected(&mut self, capabilities: Option<CameraCapabilities>) {
        let now = Utc::now();
        self.status = CameraStatus::Connected;
        self.connected_at = Some(now);
        self.last_seen = Some(now);
        self.disconnected_at = None;
        self.error_message = None;
        if capabilities.is_some() {
            self.capabilities = capabilities;
        }
    }

    /// Capabilities are kept for reference.
    pub fn mark_disconnected(&mut self) {
        let now = Utc::now();
        self.status = CameraStatus::Disconnected;
        self.disconnected_at = Some(now);
        self.last_seen = Some(now);
    }

    /// Connection timestamps are left alone.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = CameraStatus::Error;
        self.error_message = Some(message.into());
        self.last_seen = Some(Utc::now());
    }

    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    /// Payload pushed to clients in `camera_status_update` notifications.
    pub fn status_payload(&self) -> Value {
        let mut data = Map::new();
        data.insert("device".into(), json!(self.device));
        data.insert("status".into(), json!(self.status));
        data.insert("last_seen".into(), json!(self.last_seen));

        match self.status {
            CameraStatus::Connected => {
                if let Some(caps) = &self.capabilities {
                    data.insert("resolution".into(), json!(caps.resolution().to_string()));
                    data.insert("fps".into(), json!(caps.fps()));
                    data.insert("formats".into(), json!(caps.formats()));
                }
                if let Some(connected_at) = self.connected_at {
                    data.insert("connected_at".into(), json!(connected_at));
                    data.insert("uptime_seconds".into(), json!(self.uptime_seconds()));
                }
            }
            CameraStatus::Disconnected => {
                if let Some(disconnected_at) = self.disconnected_at {
                    data.insert("disconnected_at".into(), json!(disconnected_at));
                }
            }
            CameraStatus::Error => {
                if let Some(message) = &self.error_message {
                    data.insert("error_message".into(), json!(message));
                }
            }
            CameraStatus::Unknown => {}
        }

        if !self.metadata.is_empty() {
            data.insert("metadata".into(), json!(self.metadata));
        }

        Value::Object(data)
    }

    /// Status payload plus every timestamp and the full capability set.
    pub fn detailed_payload(&self) -> Value {
        let mut data = match self.status_payload() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(caps) = &self.capabilities {
            data.insert("capabilities".into(), caps.detailed_payload());
        }
        data.insert("connected_at".into(), json!(self.connected_at));
        data.insert("disconnected_at".into(), json!(self.disconnected_at));
        data.insert("device_number".into(), json!(self.device_number()));
        Value::Object(data)
    }
}

/// Kind of transition a [`CameraEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraEventKind {
    Connected,
    Disconnected,
    StatusChange,
    Removed,
}

/// One state transition of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraEvent {
    pub device: String,
    #[serde(rename = "event_type")]
    pub kind: CameraEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_status: Option<CameraStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<CameraStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CameraCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl CameraEvent {
    pub fn new(device: impl Into<String>, kind: CameraEventKind) -> Self {
        Self {
            device: device.into(),
            kind,
            timestamp: Utc::now(),
            old_status: None,
            new_status: None,
            capabilities: None,
            error_message: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Event describing the move of `camera` away from `old_status`.
    pub fn transition(camera: &CameraInfo, kind: CameraEventKind, old_status: CameraStatus) -> Self {
        Self {
            old_status: Some(old_status),
            new_status: Some(camera.status()),
            capabilities: camera.capabilities().cloned(),
            error_message: camera.error_message().map(str::to_string),
            ..Self::new(camera.device(), kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_fallbacks() {
        let caps = CameraCapabilities::new("garbage", 0, Vec::<String>::new());
        assert_eq!(caps.resolution().to_string(), "640x480");
        assert_eq!(caps.fps(), 30);
        assert_eq!(caps.formats(), ["YUYV".to_string()]);
    }

    #[test]
    fn test_capabilities_configured_fallbacks() {
        let defaults = CapabilityDefaults {
            resolution: Resolution::new(1280, 720),
            fps: 15,
            format: "MJPG".to_string(),
        };
        let caps = CameraCapabilities::with_defaults("0x480", 0, Vec::<String>::new(), &defaults);
        assert_eq!(caps.resolution(), Resolution::new(1280, 720));
        assert_eq!(caps.fps(), 15);
        assert_eq!(caps.formats(), ["MJPG".to_string()]);
    }

    #[test]
    fn test_capabilities_dedup_formats_keeps_order() {
        let caps = CameraCapabilities::new("1920x1080", 60, ["MJPG", "YUYV", "MJPG", " ", "H264"]);
        assert_eq!(caps.formats(), ["MJPG", "YUYV", "H264"]);
        assert_eq!(caps.width(), 1920);
        assert_eq!(caps.height(), 1080);
        assert_eq!(caps.fps(), 60);
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("800x600".parse::<Resolution>().ok(), Some(Resolution::new(800, 600)));
        assert!("800".parse::<Resolution>().is_err());
        assert!("x600".parse::<Resolution>().is_err());
        assert!("0x600".parse::<Resolution>().is_err());
        assert!(Resolution::new(1280, 720).is_common());
        assert!(!Resolution::new(800, 600).is_common());
    }

    #[test]
    fn test_camera_info_rejects_bad_path() {
        assert!(matches!(
            CameraInfo::new("/dev/sda1"),
            Err(OurError::InvalidDevice(_))
        ));
        let info = CameraInfo::new("/dev/video3").expect("valid path");
        assert_eq!(info.status(), CameraStatus::Unknown);
        assert_eq!(info.device_number(), Some(3));
        assert!(info.last_seen().is_some());
        assert!(!info.connected());
    }

    #[test]
    fn test_mark_connected_clears_error_and_disconnect() {
        let mut info = CameraInfo::new("/dev/video0").expect("valid path");
        info.mark_disconnected();
        info.mark_error("device busy");
        assert!(info.disconnected_at().is_some());

        info.mark_connected(Some(CameraCapabilities::new("640x480", 30, ["YUYV"])));
        assert!(info.connected());
        assert_eq!(info.status(), CameraStatus::Connected);
        assert!(info.disconnected_at().is_none());
        assert!(info.error_message().is_none());
        assert!(info.connected_at().is_some());
        assert!(info.uptime_seconds().is_some());
    }

    #[test]
    fn test_mark_error_keeps_connected_at() {
        let mut info = CameraInfo::new("/dev/video0").expect("valid path");
        info.mark_connected(None);
        let connected_at = info.connected_at();

        info.mark_error("v4l2-ctl timed out");
        assert_eq!(info.connected_at(), connected_at);
        assert_eq!(info.status(), CameraStatus::Error);
        assert!(!info.connected());
        assert_eq!(info.error_message(), Some("v4l2-ctl timed out"));
    }

    #[test]
    fn test_mark_disconnected_retains_capabilities() {
        let mut info = CameraInfo::new("/dev/video1").expect("valid path");
        info.mark_connected(Some(CameraCapabilities::new("1280x720", 30, ["MJPG"])));
        info.mark_disconnected();
        assert_eq!(info.status(), CameraStatus::Disconnected);
        assert!(info.capabilities().is_some());
        assert!(info.disconnected_at().is_some());
        assert!(info.uptime_seconds().is_none());
    }

    #[test]
    fn test_status_payload_shape() {
        let mut info = CameraInfo::new("/dev/video0").expect("valid path");
        info.mark_connected(Some(CameraCapabilities::new("1280x720", 25, ["MJPG", "YUYV"])));
        let payload = info.status_payload();
        assert_eq!(payload["device"], "/dev/video0");
        assert_eq!(payload["status"], "CONNECTED");
        assert_eq!(payload["resolution"], "1280x720");
        assert_eq!(payload["fps"], 25);
        assert_eq!(payload["formats"], json!(["MJPG", "YUYV"]));

        info.mark_disconnected();
        let payload = info.status_payload();
        assert_eq!(payload["status"], "DISCONNECTED");
        assert!(payload.get("resolution").is_none());
        assert!(payload.get("disconnected_at").is_some());

        let detailed = info.detailed_payload();
        assert_eq!(detailed["capabilities"]["width"], 1280);
        assert_eq!(detailed["device_number"], 0);
    }

    #[test]
    fn test_event_serialization() {
        let mut info = CameraInfo::new("/dev/video2").expect("valid path");
        info.mark_connected(None);
        let event = CameraEvent::transition(&info, CameraEventKind::Connected, CameraStatus::Unknown);
        let value = serde_json::to_value(&event).expect("serializable");
        assert_eq!(value["event_type"], "connected");
        assert_eq!(value["old_status"], "UNKNOWN");
        assert_eq!(value["new_status"], "CONNECTED");
        assert!(value.get("capabilities").is_none());
    }
}
