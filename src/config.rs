//! Configuration management for camwatch.
//!
//! Settings start from built-in defaults, are overlaid by an optional JSON
//! file and then by `CAMWATCH_*` environment variables. The binary applies
//! CLI flags last.

use std::env;
use std::fmt::Display;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::debug;

use crate::constants::{V4L2_CTL, device_path};
use crate::{OurError, OurResult};

/// Environment variable that points at an alternative settings file.
pub const CONFIG_PATH_ENV: &str = "CAMWATCH_CONFIG_PATH";

/// Inclusive range of `/dev/videoN` indices to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRange {
    pub first: u32,
    pub last: u32,
}

impl DeviceRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn indices(&self) -> RangeInclusive<u32> {
        self.first..=self.last
    }

    /// Node paths in scan order.
    pub fn devices(&self) -> impl Iterator<Item = String> {
        self.indices().map(device_path)
    }
}

impl Default for DeviceRange {
    fn default() -> Self {
        Self::new(0, 9)
    }
}

/// Monitor and detection settings
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Pause between polling cycles
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Device indices to scan
    pub device_range: DeviceRange,
    /// Timeout for a single `v4l2-ctl` invocation
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "detection_timeout_ms")]
    pub detection_timeout: Duration,
    /// Attempts per tool invocation
    pub max_detection_retries: u32,
    /// Pause between attempts
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    /// Run full capability detection for present devices
    pub enable_capability_detection: bool,
    /// Lifetime of cached detection results
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "capability_cache_ttl_ms")]
    pub capability_cache_ttl: Duration,
    /// Pause after a failed monitoring cycle
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "error_backoff_ms")]
    pub error_backoff: Duration,
    /// Delay before the first scan and before inspecting a hotplugged device
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "settle_delay_ms")]
    pub settle_delay: Duration,
    /// How long `stop` waits for the monitor thread
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "stop_timeout_ms")]
    pub stop_timeout: Duration,
    /// Prefer udev notifications over polling when available
    pub use_event_driven: bool,
    /// Path or name of the `v4l2-ctl` binary
    pub tool_path: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            device_range: DeviceRange::default(),
            detection_timeout: Duration::from_secs(2),
            max_detection_retries: 2,
            retry_delay: Duration::from_millis(500),
            enable_capability_detection: true,
            capability_cache_ttl: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            settle_delay: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            use_event_driven: true,
            tool_path: V4L2_CTL.to_string(),
        }
    }
}

/// Configuration settings for camwatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Path the WebSocket endpoint is mounted on
    pub websocket_path: String,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Camera monitoring
    pub monitor: MonitorConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8002,
            websocket_path: "/ws".to_string(),
            log_level: "info".to_string(),
            monitor: MonitorConfig::default(),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> OurResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| OurError::Config(format!("invalid {name}={value}: {e}")))
}

impl Settings {
    /// Loads settings from the default config path, then applies environment
    /// variable overrides.
    pub fn new() -> OurResult<Self> {
        Self::load(&Self::get_config_path())
    }

    /// Like [`Settings::new`] with an explicit file.
    pub fn load(path: &Path) -> OurResult<Self> {
        let mut settings = Self::from_file(path)?;
        settings.apply_env_overrides(|name| env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Get the path to the settings file
    pub fn get_config_path() -> PathBuf {
        if let Ok(config_path_override) = env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(config_path_override);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("camwatch.json")
    }

    /// Reads a settings file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> OurResult<Self> {
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| OurError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Applies `CAMWATCH_*` overrides, looking each name up through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> OurResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CAMWATCH_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("CAMWATCH_PORT") {
            self.port = parse_var("CAMWATCH_PORT", &port)?;
        }
        if let Some(path) = lookup("CAMWATCH_WEBSOCKET_PATH") {
            self.websocket_path = path;
        }
        if let Some(level) = lookup("CAMWATCH_LOG_LEVEL") {
            self.log_level = level;
        }

        let monitor = &mut self.monitor;
        if let Some(ms) = lookup("CAMWATCH_POLL_INTERVAL_MS") {
            monitor.poll_interval =
                Duration::from_millis(parse_var("CAMWATCH_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(first) = lookup("CAMWATCH_DEVICE_FIRST") {
            monitor.device_range.first = parse_var("CAMWATCH_DEVICE_FIRST", &first)?;
        }
        if let Some(last) = lookup("CAMWATCH_DEVICE_LAST") {
            monitor.device_range.last = parse_var("CAMWATCH_DEVICE_LAST", &last)?;
        }
        if let Some(ms) = lookup("CAMWATCH_DETECTION_TIMEOUT_MS") {
            monitor.detection_timeout =
                Duration::from_millis(parse_var("CAMWATCH_DETECTION_TIMEOUT_MS", &ms)?);
        }
        if let Some(retries) = lookup("CAMWATCH_MAX_DETECTION_RETRIES") {
            monitor.max_detection_retries = parse_var("CAMWATCH_MAX_DETECTION_RETRIES", &retries)?;
        }
        if let Some(enabled) = lookup("CAMWATCH_ENABLE_CAPABILITY_DETECTION") {
            monitor.enable_capability_detection =
                parse_var("CAMWATCH_ENABLE_CAPABILITY_DETECTION", &enabled)?;
        }
        if let Some(event_driven) = lookup("CAMWATCH_USE_EVENT_DRIVEN") {
            monitor.use_event_driven = parse_var("CAMWATCH_USE_EVENT_DRIVEN", &event_driven)?;
        }
        if let Some(tool) = lookup("CAMWATCH_TOOL_PATH") {
            monitor.tool_path = tool;
        }
        Ok(())
    }

    pub fn validate(&self) -> OurResult<()> {
        if self.port == 0 {
            return Err(OurError::Config("port must be non-zero".to_string()));
        }
        if !self.websocket_path.starts_with('/') {
            return Err(OurError::Config(format!(
                "websocket_path must start with '/', got '{}'",
                self.websocket_path
            )));
        }
        let range = self.monitor.device_range;
        if range.first > range.last {
            return Err(OurError::Config(format!(
                "device_range first ({}) is after last ({})",
                range.first, range.last
            )));
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(OurError::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.monitor.max_detection_retries == 0 {
            return Err(OurError::Config(
                "max_detection_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
