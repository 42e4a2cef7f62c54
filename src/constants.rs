//! Shared names and limits.

/// Prefix every video4linux device node path starts with.
pub const DEVICE_PREFIX: &str = "/dev/video";

/// Device reported as DISCONNECTED when the first scan finds nothing.
pub const FALLBACK_DEVICE: &str = "/dev/video0";

/// Capability fallbacks used when detection yields nothing usable.
pub const FALLBACK_WIDTH: u32 = 640;
pub const FALLBACK_HEIGHT: u32 = 480;
pub const FALLBACK_FPS: u32 = 30;
pub const FALLBACK_FORMAT: &str = "YUYV";

/// Capacity of the registry's event history.
pub const MAX_EVENT_HISTORY: usize = 1000;

/// External introspection tool.
pub const V4L2_CTL: &str = "v4l2-ctl";
/// Hotplug notification tool.
pub const UDEVADM: &str = "udevadm";

/// JSON-RPC notification methods pushed to clients.
pub const NOTIFY_CAMERA_STATUS: &str = "camera_status_update";
pub const NOTIFY_WELCOME: &str = "server_welcome";

pub const SERVER_NAME: &str = "camwatch JSON-RPC Camera Server";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns true when `device` looks like `/dev/videoN`.
pub fn is_device_path(device: &str) -> bool {
    device
        .strip_prefix(DEVICE_PREFIX)
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

/// Builds the node path for a device-namespace index.
pub fn device_path(index: u32) -> String {
    format!("{DEVICE_PREFIX}{index}")
}
