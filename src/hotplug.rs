//! OS hotplug notifications for video4linux devices.
//!
//! On Linux these come from `udevadm monitor`, read line by line on a helper
//! thread and handed to the monitor through a std channel so it can wait
//! with a timeout and still notice stop requests.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::constants::{UDEVADM, device_path};
use crate::detector::ToolRunner;
use crate::{OurError, OurResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    pub device: String,
}

/// Something that can open a stream of hotplug events.
pub trait HotplugSource: Send + Sync {
    fn open(&self) -> OurResult<Box<dyn HotplugStream>>;
}

pub trait HotplugStream: Send {
    /// Waits up to `timeout` for the next event. `Ok(None)` on timeout; `Err`
    /// once the stream has ended.
    fn next_event(&mut self, timeout: Duration) -> OurResult<Option<HotplugEvent>>;
}

/// Parses `udevadm monitor --udev` output lines.
#[derive(Debug, Clone)]
pub struct MonitorLineParser {
    line_re: Regex,
    node_re: Regex,
}

impl MonitorLineParser {
    pub fn new() -> OurResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| OurError::Monitor(format!("bad pattern {pattern}: {e}")))
        };
        Ok(Self {
            line_re: compile(r"^UDEV\s+\[[\d.]+\]\s+(add|remove)\s+(\S+)\s+\(video4linux\)")?,
            node_re: compile(r"^video(\d+)$")?,
        })
    }

    /// `None` for anything that is not an add or remove of a `videoN` node.
    pub fn parse(&self, line: &str) -> Option<HotplugEvent> {
        let caps = self.line_re.captures(line.trim())?;
        let action = match &caps[1] {
            "add" => HotplugAction::Add,
            _ => HotplugAction::Remove,
        };
        let node = caps[2].rsplit('/').next()?;
        let index: u32 = self.node_re.captures(node)?[1].parse().ok()?;
        Some(HotplugEvent {
            action,
            device: device_path(index),
        })
    }
}

/// [`HotplugSource`] that spawns `udevadm monitor`.
#[derive(Debug, Clone)]
pub struct UdevadmSource {
    program: String,
}

impl UdevadmSource {
    /// Checks once whether `udevadm` can be run here.
    pub fn detect(runner: &dyn ToolRunner) -> Option<Self> {
        match runner.run(UDEVADM, &["--version"], Duration::from_secs(2)) {
            Ok(output) if output.success => {
                info!("udev hotplug notifications available (udevadm {})", output.stdout.trim());
                Some(Self {
                    program: UDEVADM.to_string(),
                })
            }
            Ok(output) => {
                debug!("udevadm --version failed: {}", output.stderr.trim());
                None
            }
            Err(e) => {
                debug!("udevadm unavailable: {e}");
                None
            }
        }
    }
}

impl HotplugSource for UdevadmSource {
    fn open(&self) -> OurResult<Box<dyn HotplugStream>> {
        let parser = MonitorLineParser::new()?;
        let mut child = Command::new(&self.program)
            .args(["monitor", "--udev", "--subsystem-match=video4linux"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OurError::Monitor("udevadm stdout unavailable".to_string()))?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("udev-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if let Some(event) = parser.parse(&line) {
                        debug!("udev: {event:?}");
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                debug!("udevadm monitor output ended");
            })?;

        debug!("Started {} monitor", self.program);
        Ok(Box::new(UdevadmStream { child, rx }))
    }
}

struct UdevadmStream {
    child: Child,
    rx: Receiver<HotplugEvent>,
}

impl HotplugStream for UdevadmStream {
    fn next_event(&mut self, timeout: Duration) -> OurResult<Option<HotplugEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(OurError::Monitor("udevadm monitor exited".to_string()))
            }
        }
    }
}

impl Drop for UdevadmStream {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!("Failed to stop udevadm monitor: {e}");
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{ToolError, ToolOutput};

    #[test]
    fn test_parse_monitor_lines() {
        let parser = MonitorLineParser::new().expect("patterns compile");

        let add = parser.parse(
            "UDEV  [23511.442961] add      /devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0/video4linux/video2 (video4linux)",
        );
        assert_eq!(
            add,
            Some(HotplugEvent {
                action: HotplugAction::Add,
                device: "/dev/video2".to_string(),
            })
        );

        let remove = parser.parse(
            "UDEV  [23519.001] remove   /devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0/video4linux/video10 (video4linux)",
        );
        assert_eq!(remove.map(|e| (e.action, e.device)), Some((HotplugAction::Remove, "/dev/video10".to_string())));
    }

    #[test]
    fn test_parse_ignores_other_lines() {
        let parser = MonitorLineParser::new().expect("patterns compile");
        assert!(parser.parse("monitor will print the received events for:").is_none());
        assert!(parser.parse("UDEV - the event which udev sends out after rule processing").is_none());
        assert!(parser
            .parse("UDEV  [1.0] change   /devices/x/video4linux/video0 (video4linux)")
            .is_none());
        assert!(parser
            .parse("UDEV  [1.0] add      /devices/x/video4linux/v4l-subdev0 (video4linux)")
            .is_none());
    }

    struct Fixed(Result<ToolOutput, fn() -> ToolError>);

    impl ToolRunner for Fixed {
        fn run(&self, _: &str, _: &[&str], _: Duration) -> Result<ToolOutput, ToolError> {
            match &self.0 {
                Ok(output) => Ok(output.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    #[test]
    fn test_detect_depends_on_udevadm() {
        assert!(UdevadmSource::detect(&Fixed(Ok(ToolOutput::ok("255\n")))).is_some());
        assert!(UdevadmSource::detect(&Fixed(Ok(ToolOutput::failed(1, "", "nope")))).is_none());
        assert!(UdevadmSource::detect(&Fixed(Err(|| ToolError::NotFound("udevadm".to_string())))).is_none());
    }
}
