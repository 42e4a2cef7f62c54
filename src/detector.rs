//! Capability detection through `v4l2-ctl`.
//!
//! Detection runs three strategies in order and the first one that yields
//! something wins:
//!
//! 1. `--list-formats-ext`, parsed for every format tag and the best
//!    size/frame-rate pair.
//! 2. `--get-fmt-video`, which only knows the negotiated size and format.
//! 3. `--info` as a liveness probe. A device that answers but will not
//!    describe itself is reported with the fallback capabilities.
//!
//! Tool failures never escape this module; they degrade to the next
//! strategy or to `None`.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::constants::is_device_path;
use crate::models::{CameraCapabilities, CapabilityDefaults, Resolution};

/// Lowest frame rate at which a bigger frame is still an improvement.
const MIN_PREFERRED_FPS: u32 = 15;
/// How many lines after a size line may carry its frame intervals.
const FPS_LOOKAHEAD_LINES: usize = 10;
/// Poll step while waiting for a child process.
const WAIT_STEP: Duration = Duration::from_millis(10);

// Compiled once, `None` only if a pattern below is malformed.
static LIST_FORMAT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]:\s*'(\w+)'").ok());
static LIST_SIZE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Size:\s*Discrete\s*(\d+)x(\d+)").ok());
static LIST_FPS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*fps").ok());
static CURRENT_SIZE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Width/Height\s*:\s*(\d+)/(\d+)").ok());
static CURRENT_FORMAT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Pixel Format\s*:\s*'(\w+)'").ok());

/// Failure of a single tool invocation.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0} not found, install v4l-utils")]
    NotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("failed to run: {0}")]
    Spawn(String),
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external programs. Blocking; callers stay off the async runtime.
pub trait ToolRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], timeout: Duration)
    -> Result<ToolOutput, ToolError>;
}

/// [`ToolRunner`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Err(e) = pipe.read_to_string(&mut buf) {
            debug!("Failed to read child output: {e}");
        }
        buf
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl ToolRunner for CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ToolError::NotFound(program.to_string()),
                _ => ToolError::Spawn(e.to_string()),
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(e) = child.kill() {
                        warn!("Failed to kill timed out {program}: {e}");
                    }
                    let _ = child.wait();
                    return Err(ToolError::Timeout(timeout));
                }
                Ok(None) => thread::sleep(WAIT_STEP),
                Err(e) => return Err(ToolError::Spawn(e.to_string())),
            }
        };

        Ok(ToolOutput {
            success: status.success(),
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

/// Detector tuning
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Introspection tool, normally `v4l2-ctl`
    pub tool: String,
    /// Per-invocation timeout
    pub timeout: Duration,
    /// Total attempts per invocation
    pub max_retries: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Values substituted for anything the tool cannot tell us
    pub fallback: CapabilityDefaults,
    /// How long a detection result stays valid
    pub cache_ttl: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for DetectionConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            tool: config.tool_path.clone(),
            timeout: config.detection_timeout,
            max_retries: config.max_detection_retries,
            retry_delay: config.retry_delay,
            fallback: CapabilityDefaults::default(),
            cache_ttl: config.capability_cache_ttl,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedCapabilities {
    capabilities: CameraCapabilities,
    stored_at: Instant,
}

pub struct CapabilityDetector {
    config: DetectionConfig,
    runner: Arc<dyn ToolRunner>,
    cache: Mutex<HashMap<String, CachedCapabilities>>,
}

impl std::fmt::Debug for CapabilityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDetector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CapabilityDetector {
    pub fn new(config: DetectionConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config,
            runner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Detector that shells out to the real tool.
    pub fn with_command_runner(config: DetectionConfig) -> Self {
        Self::new(config, Arc::new(CommandRunner))
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, CachedCapabilities>> {
        self.cache.lock().unwrap_or_else(|e| {
            error!("Capability cache mutex poisoned: {e}");
            e.into_inner()
        })
    }

    /// Learns what `device` can do. `None` only when every strategy,
    /// including the liveness probe, failed.
    pub fn detect(&self, device: &str) -> Option<CameraCapabilities> {
        if !is_device_path(device) {
            debug!("Refusing to detect capabilities for {device}: not a video device");
            return None;
        }

        if let Some(cached) = self.cached(device) {
            debug!("Using cached capabilities for {device}");
            return Some(cached);
        }

        let capabilities = self.detect_uncached(device)?;
        self.cache().insert(
            device.to_string(),
            CachedCapabilities {
                capabilities: capabilities.clone(),
                stored_at: Instant::now(),
            },
        );
        Some(capabilities)
    }

    fn detect_uncached(&self, device: &str) -> Option<CameraCapabilities> {
        match self.invoke(device, "--list-formats-ext") {
            Ok(output) => match parse_list_formats(&output.stdout, &self.config.fallback) {
                Some(caps) => {
                    info!(
                        "Detected {device}: {} @ {}fps, formats {:?}",
                        caps.resolution(),
                        caps.fps(),
                        caps.formats()
                    );
                    return Some(caps);
                }
                None => debug!("No formats listed for {device}"),
            },
            Err(e) => debug!("Format listing failed for {device}: {e}"),
        }

        match self.invoke(device, "--get-fmt-video") {
            Ok(output) => match parse_current_format(&output.stdout, &self.config.fallback) {
                Some(caps) => {
                    info!(
                        "Detected {device} from current format: {} {:?}",
                        caps.resolution(),
                        caps.formats()
                    );
                    return Some(caps);
                }
                None => debug!("Could not parse current format for {device}"),
            },
            Err(e) => debug!("Current format query failed for {device}: {e}"),
        }

        if self.probe(device) {
            warn!("{device} responds but will not describe itself, using fallback capabilities");
            return Some(CameraCapabilities::fallback(&self.config.fallback));
        }

        debug!("All detection strategies failed for {device}");
        None
    }

    /// Liveness probe: does the device answer a minimal info query?
    pub fn probe(&self, device: &str) -> bool {
        match self.invoke(device, "--info") {
            Ok(_) => true,
            Err(e) => {
                debug!("{device} did not answer info query: {e}");
                false
            }
        }
    }

    /// One tool query with the bounded retry policy applied.
    ///
    /// Only timeouts and failures without any output are retried. A missing
    /// tool or a spawn failure ends the call straight away.
    fn invoke(&self, device: &str, query: &str) -> Result<ToolOutput, ToolError> {
        let args = ["--device", device, query];
        let attempts = self.config.max_retries.max(1);
        let mut last_error = ToolError::Failed {
            code: None,
            stderr: String::new(),
        };

        for attempt in 1..=attempts {
            debug!(
                "Running {} {} (attempt {attempt}/{attempts})",
                self.config.tool,
                args.join(" ")
            );
            match self.runner.run(&self.config.tool, &args, self.config.timeout) {
                Ok(output) if output.success => return Ok(output),
                Ok(output) => {
                    let failure = ToolError::Failed {
                        code: output.code,
                        stderr: output.stderr.trim().to_string(),
                    };
                    if !output.stdout.trim().is_empty() {
                        return Err(failure);
                    }
                    debug!("{} {query} on {device} failed: {failure}", self.config.tool);
                    last_error = failure;
                }
                Err(ToolError::Timeout(after)) => {
                    warn!(
                        "{} {query} on {device} timed out after {after:?}",
                        self.config.tool
                    );
                    last_error = ToolError::Timeout(after);
                }
                Err(e) => {
                    warn!("Cannot run {}: {e}", self.config.tool);
                    return Err(e);
                }
            }

            if attempt < attempts {
                thread::sleep(self.config.retry_delay);
            }
        }

        Err(last_error)
    }

    fn cached(&self, device: &str) -> Option<CameraCapabilities> {
        let mut cache = self.cache();
        let entry = cache.get(device)?;
        if entry.stored_at.elapsed() > self.config.cache_ttl {
            cache.remove(device);
            return None;
        }
        Some(entry.capabilities.clone())
    }

    pub fn invalidate(&self, device: &str) {
        if self.cache().remove(device).is_some() {
            debug!("Invalidated cached capabilities for {device}");
        }
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
        info!("Cleared capability cache");
    }
}

/// True when `candidate` at `fps` should replace `current` at `current_fps`.
fn is_better(candidate: Resolution, fps: u32, current: Resolution, current_fps: u32) -> bool {
    let (new_pixels, cur_pixels) = (candidate.pixels(), current.pixels());
    if new_pixels > cur_pixels {
        return fps >= MIN_PREFERRED_FPS;
    }
    if new_pixels < cur_pixels {
        return false;
    }
    if fps != current_fps {
        return fps > current_fps;
    }
    candidate.is_common() && !current.is_common()
}

/// Highest frame rate quoted in the lines following a size line, stopping at
/// the next size or format entry.
fn lookahead_fps(following: &[&str], format_re: &Regex, size_re: &Regex, fps_re: &Regex) -> Option<u32> {
    following
        .iter()
        .take(FPS_LOOKAHEAD_LINES)
        .take_while(|line| !size_re.is_match(line) && !format_re.is_match(line))
        .filter_map(|line| fps_re.captures(line))
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .filter(|fps| *fps >= 1.0)
        .map(|fps| fps as u32)
        .max()
}

/// Parses `v4l2-ctl --list-formats-ext` output.
///
/// Returns `None` when no format tag is present at all.
pub fn parse_list_formats(output: &str, defaults: &CapabilityDefaults) -> Option<CameraCapabilities> {
    let format_re = LIST_FORMAT_RE.as_ref()?;
    let size_re = LIST_SIZE_RE.as_ref()?;
    let fps_re = LIST_FPS_RE.as_ref()?;

    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let mut formats: Vec<String> = Vec::new();
    let mut best: Option<(Resolution, u32)> = None;

    for (index, line) in lines.iter().enumerate() {
        if let Some(caps) = format_re.captures(line) {
            let tag = caps[2].to_string();
            if !formats.contains(&tag) {
                debug!("Found format {tag}");
                formats.push(tag);
            }
            continue;
        }

        // sizes only count once we know which format they belong to
        if formats.is_empty() {
            continue;
        }
        let Some(size) = size_re.captures(line) else {
            continue;
        };
        let (Ok(width), Ok(height)) = (size[1].parse::<u32>(), size[2].parse::<u32>()) else {
            continue;
        };
        if width == 0 || height == 0 {
            continue;
        }

        let candidate = Resolution::new(width, height);
        let fps = lookahead_fps(&lines[index + 1..], format_re, size_re, fps_re)
            .unwrap_or(defaults.fps);

        let replace = match best {
            None => true,
            Some((current, current_fps)) => is_better(candidate, fps, current, current_fps),
        };
        if replace {
            debug!("Best so far: {candidate} @ {fps}fps");
            best = Some((candidate, fps));
        }
    }

    if formats.is_empty() {
        return None;
    }

    let (resolution, fps) = best.unwrap_or((defaults.resolution, defaults.fps));
    Some(CameraCapabilities::from_parts(resolution, fps, formats, defaults))
}

/// Parses `v4l2-ctl --get-fmt-video` output. The frame rate is not part of
/// that output so the fallback rate is used.
pub fn parse_current_format(output: &str, defaults: &CapabilityDefaults) -> Option<CameraCapabilities> {
    let size_re = CURRENT_SIZE_RE.as_ref()?;
    let format_re = CURRENT_FORMAT_RE.as_ref()?;

    let mut resolution = None;
    let mut format = None;
    for line in output.lines() {
        if let Some(caps) = size_re.captures(line) {
            if let (Ok(width), Ok(height)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) {
                resolution = Some(Resolution::new(width, height));
            }
        }
        if let Some(caps) = format_re.captures(line) {
            format = Some(caps[1].to_string());
        }
    }

    let resolution = resolution.filter(|r| r.width > 0 && r.height > 0)?;
    Some(CameraCapabilities::from_parts(
        resolution,
        defaults.fps,
        format,
        defaults,
    ))
}
