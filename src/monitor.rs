//! Camera monitoring thread.
//!
//! The monitor runs on its own OS thread because detection shells out to
//! `v4l2-ctl` and sleeps between cycles. Everything it learns goes into the
//! [`CameraRegistry`] and, as a status payload, through the [`EventBridge`]
//! to the async side.
//!
//! Two loop strategies share one [`MonitorCore`]: [`PollingLoop`] rescans the
//! device range on a fixed interval, [`HotplugLoop`] reacts to udev add and
//! remove notifications. [`create_monitor`] picks one at construction.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bridge::EventBridge;
use crate::camera_registry::CameraRegistry;
use crate::config::MonitorConfig;
use crate::detector::{CapabilityDetector, CommandRunner, DetectionConfig};
use crate::enumerator::{DeviceEnumerator, DeviceState, ScanningEnumerator, V4l2Probe};
use crate::hotplug::{HotplugAction, HotplugEvent, HotplugSource, UdevadmSource};
use crate::models::{CameraEventKind, CameraInfo, CameraStatus};
use crate::reconcile::{Reconciler, Transition};
use crate::{OurError, OurResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStrategy {
    Polling,
    EventDriven,
}

/// Monitor statistics
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub monitoring_started: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<f64>,
    pub running: bool,
    pub cycles: u64,
    pub total_events: u64,
    pub connect_events: u64,
    pub disconnect_events: u64,
    pub error_events: u64,
    pub detection_failures: u64,
    pub current_cameras: usize,
    pub connected_cameras: usize,
    pub strategy: MonitorStrategy,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    total_events: AtomicU64,
    connect_events: AtomicU64,
    disconnect_events: AtomicU64,
    error_events: AtomicU64,
    detection_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Stop flag the monitor thread can sleep on.
#[derive(Debug, Default)]
struct StopSignal {
    requested: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn flag(&self) -> MutexGuard<'_, bool> {
        self.requested.lock().unwrap_or_else(|e| {
            error!("Monitor stop flag mutex poisoned: {e}");
            e.into_inner()
        })
    }

    fn reset(&self) {
        *self.flag() = false;
    }

    fn request(&self) {
        *self.flag() = true;
        self.wake.notify_all();
    }

    fn is_requested(&self) -> bool {
        *self.flag()
    }

    /// Sleeps up to `duration`; returns true if a stop was requested.
    fn wait(&self, duration: Duration) -> bool {
        let guard = self.flag();
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |requested| !*requested)
            .unwrap_or_else(|e| {
                error!("Monitor stop flag mutex poisoned: {e}");
                e.into_inner()
            });
        *guard
    }
}

/// State and collaborators shared by every loop strategy.
pub struct MonitorCore {
    config: MonitorConfig,
    enumerator: Arc<dyn DeviceEnumerator>,
    reconciler: Mutex<Reconciler>,
    registry: Arc<CameraRegistry>,
    bridge: EventBridge,
    counters: Counters,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stop: StopSignal,
}

impl MonitorCore {
    fn new(
        config: MonitorConfig,
        enumerator: Arc<dyn DeviceEnumerator>,
        registry: Arc<CameraRegistry>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            config,
            enumerator,
            reconciler: Mutex::new(Reconciler::new()),
            registry,
            bridge,
            counters: Counters::default(),
            started_at: Mutex::new(None),
            stop: StopSignal::default(),
        }
    }

    fn reconciler(&self) -> MutexGuard<'_, Reconciler> {
        self.reconciler.lock().unwrap_or_else(|e| {
            error!("Reconciler mutex poisoned: {e}");
            e.into_inner()
        })
    }

    fn started_at(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.started_at.lock().unwrap_or_else(|e| {
            error!("Monitor start time mutex poisoned: {e}");
            e.into_inner()
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Sleeps unless stopped first. Returns true when the loop should exit.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.stop.wait(duration)
    }

    /// Runs `f`, turning a panic into an error so one bad cycle cannot take
    /// the monitor thread down.
    fn guarded<T>(&self, what: &str, f: impl FnOnce() -> OurResult<T>) -> OurResult<T> {
        panic::catch_unwind(AssertUnwindSafe(f))
            .unwrap_or_else(|_| Err(OurError::Monitor(format!("{what} panicked"))))
    }

    fn record_error(&self) {
        Counters::bump(&self.counters.error_events, 1);
    }

    /// Full scan reported as a baseline.
    fn send_baseline(&self) -> OurResult<usize> {
        let snapshot = self.enumerator.enumerate()?;
        Counters::bump(&self.counters.detection_failures, snapshot.failures() as u64);
        let transitions = self.reconciler().baseline(&snapshot);
        info!(
            "Initial camera scan found {} device(s), sending {} status update(s)",
            snapshot.devices.len(),
            transitions.len()
        );
        Ok(self.deliver(transitions))
    }

    /// One polling cycle: enumerate, reconcile, hand off.
    pub fn run_cycle(&self) -> OurResult<usize> {
        Counters::bump(&self.counters.cycles, 1);
        let snapshot = self.enumerator.enumerate()?;
        Counters::bump(&self.counters.detection_failures, snapshot.failures() as u64);
        let transitions = self.reconciler().reconcile(&snapshot);
        Ok(self.deliver(transitions))
    }

    /// Single-device reconciliation for hotplug events.
    pub fn apply_device(&self, device: &str, state: DeviceState) -> usize {
        if matches!(state, DeviceState::Failed(_)) {
            Counters::bump(&self.counters.detection_failures, 1);
        }
        let transition = self.reconciler().apply_device(device, state);
        self.deliver(transition.into_iter().collect())
    }

    fn deliver(&self, transitions: Vec<Transition>) -> usize {
        let count = transitions.len();
        for Transition { event, camera } in transitions {
            Counters::bump(&self.counters.total_events, 1);
            match event.kind {
                CameraEventKind::Connected => {
                    Counters::bump(&self.counters.connect_events, 1);
                    match camera.capabilities() {
                        Some(caps) => info!(
                            "Camera connected: {} - {} @ {}fps",
                            camera.device(),
                            caps.resolution(),
                            caps.fps()
                        ),
                        None => info!("Camera connected: {}", camera.device()),
                    }
                }
                CameraEventKind::Disconnected => {
                    Counters::bump(&self.counters.disconnect_events, 1);
                    info!("Camera disconnected: {}", camera.device());
                }
                CameraEventKind::StatusChange if camera.status() == CameraStatus::Error => {
                    warn!(
                        "Camera error: {} - {}",
                        camera.device(),
                        camera.error_message().unwrap_or("unknown error")
                    );
                }
                CameraEventKind::StatusChange | CameraEventKind::Removed => {}
            }

            let payload = camera.status_payload();
            self.registry.apply_transition(event, camera);
            if !self.bridge.deliver(payload) {
                self.record_error();
            }
        }
        count
    }
}

/// One way of driving the core until a stop is requested.
pub trait MonitorLoop: Send + Sync {
    fn strategy(&self) -> MonitorStrategy;

    fn run(&self, core: &MonitorCore);
}

/// Rescans the whole device range every poll interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingLoop;

impl MonitorLoop for PollingLoop {
    fn strategy(&self) -> MonitorStrategy {
        MonitorStrategy::Polling
    }

    fn run(&self, core: &MonitorCore) {
        info!(
            "Camera polling loop started, interval {:?}",
            core.config.poll_interval
        );
        while !core.stop_requested() {
            let pause = match core.guarded("monitoring cycle", || core.run_cycle()) {
                Ok(events) => {
                    if events > 0 {
                        debug!("Cycle produced {events} event(s)");
                    }
                    core.config.poll_interval
                }
                Err(e) => {
                    error!("Error in camera monitoring loop: {e}");
                    core.record_error();
                    core.config.error_backoff
                }
            };
            if core.sleep(pause) {
                break;
            }
        }
        info!("Camera polling loop stopped");
    }
}

/// Reacts to udev add/remove notifications for single devices.
pub struct HotplugLoop {
    source: Arc<dyn HotplugSource>,
}

impl HotplugLoop {
    pub fn new(source: Arc<dyn HotplugSource>) -> Self {
        Self { source }
    }

    fn handle(&self, core: &MonitorCore, event: HotplugEvent) {
        let device = event.device;
        core.enumerator.invalidate(Some(&device));
        let state = match event.action {
            HotplugAction::Remove => DeviceState::Absent,
            HotplugAction::Add => {
                if core.sleep(core.config.settle_delay) {
                    return;
                }
                match core.guarded("device inspection", || core.enumerator.inspect(&device)) {
                    Ok(state) => state,
                    Err(e) => {
                        warn!("Could not inspect {device}: {e}");
                        DeviceState::Failed(e.to_string())
                    }
                }
            }
        };
        core.apply_device(&device, state);
    }
}

impl MonitorLoop for HotplugLoop {
    fn strategy(&self) -> MonitorStrategy {
        MonitorStrategy::EventDriven
    }

    fn run(&self, core: &MonitorCore) {
        info!("Camera hotplug loop started");
        // wake up regularly so stop requests are noticed
        let wait = core.config.poll_interval;
        let mut resync = false;

        while !core.stop_requested() {
            let mut stream = match self.source.open() {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to open hotplug stream: {e}");
                    core.record_error();
                    resync = true;
                    if core.sleep(core.config.error_backoff) {
                        break;
                    }
                    continue;
                }
            };

            // catch up on anything missed while the stream was down
            if resync {
                resync = false;
                if let Err(e) = core.guarded("resync", || core.run_cycle()) {
                    error!("Resync after hotplug stream restart failed: {e}");
                    core.record_error();
                }
            }

            while !core.stop_requested() {
                match stream.next_event(wait) {
                    Ok(Some(event)) => self.handle(core, event),
                    Ok(None) => {}
                    Err(e) => {
                        error!("Hotplug stream failed: {e}");
                        core.record_error();
                        resync = true;
                        break;
                    }
                }
            }
            drop(stream);

            if !core.stop_requested() && core.sleep(core.config.error_backoff) {
                break;
            }
        }
        info!("Camera hotplug loop stopped");
    }
}

struct Worker {
    handle: JoinHandle<()>,
    /// Taken while a `stop` call waits on it.
    done: Option<mpsc::Receiver<()>>,
    stopping: bool,
}

/// Owns the monitor thread.
pub struct CameraMonitor {
    core: Arc<MonitorCore>,
    strategy: Arc<dyn MonitorLoop>,
    worker: Mutex<Option<Worker>>,
}

impl CameraMonitor {
    pub fn new(
        config: MonitorConfig,
        enumerator: Arc<dyn DeviceEnumerator>,
        registry: Arc<CameraRegistry>,
        bridge: EventBridge,
        strategy: Arc<dyn MonitorLoop>,
    ) -> Self {
        Self {
            core: Arc::new(MonitorCore::new(config, enumerator, registry, bridge)),
            strategy,
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| {
            error!("Monitor worker mutex poisoned: {e}");
            e.into_inner()
        })
    }

    pub fn strategy(&self) -> MonitorStrategy {
        self.strategy.strategy()
    }

    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Starts the monitor thread. Starting a running monitor does nothing.
    ///
    /// Fails while a previous thread is still winding down after `stop`,
    /// the stop flag stays raised until that thread has exited.
    pub fn start(&self) -> OurResult<()> {
        let mut worker = self.worker();
        if let Some(current) = worker.as_ref() {
            let alive = !current.handle.is_finished();
            if current.stopping && (alive || current.done.is_none()) {
                warn!("Previous monitor thread has not stopped yet");
                return Err(OurError::Monitor(
                    "previous monitor thread is still stopping".to_string(),
                ));
            }
            if alive {
                warn!("Camera monitoring already running");
                return Ok(());
            }
        }
        if worker
            .take()
            .is_some_and(|previous| previous.handle.join().is_err())
        {
            error!("Monitor thread panicked");
        }

        self.core.stop.reset();
        *self.core.started_at() = Some(Utc::now());

        let core = self.core.clone();
        let strategy = self.strategy.clone();
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("camera-monitor".to_string())
            .spawn(move || {
                if !core.sleep(core.config.settle_delay) {
                    if let Err(e) = core.guarded("initial scan", || core.send_baseline()) {
                        error!("Initial camera scan failed: {e}");
                        core.record_error();
                    }
                    strategy.run(&core);
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| OurError::Monitor(format!("failed to spawn monitor thread: {e}")))?;

        *worker = Some(Worker {
            handle,
            done: Some(done_rx),
            stopping: false,
        });
        info!(
            "Camera monitoring started ({:?} strategy)",
            self.strategy.strategy()
        );
        Ok(())
    }

    /// Asks the thread to exit and waits up to the configured stop timeout.
    /// Stopping a stopped monitor does nothing. A thread that outlives the
    /// wait is kept, so a later `stop` waits on it again.
    pub fn stop(&self) {
        let done = {
            let mut worker = self.worker();
            let Some(current) = worker.as_mut() else {
                debug!("Camera monitoring not running");
                return;
            };
            current.stopping = true;
            current.done.take()
        };

        info!("Stopping camera monitoring...");
        self.core.stop.request();

        let Some(done) = done else {
            debug!("Camera monitoring stop already in progress");
            return;
        };

        let timeout = self.core.config.stop_timeout;
        match done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("Monitor thread did not stop within {timeout:?}");
                if let Some(current) = self.worker().as_mut() {
                    current.done = Some(done);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let finished = self.worker().take();
                if finished.is_some_and(|worker| worker.handle.join().is_err()) {
                    error!("Monitor thread panicked");
                }
                let stats = self.stats();
                info!(
                    "Camera monitoring stopped after {:.1}s: {} cycles, {} events, {} errors",
                    stats.uptime_seconds.unwrap_or_default(),
                    stats.cycles,
                    stats.total_events,
                    stats.error_events
                );
            }
        }
    }

    /// Monitor's own view of known devices.
    pub fn current_cameras(&self) -> BTreeMap<String, CameraInfo> {
        self.core.reconciler().known()
    }

    pub fn camera(&self, device: &str) -> Option<CameraInfo> {
        self.core.reconciler().get(device)
    }

    /// Drops cached capabilities so the next detection queries the device.
    pub fn refresh_capabilities(&self, device: Option<&str>) {
        self.core.enumerator.invalidate(device);
        match device {
            Some(device) => info!("Capability cache invalidated for {device}"),
            None => info!("Capability cache invalidated for all devices"),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        let counters = &self.core.counters;
        let started = *self.core.started_at();
        let known = self.current_cameras();
        MonitorStats {
            monitoring_started: started,
            uptime_seconds: started
                .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0),
            running: self.is_running(),
            cycles: counters.cycles.load(Ordering::Relaxed),
            total_events: counters.total_events.load(Ordering::Relaxed),
            connect_events: counters.connect_events.load(Ordering::Relaxed),
            disconnect_events: counters.disconnect_events.load(Ordering::Relaxed),
            error_events: counters.error_events.load(Ordering::Relaxed),
            detection_failures: counters.detection_failures.load(Ordering::Relaxed),
            current_cameras: known.len(),
            connected_cameras: known.values().filter(|info| info.connected()).count(),
            strategy: self.strategy.strategy(),
        }
    }
}

impl Drop for CameraMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds a monitor, choosing the event-driven loop when `hotplug` is
/// available and enabled, polling otherwise.
pub fn create_monitor(
    config: MonitorConfig,
    enumerator: Arc<dyn DeviceEnumerator>,
    registry: Arc<CameraRegistry>,
    bridge: EventBridge,
    hotplug: Option<Arc<dyn HotplugSource>>,
) -> CameraMonitor {
    let strategy: Arc<dyn MonitorLoop> = match hotplug {
        Some(source) if config.use_event_driven => Arc::new(HotplugLoop::new(source)),
        _ => {
            if config.use_event_driven {
                info!("Hotplug notifications unavailable, falling back to polling");
            }
            Arc::new(PollingLoop)
        }
    };
    CameraMonitor::new(config, enumerator, registry, bridge, strategy)
}

/// Enumerator backed by `v4l2-ctl` and the filesystem.
pub fn v4l2_enumerator(config: &MonitorConfig) -> Arc<dyn DeviceEnumerator> {
    let detector = Arc::new(CapabilityDetector::with_command_runner(DetectionConfig::from(
        config,
    )));
    Arc::new(ScanningEnumerator::new(
        V4l2Probe::new(detector),
        config.device_range,
        config.enable_capability_detection,
    ))
}

/// Monitor wired to the real system: `v4l2-ctl` detection and, when
/// `udevadm` is present and enabled, hotplug notifications.
pub fn system_monitor(
    config: MonitorConfig,
    registry: Arc<CameraRegistry>,
    bridge: EventBridge,
) -> CameraMonitor {
    let enumerator = v4l2_enumerator(&config);
    let hotplug = if config.use_event_driven {
        UdevadmSource::detect(&CommandRunner).map(|source| Arc::new(source) as Arc<dyn HotplugSource>)
    } else {
        None
    };
    create_monitor(config, enumerator, registry, bridge, hotplug)
}
