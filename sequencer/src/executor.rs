//! Scan execution engine
//!
//! The [`ScanExecutor`] drains a [`ScanQueue`], running every scan through an
//! ordered series of gates. A gate either lets the scan continue or fails it
//! with a reason; failures are recorded on the scan and the executor moves on.
//! The one exception is a staged replacement queue, which ends the current
//! pass so the outer loop can pick up the new schedule.
//!
//! Gate order per scan:
//!  1. replacement queue staged
//!  2. scan still New
//!  3. start-time policy
//!  4. dome / roof readiness
//!  5. safety monitors
//!  6. sun altitude
//!  7. periodic autofocus (best effort)
//!  8. cooler temperature (wait only)
//!  9. pointing: skip, slew or reposition
//! 10. filter, binning, subframe and readout
//! 11. tracking rates and settle
//! 12. derotation
//! 13. expose
//! 14. save, or save and plate solve in the background
//! 15. done

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{secs, DomeMode, RunConfig, StartTimePolicy};
use crate::coords::{self, SkyPosition};
use crate::devices::{AutofocusParams, FrameMetadata, FrameType, ImageSink, ShutterState, SolveHints, Subframe};
use crate::error::{SequencerError, SequencerResult};
use crate::observatory::Observatory;
use crate::pollers::{BackgroundPollers, SafetyFaultHandler};
use crate::postprocess::{AsyncPostProcessor, PostProcessJob};
use crate::queue::{write_queue, QueueHandle, RequestedPixel, ScanQueue, ScanRequest, ScanStatus};
use crate::report::{RunSummary, ScanOutcome};
use crate::repositioning::{RepositioningRequest, RepositioningSession};
use crate::status::{Instrument, StatusEntry, StatusRegistry, StatusWriter};
use crate::watchdog::Watchdog;

/// Event emitted by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutorEvent {
    QueueLoaded { schedule_id: Uuid, scans: usize },
    QueueReplaced { schedule_id: Uuid },
    ScanStarted { index: usize, name: String },
    ScanFinished { name: String, status: ScanStatus, message: Option<String> },
    AutofocusCompleted { position: Option<i32> },
    Repositioned { name: String, converged: bool, attempts: u32 },
    ExposureCompleted { name: String, frame: u32, total: u32 },
    SafetyFault { readings: Vec<bool> },
    RunFinished { done: usize, failed: usize },
}

/// How one pass over a queue ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every scan was processed
    Finished,
    /// A replacement queue was staged
    Preempted,
    /// The run was stopped
    Stopped,
}

/// Why a scan failed
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFailure {
    pub reason: String,
    /// False when the scan's stored status must be left alone
    persist: bool,
}

impl ScanFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            persist: true,
        }
    }

    fn from_error(context: &str, error: SequencerError) -> Self {
        if error.is_cancelled() {
            Self::new("interrupted")
        } else {
            Self::new(format!("{}: {}", context, error))
        }
    }
}

type ScanResult = Result<(), ScanFailure>;

/// What a scan achieved, whether or not it finished
#[derive(Debug, Default)]
struct ScanProgress {
    exposures: u32,
    filter: Option<String>,
    centered: Option<bool>,
}

/// Pointing state carried between scans
#[derive(Debug, Default)]
struct PointingMemory {
    /// Target of the last scan that completed, and whether it was moving
    last_done: Option<(SkyPosition, bool)>,
    last_repositioned: Option<(SkyPosition, DateTime<Utc>)>,
}

impl PointingMemory {
    fn on_target(&self, target: &SkyPosition, moving: bool) -> bool {
        match &self.last_done {
            Some((last, last_moving)) => !moving && !last_moving && last == target,
            None => false,
        }
    }

    fn recently_repositioned(&self, target: &SkyPosition, now: DateTime<Utc>, max_age_secs: f64) -> bool {
        match &self.last_repositioned {
            Some((last, at)) => last == target && seconds_between(*at, now) < max_age_secs,
            None => false,
        }
    }

    fn forget(&mut self) {
        self.last_done = None;
        self.last_repositioned = None;
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// First position at or after `current` (circularly) whose filter is allowed.
/// An empty allow-list accepts every filter.
pub fn select_filter(names: &[String], allowed: &[String], current: usize) -> Option<usize> {
    let is_allowed = |i: usize| allowed.is_empty() || names.get(i).map(|n| allowed.contains(n)).unwrap_or(false);
    let n = names.len();
    if n == 0 {
        return None;
    }
    if current < n && is_allowed(current) {
        return Some(current);
    }
    ((current + 1)..n).chain(0..current.min(n)).find(|&i| is_allowed(i))
}

// =============================================================================
// INTERRUPTS AND CONTROL
// =============================================================================

/// Token of the scan in flight, shared with anything that may interrupt it
#[derive(Clone, Default)]
struct ScanInterrupt {
    current: Arc<Mutex<Option<CancellationToken>>>,
    tripped: Arc<AtomicBool>,
}

impl ScanInterrupt {
    fn set(&self, token: CancellationToken) {
        if let Ok(mut slot) = self.current.lock() {
            *slot = Some(token);
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.current.lock() {
            *slot = None;
        }
    }

    /// Cancel the scan in flight, if any
    fn interrupt(&self) -> bool {
        match self.current.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Interrupt because the observatory was shut down underneath the run
    fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    fn take_tripped(&self) -> bool {
        self.tripped.swap(false, Ordering::SeqCst)
    }
}

/// Interrupts the scan in flight and shuts the observatory down
struct InterruptAndShutdown {
    observatory: Arc<Observatory>,
    interrupt: ScanInterrupt,
    events: broadcast::Sender<ExecutorEvent>,
}

#[async_trait]
impl SafetyFaultHandler for InterruptAndShutdown {
    async fn on_unsafe(&self, readings: &[bool]) {
        tracing::error!("Unsafe conditions {:?}: interrupting current scan and shutting down", readings);
        let _ = self.events.send(ExecutorEvent::SafetyFault {
            readings: readings.to_vec(),
        });
        self.interrupt.trip();
        self.observatory.shutdown().await;
    }
}

/// Control surface for a running executor
#[derive(Clone)]
pub struct ExecutorHandle {
    queue: QueueHandle,
    interrupt: ScanInterrupt,
    stop: CancellationToken,
    events: broadcast::Sender<ExecutorEvent>,
    registry: StatusRegistry,
}

impl ExecutorHandle {
    /// Replace the active queue once the scan in flight finishes
    pub fn stage_queue(&self, queue: ScanQueue) {
        self.queue.stage(queue);
    }

    /// Fail the scan in flight; returns false if no scan is running
    pub fn interrupt_scan(&self) -> bool {
        self.interrupt.interrupt()
    }

    /// End the run after interrupting the scan in flight
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> std::collections::BTreeMap<Instrument, StatusEntry> {
        self.registry.snapshot()
    }
}

/// Status keys the executor writes while driving a scan
struct ExecutorStatus {
    telescope: StatusWriter,
    camera: StatusWriter,
    filter_wheel: StatusWriter,
    focuser: StatusWriter,
    dome: StatusWriter,
    autofocus: StatusWriter,
    repositioning: StatusWriter,
}

impl ExecutorStatus {
    fn claim(registry: &StatusRegistry) -> SequencerResult<Self> {
        let status = Self {
            telescope: registry.claim(Instrument::Telescope)?,
            camera: registry.claim(Instrument::Camera)?,
            filter_wheel: registry.claim(Instrument::FilterWheel)?,
            focuser: registry.claim(Instrument::Focuser)?,
            dome: registry.claim(Instrument::Dome)?,
            autofocus: registry.claim(Instrument::Autofocus)?,
            repositioning: registry.claim(Instrument::Repositioning)?,
        };
        status.idle();
        Ok(status)
    }

    fn idle(&self) {
        for writer in [
            &self.telescope,
            &self.camera,
            &self.filter_wheel,
            &self.focuser,
            &self.dome,
            &self.autofocus,
            &self.repositioning,
        ] {
            writer.set("Idle");
        }
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

pub struct ScanExecutor {
    observatory: Arc<Observatory>,
    config: RunConfig,
    registry: StatusRegistry,
    sink: Arc<dyn ImageSink>,
    queue_handle: QueueHandle,
    stop: CancellationToken,
    interrupt: ScanInterrupt,
    events: broadcast::Sender<ExecutorEvent>,
    pollers: BackgroundPollers,
    post: AsyncPostProcessor,
    status: ExecutorStatus,
    memory: PointingMemory,
    last_autofocus: Option<DateTime<Utc>>,
    custom_rates: bool,
    summary: RunSummary,
}

impl ScanExecutor {
    pub fn new(observatory: Arc<Observatory>, config: RunConfig, sink: Arc<dyn ImageSink>) -> SequencerResult<Self> {
        config.validate()?;
        let registry = StatusRegistry::with_clock(observatory.clock.clone());
        let stop = CancellationToken::new();
        let (events, _) = broadcast::channel(256);

        let status = ExecutorStatus::claim(&registry)?;
        let pollers = BackgroundPollers::new(observatory.clone(), registry.clone(), config.pollers.clone(), &stop);
        let post = AsyncPostProcessor::new(observatory.plate_solver.clone(), sink.clone(), &registry, &stop)?;
        let summary = RunSummary::new(observatory.now());

        Ok(Self {
            observatory,
            config,
            registry,
            sink,
            queue_handle: QueueHandle::new(),
            stop,
            interrupt: ScanInterrupt::default(),
            events,
            pollers,
            post,
            status,
            memory: PointingMemory::default(),
            last_autofocus: None,
            custom_rates: false,
            summary,
        })
    }

    /// Feed queues from an existing handle, e.g. one a schedule watcher stages into
    pub fn with_queue_handle(mut self, handle: QueueHandle) -> Self {
        self.queue_handle = handle;
        self
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            queue: self.queue_handle.clone(),
            interrupt: self.interrupt.clone(),
            stop: self.stop.clone(),
            events: self.events.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    fn emit(&self, event: ExecutorEvent) {
        let _ = self.events.send(event);
    }

    fn hardware(&self, command: &str) -> Watchdog {
        Watchdog::new(command, self.config.hardware_timeout())
    }

    /// Stage `queue` and run until it is drained
    pub async fn run_queue(&mut self, queue: ScanQueue) -> RunSummary {
        self.queue_handle.stage(queue);
        self.run().await
    }

    /// Main loop: wait for a queue, drain it, restart on hot-reload, then
    /// shut the observatory down once a queue is drained or the run stopped.
    pub async fn run(&mut self) -> RunSummary {
        tracing::info!("Starting observing run");
        self.prepare().await;

        let mut first = true;
        loop {
            let Some(mut queue) = self.next_queue().await else {
                break;
            };
            if first {
                self.emit(ExecutorEvent::QueueLoaded {
                    schedule_id: queue.schedule_id,
                    scans: queue.len(),
                });
                first = false;
            } else {
                self.emit(ExecutorEvent::QueueReplaced {
                    schedule_id: queue.schedule_id,
                });
            }
            self.summary.schedule_id = Some(queue.schedule_id);

            match self.execute_queue(&mut queue).await {
                PassOutcome::Preempted => {
                    tracing::info!("New schedule staged, restarting with it");
                    continue;
                }
                PassOutcome::Finished => {
                    tracing::info!("Schedule {} finished", queue.schedule_id);
                    break;
                }
                PassOutcome::Stopped => {
                    tracing::info!("Run stopped");
                    break;
                }
            }
        }

        self.finish().await
    }

    async fn next_queue(&self) -> Option<ScanQueue> {
        loop {
            if let Some(queue) = self.queue_handle.take_staged() {
                return Some(queue);
            }
            tokio::select! {
                _ = self.stop.cancelled() => return None,
                _ = tokio::time::sleep(self.config.polling.queue()) => {}
            }
        }
    }

    async fn prepare(&mut self) {
        for (name, on) in self.observatory.switch_states().await {
            tracing::info!("Switch {}: {}", name, if on { "on" } else { "off" });
        }

        if self.config.initial_home && self.observatory.telescope.capabilities().can_find_home {
            self.status.telescope.set("Homing");
            let telescope = self.observatory.telescope.clone();
            if let Err(e) = self.hardware("find home").guard(&self.stop, telescope.find_home()).await {
                tracing::warn!("Initial homing failed: {}", e);
            }
            self.status.telescope.set("Idle");
        }

        if !self.config.autofocus.initial {
            self.last_autofocus = Some(self.observatory.now());
        }

        if self.config.pollers.enable_conditions_poller {
            if let Err(e) = self.pollers.start_conditions() {
                tracing::warn!("Could not start observing conditions poller: {}", e);
            }
        }
    }

    async fn finish(&mut self) -> RunSummary {
        self.pollers.stop_all().await;

        let drained = self.post.drain(secs(self.config.plate_solve.drain_timeout_secs)).await;
        if drained.abandoned > 0 {
            tracing::warn!("{} frames were left unsolved at shutdown", drained.abandoned);
        }

        self.summary.finished = Some(self.observatory.now());
        if let Err(e) = self.summary.write_to(&self.config.paths.reports) {
            tracing::error!("Could not write run summary: {}", e);
        }

        self.observatory.shutdown().await;
        self.status.idle();

        let done = self.summary.count(ScanStatus::Done);
        let failed = self.summary.count(ScanStatus::Failed);
        tracing::info!("Run finished: {} done, {} failed", done, failed);
        self.emit(ExecutorEvent::RunFinished { done, failed });
        self.summary.clone()
    }

    fn persist(&self, queue: &ScanQueue) {
        if !self.config.update_scan_status {
            return;
        }
        if let Some(path) = &queue.log_path {
            if let Err(e) = write_queue(path, queue) {
                tracing::error!("Failed to persist scan status to {}: {}", path.display(), e);
            }
        }
    }

    /// One pass over `queue`
    pub async fn execute_queue(&mut self, queue: &mut ScanQueue) -> PassOutcome {
        tracing::info!("Executing schedule {} ({} scans, {} pending)", queue.schedule_id, queue.len(), queue.pending());

        for index in 0..queue.len() {
            if self.stop.is_cancelled() {
                return PassOutcome::Stopped;
            }
            // Gate 1
            if self.queue_handle.has_staged() {
                tracing::info!("Replacement schedule staged, abandoning remaining {} scans", queue.len() - index);
                return PassOutcome::Preempted;
            }
            if self.interrupt.take_tripped() {
                self.memory.forget();
                self.custom_rates = false;
            }

            let scan = queue.scans[index].clone();
            let neighbors = queue.neighbors(index);
            tracing::info!("Processing scan {} of {}: {}", index + 1, queue.len(), scan.name);
            self.emit(ExecutorEvent::ScanStarted {
                index,
                name: scan.name.clone(),
            });

            let started = self.observatory.now();
            let token = self.stop.child_token();
            self.interrupt.set(token.clone());
            let mut progress = ScanProgress::default();
            let result = self.execute_scan(&scan, &neighbors, &token, &mut progress).await;
            self.interrupt.clear();
            self.pollers.stop_derotation().await;
            self.status.idle();

            let target = scan.target.map(|t| coords::frame_to_icrs(&t, scan.frame, &started));
            let (status, message) = match result {
                Ok(()) => {
                    tracing::info!("Scan {} done", scan.name);
                    if self.config.update_scan_status {
                        queue.scans[index].mark_done();
                    }
                    self.memory.last_done = target.map(|t| (t, scan.has_proper_motion()));
                    (ScanStatus::Done, None)
                }
                Err(failure) => {
                    tracing::warn!("Scan {} failed: {}", scan.name, failure.reason);
                    if self.config.update_scan_status && failure.persist {
                        queue.scans[index].mark_failed(failure.reason.clone());
                    }
                    self.memory.last_done = None;
                    (ScanStatus::Failed, Some(failure.reason))
                }
            };
            self.persist(queue);

            self.summary.record(ScanOutcome {
                scan_id: scan.id,
                name: scan.name.clone(),
                status,
                message: message.clone(),
                started,
                finished: self.observatory.now(),
                exposures: progress.exposures,
                filter: progress.filter,
                centered: progress.centered,
            });
            self.emit(ExecutorEvent::ScanFinished {
                name: scan.name,
                status,
                message,
            });
        }
        if self.queue_handle.has_staged() {
            tracing::info!("Replacement schedule staged during the last scan");
            return PassOutcome::Preempted;
        }
        PassOutcome::Finished
    }

    async fn execute_scan(
        &mut self,
        scan: &ScanRequest,
        neighbors: &(Option<String>, Option<String>),
        cancel: &CancellationToken,
        progress: &mut ScanProgress,
    ) -> ScanResult {
        // Gate 2
        if self.config.check_scan_status && !scan.is_new() {
            return Err(ScanFailure {
                reason: "already attempted".to_string(),
                persist: false,
            });
        }

        self.check_start_time(scan, cancel).await?;
        self.check_dome(cancel).await?;
        self.check_safety(cancel).await?;
        self.check_sun()?;
        self.maybe_autofocus(scan, cancel).await?;
        self.wait_for_cooler(cancel).await?;

        let pointing = match (scan.light, scan.target) {
            (true, Some(target)) => {
                let icrs = coords::frame_to_icrs(&target, scan.frame, &self.observatory.now());
                self.point(scan, &icrs, cancel, progress).await?;
                Some(icrs)
            }
            _ => None,
        };

        let subframe = self.configure_instrument(scan, cancel, progress).await?;

        if let Some(target) = pointing {
            self.track_and_settle(scan, &target, cancel).await?;
            if self.observatory.rotator.is_some() {
                if let Err(e) = self.pollers.start_derotation(target) {
                    tracing::warn!("Could not start derotation: {}", e);
                }
            }
        }

        self.take_exposures(scan, pointing, subframe, neighbors, cancel, progress).await
    }

    // =========================================================================
    // Gates 3 to 6: timing and environment
    // =========================================================================

    async fn check_start_time(&self, scan: &ScanRequest, cancel: &CancellationToken) -> ScanResult {
        let Some(start) = scan.start_time else {
            return Ok(());
        };
        let policy = self.config.start_time_policy;
        if policy == StartTimePolicy::Ignore {
            return Ok(());
        }

        let late = seconds_between(start, self.observatory.now());
        if late > self.config.max_lateness_secs {
            return Err(ScanFailure::new(format!(
                "exceeded max lateness ({:.0}s late, limit {:.0}s)",
                late, self.config.max_lateness_secs
            )));
        }

        if policy == StartTimePolicy::Strict {
            let lead = chrono::Duration::milliseconds((self.config.preslew_secs * 1000.0) as i64);
            self.wait_until(start - lead, "slew window", cancel).await?;
        }
        Ok(())
    }

    async fn wait_until(&self, when: DateTime<Utc>, what: &str, cancel: &CancellationToken) -> ScanResult {
        let remaining = seconds_between(self.observatory.now(), when);
        if remaining <= 0.0 {
            return Ok(());
        }
        tracing::info!("Waiting {:.1}s for {}", remaining, what);
        let interval = self.config.polling.start_time();
        loop {
            let remaining = seconds_between(self.observatory.now(), when);
            if remaining <= 0.0 {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanFailure::new("interrupted")),
                _ = tokio::time::sleep(interval.min(secs(remaining))) => {}
            }
        }
    }

    /// Run an observatory query under the hardware timeout
    async fn bounded<T>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        query: impl Future<Output = T>,
    ) -> SequencerResult<T> {
        self.hardware(command)
            .guard(cancel, async { Ok::<T, SequencerError>(query.await) })
            .await
    }

    async fn check_dome(&self, cancel: &CancellationToken) -> ScanResult {
        match self.config.dome_mode {
            DomeMode::None => Ok(()),
            DomeMode::Dome => self.check_shutter(cancel).await,
            DomeMode::SafetyMonitor => self.check_roof_monitor(cancel).await,
            DomeMode::Both => {
                self.check_roof_monitor(cancel).await?;
                self.check_shutter(cancel).await
            }
        }
    }

    async fn check_shutter(&self, cancel: &CancellationToken) -> ScanResult {
        let Some(dome) = &self.observatory.dome else {
            return Err(ScanFailure::new("dome mode requires a dome"));
        };
        if dome.capabilities().can_set_shutter {
            return Ok(());
        }
        match self.hardware("read shutter").guard(cancel, dome.shutter_status()).await {
            Ok(ShutterState::Open) => Ok(()),
            Ok(state) => {
                self.status.dome.set(format!("Shutter {:?}", state));
                Err(ScanFailure::new(format!("dome shutter is {:?} and cannot be opened", state)))
            }
            Err(e) => Err(ScanFailure::from_error("cannot read dome shutter", e)),
        }
    }

    async fn check_roof_monitor(&self, cancel: &CancellationToken) -> ScanResult {
        let reading = self
            .bounded("read roof monitor", cancel, self.observatory.first_monitor_safe())
            .await
            .map_err(|e| ScanFailure::from_error("roof monitor", e))?;
        match reading {
            Some(true) => Ok(()),
            Some(false) => Err(ScanFailure::new("Safety monitor indicates unsafe")),
            None => {
                tracing::warn!("Dome mode uses a safety monitor but none is configured, skipping roof check");
                Ok(())
            }
        }
    }

    async fn check_safety(&mut self, cancel: &CancellationToken) -> ScanResult {
        if !self.config.check_safety_monitors {
            return Ok(());
        }
        let safe = self
            .bounded("read safety monitors", cancel, self.observatory.is_safe())
            .await
            .map_err(|e| ScanFailure::from_error("unsafe", e))?;
        if !safe {
            return Err(ScanFailure::new("unsafe"));
        }
        if self.config.pollers.enable_safety_poller {
            let handler = Arc::new(InterruptAndShutdown {
                observatory: self.observatory.clone(),
                interrupt: self.interrupt.clone(),
                events: self.events.clone(),
            });
            if let Err(e) = self.pollers.start_safety(handler) {
                tracing::warn!("Could not start safety poller: {}", e);
            }
        }
        Ok(())
    }

    fn check_sun(&self) -> ScanResult {
        if !self.config.wait_for_sun {
            return Ok(());
        }
        let altitude = self.observatory.sun_altitude();
        if altitude > self.config.max_solar_elevation_deg {
            return Err(ScanFailure::new(format!(
                "sun above limit ({:.1} deg > {:.1} deg)",
                altitude, self.config.max_solar_elevation_deg
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Gates 7 and 8: focus and cooling
    // =========================================================================

    fn autofocus_due(&self, now: DateTime<Utc>) -> bool {
        let af = &self.config.autofocus;
        if !af.is_periodic() {
            return false;
        }
        match self.last_autofocus {
            None => af.initial,
            Some(last) => seconds_between(last, now) >= af.interval_secs,
        }
    }

    /// Move to an allowed filter if the current one is not allowed
    async fn select_allowed_filter(&self, allowed: &[String], cancel: &CancellationToken) -> SequencerResult<()> {
        if allowed.is_empty() {
            return Ok(());
        }
        let Some(current) = self.observatory.filter_position().await? else {
            return Ok(());
        };
        let names = self.observatory.filter_names();
        match select_filter(names, allowed, current) {
            Some(index) if index != current => {
                let name = names[index].clone();
                tracing::info!("Switching to allowed filter {}", name);
                self.status.filter_wheel.set(format!("Changing to {}", name));
                self.observatory.set_filter(&name, cancel).await
            }
            Some(_) => Ok(()),
            None => {
                tracing::warn!("None of the allowed filters {:?} are in the filter wheel", allowed);
                Ok(())
            }
        }
    }

    async fn maybe_autofocus(&mut self, scan: &ScanRequest, cancel: &CancellationToken) -> ScanResult {
        let now = self.observatory.now();
        if !self.autofocus_due(now)
            || !scan.interrupt_allowed
            || self.observatory.focuser.is_none()
            || self.observatory.autofocuser.is_none()
        {
            return Ok(());
        }

        tracing::info!("Autofocus is due");
        self.status.autofocus.set("Running");
        let af = self.config.autofocus.clone();
        let result = match self.select_allowed_filter(&af.filters, cancel).await {
            Ok(()) => {
                let params = AutofocusParams {
                    exposure_secs: af.exposure_secs,
                    midpoint: af.midpoint,
                    nsteps: af.nsteps,
                    step_size: af.step_size,
                    use_current_pointing: af.use_current_pointing,
                };
                self.observatory.run_autofocus(&params, af.timeout(), cancel).await
            }
            Err(e) => Err(e),
        };

        self.last_autofocus = Some(self.observatory.now());
        self.memory.forget();
        match result {
            Ok(position) => {
                match position {
                    Some(p) => tracing::info!("Autofocus complete, best focus at {}", p),
                    None => tracing::warn!("Autofocus did not find a focus position"),
                }
                self.status.autofocus.set("Idle");
                self.emit(ExecutorEvent::AutofocusCompleted { position });
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(ScanFailure::new("interrupted")),
            Err(e) => {
                tracing::warn!("Autofocus failed, continuing: {}", e);
                self.status.autofocus.set("Failed");
                Ok(())
            }
        }
    }

    async fn wait_for_cooler(&self, cancel: &CancellationToken) -> ScanResult {
        if !self.config.wait_for_cooldown {
            return Ok(());
        }
        let Some(setpoint) = self.observatory.settings.cooler_setpoint else {
            return Ok(());
        };
        let tolerance = self.observatory.settings.cooler_tolerance;
        let interval = self.config.polling.cooler();
        loop {
            let reading = self
                .hardware("read CCD temperature")
                .guard(cancel, self.observatory.camera.ccd_temperature())
                .await;
            match reading {
                Ok(t) if (t - setpoint).abs() <= tolerance => return Ok(()),
                Ok(t) => {
                    tracing::info!("Waiting for cooler: {:.1}C, target {:.1}C +/- {:.1}", t, setpoint, tolerance);
                    self.status.camera.set(format!("Cooling ({:.1}C)", t));
                }
                Err(e) if e.is_cancelled() => return Err(ScanFailure::new("interrupted")),
                Err(e) => {
                    tracing::warn!("Cannot read CCD temperature, not waiting for cooler: {}", e);
                    return Ok(());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanFailure::new("interrupted")),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    // =========================================================================
    // Gate 9: pointing
    // =========================================================================

    async fn point(
        &mut self,
        scan: &ScanRequest,
        target: &SkyPosition,
        cancel: &CancellationToken,
        progress: &mut ScanProgress,
    ) -> ScanResult {
        let slew = !self.memory.on_target(target, scan.has_proper_motion());

        let mut requested = scan.requested_pixel;
        if let Some(filter) = &scan.filter {
            if self.config.repositioning.required_filters.contains(filter) {
                requested = Some(RequestedPixel::Center);
            }
        }

        let Some(requested) = requested else {
            if slew {
                self.status.telescope.set(format!("Slewing to {}", scan.name));
                self.observatory
                    .slew_to(target, cancel)
                    .await
                    .map_err(|e| ScanFailure::from_error("slew failed", e))?;
            } else {
                tracing::info!("Already on target for {}, not slewing", scan.name);
            }
            return Ok(());
        };

        let now = self.observatory.now();
        if !slew && self.memory.recently_repositioned(target, now, self.config.repositioning.max_stability_secs) {
            tracing::info!("Target {} was centered recently, skipping repositioning", scan.name);
            progress.centered = Some(true);
            return Ok(());
        }

        self.select_allowed_filter(&self.config.repositioning.allowed_filters, cancel)
            .await
            .map_err(|e| ScanFailure::from_error("repositioning filter change failed", e))?;

        let caps = self.observatory.camera.capabilities();
        let pixel = match requested {
            RequestedPixel::Center => (caps.sensor_width as f64 / 2.0, caps.sensor_height as f64 / 2.0),
            RequestedPixel::At { x, y } => (x, y),
        };
        let request = RepositioningRequest {
            name: scan.name.clone(),
            target: *target,
            pixel,
            do_initial_slew: slew,
            extra_attempts: if slew { 0 } else { 1 },
        };

        self.status.telescope.set("Repositioning");
        self.status.camera.set("Repositioning");
        let outcome = {
            let session = RepositioningSession::new(&self.observatory, &self.config.repositioning)
                .with_sink(self.sink.as_ref())
                .with_status(&self.status.repositioning);
            session.run(&request, cancel).await
        };

        match outcome {
            Ok(report) => {
                progress.centered = Some(report.converged);
                if report.converged {
                    self.memory.last_repositioned = Some((*target, self.observatory.now()));
                } else {
                    tracing::warn!(
                        "Repositioning of {} did not converge after {} attempts, continuing uncentered",
                        scan.name,
                        report.attempts
                    );
                }
                self.emit(ExecutorEvent::Repositioned {
                    name: scan.name.clone(),
                    converged: report.converged,
                    attempts: report.attempts,
                });
                Ok(())
            }
            Err(e) => Err(ScanFailure::from_error("repositioning error", e)),
        }
    }

    // =========================================================================
    // Gate 10: instrument configuration
    // =========================================================================

    /// Validate and apply filter, binning, subframe and readout mode. Returns
    /// the subframe actually applied.
    async fn configure_instrument(
        &self,
        scan: &ScanRequest,
        cancel: &CancellationToken,
        progress: &mut ScanProgress,
    ) -> Result<Subframe, ScanFailure> {
        if let Some(filter) = &scan.filter {
            if self.observatory.filter_wheel.is_none() {
                return Err(ScanFailure::new(format!("filter {} requested but there is no filter wheel", filter)));
            }
            if !self.observatory.filter_names().contains(filter) {
                return Err(ScanFailure::new(format!("filter {} is not in the filter wheel", filter)));
            }
            self.status.filter_wheel.set(format!("Changing to {}", filter));
            self.status.focuser.set("Applying filter offset");
            self.observatory
                .set_filter(filter, cancel)
                .await
                .map_err(|e| ScanFailure::from_error("filter change failed", e))?;
            self.status.filter_wheel.set("Idle");
            self.status.focuser.set("Idle");
        }
        progress.filter = match self.observatory.current_filter().await {
            Ok(current) => current,
            Err(_) => scan.filter.clone(),
        };

        let caps = self.observatory.camera.capabilities();
        let bin = scan.binning;
        if bin.x < 1 || bin.x > caps.max_bin_x {
            return Err(ScanFailure::new(format!("binning x {} outside 1..={}", bin.x, caps.max_bin_x)));
        }
        if bin.y < 1 || bin.y > caps.max_bin_y {
            return Err(ScanFailure::new(format!("binning y {} outside 1..={}", bin.y, caps.max_bin_y)));
        }
        if bin.x != bin.y && !caps.can_asymmetric_bin {
            return Err(ScanFailure::new(format!(
                "asymmetric binning {}x{} is not supported",
                bin.x, bin.y
            )));
        }

        let binned_w = caps.sensor_width / bin.x;
        let binned_h = caps.sensor_height / bin.y;
        let sub = scan.subframe;
        let width = if sub.width == 0 { binned_w.saturating_sub(sub.start_x) } else { sub.width };
        let height = if sub.height == 0 { binned_h.saturating_sub(sub.start_y) } else { sub.height };
        if width == 0 || sub.start_x + width > binned_w {
            return Err(ScanFailure::new(format!(
                "subframe x {}+{} exceeds binned width {}",
                sub.start_x, width, binned_w
            )));
        }
        if height == 0 || sub.start_y + height > binned_h {
            return Err(ScanFailure::new(format!(
                "subframe y {}+{} exceeds binned height {}",
                sub.start_y, height, binned_h
            )));
        }

        let readout = scan.readout_mode.unwrap_or(self.config.default_readout);
        if readout >= caps.readout_modes.len() {
            return Err(ScanFailure::new(format!(
                "readout mode {} not available, camera has {} modes",
                readout,
                caps.readout_modes.len()
            )));
        }

        let applied = Subframe {
            start_x: sub.start_x,
            start_y: sub.start_y,
            width,
            height,
        };
        let camera = self.observatory.camera.clone();
        self.hardware("set binning")
            .guard(cancel, camera.set_binning(bin))
            .await
            .map_err(|e| ScanFailure::from_error("camera configuration failed", e))?;
        self.hardware("set subframe")
            .guard(cancel, camera.set_subframe(applied))
            .await
            .map_err(|e| ScanFailure::from_error("camera configuration failed", e))?;
        self.hardware("set readout mode")
            .guard(cancel, camera.set_readout_mode(readout))
            .await
            .map_err(|e| ScanFailure::from_error("camera configuration failed", e))?;
        Ok(applied)
    }

    // =========================================================================
    // Gate 11: tracking
    // =========================================================================

    async fn track_and_settle(&mut self, scan: &ScanRequest, target: &SkyPosition, cancel: &CancellationToken) -> ScanResult {
        let telescope = self.observatory.telescope.clone();
        let caps = telescope.capabilities();

        let threshold = 2.0 * self.observatory.settings.pixel_scale_arcsec.0;
        let pm = scan.pm_ra_cosdec.hypot(scan.pm_dec);
        if pm > threshold {
            let (ra_rate, dec_rate) = coords::non_sidereal_rates(scan.pm_ra_cosdec, scan.pm_dec, target.dec_deg);
            if caps.can_set_ra_rate && caps.can_set_dec_rate {
                tracing::info!(
                    "Proper motion {:.2} arcsec/hr exceeds {:.2}, tracking at RA {:.6} Dec {:.6}",
                    pm,
                    threshold,
                    ra_rate,
                    dec_rate
                );
                self.hardware("set tracking rates")
                    .guard(cancel, telescope.set_tracking_rates(ra_rate, dec_rate))
                    .await
                    .map_err(|e| ScanFailure::from_error("non-sidereal tracking failed", e))?;
                self.custom_rates = true;
            } else {
                tracing::warn!("Mount cannot set custom rates, tracking {} sidereally", scan.name);
            }
        } else if self.custom_rates {
            self.hardware("reset tracking rates")
                .guard(cancel, telescope.set_tracking_rates(0.0, 0.0))
                .await
                .map_err(|e| ScanFailure::from_error("resetting tracking rates failed", e))?;
            self.custom_rates = false;
        }

        if caps.can_set_tracking {
            self.hardware("enable tracking")
                .guard(cancel, telescope.set_tracking(true))
                .await
                .map_err(|e| ScanFailure::from_error("enabling tracking failed", e))?;
        }
        self.status.telescope.set("Tracking");

        let settle = secs(self.observatory.settings.settle_time_secs);
        if !settle.is_zero() {
            tracing::debug!("Settling for {:.1}s", settle.as_secs_f64());
            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanFailure::new("interrupted")),
                _ = tokio::time::sleep(settle) => {}
            }
        }
        Ok(())
    }

    // =========================================================================
    // Gates 13 and 14: expose and persist
    // =========================================================================

    async fn take_exposures(
        &mut self,
        scan: &ScanRequest,
        target: Option<SkyPosition>,
        subframe: Subframe,
        neighbors: &(Option<String>, Option<String>),
        cancel: &CancellationToken,
        progress: &mut ScanProgress,
    ) -> ScanResult {
        let total = scan.exposure_count.max(1);
        for frame in 1..=total {
            self.status.focuser.set("Waiting for motion");
            self.observatory
                .wait_for_focuser_and_dome(cancel)
                .await
                .map_err(|e| ScanFailure::from_error("waiting for focuser and dome failed", e))?;
            self.status.focuser.set("Idle");

            if frame == 1 && self.config.start_time_policy == StartTimePolicy::Strict {
                if let Some(start) = scan.start_time {
                    self.wait_until(start, "scan start", cancel).await?;
                }
            }

            self.status.camera.set(format!("Exposing {} ({}/{})", scan.name, frame, total));
            let image = self
                .observatory
                .expose(scan.exposure_secs, scan.light, cancel)
                .await
                .map_err(|e| ScanFailure::from_error("exposure failed", e))?;
            self.status.camera.set("Saving");

            let metadata = self
                .frame_metadata(scan, target, subframe, neighbors, progress, cancel)
                .await;
            let file_name = if total > 1 {
                format!("{}_{}.fits", scan.file_stem(), frame)
            } else {
                format!("{}.fits", scan.file_stem())
            };
            let dest: PathBuf = self.config.paths.images.join(&file_name);

            let solve = scan.light
                && self.observatory.plate_solver.is_some()
                && self.config.plate_solve.applies_to(progress.filter.as_deref());
            if solve {
                let saved = self.config.paths.temp.join(&file_name);
                self.sink
                    .save(&image, &metadata, &saved)
                    .await
                    .map_err(|e| ScanFailure::new(format!("failed to save image: {}", e)))?;
                self.post.submit(PostProcessJob {
                    scan_name: scan.name.clone(),
                    image,
                    saved,
                    dest,
                    hints: SolveHints {
                        center: target,
                        scale_arcsec: Some(self.observatory.settings.pixel_scale_arcsec.0 * scan.binning.x as f64),
                        timeout: secs(self.config.plate_solve.timeout_secs),
                    },
                });
            } else {
                self.sink
                    .save(&image, &metadata, &dest)
                    .await
                    .map_err(|e| ScanFailure::new(format!("failed to save image: {}", e)))?;
            }

            progress.exposures += 1;
            self.emit(ExecutorEvent::ExposureCompleted {
                name: scan.name.clone(),
                frame,
                total,
            });
        }
        Ok(())
    }

    async fn frame_metadata(
        &self,
        scan: &ScanRequest,
        target: Option<SkyPosition>,
        subframe: Subframe,
        neighbors: &(Option<String>, Option<String>),
        progress: &ScanProgress,
        cancel: &CancellationToken,
    ) -> FrameMetadata {
        let now = self.observatory.now();
        let achieved = match target {
            Some(_) => {
                let frame = self.observatory.telescope_frame().await;
                self.hardware("read coordinates")
                    .guard(cancel, self.observatory.telescope.coordinates())
                    .await
                    .ok()
                    .map(|pos| coords::frame_to_icrs(&pos, frame, &now))
            }
            None => None,
        };
        let focuser_position = match &self.observatory.focuser {
            Some(focuser) => self
                .hardware("read focuser position")
                .guard(cancel, focuser.position())
                .await
                .ok(),
            None => None,
        };
        FrameMetadata {
            scan_id: scan.id.to_string(),
            scan_name: scan.name.clone(),
            frame_type: if scan.light { FrameType::Light } else { FrameType::Dark },
            exposure_secs: scan.exposure_secs,
            requested: target,
            achieved,
            filter: progress.filter.clone(),
            binning: scan.binning,
            subframe,
            readout_mode: scan.readout_mode.unwrap_or(self.config.default_readout),
            ccd_temperature: self
                .hardware("read CCD temperature")
                .guard(cancel, self.observatory.camera.ccd_temperature())
                .await
                .ok(),
            focuser_position,
            centered: progress.centered.unwrap_or(false),
            previous_scan: neighbors.0.clone(),
            next_scan: neighbors.1.clone(),
            observed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutofocusConfig, PollIntervals, PollerConfig};
    use crate::devices::Clock;
    use crate::observatory::HardwareTiming;
    use crate::queue::{ScheduleStore, ScheduleWatcher};
    use crate::sim::{SimPlateSolver, SimRig};
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> RunConfig {
        let mut config = RunConfig {
            initial_home: false,
            preslew_secs: 0.0,
            autofocus: AutofocusConfig {
                interval_secs: 0.0,
                ..AutofocusConfig::default()
            },
            pollers: PollerConfig {
                enable_safety_poller: false,
                enable_conditions_poller: false,
                ..PollerConfig::default()
            },
            polling: PollIntervals {
                motion_secs: 0.005,
                image_ready_secs: 0.005,
                cooler_secs: 0.005,
                start_time_secs: 0.005,
                queue_secs: 0.005,
            },
            ..RunConfig::default()
        };
        config.paths.reports = dir.join("reports");
        config.plate_solve.drain_timeout_secs = 2.0;
        config
    }

    fn executor(rig: &SimRig, config: RunConfig) -> ScanExecutor {
        ScanExecutor::new(Arc::new(rig.observatory()), config, rig.sink.clone()).unwrap()
    }

    #[test]
    fn test_select_filter_is_circular() {
        let names: Vec<String> = ["L", "V", "R", "B"].iter().map(|s| s.to_string()).collect();
        let allowed = vec!["L".to_string()];
        assert_eq!(select_filter(&names, &allowed, 0), Some(0));
        assert_eq!(select_filter(&names, &allowed, 2), Some(0));
        let allowed = vec!["V".to_string(), "B".to_string()];
        assert_eq!(select_filter(&names, &allowed, 2), Some(3));
        assert_eq!(select_filter(&names, &allowed, 3), Some(3));
        assert_eq!(select_filter(&names, &[], 1), Some(1));
        assert_eq!(select_filter(&names, &["Ha".to_string()], 1), None);
    }

    #[tokio::test]
    async fn test_each_scan_gets_one_terminal_status() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let target = rig.position_at_altitude(60.0);

        let mut already = ScanRequest::dark("old", 1.0);
        already.mark_done();
        let queue = ScanQueue::new(vec![
            ScanRequest::light("a", target, 0.01).with_filter("R"),
            ScanRequest::light("b", target, 0.01).with_binning(9, 9),
            already,
            ScanRequest::dark("d", 0.01),
        ]);

        let summary = exec.run_queue(queue).await;
        let statuses: Vec<_> = summary.outcomes.iter().map(|o| (o.name.as_str(), o.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("a", ScanStatus::Done),
                ("b", ScanStatus::Failed),
                ("old", ScanStatus::Failed),
                ("d", ScanStatus::Done),
            ]
        );
        assert_eq!(summary.outcomes[2].message.as_deref(), Some("already attempted"));
        assert_eq!(rig.sink.saved().len(), 2);
        assert!(dir.path().join("reports").join(summary.file_name()).exists());
        // run ends with an orderly shutdown
        assert!(rig.telescope.parked_now());
    }

    #[tokio::test]
    async fn test_statuses_persist_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("d1", 0.01), ScanRequest::dark("d2", 0.01).with_readout_mode(7)]);
        let log = dir.path().join("log.json");
        queue.log_path = Some(log.clone());

        let outcome = exec.execute_queue(&mut queue).await;
        assert_eq!(outcome, PassOutcome::Finished);
        let persisted = crate::queue::read_queue(&log).unwrap();
        assert_eq!(persisted.scans[0].status, ScanStatus::Done);
        assert_eq!(persisted.scans[1].status, ScanStatus::Failed);
        assert!(persisted.scans[1].status_message.as_deref().unwrap().contains("readout mode 7"));
    }

    #[tokio::test]
    async fn test_watcher_feeds_executor_and_log_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let store = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        let published_at = rig.clock.now() - chrono::Duration::minutes(5);
        store
            .publish(&ScanQueue::new(vec![ScanRequest::dark("d1", 0.01), ScanRequest::dark("d2", 0.01)]), &published_at)
            .unwrap();

        let handle = QueueHandle::new();
        let mut watcher = ScheduleWatcher::new(store, handle.clone(), Duration::from_millis(5));
        assert!(watcher.check_once(&rig.clock.now()).unwrap());

        let mut exec = executor(&rig, test_config(dir.path())).with_queue_handle(handle);
        let summary = exec.run().await;
        assert_eq!(summary.count(ScanStatus::Done), 2);

        // a restart reloads the log, so nothing is executed twice
        let reloaded = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        let path = reloaded.newest_schedule(&rig.clock.now()).unwrap().unwrap();
        let queue = reloaded.load(&path).unwrap();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_hot_reload_skips_rest_of_old_queue() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.camera.set_ready_delay(Duration::from_millis(50));
        let mut exec = executor(&rig, test_config(dir.path()));
        let handle = exec.handle();
        let mut events = exec.subscribe();

        let old = ScanQueue::new((0..4).map(|i| ScanRequest::dark(format!("old{}", i), 0.01)).collect());
        let replacement = ScanQueue::new(vec![ScanRequest::dark("new0", 0.01)]);

        let stager = tokio::spawn(async move {
            // stage while the first old scan is exposing
            while let Ok(event) = events.recv().await {
                if let ExecutorEvent::ScanStarted { name, .. } = event {
                    if name == "old0" {
                        handle.stage_queue(replacement);
                        break;
                    }
                }
            }
        });

        let summary = exec.run_queue(old).await;
        stager.await.unwrap();
        let names: Vec<_> = summary.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["old0", "new0"]);
        assert_eq!(summary.outcomes[0].status, ScanStatus::Done);
    }

    #[tokio::test]
    async fn test_queue_staged_during_last_scan_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.camera.set_ready_delay(Duration::from_millis(50));
        let mut exec = executor(&rig, test_config(dir.path()));
        let handle = exec.handle();
        let mut events = exec.subscribe();

        let old = ScanQueue::new(vec![ScanRequest::dark("only", 0.01)]);
        let replacement = ScanQueue::new(vec![ScanRequest::dark("new0", 0.01)]);

        let stager = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let ExecutorEvent::ScanStarted { name, .. } = event {
                    if name == "only" {
                        handle.stage_queue(replacement);
                        break;
                    }
                }
            }
        });

        let summary = exec.run_queue(old).await;
        stager.await.unwrap();
        let names: Vec<_> = summary.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["only", "new0"]);
        assert_eq!(summary.count(ScanStatus::Done), 2);
        assert!(!exec.queue_handle.has_staged());
    }

    #[tokio::test]
    async fn test_proper_motion_engages_non_sidereal_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let target = rig.position_at_altitude(55.0);
        let mut queue = ScanQueue::new(vec![ScanRequest::light("asteroid", target, 0.01).with_proper_motion(3.0, 0.0)]);

        exec.execute_queue(&mut queue).await;
        assert_eq!(queue.scans[0].status, ScanStatus::Done);
        let (ra_rate, dec_rate) = rig.telescope.rates_now();
        assert!(ra_rate > 0.0);
        assert_eq!(dec_rate, 0.0);
        assert!(rig.telescope.tracking_now());
    }

    #[tokio::test]
    async fn test_slow_mover_tracks_sidereally() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let target = rig.position_at_altitude(55.0);
        let mut queue = ScanQueue::new(vec![ScanRequest::light("slow", target, 0.01).with_proper_motion(1.0, 1.0)]);

        exec.execute_queue(&mut queue).await;
        assert_eq!(rig.telescope.rates_now(), (0.0, 0.0));
    }

    #[tokio::test]
    async fn test_safety_monitor_dome_mode_fails_without_slewing() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.safety.set_safe(false);
        let mut config = test_config(dir.path());
        config.dome_mode = DomeMode::SafetyMonitor;
        let mut exec = executor(&rig, config);
        let target = rig.position_at_altitude(60.0);
        let mut queue = ScanQueue::new(vec![ScanRequest::light("a", target, 0.01), ScanRequest::light("b", target, 0.01)]);

        let outcome = exec.execute_queue(&mut queue).await;
        assert_eq!(outcome, PassOutcome::Finished);
        for scan in &queue.scans {
            assert_eq!(scan.status, ScanStatus::Failed);
            assert_eq!(scan.status_message.as_deref(), Some("Safety monitor indicates unsafe"));
        }
        assert_eq!(rig.telescope.slew_count(), 0);
        assert!(rig.camera.exposures().is_empty());
    }

    #[tokio::test]
    async fn test_hung_safety_monitor_fails_scan_within_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.safety.set_hung(true);
        let mut config = test_config(dir.path());
        config.hardware_timeout_secs = 0.2;
        let mut exec = executor(&rig, config);
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("d", 0.01)]);

        let outcome = tokio::time::timeout(Duration::from_secs(3), exec.execute_queue(&mut queue))
            .await
            .expect("executor blocked on a hung safety monitor");
        assert_eq!(outcome, PassOutcome::Finished);
        assert_eq!(queue.scans[0].status, ScanStatus::Failed);
        let message = queue.scans[0].status_message.as_deref().unwrap();
        assert!(message.starts_with("unsafe"), "{}", message);
        assert!(rig.camera.exposures().is_empty());
    }

    #[tokio::test]
    async fn test_hung_roof_monitor_fails_scan_within_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.safety.set_hung(true);
        let observatory = rig.observatory().with_timing(HardwareTiming {
            timeout: Duration::from_millis(200),
            poll: Duration::from_millis(5),
        });
        let mut config = test_config(dir.path());
        config.dome_mode = DomeMode::SafetyMonitor;
        let mut exec = ScanExecutor::new(Arc::new(observatory), config, rig.sink.clone()).unwrap();
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("d", 0.01)]);

        tokio::time::timeout(Duration::from_secs(3), exec.execute_queue(&mut queue))
            .await
            .expect("executor blocked on a hung roof monitor");
        // an unreadable monitor counts as unsafe
        assert_eq!(queue.scans[0].status_message.as_deref(), Some("Safety monitor indicates unsafe"));
    }

    #[tokio::test]
    async fn test_safety_monitor_dome_mode_without_monitor_skips_roof_check() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let observatory = Observatory::new(rig.telescope.clone(), rig.camera.clone(), rig.settings.clone())
            .with_clock(rig.clock.clone())
            .with_timing(HardwareTiming {
                timeout: Duration::from_secs(5),
                poll: Duration::from_millis(5),
            });
        let mut config = test_config(dir.path());
        config.dome_mode = DomeMode::SafetyMonitor;
        let mut exec = ScanExecutor::new(Arc::new(observatory), config, rig.sink.clone()).unwrap();
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("d", 0.01)]);

        exec.execute_queue(&mut queue).await;
        assert_eq!(queue.scans[0].status, ScanStatus::Done);

        // status entries carry observatory time, not wall time
        let stamped = exec.registry().snapshot()[&Instrument::Camera].updated;
        assert!((stamped - rig.clock.now()).num_minutes().abs() < 1);
    }

    #[tokio::test]
    async fn test_closed_dome_that_cannot_open_fails_scan() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.dome.set_can_set_shutter(false);
        rig.dome.set_shutter(ShutterState::Closed);
        let mut config = test_config(dir.path());
        config.dome_mode = DomeMode::Dome;
        let mut exec = executor(&rig, config);
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("d", 0.01)]);

        exec.execute_queue(&mut queue).await;
        assert!(queue.scans[0].status_message.as_deref().unwrap().contains("Closed"));
    }

    #[tokio::test]
    async fn test_image_ready_timeout_fails_only_that_scan() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.camera.set_never_ready(true);
        let observatory = rig.observatory().with_timing(HardwareTiming {
            timeout: Duration::from_millis(50),
            poll: Duration::from_millis(5),
        });
        let mut exec = ScanExecutor::new(Arc::new(observatory), test_config(dir.path()), rig.sink.clone()).unwrap();
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("stuck", 0.01), ScanRequest::dark("next", 0.01)]);

        exec.execute_queue(&mut queue).await;
        assert_eq!(queue.scans[0].status, ScanStatus::Failed);
        assert!(queue.scans[0].status_message.as_deref().unwrap().contains("timeout"));
        // the executor moved on; the second scan hit the same camera fault
        assert_eq!(queue.scans[1].status, ScanStatus::Failed);
        assert_eq!(rig.camera.exposures().len(), 2);
    }

    #[tokio::test]
    async fn test_instrument_validation() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let mut queue = ScanQueue::new(vec![
            ScanRequest::dark("asym", 0.01).with_binning(2, 1),
            ScanRequest::dark("zero", 0.01).with_binning(0, 0),
            ScanRequest::dark("sub", 0.01).with_binning(2, 2).with_subframe(Subframe {
                start_x: 1000,
                start_y: 0,
                width: 100,
                height: 100,
            }),
            ScanRequest::dark("filter", 0.01).with_filter("Ha"),
            ScanRequest::dark("ok", 0.01).with_binning(2, 2).with_readout_mode(1),
        ]);

        exec.execute_queue(&mut queue).await;
        let messages: Vec<_> = queue.scans.iter().map(|s| s.status_message.clone().unwrap_or_default()).collect();
        assert!(messages[0].contains("asymmetric"));
        assert!(messages[1].contains("binning x 0"));
        assert!(messages[2].contains("exceeds binned width 1024"));
        assert!(messages[3].contains("Ha"));
        assert_eq!(queue.scans[4].status, ScanStatus::Done);
        assert_eq!(rig.camera.readout_now(), 1);
    }

    #[tokio::test]
    async fn test_late_scan_fails_under_strict_and_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        for policy in [StartTimePolicy::Strict, StartTimePolicy::Ceiling] {
            let rig = SimRig::new();
            let mut config = test_config(dir.path());
            config.start_time_policy = policy;
            let mut exec = executor(&rig, config);
            let start = rig.clock.now() - chrono::Duration::seconds(1500);
            let mut queue = ScanQueue::new(vec![ScanRequest::dark("late", 0.01).with_start_time(start)]);
            exec.execute_queue(&mut queue).await;
            assert!(queue.scans[0].status_message.as_deref().unwrap().starts_with("exceeded max lateness"));
        }
    }

    #[tokio::test]
    async fn test_late_scan_runs_when_ignoring_start_times() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut config = test_config(dir.path());
        config.start_time_policy = StartTimePolicy::Ignore;
        let mut exec = executor(&rig, config);
        let start = rig.clock.now() - chrono::Duration::seconds(1500);
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("late", 0.01).with_start_time(start)]);
        exec.execute_queue(&mut queue).await;
        assert_eq!(queue.scans[0].status, ScanStatus::Done);
    }

    #[tokio::test]
    async fn test_strict_policy_waits_for_start() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let start = rig.clock.now() + chrono::Duration::milliseconds(150);
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("timed", 0.01).with_start_time(start)]);

        let began = std::time::Instant::now();
        exec.execute_queue(&mut queue).await;
        assert!(began.elapsed() >= Duration::from_millis(140));
        assert_eq!(queue.scans[0].status, ScanStatus::Done);
    }

    #[tokio::test]
    async fn test_sun_limit() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        // noon local time at the sim site
        rig.clock.advance(chrono::Duration::hours(13));
        let mut exec = executor(&rig, test_config(dir.path()));
        let mut queue = ScanQueue::new(vec![ScanRequest::dark("day", 0.01)]);
        exec.execute_queue(&mut queue).await;
        assert!(queue.scans[0].status_message.as_deref().unwrap().starts_with("sun above limit"));
    }

    #[tokio::test]
    async fn test_same_target_is_not_reslewed() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let target = rig.position_at_altitude(60.0);
        let other = rig.position_at_altitude(45.0);
        let mut queue = ScanQueue::new(vec![
            ScanRequest::light("a1", target, 0.01),
            ScanRequest::light("a2", target, 0.01),
            ScanRequest::light("b", other, 0.01),
        ]);
        exec.execute_queue(&mut queue).await;
        assert_eq!(rig.telescope.slew_count(), 2);
    }

    #[tokio::test]
    async fn test_required_filter_triggers_repositioning() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let solver = SimPlateSolver::following(rig.telescope.clone(), (0.0, 20.0 / 3600.0), 1.0, (1024.0, 768.0));
        let rig = rig.with_solver(solver);
        let mut config = test_config(dir.path());
        config.repositioning.required_filters = vec!["R".to_string()];
        config.plate_solve.filters = vec!["B".to_string()];
        let mut exec = executor(&rig, config);
        let mut events = exec.subscribe();
        let target = rig.position_at_altitude(60.0);
        let mut queue = ScanQueue::new(vec![ScanRequest::light("centered", target, 0.01).with_filter("R")]);

        exec.execute_queue(&mut queue).await;
        assert_eq!(queue.scans[0].status, ScanStatus::Done);
        assert!(rig.telescope.slew_count() >= 2);
        let mut repositioned = None;
        while let Ok(event) = events.try_recv() {
            if let ExecutorEvent::Repositioned { converged, .. } = event {
                repositioned = Some(converged);
            }
        }
        assert_eq!(repositioned, Some(true));
        let saved = rig.sink.saved();
        let (_, metadata) = saved.last().unwrap();
        assert!(metadata.centered);
    }

    #[tokio::test]
    async fn test_plate_solve_filter_goes_through_post_processor() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut config = test_config(dir.path());
        config.plate_solve.filters = vec!["V".to_string()];
        let mut exec = executor(&rig, config);
        let target = rig.position_at_altitude(60.0);
        let queue = ScanQueue::new(vec![
            ScanRequest::light("solved", target, 0.01).with_filter("V").with_exposure_count(2),
            ScanRequest::light("plain", target, 0.01).with_filter("R"),
        ]);

        exec.run_queue(queue).await;
        let saved: Vec<_> = rig.sink.saved().into_iter().map(|(p, _)| p).collect();
        assert_eq!(saved[0], PathBuf::from("images/temp/solved_1.fits"));
        assert_eq!(saved[1], PathBuf::from("images/temp/solved_2.fits"));
        assert_eq!(saved[2], PathBuf::from("images/plain.fits"));
        let finalized = rig.sink.finalized();
        assert_eq!(finalized.len(), 2);
        assert!(finalized.iter().all(|(_, _, wcs)| wcs.is_some()));
    }

    #[tokio::test]
    async fn test_autofocus_runs_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut config = test_config(dir.path());
        config.autofocus = AutofocusConfig {
            interval_secs: 3600.0,
            initial: true,
            filters: vec!["L".to_string()],
            ..AutofocusConfig::default()
        };
        rig.filter_wheel.set_position_now(2);
        let mut exec = executor(&rig, config);
        let mut queue = ScanQueue::new(vec![
            ScanRequest::dark("d1", 0.01),
            ScanRequest::dark("d2", 0.01),
            ScanRequest::dark("d3", 0.01).uninterruptible(),
        ]);

        exec.execute_queue(&mut queue).await;
        assert_eq!(rig.autofocuser.run_count(), 1);
        // wrapped around to L
        assert_eq!(rig.filter_wheel.position_now(), 0);
        assert!(queue.scans.iter().all(|s| s.status == ScanStatus::Done));
    }

    #[tokio::test]
    async fn test_safety_fault_interrupts_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        rig.camera.set_ready_delay(Duration::from_secs(5));
        let mut config = test_config(dir.path());
        config.pollers.enable_safety_poller = true;
        config.pollers.safety_interval_secs = 0.01;
        let mut exec = executor(&rig, config);
        let mut events = exec.subscribe();

        let safety = rig.safety.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            safety.set_safe(false);
        });

        let mut queue = ScanQueue::new(vec![ScanRequest::dark("long", 1.0), ScanRequest::dark("after", 0.01)]);
        let began = std::time::Instant::now();
        exec.execute_queue(&mut queue).await;

        assert!(began.elapsed() < Duration::from_secs(3));
        assert_eq!(queue.scans[0].status_message.as_deref(), Some("interrupted"));
        assert_eq!(queue.scans[1].status_message.as_deref(), Some("unsafe"));
        assert!(rig.camera.abort_count() >= 1);
        let mut faulted = false;
        while let Ok(event) = events.try_recv() {
            faulted |= matches!(event, ExecutorEvent::SafetyFault { .. });
        }
        assert!(faulted);
    }

    #[tokio::test]
    async fn test_handle_stop_ends_idle_run() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let mut exec = executor(&rig, test_config(dir.path()));
        let handle = exec.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.stop();
        });
        let summary = exec.run().await;
        assert!(summary.outcomes.is_empty());
        assert!(summary.finished.is_some());
    }

    #[tokio::test]
    async fn test_status_keys_owned_by_executor() {
        let dir = tempfile::tempdir().unwrap();
        let rig = SimRig::new();
        let exec = executor(&rig, test_config(dir.path()));
        assert!(exec.registry().claim(Instrument::Telescope).is_err());
        assert!(exec.registry().claim(Instrument::Wcs).is_err());
        assert_eq!(exec.handle().status().get(&Instrument::Camera).map(|e| e.status.as_str()), Some("Idle"));
    }
}
