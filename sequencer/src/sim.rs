//! Simulated instruments
//!
//! In-memory implementations of every facade, with knobs to inject faults and
//! counters to inspect what the sequencer commanded. Motions complete
//! instantly unless a delay is configured.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::coords::{self, EquatorialFrame, Site, SkyPosition};
use crate::devices::{
    Autofocuser, AutofocusParams, Binning, Camera, CameraCapabilities, Clock, CoverCalibrator,
    Dome, DomeCapabilities, FilterWheel, Focuser, FocuserCapabilities, FrameMetadata, ImageData,
    ImageSink, ObservingConditions, PlateSolver, Rotator, SafetyMonitor, ShutterState, SolveHints,
    Subframe, Telescope, TelescopeCapabilities,
};
use crate::error::{DeviceError, DeviceResult};
use crate::observatory::{HardwareTiming, Observatory, ObservatorySettings};
use crate::wcs::Wcs;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// CLOCK
// =============================================================================

/// Clock that starts at a chosen instant and then runs in real time
pub struct SimClock {
    epoch: DateTime<Utc>,
    started: std::time::Instant,
    offset: Mutex<chrono::Duration>,
}

impl SimClock {
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            started: std::time::Instant::now(),
            offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    /// Jump forward (or back, with a negative value)
    pub fn advance(&self, by: chrono::Duration) {
        *lock(&self.offset) += by;
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.epoch + elapsed + *lock(&self.offset)
    }
}

// =============================================================================
// TELESCOPE
// =============================================================================

#[derive(Debug)]
struct TelescopeState {
    position: SkyPosition,
    parked: bool,
    tracking: bool,
    rates: (f64, f64),
    frame: EquatorialFrame,
    slews: Vec<SkyPosition>,
    slew_delay: Duration,
}

pub struct SimTelescope {
    caps: TelescopeCapabilities,
    state: Mutex<TelescopeState>,
}

impl SimTelescope {
    pub fn new() -> Self {
        Self {
            caps: TelescopeCapabilities {
                can_slew: true,
                can_slew_async: true,
                can_park: true,
                can_unpark: true,
                can_find_home: true,
                can_set_tracking: true,
                can_set_ra_rate: true,
                can_set_dec_rate: true,
            },
            state: Mutex::new(TelescopeState {
                position: SkyPosition::new(0.0, 0.0),
                parked: false,
                tracking: false,
                rates: (0.0, 0.0),
                frame: EquatorialFrame::J2000,
                slews: Vec::new(),
                slew_delay: Duration::ZERO,
            }),
        }
    }

    pub fn set_parked(&self, parked: bool) {
        lock(&self.state).parked = parked;
    }

    pub fn set_frame(&self, frame: EquatorialFrame) {
        lock(&self.state).frame = frame;
    }

    /// Make every slew command take this long to return
    pub fn set_slew_delay(&self, delay: Duration) {
        lock(&self.state).slew_delay = delay;
    }

    pub fn parked_now(&self) -> bool {
        lock(&self.state).parked
    }

    pub fn tracking_now(&self) -> bool {
        lock(&self.state).tracking
    }

    pub fn rates_now(&self) -> (f64, f64) {
        lock(&self.state).rates
    }

    pub fn position_now(&self) -> SkyPosition {
        lock(&self.state).position
    }

    pub fn slew_count(&self) -> usize {
        lock(&self.state).slews.len()
    }

    pub fn slews(&self) -> Vec<SkyPosition> {
        lock(&self.state).slews.clone()
    }

    async fn do_slew(&self, target: SkyPosition) -> DeviceResult<()> {
        let delay = {
            let state = lock(&self.state);
            if state.parked {
                return Err(DeviceError::hardware("SimTelescope", "telescope is parked"));
            }
            state.slew_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        state.position = target;
        state.slews.push(target);
        tracing::debug!("[SIM] Telescope slewed to {:.4}h {:+.3}", target.ra_hours, target.dec_deg);
        Ok(())
    }
}

impl Default for SimTelescope {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Telescope for SimTelescope {
    fn capabilities(&self) -> TelescopeCapabilities {
        self.caps.clone()
    }

    async fn equatorial_frame(&self) -> DeviceResult<EquatorialFrame> {
        Ok(lock(&self.state).frame)
    }

    async fn coordinates(&self) -> DeviceResult<SkyPosition> {
        Ok(lock(&self.state).position)
    }

    async fn is_slewing(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn is_parked(&self) -> DeviceResult<bool> {
        Ok(lock(&self.state).parked)
    }

    async fn tracking(&self) -> DeviceResult<bool> {
        Ok(lock(&self.state).tracking)
    }

    async fn set_tracking(&self, enabled: bool) -> DeviceResult<()> {
        lock(&self.state).tracking = enabled;
        Ok(())
    }

    async fn slew_to_coordinates(&self, target: SkyPosition) -> DeviceResult<()> {
        self.do_slew(target).await
    }

    async fn slew_to_coordinates_async(&self, target: SkyPosition) -> DeviceResult<()> {
        self.do_slew(target).await
    }

    async fn abort_slew(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn park(&self) -> DeviceResult<()> {
        lock(&self.state).parked = true;
        Ok(())
    }

    async fn unpark(&self) -> DeviceResult<()> {
        lock(&self.state).parked = false;
        Ok(())
    }

    async fn find_home(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn set_tracking_rates(&self, ra_rate: f64, dec_rate: f64) -> DeviceResult<()> {
        lock(&self.state).rates = (ra_rate, dec_rate);
        Ok(())
    }
}

// =============================================================================
// CAMERA
// =============================================================================

#[derive(Debug)]
struct CameraState {
    exposures: Vec<(f64, bool)>,
    started: Option<std::time::Instant>,
    ready_delay: Duration,
    never_ready: bool,
    hung: bool,
    binning: Binning,
    subframe: Subframe,
    readout_mode: usize,
    ccd_temperature: f64,
    aborts: usize,
}

pub struct SimCamera {
    caps: CameraCapabilities,
    state: Mutex<CameraState>,
}

impl SimCamera {
    pub fn new() -> Self {
        Self {
            caps: CameraCapabilities {
                sensor_width: 2048,
                sensor_height: 1536,
                max_bin_x: 4,
                max_bin_y: 4,
                can_asymmetric_bin: false,
                can_abort_exposure: true,
                readout_modes: vec!["Fast".to_string(), "Slow".to_string()],
            },
            state: Mutex::new(CameraState {
                exposures: Vec::new(),
                started: None,
                ready_delay: Duration::ZERO,
                never_ready: false,
                hung: false,
                binning: Binning::default(),
                subframe: Subframe::default(),
                readout_mode: 0,
                ccd_temperature: -10.0,
                aborts: 0,
            }),
        }
    }

    /// Images become ready this long after the exposure starts
    pub fn set_ready_delay(&self, delay: Duration) {
        lock(&self.state).ready_delay = delay;
    }

    pub fn set_never_ready(&self, never: bool) {
        lock(&self.state).never_ready = never;
    }

    /// Readiness queries never return while set
    pub fn set_hung(&self, hung: bool) {
        lock(&self.state).hung = hung;
    }

    pub fn set_ccd_temperature(&self, celsius: f64) {
        lock(&self.state).ccd_temperature = celsius;
    }

    /// Light exposures taken so far
    pub fn light_count(&self) -> usize {
        lock(&self.state).exposures.iter().filter(|(_, light)| *light).count()
    }

    pub fn exposures(&self) -> Vec<(f64, bool)> {
        lock(&self.state).exposures.clone()
    }

    pub fn abort_count(&self) -> usize {
        lock(&self.state).aborts
    }

    pub fn binning_now(&self) -> Binning {
        lock(&self.state).binning
    }

    pub fn readout_now(&self) -> usize {
        lock(&self.state).readout_mode
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Camera for SimCamera {
    fn capabilities(&self) -> CameraCapabilities {
        self.caps.clone()
    }

    async fn start_exposure(&self, duration_secs: f64, light: bool) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.exposures.push((duration_secs, light));
        state.started = Some(std::time::Instant::now());
        Ok(())
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.aborts += 1;
        state.started = None;
        Ok(())
    }

    async fn image_ready(&self) -> DeviceResult<bool> {
        let (hung, ready) = {
            let state = lock(&self.state);
            let ready = !state.never_ready
                && state
                    .started
                    .map(|t| t.elapsed() >= state.ready_delay)
                    .unwrap_or(false);
            (state.hung, ready)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        Ok(ready)
    }

    async fn download_image(&self) -> DeviceResult<ImageData> {
        let state = lock(&self.state);
        let width = if state.subframe.width > 0 {
            state.subframe.width
        } else {
            self.caps.sensor_width / state.binning.x
        };
        let height = if state.subframe.height > 0 {
            state.subframe.height
        } else {
            self.caps.sensor_height / state.binning.y
        };
        Ok(ImageData {
            width,
            height,
            pixels: Vec::new(),
        })
    }

    async fn set_binning(&self, binning: Binning) -> DeviceResult<()> {
        lock(&self.state).binning = binning;
        Ok(())
    }

    async fn binning(&self) -> DeviceResult<Binning> {
        Ok(lock(&self.state).binning)
    }

    async fn set_subframe(&self, subframe: Subframe) -> DeviceResult<()> {
        lock(&self.state).subframe = subframe;
        Ok(())
    }

    async fn set_readout_mode(&self, index: usize) -> DeviceResult<()> {
        if index >= self.caps.readout_modes.len() {
            return Err(DeviceError::not_supported("SimCamera", format!("readout mode {}", index)));
        }
        lock(&self.state).readout_mode = index;
        Ok(())
    }

    async fn ccd_temperature(&self) -> DeviceResult<f64> {
        Ok(lock(&self.state).ccd_temperature)
    }

    async fn cooler_on(&self) -> DeviceResult<bool> {
        Ok(true)
    }
}

// =============================================================================
// FILTER WHEEL, FOCUSER, ROTATOR
// =============================================================================

pub struct SimFilterWheel {
    names: Vec<String>,
    position: AtomicUsize,
    moves: AtomicUsize,
}

impl SimFilterWheel {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            position: AtomicUsize::new(0),
            moves: AtomicUsize::new(0),
        }
    }

    pub fn position_now(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }

    pub fn set_position_now(&self, position: usize) {
        self.position.store(position, Ordering::SeqCst);
    }

    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilterWheel for SimFilterWheel {
    async fn names(&self) -> DeviceResult<Vec<String>> {
        Ok(self.names.clone())
    }

    async fn position(&self) -> DeviceResult<usize> {
        Ok(self.position_now())
    }

    async fn set_position(&self, position: usize) -> DeviceResult<()> {
        if position >= self.names.len() {
            return Err(DeviceError::hardware("SimFilterWheel", format!("no slot {}", position)));
        }
        self.position.store(position, Ordering::SeqCst);
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }
}

pub struct SimFocuser {
    position: Mutex<i32>,
}

impl SimFocuser {
    pub fn new(position: i32) -> Self {
        Self {
            position: Mutex::new(position),
        }
    }

    pub fn position_now(&self) -> i32 {
        *lock(&self.position)
    }
}

#[async_trait]
impl Focuser for SimFocuser {
    fn capabilities(&self) -> FocuserCapabilities {
        FocuserCapabilities::default()
    }

    async fn position(&self) -> DeviceResult<i32> {
        Ok(self.position_now())
    }

    async fn is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn move_to(&self, position: i32) -> DeviceResult<()> {
        *lock(&self.position) = position;
        Ok(())
    }

    async fn move_by(&self, steps: i32) -> DeviceResult<()> {
        *lock(&self.position) += steps;
        Ok(())
    }

    async fn halt(&self) -> DeviceResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct SimRotator {
    moves: Mutex<Vec<f64>>,
    halts: AtomicUsize,
}

impl SimRotator {
    pub fn moves(&self) -> Vec<f64> {
        lock(&self.moves).clone()
    }

    pub fn halt_count(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Rotator for SimRotator {
    async fn mechanical_position(&self) -> DeviceResult<f64> {
        Ok(lock(&self.moves).iter().sum::<f64>().rem_euclid(360.0))
    }

    async fn is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn move_by(&self, degrees: f64) -> DeviceResult<()> {
        lock(&self.moves).push(degrees);
        Ok(())
    }

    async fn halt(&self) -> DeviceResult<()> {
        self.halts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// ENCLOSURE AND ENVIRONMENT
// =============================================================================

pub struct SimDome {
    caps: Mutex<DomeCapabilities>,
    shutter: Mutex<ShutterState>,
}

impl SimDome {
    pub fn new() -> Self {
        Self {
            caps: Mutex::new(DomeCapabilities {
                can_set_shutter: true,
                can_park: true,
                can_find_home: true,
            }),
            shutter: Mutex::new(ShutterState::Open),
        }
    }

    pub fn set_shutter(&self, state: ShutterState) {
        *lock(&self.shutter) = state;
    }

    pub fn shutter_now(&self) -> ShutterState {
        *lock(&self.shutter)
    }

    pub fn set_can_set_shutter(&self, can: bool) {
        lock(&self.caps).can_set_shutter = can;
    }
}

impl Default for SimDome {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dome for SimDome {
    fn capabilities(&self) -> DomeCapabilities {
        lock(&self.caps).clone()
    }

    async fn shutter_status(&self) -> DeviceResult<ShutterState> {
        Ok(self.shutter_now())
    }

    async fn is_slewing(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn open_shutter(&self) -> DeviceResult<()> {
        self.set_shutter(ShutterState::Open);
        Ok(())
    }

    async fn close_shutter(&self) -> DeviceResult<()> {
        self.set_shutter(ShutterState::Closed);
        Ok(())
    }

    async fn abort_slew(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn park(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn find_home(&self) -> DeviceResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct SimCoverCalibrator {
    calls: Mutex<Vec<&'static str>>,
}

impl SimCoverCalibrator {
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl CoverCalibrator for SimCoverCalibrator {
    async fn calibrator_off(&self) -> DeviceResult<()> {
        lock(&self.calls).push("calibrator_off");
        Ok(())
    }

    async fn halt_cover(&self) -> DeviceResult<()> {
        lock(&self.calls).push("halt_cover");
        Ok(())
    }

    async fn close_cover(&self) -> DeviceResult<()> {
        lock(&self.calls).push("close_cover");
        Ok(())
    }
}

pub struct SimSafetyMonitor {
    safe: AtomicBool,
    hung: AtomicBool,
    reads: AtomicUsize,
}

impl SimSafetyMonitor {
    pub fn new(safe: bool) -> Self {
        Self {
            safe: AtomicBool::new(safe),
            hung: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn set_safe(&self, safe: bool) {
        self.safe.store(safe, Ordering::SeqCst);
    }

    /// Readings never return while set
    pub fn set_hung(&self, hung: bool) {
        self.hung.store(hung, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SafetyMonitor for SimSafetyMonitor {
    fn name(&self) -> String {
        "SimSafetyMonitor".to_string()
    }

    async fn is_safe(&self) -> DeviceResult<bool> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.hung.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.safe.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct SimObservingConditions {
    refreshes: AtomicUsize,
}

impl SimObservingConditions {
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObservingConditions for SimObservingConditions {
    async fn refresh(&self) -> DeviceResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn summary(&self) -> DeviceResult<String> {
        Ok("Clear, wind 2 m/s".to_string())
    }
}

// =============================================================================
// SOLVER, AUTOFOCUS, STORAGE
// =============================================================================

enum SolverMode {
    /// Solutions follow the simulated telescope, with a fixed pointing bias
    Follow {
        telescope: Arc<SimTelescope>,
        bias_deg: (f64, f64),
    },
    /// Each call pops the next scripted pixel error for a fixed target;
    /// `None` entries fail to solve
    Scripted {
        target: SkyPosition,
        desired: (f64, f64),
        errors: Mutex<VecDeque<Option<f64>>>,
    },
}

pub struct SimPlateSolver {
    mode: SolverMode,
    scale_arcsec: f64,
    center_px: (f64, f64),
    calls: AtomicUsize,
}

impl SimPlateSolver {
    pub fn following(telescope: Arc<SimTelescope>, bias_deg: (f64, f64), scale_arcsec: f64, center_px: (f64, f64)) -> Self {
        Self {
            mode: SolverMode::Follow { telescope, bias_deg },
            scale_arcsec,
            center_px,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn scripted(target: SkyPosition, desired: (f64, f64), errors: Vec<Option<f64>>, scale_arcsec: f64) -> Self {
        Self {
            mode: SolverMode::Scripted {
                target,
                desired,
                errors: Mutex::new(errors.into()),
            },
            scale_arcsec,
            center_px: desired,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlateSolver for SimPlateSolver {
    async fn solve(&self, _image: &ImageData, _hints: &SolveHints) -> DeviceResult<Option<Wcs>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            SolverMode::Follow { telescope, bias_deg } => {
                let pointing = telescope.position_now();
                let frame = lock(&telescope.state).frame;
                let icrs = coords::frame_to_icrs(&pointing, frame, &Utc::now());
                let actual = icrs.offset_by(bias_deg.0, bias_deg.1);
                Ok(Some(Wcs::from_scale(actual, self.center_px, self.scale_arcsec)))
            }
            SolverMode::Scripted { target, desired, errors } => {
                let next = lock(errors).pop_front().flatten();
                Ok(next.map(|err_px| Wcs::from_scale(*target, (desired.0 + err_px, desired.1), self.scale_arcsec)))
            }
        }
    }
}

pub struct SimAutofocuser {
    result: Mutex<Option<i32>>,
    runs: AtomicUsize,
}

impl SimAutofocuser {
    pub fn new(result: Option<i32>) -> Self {
        Self {
            result: Mutex::new(result),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Autofocuser for SimAutofocuser {
    async fn run(&self, _params: &AutofocusParams) -> DeviceResult<Option<i32>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(*lock(&self.result))
    }
}

/// Image sink that records what would have been written
#[derive(Default)]
pub struct MemoryImageSink {
    saved: Mutex<Vec<(PathBuf, FrameMetadata)>>,
    finalized: Mutex<Vec<(PathBuf, PathBuf, Option<Wcs>)>>,
    finalize_delay: Mutex<Duration>,
}

impl MemoryImageSink {
    pub fn saved(&self) -> Vec<(PathBuf, FrameMetadata)> {
        lock(&self.saved).clone()
    }

    pub fn finalized(&self) -> Vec<(PathBuf, PathBuf, Option<Wcs>)> {
        lock(&self.finalized).clone()
    }

    pub fn set_finalize_delay(&self, delay: Duration) {
        *lock(&self.finalize_delay) = delay;
    }
}

#[async_trait]
impl ImageSink for MemoryImageSink {
    async fn save(&self, _image: &ImageData, metadata: &FrameMetadata, path: &Path) -> DeviceResult<()> {
        lock(&self.saved).push((path.to_path_buf(), metadata.clone()));
        Ok(())
    }

    async fn finalize(&self, saved: &Path, dest: &Path, wcs: Option<&Wcs>) -> DeviceResult<()> {
        let delay = *lock(&self.finalize_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.finalized).push((saved.to_path_buf(), dest.to_path_buf(), wcs.copied()));
        Ok(())
    }
}

// =============================================================================
// RIG
// =============================================================================

/// A complete simulated observatory at a dark site
pub struct SimRig {
    pub telescope: Arc<SimTelescope>,
    pub camera: Arc<SimCamera>,
    pub filter_wheel: Arc<SimFilterWheel>,
    pub focuser: Arc<SimFocuser>,
    pub rotator: Arc<SimRotator>,
    pub dome: Arc<SimDome>,
    pub cover: Arc<SimCoverCalibrator>,
    pub safety: Arc<SimSafetyMonitor>,
    pub conditions: Arc<SimObservingConditions>,
    pub autofocuser: Arc<SimAutofocuser>,
    pub solver: Arc<SimPlateSolver>,
    pub sink: Arc<MemoryImageSink>,
    pub clock: Arc<SimClock>,
    pub settings: ObservatorySettings,
}

impl SimRig {
    /// Site at 40N 105W; the clock starts on a January night with the sun
    /// far below the horizon
    pub fn new() -> Self {
        let settings = ObservatorySettings {
            site: Site {
                latitude_deg: 40.0,
                longitude_deg: -105.0,
                elevation_m: 1600.0,
            },
            pixel_scale_arcsec: (1.0, 1.0),
            filters: vec!["L".into(), "V".into(), "R".into(), "B".into()],
            focus_offsets: vec![0, 25, 40, 30],
            cooler_setpoint: Some(-10.0),
            cooler_tolerance: 1.0,
            settle_time_secs: 0.0,
            min_altitude_deg: 10.0,
        };
        let epoch = Utc
            .with_ymd_and_hms(2024, 1, 15, 6, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let telescope = Arc::new(SimTelescope::new());
        let solver = Arc::new(SimPlateSolver::following(
            telescope.clone(),
            (0.0, 0.0),
            settings.pixel_scale_arcsec.0,
            (1024.0, 768.0),
        ));

        Self {
            telescope,
            camera: Arc::new(SimCamera::new()),
            filter_wheel: Arc::new(SimFilterWheel::new(settings.filters.clone())),
            focuser: Arc::new(SimFocuser::new(10_000)),
            rotator: Arc::new(SimRotator::default()),
            dome: Arc::new(SimDome::new()),
            cover: Arc::new(SimCoverCalibrator::default()),
            safety: Arc::new(SimSafetyMonitor::new(true)),
            conditions: Arc::new(SimObservingConditions::default()),
            autofocuser: Arc::new(SimAutofocuser::new(Some(10_100))),
            solver,
            sink: Arc::new(MemoryImageSink::default()),
            clock: Arc::new(SimClock::starting_at(epoch)),
            settings,
        }
    }

    pub fn with_solver(mut self, solver: SimPlateSolver) -> Self {
        self.solver = Arc::new(solver);
        self
    }

    /// Observatory wired to every simulated instrument except the rotator
    pub fn observatory(&self) -> Observatory {
        Observatory::new(self.telescope.clone(), self.camera.clone(), self.settings.clone())
            .with_filter_wheel(self.filter_wheel.clone())
            .with_focuser(self.focuser.clone())
            .with_dome(self.dome.clone())
            .with_cover_calibrator(self.cover.clone())
            .with_safety_monitor(self.safety.clone())
            .with_observing_conditions(self.conditions.clone())
            .with_autofocuser(self.autofocuser.clone())
            .with_plate_solver(self.solver.clone())
            .with_clock(self.clock.clone())
            .with_timing(HardwareTiming {
                timeout: Duration::from_secs(5),
                poll: Duration::from_millis(5),
            })
    }

    /// J2000 position on the meridian at the given altitude right now
    pub fn position_at_altitude(&self, alt_deg: f64) -> SkyPosition {
        let now = self.clock.now();
        let lst = coords::local_sidereal_time(coords::julian_day(&now), self.settings.site.longitude_deg);
        let dec = self.settings.site.latitude_deg - (90.0 - alt_deg);
        let of_date = SkyPosition::new(lst, dec);
        coords::frame_to_icrs(&of_date, EquatorialFrame::Topocentric, &now)
    }
}

impl Default for SimRig {
    fn default() -> Self {
        Self::new()
    }
}
