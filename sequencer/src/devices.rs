//! Instrument capability interfaces
//!
//! One trait per instrument kind. Implementations translate these calls onto
//! a concrete driver protocol; the sequencer only ever talks to the traits.
//! Optional abilities are advertised through `capabilities()` and must be
//! checked before the corresponding command is issued.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coords::{EquatorialFrame, SkyPosition};
use crate::error::DeviceResult;
use crate::wcs::Wcs;

// =============================================================================
// TELESCOPE
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelescopeCapabilities {
    pub can_slew: bool,
    pub can_slew_async: bool,
    pub can_park: bool,
    pub can_unpark: bool,
    pub can_find_home: bool,
    pub can_set_tracking: bool,
    pub can_set_ra_rate: bool,
    pub can_set_dec_rate: bool,
}

#[async_trait]
pub trait Telescope: Send + Sync {
    fn capabilities(&self) -> TelescopeCapabilities;

    /// Frame the mount expects coordinates in
    async fn equatorial_frame(&self) -> DeviceResult<EquatorialFrame>;

    /// Current pointing in the mount's frame
    async fn coordinates(&self) -> DeviceResult<SkyPosition>;

    async fn is_slewing(&self) -> DeviceResult<bool>;

    async fn is_parked(&self) -> DeviceResult<bool>;

    async fn tracking(&self) -> DeviceResult<bool>;

    async fn set_tracking(&self, enabled: bool) -> DeviceResult<()>;

    /// Blocking slew; returns once the mount has arrived
    async fn slew_to_coordinates(&self, target: SkyPosition) -> DeviceResult<()>;

    /// Start a slew and return immediately
    async fn slew_to_coordinates_async(&self, target: SkyPosition) -> DeviceResult<()>;

    async fn abort_slew(&self) -> DeviceResult<()>;

    async fn park(&self) -> DeviceResult<()>;

    async fn unpark(&self) -> DeviceResult<()>;

    async fn find_home(&self) -> DeviceResult<()>;

    /// RA offset rate in seconds of RA per sidereal second and Dec offset
    /// rate in arcsec per second
    async fn set_tracking_rates(&self, ra_rate: f64, dec_rate: f64) -> DeviceResult<()>;
}

// =============================================================================
// CAMERA
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCapabilities {
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub max_bin_x: u32,
    pub max_bin_y: u32,
    pub can_asymmetric_bin: bool,
    pub can_abort_exposure: bool,
    pub readout_modes: Vec<String>,
}

impl Default for CameraCapabilities {
    fn default() -> Self {
        Self {
            sensor_width: 0,
            sensor_height: 0,
            max_bin_x: 1,
            max_bin_y: 1,
            can_asymmetric_bin: false,
            can_abort_exposure: true,
            readout_modes: vec!["Default".to_string()],
        }
    }
}

/// Binning factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

/// Readout region in binned pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Subframe {
    pub start_x: u32,
    pub start_y: u32,
    /// Zero means "to the edge of the binned sensor"
    pub width: u32,
    pub height: u32,
}

/// Raw frame downloaded from a camera
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

#[async_trait]
pub trait Camera: Send + Sync {
    fn capabilities(&self) -> CameraCapabilities;

    async fn start_exposure(&self, duration_secs: f64, light: bool) -> DeviceResult<()>;

    async fn abort_exposure(&self) -> DeviceResult<()>;

    async fn image_ready(&self) -> DeviceResult<bool>;

    async fn download_image(&self) -> DeviceResult<ImageData>;

    async fn set_binning(&self, binning: Binning) -> DeviceResult<()>;

    async fn binning(&self) -> DeviceResult<Binning>;

    async fn set_subframe(&self, subframe: Subframe) -> DeviceResult<()>;

    async fn set_readout_mode(&self, index: usize) -> DeviceResult<()>;

    async fn ccd_temperature(&self) -> DeviceResult<f64>;

    async fn cooler_on(&self) -> DeviceResult<bool>;
}

// =============================================================================
// FILTER WHEEL, FOCUSER, ROTATOR
// =============================================================================

#[async_trait]
pub trait FilterWheel: Send + Sync {
    async fn names(&self) -> DeviceResult<Vec<String>>;

    async fn position(&self) -> DeviceResult<usize>;

    async fn set_position(&self, position: usize) -> DeviceResult<()>;

    async fn is_moving(&self) -> DeviceResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocuserCapabilities {
    /// Absolute focusers accept target positions, relative ones step counts
    pub absolute: bool,
    pub max_step: i32,
}

impl Default for FocuserCapabilities {
    fn default() -> Self {
        Self {
            absolute: true,
            max_step: i32::MAX,
        }
    }
}

#[async_trait]
pub trait Focuser: Send + Sync {
    fn capabilities(&self) -> FocuserCapabilities;

    async fn position(&self) -> DeviceResult<i32>;

    async fn is_moving(&self) -> DeviceResult<bool>;

    async fn move_to(&self, position: i32) -> DeviceResult<()>;

    async fn move_by(&self, steps: i32) -> DeviceResult<()>;

    async fn halt(&self) -> DeviceResult<()>;
}

#[async_trait]
pub trait Rotator: Send + Sync {
    async fn mechanical_position(&self) -> DeviceResult<f64>;

    async fn is_moving(&self) -> DeviceResult<bool>;

    /// Relative move in degrees
    async fn move_by(&self, degrees: f64) -> DeviceResult<()>;

    async fn halt(&self) -> DeviceResult<()>;
}

// =============================================================================
// ENCLOSURE AND ENVIRONMENT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomeCapabilities {
    pub can_set_shutter: bool,
    pub can_park: bool,
    pub can_find_home: bool,
}

#[async_trait]
pub trait Dome: Send + Sync {
    fn capabilities(&self) -> DomeCapabilities;

    async fn shutter_status(&self) -> DeviceResult<ShutterState>;

    async fn is_slewing(&self) -> DeviceResult<bool>;

    async fn open_shutter(&self) -> DeviceResult<()>;

    async fn close_shutter(&self) -> DeviceResult<()>;

    async fn abort_slew(&self) -> DeviceResult<()>;

    async fn park(&self) -> DeviceResult<()>;

    async fn find_home(&self) -> DeviceResult<()>;
}

#[async_trait]
pub trait CoverCalibrator: Send + Sync {
    async fn calibrator_off(&self) -> DeviceResult<()>;

    async fn halt_cover(&self) -> DeviceResult<()>;

    async fn close_cover(&self) -> DeviceResult<()>;
}

#[async_trait]
pub trait SafetyMonitor: Send + Sync {
    fn name(&self) -> String;

    async fn is_safe(&self) -> DeviceResult<bool>;
}

#[async_trait]
pub trait ObservingConditions: Send + Sync {
    /// Ask the weather source to refresh its readings
    async fn refresh(&self) -> DeviceResult<()>;

    /// Short human-readable summary of the latest readings
    async fn summary(&self) -> DeviceResult<String>;
}

#[async_trait]
pub trait Switch: Send + Sync {
    async fn names(&self) -> DeviceResult<Vec<String>>;

    async fn get(&self, id: usize) -> DeviceResult<bool>;
}

// =============================================================================
// IMAGE PROCESSING COLLABORATORS
// =============================================================================

/// Hints passed to a plate solver
#[derive(Debug, Clone, PartialEq)]
pub struct SolveHints {
    pub center: Option<SkyPosition>,
    pub scale_arcsec: Option<f64>,
    pub timeout: Duration,
}

#[async_trait]
pub trait PlateSolver: Send + Sync {
    /// Returns `None` when the image could not be solved
    async fn solve(&self, image: &ImageData, hints: &SolveHints) -> DeviceResult<Option<Wcs>>;
}

/// Parameters of an autofocus sweep
#[derive(Debug, Clone, PartialEq)]
pub struct AutofocusParams {
    pub exposure_secs: f64,
    pub midpoint: Option<i32>,
    pub nsteps: u32,
    pub step_size: i32,
    pub use_current_pointing: bool,
}

#[async_trait]
pub trait Autofocuser: Send + Sync {
    /// Returns the best focus position, or `None` if no focus was found
    async fn run(&self, params: &AutofocusParams) -> DeviceResult<Option<i32>>;
}

/// Kind of frame being written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Light,
    Dark,
}

/// Pointing and instrument state recorded with every saved frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub scan_id: String,
    pub scan_name: String,
    pub frame_type: FrameType,
    pub exposure_secs: f64,
    pub requested: Option<SkyPosition>,
    pub achieved: Option<SkyPosition>,
    pub filter: Option<String>,
    pub binning: Binning,
    pub subframe: Subframe,
    pub readout_mode: usize,
    pub ccd_temperature: Option<f64>,
    pub focuser_position: Option<i32>,
    pub centered: bool,
    pub previous_scan: Option<String>,
    pub next_scan: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Image persistence (file format is the implementation's concern)
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn save(&self, image: &ImageData, metadata: &FrameMetadata, path: &Path) -> DeviceResult<()>;

    /// Attach a solution (if any) to a saved frame and move it to `dest`
    async fn finalize(&self, saved: &Path, dest: &Path, wcs: Option<&Wcs>) -> DeviceResult<()>;
}

// =============================================================================
// TIME
// =============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type SharedTelescope = Arc<dyn Telescope>;
pub type SharedCamera = Arc<dyn Camera>;
pub type SharedClock = Arc<dyn Clock>;
