//! Run configuration
//!
//! Every option has a default so a partial TOML file (or none at all) yields a
//! usable configuration. Durations are expressed in seconds as `f64` and
//! converted with the `*_duration()` helpers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{SequencerError, SequencerResult};

/// How roof/dome readiness is judged before each scan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DomeMode {
    /// No roof check
    #[default]
    None,
    /// The dome shutter must be open (or controllable by the run)
    Dome,
    /// The first safety monitor doubles as the roof sensor
    #[serde(alias = "safety_monitor", alias = "safetymonitor", alias = "safety monitor")]
    SafetyMonitor,
    /// Both the safety monitor and the dome shutter are checked
    Both,
}

/// What to do with a scan's requested start time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StartTimePolicy {
    /// Start as soon as the scan comes up
    Ignore,
    /// Wait for the start time; fail scans later than the lateness ceiling
    #[default]
    Strict,
    /// Never wait, but still fail scans later than the lateness ceiling
    Ceiling,
}

/// Periodic autofocus settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Seconds between autofocus runs; zero or negative disables periodic autofocus
    pub interval_secs: f64,
    /// Run autofocus before the first scan regardless of the interval
    pub initial: bool,
    /// Filters autofocus may run in; empty means any filter
    pub filters: Vec<String>,
    pub exposure_secs: f64,
    /// Focuser midpoint for the sweep; `None` uses the current position
    pub midpoint: Option<i32>,
    pub nsteps: u32,
    pub step_size: i32,
    pub use_current_pointing: bool,
    pub timeout_secs: f64,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600.0,
            initial: true,
            filters: Vec::new(),
            exposure_secs: 10.0,
            midpoint: None,
            nsteps: 5,
            step_size: 500,
            use_current_pointing: false,
            timeout_secs: 180.0,
        }
    }
}

impl AutofocusConfig {
    pub fn is_periodic(&self) -> bool {
        self.interval_secs > 0.0
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }
}

/// Closed-loop pointing refinement settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepositioningConfig {
    /// Filters repositioning exposures may be taken in; empty means any filter
    pub allowed_filters: Vec<String>,
    /// Scans in these filters are always centered on the detector
    pub required_filters: Vec<String>,
    /// Declination bias applied to the first slew only
    pub initial_offset_dec_arcsec: f64,
    /// When false a single slew is reported as success without imaging
    pub check_and_refine: bool,
    pub max_attempts: u32,
    pub tolerance_px: f64,
    pub exposure_secs: f64,
    pub save_images: bool,
    pub save_path: Option<PathBuf>,
    /// A prior success on the same target is trusted for this long
    pub max_stability_secs: f64,
    /// Extra attempts reserved for failed solves. `None` means a failed
    /// solve consumes a regular attempt.
    pub solve_failure_budget: Option<u32>,
    pub timeout_secs: f64,
}

impl Default for RepositioningConfig {
    fn default() -> Self {
        Self {
            allowed_filters: Vec::new(),
            required_filters: Vec::new(),
            initial_offset_dec_arcsec: 0.0,
            check_and_refine: true,
            max_attempts: 5,
            tolerance_px: 3.0,
            exposure_secs: 10.0,
            save_images: false,
            save_path: None,
            max_stability_secs: 600.0,
            solve_failure_budget: None,
            timeout_secs: 180.0,
        }
    }
}

/// Asynchronous plate solving of science frames
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlateSolveConfig {
    /// Frames taken in these filters are solved after saving. Empty means
    /// every frame is solved.
    pub filters: Vec<String>,
    pub timeout_secs: f64,
    /// How long shutdown waits for outstanding solves
    pub drain_timeout_secs: f64,
}

impl Default for PlateSolveConfig {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            timeout_secs: 60.0,
            drain_timeout_secs: 300.0,
        }
    }
}

impl PlateSolveConfig {
    pub fn applies_to(&self, filter: Option<&str>) -> bool {
        match filter {
            Some(name) => self.filters.is_empty() || self.filters.iter().any(|f| f == name),
            None => true,
        }
    }
}

/// Background poller cadences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    pub conditions_interval_secs: f64,
    pub safety_interval_secs: f64,
    pub derotation_interval_secs: f64,
    /// Disabling leaves the executor's own per-scan safety gate in place
    pub enable_safety_poller: bool,
    pub enable_conditions_poller: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            conditions_interval_secs: 60.0,
            safety_interval_secs: 10.0,
            derotation_interval_secs: 1.0,
            enable_safety_poller: true,
            enable_conditions_poller: true,
        }
    }
}

/// Polling cadence for hardware readiness waits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollIntervals {
    pub motion_secs: f64,
    pub image_ready_secs: f64,
    pub cooler_secs: f64,
    pub start_time_secs: f64,
    pub queue_secs: f64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            motion_secs: 0.1,
            image_ready_secs: 0.1,
            cooler_secs: 10.0,
            start_time_secs: 0.5,
            queue_secs: 5.0,
        }
    }
}

impl PollIntervals {
    pub fn motion(&self) -> Duration {
        secs(self.motion_secs)
    }

    pub fn image_ready(&self) -> Duration {
        secs(self.image_ready_secs)
    }

    pub fn cooler(&self) -> Duration {
        secs(self.cooler_secs)
    }

    pub fn start_time(&self) -> Duration {
        secs(self.start_time_secs)
    }

    pub fn queue(&self) -> Duration {
        secs(self.queue_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub images: PathBuf,
    pub temp: PathBuf,
    pub schedules: PathBuf,
    pub logs: PathBuf,
    pub reports: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            images: PathBuf::from("images"),
            temp: PathBuf::from("images/temp"),
            schedules: PathBuf::from("schedules"),
            logs: PathBuf::from("logs"),
            reports: PathBuf::from("reports"),
        }
    }
}

/// Top-level configuration of an observing run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub dome_mode: DomeMode,
    pub check_safety_monitors: bool,
    pub wait_for_sun: bool,
    /// Scans fail while the sun is above this altitude (degrees)
    pub max_solar_elevation_deg: f64,
    pub wait_for_cooldown: bool,
    pub initial_home: bool,
    pub default_readout: usize,
    pub check_scan_status: bool,
    pub update_scan_status: bool,
    pub start_time_policy: StartTimePolicy,
    pub max_lateness_secs: f64,
    /// Lead time before a scan's start at which the slew may begin
    pub preslew_secs: f64,
    pub hardware_timeout_secs: f64,
    pub autofocus: AutofocusConfig,
    pub repositioning: RepositioningConfig,
    pub plate_solve: PlateSolveConfig,
    pub pollers: PollerConfig,
    pub polling: PollIntervals,
    pub paths: PathsConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dome_mode: DomeMode::None,
            check_safety_monitors: true,
            wait_for_sun: true,
            max_solar_elevation_deg: -12.0,
            wait_for_cooldown: true,
            initial_home: true,
            default_readout: 0,
            check_scan_status: true,
            update_scan_status: true,
            start_time_policy: StartTimePolicy::Strict,
            max_lateness_secs: 1200.0,
            preslew_secs: 60.0,
            hardware_timeout_secs: 120.0,
            autofocus: AutofocusConfig::default(),
            repositioning: RepositioningConfig::default(),
            plate_solve: PlateSolveConfig::default(),
            pollers: PollerConfig::default(),
            polling: PollIntervals::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::info!("Loaded run configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> SequencerResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SequencerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SequencerResult<()> {
        let fail = |msg: &str| Err(SequencerError::Config(msg.to_string()));

        if self.hardware_timeout_secs <= 0.0 {
            return fail("hardware_timeout_secs must be positive");
        }
        if self.max_lateness_secs < 0.0 || self.preslew_secs < 0.0 {
            return fail("lateness and pre-slew times must not be negative");
        }
        if self.repositioning.max_attempts == 0 {
            return fail("repositioning.max_attempts must be at least 1");
        }
        if self.repositioning.tolerance_px <= 0.0 {
            return fail("repositioning.tolerance_px must be positive");
        }
        if self.repositioning.exposure_secs < 0.0 || self.autofocus.exposure_secs < 0.0 {
            return fail("exposure times must not be negative");
        }
        if self.plate_solve.timeout_secs <= 0.0 || self.autofocus.timeout_secs <= 0.0 {
            return fail("timeouts must be positive");
        }
        let p = &self.pollers;
        if p.conditions_interval_secs <= 0.0
            || p.safety_interval_secs <= 0.0
            || p.derotation_interval_secs <= 0.0
        {
            return fail("poller intervals must be positive");
        }
        Ok(())
    }

    pub fn hardware_timeout(&self) -> Duration {
        secs(self.hardware_timeout_secs)
    }
}

/// Convert a possibly negative seconds value into a `Duration`
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.repositioning.max_attempts, 5);
        assert_eq!(config.repositioning.tolerance_px, 3.0);
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            dome_mode = "safety_monitor"
            start_time_policy = "ceiling"

            [repositioning]
            max_attempts = 3
            solve_failure_budget = 2
        "#;
        let config = RunConfig::from_toml_str(text).unwrap();
        assert_eq!(config.dome_mode, DomeMode::SafetyMonitor);
        assert_eq!(config.start_time_policy, StartTimePolicy::Ceiling);
        assert_eq!(config.repositioning.max_attempts, 3);
        assert_eq!(config.repositioning.solve_failure_budget, Some(2));
        assert_eq!(config.repositioning.tolerance_px, 3.0);
        assert!(config.wait_for_sun);
    }

    #[test]
    fn test_dome_mode_aliases() {
        for alias in ["safety-monitor", "safetymonitor", "safety monitor"] {
            let text = format!("dome_mode = \"{}\"", alias);
            let config = RunConfig::from_toml_str(&text).unwrap();
            assert_eq!(config.dome_mode, DomeMode::SafetyMonitor);
        }
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let text = "[repositioning]\nmax_attempts = 0\n";
        assert!(matches!(
            RunConfig::from_toml_str(text),
            Err(SequencerError::Config(_))
        ));
    }

    #[test]
    fn test_plate_solve_filter_set() {
        let mut config = PlateSolveConfig::default();
        assert!(config.applies_to(Some("R")));
        config.filters = vec!["L".into()];
        assert!(config.applies_to(Some("L")));
        assert!(!config.applies_to(Some("R")));
        assert!(config.applies_to(None));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "wait_for_sun = false\n").unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert!(!config.wait_for_sun);
        assert!(RunConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
