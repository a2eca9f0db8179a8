//! Observatory aggregate
//!
//! Bundles the instrument facades with the site description and provides the
//! compound operations the executor and repositioning loop need: slewing with
//! frame conversion, filter changes with focus offsets, safety aggregation and
//! the orderly end-of-night shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::coords::{self, AltAz, EquatorialFrame, Site, SkyPosition};
use crate::devices::{
    Autofocuser, AutofocusParams, Clock, CoverCalibrator, Dome, FilterWheel, Focuser,
    ObservingConditions, PlateSolver, Rotator, SafetyMonitor, SharedCamera, SharedClock, SharedTelescope,
    ImageData, ShutterState, Switch, SystemClock,
};
use crate::error::{DeviceError, DeviceResult, SequencerError, SequencerResult};
use crate::watchdog::Watchdog;

/// Resolves at `deadline`, or never without one
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Static description of the observatory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatorySettings {
    pub site: Site,
    /// Unbinned pixel scale (x, y) in arcsec per pixel
    pub pixel_scale_arcsec: (f64, f64),
    /// Filter names in wheel order
    pub filters: Vec<String>,
    /// Focuser offset per filter, same order as `filters`
    pub focus_offsets: Vec<i32>,
    pub cooler_setpoint: Option<f64>,
    pub cooler_tolerance: f64,
    pub settle_time_secs: f64,
    pub min_altitude_deg: f64,
}

impl Default for ObservatorySettings {
    fn default() -> Self {
        Self {
            site: Site::default(),
            pixel_scale_arcsec: (1.0, 1.0),
            filters: Vec::new(),
            focus_offsets: Vec::new(),
            cooler_setpoint: None,
            cooler_tolerance: 1.0,
            settle_time_secs: 0.0,
            min_altitude_deg: 10.0,
        }
    }
}

impl ObservatorySettings {
    pub fn focus_offset(&self, filter_index: usize) -> i32 {
        self.focus_offsets.get(filter_index).copied().unwrap_or(0)
    }
}

/// Deadline and poll cadence for hardware waits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareTiming {
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for HardwareTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll: Duration::from_millis(100),
        }
    }
}

pub struct Observatory {
    pub telescope: SharedTelescope,
    pub camera: SharedCamera,
    pub filter_wheel: Option<Arc<dyn FilterWheel>>,
    pub focuser: Option<Arc<dyn Focuser>>,
    pub rotator: Option<Arc<dyn Rotator>>,
    pub dome: Option<Arc<dyn Dome>>,
    pub cover_calibrator: Option<Arc<dyn CoverCalibrator>>,
    pub safety_monitors: Vec<Arc<dyn SafetyMonitor>>,
    pub observing_conditions: Option<Arc<dyn ObservingConditions>>,
    pub switches: Vec<Arc<dyn Switch>>,
    pub autofocuser: Option<Arc<dyn Autofocuser>>,
    pub plate_solver: Option<Arc<dyn PlateSolver>>,
    pub clock: SharedClock,
    pub settings: ObservatorySettings,
    pub timing: HardwareTiming,
}

impl Observatory {
    pub fn new(telescope: SharedTelescope, camera: SharedCamera, settings: ObservatorySettings) -> Self {
        Self {
            telescope,
            camera,
            filter_wheel: None,
            focuser: None,
            rotator: None,
            dome: None,
            cover_calibrator: None,
            safety_monitors: Vec::new(),
            observing_conditions: None,
            switches: Vec::new(),
            autofocuser: None,
            plate_solver: None,
            clock: Arc::new(SystemClock),
            settings,
            timing: HardwareTiming::default(),
        }
    }

    pub fn with_filter_wheel(mut self, wheel: Arc<dyn FilterWheel>) -> Self {
        self.filter_wheel = Some(wheel);
        self
    }

    pub fn with_focuser(mut self, focuser: Arc<dyn Focuser>) -> Self {
        self.focuser = Some(focuser);
        self
    }

    pub fn with_rotator(mut self, rotator: Arc<dyn Rotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    pub fn with_dome(mut self, dome: Arc<dyn Dome>) -> Self {
        self.dome = Some(dome);
        self
    }

    pub fn with_cover_calibrator(mut self, cover: Arc<dyn CoverCalibrator>) -> Self {
        self.cover_calibrator = Some(cover);
        self
    }

    pub fn with_safety_monitor(mut self, monitor: Arc<dyn SafetyMonitor>) -> Self {
        self.safety_monitors.push(monitor);
        self
    }

    pub fn with_observing_conditions(mut self, conditions: Arc<dyn ObservingConditions>) -> Self {
        self.observing_conditions = Some(conditions);
        self
    }

    pub fn with_switch(mut self, switch: Arc<dyn Switch>) -> Self {
        self.switches.push(switch);
        self
    }

    pub fn with_autofocuser(mut self, autofocuser: Arc<dyn Autofocuser>) -> Self {
        self.autofocuser = Some(autofocuser);
        self
    }

    pub fn with_plate_solver(mut self, solver: Arc<dyn PlateSolver>) -> Self {
        self.plate_solver = Some(solver);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timing(mut self, timing: HardwareTiming) -> Self {
        self.timing = timing;
        self
    }

    // =========================================================================
    // Time and geometry
    // =========================================================================

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn site(&self) -> &Site {
        &self.settings.site
    }

    pub fn sun_altitude(&self) -> f64 {
        coords::sun_altitude(&self.settings.site, &self.now())
    }

    /// Alt-az of a J2000 position right now
    pub fn altaz_of(&self, target: &SkyPosition) -> AltAz {
        let now = self.now();
        let of_date = coords::icrs_to_frame(target, EquatorialFrame::Topocentric, &now);
        coords::altaz(&of_date, &self.settings.site, &now)
    }

    /// The mount's equatorial frame; undefined or unreadable frames fall back
    /// to topocentric-of-date
    pub async fn telescope_frame(&self) -> EquatorialFrame {
        match self
            .guard("read equatorial frame")
            .guard(&CancellationToken::new(), self.telescope.equatorial_frame())
            .await
        {
            Ok(EquatorialFrame::Undefined) => {
                tracing::warn!("Telescope equatorial frame is undefined, assuming topocentric of date");
                EquatorialFrame::Topocentric
            }
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Could not read telescope equatorial frame ({}), assuming topocentric of date", e);
                EquatorialFrame::Topocentric
            }
        }
    }

    fn guard(&self, command: &str) -> Watchdog {
        Watchdog::new(command, self.timing.timeout)
    }

    /// Run a single device call under the hardware timeout
    pub async fn guarded<T>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        call: impl Future<Output = DeviceResult<T>>,
    ) -> SequencerResult<T> {
        self.guard(command).guard(cancel, call).await
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Poll `check` every `interval` until it reports true.
    ///
    /// Device errors during polling are treated as transient. Returns
    /// `Timeout` once `timeout` elapses and `Cancelled` if `cancel` fires.
    pub async fn wait_for<F, Fut>(
        what: &str,
        interval: Duration,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut check: F,
    ) -> SequencerResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeviceResult<bool>>,
    {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let timed_out = || {
            let limit = timeout.unwrap_or_default();
            tracing::error!("Timed out after {:.1}s waiting for {}", limit.as_secs_f64(), what);
            SequencerError::Timeout {
                command: what.to_string(),
                timeout_secs: limit.as_secs_f64(),
            }
        };

        loop {
            if cancel.is_cancelled() {
                return Err(SequencerError::Cancelled(what.to_string()));
            }

            // a device that never answers must not outlive the deadline
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SequencerError::Cancelled(what.to_string())),
                _ = until(deadline) => return Err(timed_out()),
                result = check() => result,
            };
            match polled {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => tracing::debug!("Transient error while waiting for {}: {}", what, e),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SequencerError::Cancelled(what.to_string())),
                _ = until(deadline) => return Err(timed_out()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Wait for mount and dome to stop moving
    pub async fn wait_for_slew(&self, cancel: &CancellationToken) -> SequencerResult<()> {
        let telescope = self.telescope.clone();
        let dome = self.dome.clone();
        Self::wait_for("slew to complete", self.timing.poll, Some(self.timing.timeout), cancel, || {
            let telescope = telescope.clone();
            let dome = dome.clone();
            async move {
                if telescope.is_slewing().await? {
                    return Ok(false);
                }
                match dome {
                    Some(dome) => Ok(!dome.is_slewing().await?),
                    None => Ok(true),
                }
            }
        })
        .await
    }

    /// Wait for focuser and dome to stop moving
    pub async fn wait_for_focuser_and_dome(&self, cancel: &CancellationToken) -> SequencerResult<()> {
        let focuser = self.focuser.clone();
        let dome = self.dome.clone();
        Self::wait_for("focuser and dome motion", self.timing.poll, Some(self.timing.timeout), cancel, || {
            let focuser = focuser.clone();
            let dome = dome.clone();
            async move {
                if let Some(focuser) = focuser {
                    if focuser.is_moving().await? {
                        return Ok(false);
                    }
                }
                match dome {
                    Some(dome) => Ok(!dome.is_slewing().await?),
                    None => Ok(true),
                }
            }
        })
        .await
    }

    pub async fn wait_for_rotator(&self, cancel: &CancellationToken) -> SequencerResult<()> {
        let Some(rotator) = self.rotator.clone() else {
            return Ok(());
        };
        Self::wait_for("rotator motion", self.timing.poll, Some(self.timing.timeout), cancel, || {
            let rotator = rotator.clone();
            async move { Ok(!rotator.is_moving().await?) }
        })
        .await
    }

    // =========================================================================
    // Slewing
    // =========================================================================

    /// Slew to a J2000 target. Returns the position commanded to the mount.
    pub async fn slew_to(&self, target: &SkyPosition, cancel: &CancellationToken) -> SequencerResult<SkyPosition> {
        let frame = self.telescope_frame().await;
        let commanded = coords::icrs_to_frame(target, frame, &self.now());
        self.slew_to_frame_coordinates(&commanded, frame, cancel).await?;
        Ok(commanded)
    }

    /// Slew to a position already expressed in the mount's frame
    pub async fn slew_to_frame_coordinates(
        &self,
        position: &SkyPosition,
        frame: EquatorialFrame,
        cancel: &CancellationToken,
    ) -> SequencerResult<()> {
        let icrs = coords::frame_to_icrs(position, frame, &self.now());
        let horizontal = self.altaz_of(&icrs);
        if horizontal.alt_deg < self.settings.min_altitude_deg {
            return Err(SequencerError::BelowHorizon {
                altitude: horizontal.alt_deg,
                minimum: self.settings.min_altitude_deg,
            });
        }

        let caps = self.telescope.capabilities();

        if caps.can_unpark && self.guarded("read park state", cancel, self.telescope.is_parked()).await? {
            tracing::info!("Unparking telescope...");
            self.guard("unpark").guard(cancel, self.telescope.unpark()).await?;
        }

        if caps.can_set_tracking {
            self.guarded("enable tracking", cancel, self.telescope.set_tracking(true)).await?;
        }

        tracing::info!(
            "Slewing to RA {:.5}h Dec {:+.4} deg ({:?}), altitude {:.1} deg",
            position.ra_hours,
            position.dec_deg,
            frame,
            horizontal.alt_deg
        );
        if caps.can_slew_async {
            self.guard("slew")
                .guard(cancel, self.telescope.slew_to_coordinates_async(*position))
                .await?;
        } else if caps.can_slew {
            self.guard("slew")
                .guard(cancel, self.telescope.slew_to_coordinates(*position))
                .await?;
        } else {
            return Err(SequencerError::Device(DeviceError::not_supported(
                "Telescope",
                "slewing",
            )));
        }

        if let Some(dome) = &self.dome {
            if dome.capabilities().can_set_shutter
                && self.guarded("read shutter", cancel, dome.shutter_status()).await? != ShutterState::Open {
                tracing::info!("Opening dome shutter...");
                self.guard("open shutter").guard(cancel, dome.open_shutter()).await?;
            }
        }

        self.wait_for_slew(cancel).await
    }

    // =========================================================================
    // Exposures
    // =========================================================================

    /// Take one exposure and download it.
    ///
    /// Readiness is bounded by the exposure time plus the hardware timeout.
    /// A cancelled wait aborts the exposure in progress.
    pub async fn expose(&self, duration_secs: f64, light: bool, cancel: &CancellationToken) -> SequencerResult<ImageData> {
        tracing::info!("Starting {:.4} second {} exposure...", duration_secs, if light { "light" } else { "dark" });
        self.guard("start exposure")
            .guard(cancel, self.camera.start_exposure(duration_secs, light))
            .await?;

        let camera = self.camera.clone();
        let limit = crate::config::secs(duration_secs) + self.timing.timeout;
        let waited = Self::wait_for("image ready", self.timing.poll, Some(limit), cancel, || {
            let camera = camera.clone();
            async move { camera.image_ready().await }
        })
        .await;

        if let Err(e) = waited {
            if e.is_cancelled() && self.camera.capabilities().can_abort_exposure {
                tracing::warn!("Exposure interrupted, aborting...");
                if let Err(abort_err) = self.camera.abort_exposure().await {
                    tracing::warn!("Failed to abort exposure: {}", abort_err);
                }
            }
            return Err(e);
        }

        self.guard("image download")
            .guard(cancel, self.camera.download_image())
            .await
    }

    // =========================================================================
    // Filters and focus
    // =========================================================================

    pub fn filter_names(&self) -> &[String] {
        &self.settings.filters
    }

    pub async fn filter_position(&self) -> SequencerResult<Option<usize>> {
        match &self.filter_wheel {
            Some(wheel) => Ok(Some(
                self.guarded("read filter position", &CancellationToken::new(), wheel.position())
                    .await?,
            )),
            None => Ok(None),
        }
    }

    pub async fn current_filter(&self) -> SequencerResult<Option<String>> {
        Ok(self
            .filter_position()
            .await?
            .and_then(|pos| self.settings.filters.get(pos).cloned()))
    }

    /// Move the wheel to `name` and apply the focus offset difference
    pub async fn set_filter(&self, name: &str, cancel: &CancellationToken) -> SequencerResult<()> {
        let Some(wheel) = &self.filter_wheel else {
            return Err(SequencerError::FilterNotFound(name.to_string()));
        };
        let target = self
            .settings
            .filters
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| SequencerError::FilterNotFound(name.to_string()))?;

        let current = self.guarded("read filter position", cancel, wheel.position()).await?;
        if current == target {
            tracing::debug!("Filter {} already selected", name);
            return Ok(());
        }

        tracing::info!("Changing filter to {} (position {})", name, target);
        self.guard("filter change")
            .guard(cancel, wheel.set_position(target))
            .await?;
        let w = wheel.clone();
        Self::wait_for("filter wheel", self.timing.poll, Some(self.timing.timeout), cancel, || {
            let w = w.clone();
            async move { Ok(!w.is_moving().await?) }
        })
        .await?;

        let delta = self.settings.focus_offset(target) - self.settings.focus_offset(current);
        if let Some(focuser) = &self.focuser {
            if delta != 0 {
                tracing::info!("Applying focus offset of {} steps for {}", delta, name);
                if focuser.capabilities().absolute {
                    let position = self.guarded("read focuser position", cancel, focuser.position()).await?;
                    self.guard("focuser move")
                        .guard(cancel, focuser.move_to(position + delta))
                        .await?;
                } else {
                    self.guard("focuser move")
                        .guard(cancel, focuser.move_by(delta))
                        .await?;
                }
                let f = focuser.clone();
                Self::wait_for("focuser", self.timing.poll, Some(self.timing.timeout), cancel, || {
                    let f = f.clone();
                    async move { Ok(!f.is_moving().await?) }
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Run an autofocus sweep; returns the best position if one was found
    pub async fn run_autofocus(
        &self,
        params: &AutofocusParams,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SequencerResult<Option<i32>> {
        let Some(autofocuser) = &self.autofocuser else {
            return Err(SequencerError::Device(DeviceError::not_supported(
                "Observatory",
                "autofocus",
            )));
        };
        Watchdog::new("autofocus", timeout)
            .guard(cancel, autofocuser.run(params))
            .await
    }

    // =========================================================================
    // Safety
    // =========================================================================

    /// One reading per monitor; a monitor that cannot be read in time
    /// counts as unsafe
    pub async fn safety_status(&self) -> Vec<bool> {
        let mut readings = Vec::with_capacity(self.safety_monitors.len());
        for monitor in &self.safety_monitors {
            readings.push(self.read_monitor(monitor.as_ref()).await);
        }
        readings
    }

    async fn read_monitor(&self, monitor: &dyn SafetyMonitor) -> bool {
        let command = format!("safety monitor {}", monitor.name());
        match self.guarded(&command, &CancellationToken::new(), monitor.is_safe()).await {
            Ok(safe) => safe,
            Err(e) => {
                tracing::warn!("Safety monitor {} unreadable: {}", monitor.name(), e);
                false
            }
        }
    }

    /// AND over all monitors; no monitors means safe
    pub async fn is_safe(&self) -> bool {
        self.safety_status().await.into_iter().all(|s| s)
    }

    /// Reading of the first monitor, used as a roof sensor
    pub async fn first_monitor_safe(&self) -> Option<bool> {
        let monitor = self.safety_monitors.first()?;
        Some(self.read_monitor(monitor.as_ref()).await)
    }

    /// Names and states of every switch, for the run log
    pub async fn switch_states(&self) -> Vec<(String, bool)> {
        let cancel = CancellationToken::new();
        let mut states = Vec::new();
        for switch in &self.switches {
            let Ok(names) = self.guarded("read switch names", &cancel, switch.names()).await else {
                continue;
            };
            for (id, name) in names.into_iter().enumerate() {
                if let Ok(on) = self.guarded("read switch", &cancel, switch.get(id)).await {
                    states.push((name, on));
                }
            }
        }
        states
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Put every instrument into a safe state. Each step is attempted even if
    /// earlier ones fail.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down observatory...");
        let cancel = CancellationToken::new();

        async fn step<F, T>(what: &str, dog: Watchdog, cancel: &CancellationToken, fut: F)
        where
            F: Future<Output = DeviceResult<T>>,
        {
            match dog.guard(cancel, fut).await {
                Ok(_) => tracing::info!("Shutdown: {} done", what),
                Err(e) => tracing::warn!("Shutdown: {} failed: {}", what, e),
            }
        }

        if self.camera.capabilities().can_abort_exposure {
            step("abort exposure", self.guard("abort exposure"), &cancel, self.camera.abort_exposure()).await;
        }
        step("close camera shutter", self.guard("dark frame"), &cancel, self.camera.start_exposure(0.0, false)).await;

        if let Some(cover) = &self.cover_calibrator {
            step("calibrator off", self.guard("calibrator off"), &cancel, cover.calibrator_off()).await;
            step("halt cover", self.guard("halt cover"), &cancel, cover.halt_cover()).await;
            step("close cover", self.guard("close cover"), &cancel, cover.close_cover()).await;
        }

        if let Some(dome) = &self.dome {
            let caps = dome.capabilities();
            step("abort dome slew", self.guard("dome abort"), &cancel, dome.abort_slew()).await;
            if caps.can_park {
                step("park dome", self.guard("dome park"), &cancel, dome.park()).await;
            } else if caps.can_find_home {
                step("home dome", self.guard("dome home"), &cancel, dome.find_home()).await;
            }
            if caps.can_set_shutter {
                step("close shutter", self.guard("close shutter"), &cancel, dome.close_shutter()).await;
            }
        }

        if let Some(focuser) = &self.focuser {
            step("halt focuser", self.guard("focuser halt"), &cancel, focuser.halt()).await;
        }
        if let Some(rotator) = &self.rotator {
            step("halt rotator", self.guard("rotator halt"), &cancel, rotator.halt()).await;
        }

        let caps = self.telescope.capabilities();
        step("abort slew", self.guard("abort slew"), &cancel, self.telescope.abort_slew()).await;
        if caps.can_set_ra_rate || caps.can_set_dec_rate {
            step("zero tracking rates", self.guard("rates"), &cancel, self.telescope.set_tracking_rates(0.0, 0.0)).await;
        }
        if caps.can_set_tracking {
            step("tracking off", self.guard("tracking"), &cancel, self.telescope.set_tracking(false)).await;
        }
        if caps.can_park {
            step("park telescope", self.guard("park"), &cancel, self.telescope.park()).await;
        } else if caps.can_find_home {
            step("home telescope", self.guard("find home"), &cancel, self.telescope.find_home()).await;
        }
        tracing::info!("Observatory shutdown complete");
    }
}
