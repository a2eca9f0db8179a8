//! Closed-loop pointing refinement
//!
//! Places a sky position on a requested detector pixel by repeating
//! slew, expose, plate-solve and correct until the pixel error is within
//! tolerance or the attempt budget runs out. Corrections are accumulated in
//! the mount's own equatorial frame.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{secs, RepositioningConfig};
use crate::coords::{self, SkyPosition};
use crate::devices::{
    Binning, FrameMetadata, FrameType, ImageData, ImageSink, SolveHints, Subframe,
};
use crate::error::{SequencerError, SequencerResult};
use crate::observatory::Observatory;
use crate::status::StatusWriter;
use crate::watchdog::Watchdog;

/// One placement request
#[derive(Debug, Clone, PartialEq)]
pub struct RepositioningRequest {
    pub name: String,
    /// J2000 target
    pub target: SkyPosition,
    /// Unbinned detector pixel the target should land on
    pub pixel: (f64, f64),
    /// When false the mount is assumed to be on target already
    pub do_initial_slew: bool,
    /// Attempts granted on top of the configured maximum
    pub extra_attempts: u32,
}

/// Outcome of a session that was not cancelled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositioningReport {
    pub converged: bool,
    /// Attempts consumed, counting failed solves that used the regular budget
    pub attempts: u32,
    pub exposures: u32,
    pub solve_failures: u32,
    /// Last measured (requested - predicted) pixel error
    pub last_error_px: Option<(f64, f64)>,
    /// Final working position in the mount's frame
    pub working: SkyPosition,
}

/// Measured pointing error from one solved frame
#[derive(Debug, Clone, Copy, PartialEq)]
struct PointingError {
    ra_deg: f64,
    dec_deg: f64,
    px: (f64, f64),
}

impl PointingError {
    fn magnitude_px(&self) -> f64 {
        self.px.0.hypot(self.px.1)
    }
}

pub struct RepositioningSession<'a> {
    observatory: &'a Observatory,
    config: &'a RepositioningConfig,
    sink: Option<&'a dyn ImageSink>,
    status: Option<&'a StatusWriter>,
}

impl<'a> RepositioningSession<'a> {
    pub fn new(observatory: &'a Observatory, config: &'a RepositioningConfig) -> Self {
        Self {
            observatory,
            config,
            sink: None,
            status: None,
        }
    }

    /// Where repositioning frames go when `save_images` is enabled
    pub fn with_sink(mut self, sink: &'a dyn ImageSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_status(mut self, status: &'a StatusWriter) -> Self {
        self.status = Some(status);
        self
    }

    fn report_status(&self, text: String) {
        if let Some(status) = self.status {
            status.set(text);
        }
    }

    /// Run the loop. Only cancellation and hardware faults return `Err`;
    /// running out of attempts is a report with `converged == false`.
    pub async fn run(&self, request: &RepositioningRequest, cancel: &CancellationToken) -> SequencerResult<RepositioningReport> {
        let obs = self.observatory;
        let max_attempts = self.config.max_attempts + request.extra_attempts;
        let mut solve_budget = self.config.solve_failure_budget.unwrap_or(0);

        let frame = obs.telescope_frame().await;
        let target_frame = coords::icrs_to_frame(&request.target, frame, &obs.now());
        let mut working = target_frame;

        let mut report = RepositioningReport {
            converged: false,
            attempts: 0,
            exposures: 0,
            solve_failures: 0,
            last_error_px: None,
            working,
        };

        tracing::info!(
            "Repositioning {} onto pixel ({:.1}, {:.1}): tolerance {:.1}px, up to {} attempts",
            request.name,
            request.pixel.0,
            request.pixel.1,
            self.config.tolerance_px,
            max_attempts
        );

        let mut iteration = 0u32;
        while report.attempts < max_attempts {
            if cancel.is_cancelled() {
                return Err(SequencerError::Cancelled("repositioning".into()));
            }
            self.report_status(format!("Attempt {} of {}", report.attempts + 1, max_attempts));

            if iteration == 0 {
                if request.do_initial_slew {
                    let bias_deg = self.config.initial_offset_dec_arcsec / 3600.0;
                    if bias_deg != 0.0 {
                        tracing::info!("Applying initial declination offset of {:.1} arcsec", self.config.initial_offset_dec_arcsec);
                    }
                    let first = working.offset_by(0.0, bias_deg);
                    obs.slew_to_frame_coordinates(&first, frame, cancel).await?;
                }
            } else {
                obs.slew_to_frame_coordinates(&working, frame, cancel).await?;
            }
            self.settle(cancel).await?;

            if !self.config.check_and_refine && iteration > 0 {
                tracing::info!("Refinement disabled, accepting single corrective slew");
                report.converged = true;
                break;
            }
            iteration += 1;

            let image = self.take_frame(request, report.exposures, cancel).await?;
            report.exposures += 1;

            match self.measure(request, &target_frame, frame, &image, cancel).await? {
                None => {
                    report.solve_failures += 1;
                    if solve_budget > 0 {
                        solve_budget -= 1;
                        tracing::warn!("Plate solve failed, retrying ({} solve retries left)", solve_budget);
                    } else {
                        report.attempts += 1;
                        tracing::warn!("Plate solve failed, attempt {} of {} consumed", report.attempts, max_attempts);
                    }
                }
                Some(error) => {
                    report.attempts += 1;
                    report.last_error_px = Some(error.px);
                    let magnitude = error.magnitude_px();
                    tracing::info!(
                        "Attempt {}: pixel error ({:.2}, {:.2}) = {:.2}px, sky error RA {:+.2}\" Dec {:+.2}\"",
                        report.attempts,
                        error.px.0,
                        error.px.1,
                        magnitude,
                        error.ra_deg * 3600.0,
                        error.dec_deg * 3600.0
                    );
                    if magnitude <= self.config.tolerance_px {
                        report.converged = true;
                        break;
                    }
                    working = working.offset_by(error.ra_deg, error.dec_deg);
                }
            }
        }

        report.working = working;
        if report.converged {
            tracing::info!("Repositioning of {} converged after {} attempt(s)", request.name, report.attempts);
        } else {
            tracing::warn!("Repositioning of {} did not converge within {} attempts", request.name, max_attempts);
        }
        Ok(report)
    }

    async fn settle(&self, cancel: &CancellationToken) -> SequencerResult<()> {
        let settle = secs(self.observatory.settings.settle_time_secs);
        if settle.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(SequencerError::Cancelled("settle".into())),
            _ = tokio::time::sleep(settle) => Ok(()),
        }
    }

    async fn take_frame(
        &self,
        request: &RepositioningRequest,
        index: u32,
        cancel: &CancellationToken,
    ) -> SequencerResult<ImageData> {
        let obs = self.observatory;
        obs.guarded("set binning", cancel, obs.camera.set_binning(Binning::default()))
            .await?;
        obs.guarded("set subframe", cancel, obs.camera.set_subframe(Subframe::default()))
            .await?;

        let image = obs.expose(self.config.exposure_secs, true, cancel).await?;

        if self.config.save_images {
            if let Some(sink) = self.sink {
                let dir = self
                    .config
                    .save_path
                    .clone()
                    .unwrap_or_else(|| std::path::PathBuf::from("repositioning"));
                let path = dir.join(format!(
                    "{}_{}_{}.fts",
                    request.name.replace(' ', "_"),
                    obs.now().format("%Y%m%dT%H%M%S"),
                    index
                ));
                let metadata = FrameMetadata {
                    scan_id: String::new(),
                    scan_name: request.name.clone(),
                    frame_type: FrameType::Light,
                    exposure_secs: self.config.exposure_secs,
                    requested: Some(request.target),
                    achieved: obs.guarded("read coordinates", cancel, obs.telescope.coordinates()).await.ok(),
                    filter: obs.current_filter().await.ok().flatten(),
                    binning: Binning::default(),
                    subframe: Subframe::default(),
                    readout_mode: 0,
                    ccd_temperature: obs
                        .guarded("read CCD temperature", cancel, obs.camera.ccd_temperature())
                        .await
                        .ok(),
                    focuser_position: None,
                    centered: false,
                    previous_scan: None,
                    next_scan: None,
                    observed_at: obs.now(),
                };
                if let Err(e) = sink.save(&image, &metadata, &path).await {
                    tracing::warn!("Failed to save repositioning frame {}: {}", path.display(), e);
                }
            }
        }
        Ok(image)
    }

    /// Solve a frame and derive the pointing error. `None` means no usable
    /// solution.
    async fn measure(
        &self,
        request: &RepositioningRequest,
        target_frame: &SkyPosition,
        frame: coords::EquatorialFrame,
        image: &ImageData,
        cancel: &CancellationToken,
    ) -> SequencerResult<Option<PointingError>> {
        let obs = self.observatory;
        let Some(solver) = &obs.plate_solver else {
            tracing::warn!("No plate solver configured");
            return Ok(None);
        };

        let timeout = Duration::from_secs_f64(self.config.timeout_secs.max(1.0));
        let hints = SolveHints {
            center: Some(request.target),
            scale_arcsec: Some(obs.settings.pixel_scale_arcsec.0),
            timeout,
        };
        let wcs = match Watchdog::new("plate solve", timeout)
            .guard(cancel, solver.solve(image, &hints))
            .await
        {
            Ok(Some(wcs)) => wcs,
            Ok(None) => return Ok(None),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!("Plate solver error: {}", e);
                return Ok(None);
            }
        };

        let center = wcs.pixel_to_world(image.width as f64 / 2.0, image.height as f64 / 2.0);
        tracing::debug!("Image center at RA {:.5}h Dec {:+.4}", center.ra_hours, center.dec_deg);

        let Some(target_px) = wcs.world_to_pixel(&request.target) else {
            tracing::warn!("Target does not project onto the solved image");
            return Ok(None);
        };
        let predicted_sky = wcs.pixel_to_world(request.pixel.0, request.pixel.1);
        let predicted_frame = coords::icrs_to_frame(&predicted_sky, frame, &obs.now());

        Ok(Some(PointingError {
            ra_deg: coords::ra_difference_deg(target_frame, &predicted_frame),
            dec_deg: target_frame.dec_deg - predicted_frame.dec_deg,
            px: (request.pixel.0 - target_px.0, request.pixel.1 - target_px.1),
        }))
    }
}
