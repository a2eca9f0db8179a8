//! Background pollers
//!
//! Three independent loops run next to the executor:
//! - observing conditions: refresh the weather source on a fixed interval
//! - safety: read every safety monitor, hand the first unsafe reading to a
//!   [`SafetyFaultHandler`] and stop
//! - derotation: keep the rotator matched to the field rotation of a target
//!
//! Every loop runs on a child of the owner's cancellation token, so none of
//! them can outlive it. Start and stop are idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{secs, PollerConfig};
use crate::coords::{self, EquatorialFrame, SkyPosition};
use crate::error::SequencerResult;
use crate::observatory::Observatory;
use crate::status::{Instrument, StatusRegistry};
use crate::watchdog::Watchdog;

/// Reaction to the first unsafe safety reading
#[async_trait]
pub trait SafetyFaultHandler: Send + Sync {
    async fn on_unsafe(&self, readings: &[bool]);
}

/// Handler that shuts the observatory down
pub struct ShutdownOnUnsafe {
    observatory: Arc<Observatory>,
}

impl ShutdownOnUnsafe {
    pub fn new(observatory: Arc<Observatory>) -> Self {
        Self { observatory }
    }
}

#[async_trait]
impl SafetyFaultHandler for ShutdownOnUnsafe {
    async fn on_unsafe(&self, readings: &[bool]) {
        tracing::error!("Safety monitors report unsafe conditions {:?}, shutting down", readings);
        self.observatory.shutdown().await;
    }
}

#[derive(Default)]
struct PollerSlot {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl PollerSlot {
    fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn spawn<F, Fut>(&mut self, parent: &CancellationToken, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        self.handle = Some(tokio::spawn(body(token.clone())));
        self.cancel = Some(token);
    }

    async fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Poller task ended abnormally: {}", e);
            }
        }
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

pub struct BackgroundPollers {
    observatory: Arc<Observatory>,
    registry: StatusRegistry,
    config: PollerConfig,
    root: CancellationToken,
    conditions: PollerSlot,
    safety: PollerSlot,
    derotation: PollerSlot,
}

impl BackgroundPollers {
    pub fn new(
        observatory: Arc<Observatory>,
        registry: StatusRegistry,
        config: PollerConfig,
        root: &CancellationToken,
    ) -> Self {
        Self {
            observatory,
            registry,
            config,
            root: root.child_token(),
            conditions: PollerSlot::default(),
            safety: PollerSlot::default(),
            derotation: PollerSlot::default(),
        }
    }

    pub fn conditions_running(&self) -> bool {
        self.conditions.is_running()
    }

    pub fn safety_running(&self) -> bool {
        self.safety.is_running()
    }

    pub fn derotation_running(&self) -> bool {
        self.derotation.is_running()
    }

    // =========================================================================
    // Observing conditions
    // =========================================================================

    /// Returns `Ok(false)` if already running or there is no weather source
    pub fn start_conditions(&mut self) -> SequencerResult<bool> {
        if self.conditions.is_running() {
            return Ok(false);
        }
        let Some(source) = self.observatory.observing_conditions.clone() else {
            return Ok(false);
        };
        let status = self.registry.claim(Instrument::ObservingConditions)?;
        let interval = secs(self.config.conditions_interval_secs);
        let timeout = self.observatory.timing.timeout;

        tracing::info!("Starting observing conditions poller ({:.0}s interval)", interval.as_secs_f64());
        self.conditions.spawn(&self.root, move |cancel| async move {
            loop {
                match Watchdog::new("conditions refresh", timeout)
                    .guard(&cancel, source.refresh())
                    .await
                {
                    Ok(()) => {
                        let summary = source.summary().await.unwrap_or_else(|_| "Refreshed".to_string());
                        status.set(summary);
                    }
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => {
                        tracing::warn!("Observing conditions refresh failed: {}", e);
                        status.set("Refresh failed");
                    }
                }
                if !sleep_or_cancel(&cancel, interval).await {
                    break;
                }
            }
            status.set("Stopped");
            tracing::info!("Observing conditions poller stopped");
        });
        Ok(true)
    }

    pub async fn stop_conditions(&mut self) {
        self.conditions.stop().await;
    }

    // =========================================================================
    // Safety
    // =========================================================================

    /// Returns `Ok(false)` if already running or there are no monitors
    pub fn start_safety(&mut self, handler: Arc<dyn SafetyFaultHandler>) -> SequencerResult<bool> {
        if self.safety.is_running() {
            return Ok(false);
        }
        if self.observatory.safety_monitors.is_empty() {
            return Ok(false);
        }
        // a previous loop that tripped has released its key when it ended
        let status = self.registry.claim(Instrument::SafetyMonitor)?;
        let observatory = self.observatory.clone();
        let interval = secs(self.config.safety_interval_secs);

        tracing::info!("Starting safety monitor poller ({:.0}s interval)", interval.as_secs_f64());
        self.safety.spawn(&self.root, move |cancel| async move {
            loop {
                let readings = observatory.safety_status().await;
                if cancel.is_cancelled() {
                    break;
                }
                if readings.iter().all(|safe| *safe) {
                    status.set("Safe");
                } else {
                    status.set("Unsafe");
                    tracing::error!("Safety monitor reports unsafe: {:?}", readings);
                    handler.on_unsafe(&readings).await;
                    cancel.cancel();
                    break;
                }
                if !sleep_or_cancel(&cancel, interval).await {
                    break;
                }
            }
            tracing::info!("Safety monitor poller stopped");
        });
        Ok(true)
    }

    pub async fn stop_safety(&mut self) {
        self.safety.stop().await;
    }

    // =========================================================================
    // Derotation
    // =========================================================================

    /// Track field rotation for a J2000 target. Restarting with a new target
    /// requires a stop first.
    pub fn start_derotation(&mut self, target: SkyPosition) -> SequencerResult<bool> {
        if self.derotation.is_running() {
            return Ok(false);
        }
        let Some(rotator) = self.observatory.rotator.clone() else {
            return Ok(false);
        };
        let status = self.registry.claim(Instrument::Rotator)?;
        let observatory = self.observatory.clone();
        let tick = secs(self.config.derotation_interval_secs);

        tracing::info!("Starting derotation for RA {:.4}h Dec {:+.3}", target.ra_hours, target.dec_deg);
        self.derotation.spawn(&self.root, move |cancel| async move {
            status.set("Derotating");
            let latitude = observatory.settings.site.latitude_deg;
            let tick_secs = tick.as_secs_f64();
            let mut command = coords::derotation_step_deg(&observatory.altaz_of(&target), latitude, tick_secs);

            loop {
                let started = Instant::now();
                if let Err(e) = Watchdog::new("rotator move", observatory.timing.timeout)
                    .guard(&cancel, rotator.move_by(command))
                    .await
                {
                    if e.is_cancelled() {
                        break;
                    }
                    tracing::warn!("Derotation move failed: {}", e);
                    status.set("Derotation error");
                }

                command = next_derotation_step(&observatory, &target, tick);

                let remaining = tick.saturating_sub(started.elapsed());
                if !sleep_or_cancel(&cancel, remaining).await {
                    break;
                }
            }
            status.set("Idle");
            tracing::info!("Derotation stopped");
        });
        Ok(true)
    }

    pub async fn stop_derotation(&mut self) {
        self.derotation.stop().await;
    }

    pub async fn stop_all(&mut self) {
        self.stop_derotation().await;
        self.stop_safety().await;
        self.stop_conditions().await;
    }
}

/// Rotator step for the tick that starts one tick from now
fn next_derotation_step(observatory: &Observatory, target: &SkyPosition, tick: Duration) -> f64 {
    let ahead = observatory.now() + ChronoDuration::from_std(tick).unwrap_or_else(|_| ChronoDuration::zero());
    let of_date = coords::icrs_to_frame(target, EquatorialFrame::Topocentric, &ahead);
    let horizontal = coords::altaz(&of_date, &observatory.settings.site, &ahead);
    coords::derotation_step_deg(&horizontal, observatory.settings.site.latitude_deg, tick.as_secs_f64())
}

impl Drop for BackgroundPollers {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> PollerConfig {
        PollerConfig {
            conditions_interval_secs: 0.01,
            safety_interval_secs: 0.01,
            derotation_interval_secs: 0.01,
            ..PollerConfig::default()
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SafetyFaultHandler for CountingHandler {
        async fn on_unsafe(&self, _readings: &[bool]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_conditions_start_is_idempotent() {
        let rig = SimRig::new();
        let registry = StatusRegistry::new();
        let root = CancellationToken::new();
        let mut pollers = BackgroundPollers::new(Arc::new(rig.observatory()), registry.clone(), fast_config(), &root);

        assert!(pollers.start_conditions().unwrap());
        assert!(!pollers.start_conditions().unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.conditions.refresh_count() >= 2);

        pollers.stop_conditions().await;
        pollers.stop_conditions().await;
        assert!(!pollers.conditions_running());
        assert!(!registry.is_claimed(Instrument::ObservingConditions));
        let after = rig.conditions.refresh_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.conditions.refresh_count(), after);
    }

    #[tokio::test]
    async fn test_safety_fault_fires_once_and_stops() {
        let rig = SimRig::new();
        let root = CancellationToken::new();
        let mut pollers = BackgroundPollers::new(Arc::new(rig.observatory()), StatusRegistry::new(), fast_config(), &root);
        let handler = Arc::new(CountingHandler::default());

        assert!(pollers.start_safety(handler.clone()).unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        rig.safety.set_safe(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(!pollers.safety_running());

        // re-arming after the fault is allowed
        rig.safety.set_safe(true);
        assert!(pollers.start_safety(handler.clone()).unwrap());
        pollers.stop_all().await;
    }

    #[tokio::test]
    async fn test_default_handler_shuts_down() {
        let rig = SimRig::new();
        let observatory = Arc::new(rig.observatory());
        let root = CancellationToken::new();
        let mut pollers = BackgroundPollers::new(observatory.clone(), StatusRegistry::new(), fast_config(), &root);
        rig.safety.set_safe(false);
        pollers.start_safety(Arc::new(ShutdownOnUnsafe::new(observatory))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.telescope.parked_now());
    }

    #[tokio::test]
    async fn test_derotation_moves_rotator_until_stopped() {
        let rig = SimRig::new();
        let observatory = Arc::new(rig.observatory().with_rotator(rig.rotator.clone()));
        let root = CancellationToken::new();
        let registry = StatusRegistry::new();
        let mut pollers = BackgroundPollers::new(observatory, registry.clone(), fast_config(), &root);

        let target = rig.position_at_altitude(50.0);
        assert!(pollers.start_derotation(target).unwrap());
        assert!(!pollers.start_derotation(target).unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        pollers.stop_derotation().await;

        let moves = rig.rotator.moves();
        assert!(moves.len() >= 2);
        // target on the meridian, south of zenith: field rotates one way
        assert!(moves.iter().all(|m| *m > 0.0));
        let count = moves.len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.rotator.moves().len(), count);
        assert_eq!(registry.get(Instrument::Rotator).as_deref(), Some("Idle"));
    }

    #[tokio::test]
    async fn test_pollers_do_not_outlive_owner_token() {
        let rig = SimRig::new();
        let root = CancellationToken::new();
        let mut pollers = BackgroundPollers::new(Arc::new(rig.observatory()), StatusRegistry::new(), fast_config(), &root);
        pollers.start_conditions().unwrap();
        root.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pollers.conditions_running());
    }
}
