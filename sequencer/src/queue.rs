//! Scan requests, the scan queue and its hot-reload plumbing
//!
//! A [`ScanQueue`] is one schedule: an ordered list of [`ScanRequest`]s that
//! share a schedule id. Queues are replaced whole through a [`QueueHandle`];
//! the executor notices a staged replacement between scans.
//!
//! Schedules live on disk as JSON files named
//! `schedule_YYYY-MM-DDTHH-MM-SS.json`. The [`ScheduleStore`] keeps a status
//! log copy of the active schedule under the logs directory and resumes from
//! it when the same schedule is loaded again.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coords::{EquatorialFrame, SkyPosition};
use crate::devices::{Binning, Subframe};
use crate::error::{SequencerError, SequencerResult};

// =============================================================================
// SCAN REQUEST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    #[default]
    New,
    Done,
    Failed,
}

/// Detector pixel a target should be placed on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequestedPixel {
    /// Centre of the unbinned sensor
    Center,
    /// Unbinned pixel coordinates
    At { x: f64, y: f64 },
}

fn default_exposure_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_frame() -> EquatorialFrame {
    EquatorialFrame::J2000
}

/// One observation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub status: ScanStatus,
    #[serde(default)]
    pub status_message: Option<String>,

    /// `None` for frames that need no pointing
    #[serde(default)]
    pub target: Option<SkyPosition>,
    #[serde(default = "default_frame")]
    pub frame: EquatorialFrame,
    /// Proper motion in RA (times cos Dec), arcsec per hour
    #[serde(default)]
    pub pm_ra_cosdec: f64,
    /// Proper motion in Dec, arcsec per hour
    #[serde(default)]
    pub pm_dec: f64,

    pub exposure_secs: f64,
    #[serde(default = "default_exposure_count")]
    pub exposure_count: u32,
    #[serde(default = "default_true")]
    pub light: bool,
    #[serde(default)]
    pub binning: Binning,
    #[serde(default)]
    pub subframe: Subframe,
    /// Camera readout mode index; the run default applies when unset
    #[serde(default)]
    pub readout_mode: Option<usize>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Whether periodic autofocus may run before this scan
    #[serde(default = "default_true")]
    pub interrupt_allowed: bool,
    #[serde(default)]
    pub requested_pixel: Option<RequestedPixel>,
    /// Output file stem; derived from the scan name when unset
    #[serde(default)]
    pub filename: Option<String>,
}

impl ScanRequest {
    /// Light frame of `target` (J2000)
    pub fn light(name: impl Into<String>, target: SkyPosition, exposure_secs: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ScanStatus::New,
            status_message: None,
            target: Some(target),
            frame: EquatorialFrame::J2000,
            pm_ra_cosdec: 0.0,
            pm_dec: 0.0,
            exposure_secs,
            exposure_count: 1,
            light: true,
            binning: Binning::default(),
            subframe: Subframe::default(),
            readout_mode: None,
            filter: None,
            start_time: None,
            interrupt_allowed: true,
            requested_pixel: None,
            filename: None,
        }
    }

    /// Dark frame; no pointing
    pub fn dark(name: impl Into<String>, exposure_secs: f64) -> Self {
        Self {
            target: None,
            light: false,
            ..Self::light(name, SkyPosition::new(0.0, 0.0), exposure_secs)
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_binning(mut self, x: u32, y: u32) -> Self {
        self.binning = Binning { x, y };
        self
    }

    pub fn with_subframe(mut self, subframe: Subframe) -> Self {
        self.subframe = subframe;
        self
    }

    pub fn with_readout_mode(mut self, mode: usize) -> Self {
        self.readout_mode = Some(mode);
        self
    }

    pub fn with_proper_motion(mut self, pm_ra_cosdec: f64, pm_dec: f64) -> Self {
        self.pm_ra_cosdec = pm_ra_cosdec;
        self.pm_dec = pm_dec;
        self
    }

    pub fn with_requested_pixel(mut self, pixel: RequestedPixel) -> Self {
        self.requested_pixel = Some(pixel);
        self
    }

    pub fn with_exposure_count(mut self, count: u32) -> Self {
        self.exposure_count = count;
        self
    }

    pub fn uninterruptible(mut self) -> Self {
        self.interrupt_allowed = false;
        self
    }

    pub fn is_new(&self) -> bool {
        self.status == ScanStatus::New
    }

    pub fn has_proper_motion(&self) -> bool {
        self.pm_ra_cosdec != 0.0 || self.pm_dec != 0.0
    }

    /// Transition New -> Done. Returns false if the scan was already terminal.
    pub fn mark_done(&mut self) -> bool {
        if !self.is_new() {
            return false;
        }
        self.status = ScanStatus::Done;
        self.status_message = None;
        true
    }

    /// Transition New -> Failed. Returns false if the scan was already terminal.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> bool {
        if !self.is_new() {
            return false;
        }
        self.status = ScanStatus::Failed;
        self.status_message = Some(reason.into());
        true
    }

    /// Output file stem, with path separators and spaces replaced
    pub fn file_stem(&self) -> String {
        let raw = self.filename.as_deref().unwrap_or(&self.name);
        raw.chars()
            .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
            .collect()
    }
}

// =============================================================================
// SCAN QUEUE
// =============================================================================

/// One schedule's worth of scans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanQueue {
    #[serde(default = "Uuid::new_v4")]
    pub schedule_id: Uuid,
    #[serde(default)]
    pub scans: Vec<ScanRequest>,
    /// Status log the executor persists to after every scan
    #[serde(skip)]
    pub log_path: Option<PathBuf>,
}

impl ScanQueue {
    pub fn new(scans: Vec<ScanRequest>) -> Self {
        Self {
            schedule_id: Uuid::new_v4(),
            scans,
            log_path: None,
        }
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.scans.iter().filter(|s| s.is_new()).count()
    }

    /// Names of the scans before and after `index`
    pub fn neighbors(&self, index: usize) -> (Option<String>, Option<String>) {
        let previous = index
            .checked_sub(1)
            .and_then(|i| self.scans.get(i))
            .map(|s| s.name.clone());
        let next = self.scans.get(index + 1).map(|s| s.name.clone());
        (previous, next)
    }

    pub fn to_json(&self) -> SequencerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> SequencerResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// =============================================================================
// HOT RELOAD
// =============================================================================

/// Slot for a replacement queue, shared between whoever loads schedules and
/// the executor. Only the most recently staged queue is kept.
#[derive(Clone, Default)]
pub struct QueueHandle {
    staged: Arc<Mutex<Option<ScanQueue>>>,
}

impl QueueHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, queue: ScanQueue) {
        tracing::info!(
            "Staging schedule {} with {} scans",
            queue.schedule_id,
            queue.len()
        );
        if let Ok(mut slot) = self.staged.lock() {
            if let Some(previous) = slot.replace(queue) {
                tracing::debug!("Replaced staged schedule {} before it was picked up", previous.schedule_id);
            }
        }
    }

    pub fn has_staged(&self) -> bool {
        self.staged.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn take_staged(&self) -> Option<ScanQueue> {
        self.staged.lock().ok().and_then(|mut slot| slot.take())
    }
}

// =============================================================================
// SCHEDULE STORE
// =============================================================================

const SCHEDULE_PREFIX: &str = "schedule_";
const SCHEDULE_SUFFIX: &str = ".json";
const SCHEDULE_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// File name of a schedule that becomes active at `at`
pub fn schedule_file_name(at: &DateTime<Utc>) -> String {
    format!("{}{}{}", SCHEDULE_PREFIX, at.format(SCHEDULE_TIME_FORMAT), SCHEDULE_SUFFIX)
}

/// Activation time encoded in a schedule file name
pub fn parse_schedule_time(file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name
        .strip_prefix(SCHEDULE_PREFIX)?
        .strip_suffix(SCHEDULE_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, SCHEDULE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn io_error(path: &Path, e: std::io::Error) -> SequencerError {
    SequencerError::Io(format!("{}: {}", path.display(), e))
}

pub struct ScheduleStore {
    schedules_dir: PathBuf,
    logs_dir: PathBuf,
}

impl ScheduleStore {
    pub fn new(schedules_dir: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            schedules_dir: schedules_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn schedules_dir(&self) -> &Path {
        &self.schedules_dir
    }

    /// Newest schedule whose activation time is not after `now`
    pub fn newest_schedule(&self, now: &DateTime<Utc>) -> SequencerResult<Option<PathBuf>> {
        let entries = fs::read_dir(&self.schedules_dir).map_err(|e| io_error(&self.schedules_dir, e))?;

        let mut newest: Option<(DateTime<Utc>, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(at) = name.to_str().and_then(parse_schedule_time) else {
                continue;
            };
            if at > *now {
                continue;
            }
            if newest.as_ref().map(|(best, _)| at > *best).unwrap_or(true) {
                newest = Some((at, entry.path()));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    /// Status log path kept for `schedule`
    pub fn log_path_for(&self, schedule: &Path) -> PathBuf {
        match schedule.file_name() {
            Some(name) => self.logs_dir.join(name),
            None => self.logs_dir.join("schedule.json"),
        }
    }

    /// Load a schedule, resuming from its status log if one exists. The
    /// returned queue persists to that log.
    pub fn load(&self, schedule: &Path) -> SequencerResult<ScanQueue> {
        let log_path = self.log_path_for(schedule);
        let mut queue = if log_path.exists() {
            tracing::info!("Status log for {} exists, resuming from it", schedule.display());
            read_queue(&log_path)?
        } else {
            let queue = read_queue(schedule)?;
            write_queue(&log_path, &queue)?;
            queue
        };

        if queue.is_empty() {
            return Err(SequencerError::Schedule(format!("{} contains no scans", schedule.display())));
        }
        queue.log_path = Some(log_path);
        Ok(queue)
    }

    /// Write a new schedule file activating at `at`
    pub fn publish(&self, queue: &ScanQueue, at: &DateTime<Utc>) -> SequencerResult<PathBuf> {
        let path = self.schedules_dir.join(schedule_file_name(at));
        write_queue(&path, queue)?;
        Ok(path)
    }
}

pub fn read_queue(path: &Path) -> SequencerResult<ScanQueue> {
    let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    ScanQueue::from_json(&text).map_err(|e| SequencerError::Schedule(format!("{}: {}", path.display(), e)))
}

/// Replace `path` with the serialized queue via a sibling temp file
pub fn write_queue(path: &Path, queue: &ScanQueue) -> SequencerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, queue.to_json()?).map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
    Ok(())
}

// =============================================================================
// SCHEDULE WATCHER
// =============================================================================

/// Polls the schedules directory and stages each newly activated schedule
pub struct ScheduleWatcher {
    store: ScheduleStore,
    handle: QueueHandle,
    interval: Duration,
    current: Option<PathBuf>,
}

impl ScheduleWatcher {
    pub fn new(store: ScheduleStore, handle: QueueHandle, interval: Duration) -> Self {
        Self {
            store,
            handle,
            interval,
            current: None,
        }
    }

    /// Stage the newest schedule if it differs from the last one staged.
    /// Returns true when something was staged.
    pub fn check_once(&mut self, now: &DateTime<Utc>) -> SequencerResult<bool> {
        let Some(newest) = self.store.newest_schedule(now)? else {
            tracing::debug!("No active schedule in {}", self.store.schedules_dir().display());
            return Ok(false);
        };
        if self.current.as_ref() == Some(&newest) {
            return Ok(false);
        }

        tracing::info!("New schedule detected: {}", newest.display());
        let queue = self.store.load(&newest)?;
        self.handle.stage(queue);
        self.current = Some(newest);
        Ok(true)
    }

    /// Run until cancelled. Bad schedule files are logged and skipped.
    pub async fn run<C>(mut self, clock: C, cancel: CancellationToken)
    where
        C: Fn() -> DateTime<Utc> + Send,
    {
        loop {
            if let Err(e) = self.check_once(&clock()) {
                tracing::warn!("Schedule check failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("Schedule watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn sample_queue() -> ScanQueue {
        ScanQueue::new(vec![
            ScanRequest::light("m42", SkyPosition::new(5.588, -5.39), 30.0).with_filter("R"),
            ScanRequest::dark("dark30", 30.0),
        ])
    }

    #[test]
    fn test_status_transitions_only_from_new() {
        let mut scan = ScanRequest::dark("d", 1.0);
        assert!(scan.mark_failed("sun above limit"));
        assert!(!scan.mark_done());
        assert!(!scan.mark_failed("again"));
        assert_eq!(scan.status, ScanStatus::Failed);
        assert_eq!(scan.status_message.as_deref(), Some("sun above limit"));
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let json = r#"{ "scans": [ { "name": "vega", "exposure_secs": 5.0,
            "target": { "ra_hours": 18.6156, "dec_deg": 38.78 } } ] }"#;
        let queue = ScanQueue::from_json(json).unwrap();
        let scan = &queue.scans[0];
        assert_eq!(scan.status, ScanStatus::New);
        assert_eq!(scan.exposure_count, 1);
        assert!(scan.light);
        assert!(scan.interrupt_allowed);
        assert_eq!(scan.frame, EquatorialFrame::J2000);
        assert_eq!(scan.binning, Binning { x: 1, y: 1 });
    }

    #[test]
    fn test_requested_pixel_serde() {
        let scan = ScanRequest::light("t", SkyPosition::new(1.0, 2.0), 1.0)
            .with_requested_pixel(RequestedPixel::At { x: 100.0, y: 50.0 });
        let json = serde_json::to_string(&scan).unwrap();
        assert!(json.contains(r#""kind":"at""#));
        let back: ScanRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.requested_pixel, scan.requested_pixel);
    }

    #[test]
    fn test_file_stem_sanitized() {
        let mut scan = ScanRequest::dark("NGC 891/field a", 1.0);
        assert_eq!(scan.file_stem(), "NGC_891_field_a");
        scan.filename = Some("custom".into());
        assert_eq!(scan.file_stem(), "custom");
    }

    #[test]
    fn test_neighbors() {
        let queue = sample_queue();
        assert_eq!(queue.neighbors(0), (None, Some("dark30".to_string())));
        assert_eq!(queue.neighbors(1), (Some("m42".to_string()), None));
    }

    #[test]
    fn test_queue_handle_keeps_latest() {
        let handle = QueueHandle::new();
        assert!(!handle.has_staged());
        let first = sample_queue();
        let second = sample_queue();
        let second_id = second.schedule_id;
        handle.stage(first);
        handle.stage(second);
        assert!(handle.has_staged());
        assert_eq!(handle.take_staged().map(|q| q.schedule_id), Some(second_id));
        assert!(handle.take_staged().is_none());
    }

    #[test]
    fn test_schedule_file_name_round_trip() {
        let t = at(3, 15);
        let name = schedule_file_name(&t);
        assert_eq!(name, "schedule_2024-03-01T03-15-00.json");
        assert_eq!(parse_schedule_time(&name), Some(t));
        assert_eq!(parse_schedule_time("notes.txt"), None);
    }

    #[test]
    fn test_newest_schedule_ignores_future() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        fs::create_dir_all(store.schedules_dir()).unwrap();
        let early = store.publish(&sample_queue(), &at(1, 0)).unwrap();
        let late = store.publish(&sample_queue(), &at(4, 0)).unwrap();
        fs::write(store.schedules_dir().join("readme.txt"), "x").unwrap();

        assert_eq!(store.newest_schedule(&at(2, 0)).unwrap(), Some(early));
        assert_eq!(store.newest_schedule(&at(5, 0)).unwrap(), Some(late));
        assert_eq!(store.newest_schedule(&at(0, 30)).unwrap(), None);
    }

    #[test]
    fn test_load_prefers_status_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        let path = store.publish(&sample_queue(), &at(1, 0)).unwrap();

        let mut queue = store.load(&path).unwrap();
        let log = queue.log_path.clone().unwrap();
        assert!(log.exists());
        queue.scans[0].mark_done();
        write_queue(&log, &queue).unwrap();

        let resumed = store.load(&path).unwrap();
        assert_eq!(resumed.scans[0].status, ScanStatus::Done);
        assert_eq!(resumed.scans[1].status, ScanStatus::New);
    }

    #[test]
    fn test_empty_schedule_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        let path = store.publish(&ScanQueue::new(vec![]), &at(1, 0)).unwrap();
        assert!(matches!(store.load(&path), Err(SequencerError::Schedule(_))));
    }

    #[test]
    fn test_watcher_stages_each_schedule_once() {
        let dir = tempfile::tempdir().unwrap();
        let handle = QueueHandle::new();
        let store = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        store.publish(&sample_queue(), &at(1, 0)).unwrap();
        let mut watcher = ScheduleWatcher::new(store, handle.clone(), Duration::from_millis(10));

        assert!(watcher.check_once(&at(2, 0)).unwrap());
        assert!(handle.take_staged().is_some());
        assert!(!watcher.check_once(&at(2, 5)).unwrap());

        let store = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        store.publish(&sample_queue(), &at(3, 0)).unwrap();
        assert!(watcher.check_once(&at(3, 1)).unwrap());
        assert!(handle.has_staged());
    }

    #[tokio::test]
    async fn test_watcher_loop_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let handle = QueueHandle::new();
        let store = ScheduleStore::new(dir.path().join("schedules"), dir.path().join("logs"));
        store.publish(&sample_queue(), &at(1, 0)).unwrap();
        let watcher = ScheduleWatcher::new(store, handle.clone(), Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(|| at(2, 0), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.has_staged());
        cancel.cancel();
        task.await.unwrap();
    }
}
