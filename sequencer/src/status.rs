//! Live per-instrument status
//!
//! Each status key has at most one writer at a time. A writer obtains a
//! [`StatusWriter`] by claiming the key; the claim is released when the
//! writer is dropped. Any number of observers may take snapshots.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::devices::{SharedClock, SystemClock};
use crate::error::{SequencerError, SequencerResult};

/// Status keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instrument {
    Telescope,
    Camera,
    FilterWheel,
    Focuser,
    Rotator,
    Dome,
    CoverCalibrator,
    SafetyMonitor,
    ObservingConditions,
    Autofocus,
    Repositioning,
    Wcs,
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: String,
    pub updated: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Instrument, StatusEntry>,
    claimed: HashSet<Instrument>,
}

/// Shared status board, cheap to clone
#[derive(Clone)]
pub struct StatusRegistry {
    inner: Arc<RwLock<Inner>>,
    clock: SharedClock,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose entries are stamped by the observatory clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            clock,
        }
    }

    /// Take exclusive write access to `key`
    pub fn claim(&self, key: Instrument) -> SequencerResult<StatusWriter> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| SequencerError::StatusKeyClaimed(key))?;
        if !inner.claimed.insert(key) {
            return Err(SequencerError::StatusKeyClaimed(key));
        }
        tracing::debug!("Status key {} claimed", key);
        Ok(StatusWriter {
            key,
            registry: self.clone(),
        })
    }

    pub fn is_claimed(&self, key: Instrument) -> bool {
        self.inner
            .read()
            .map(|inner| inner.claimed.contains(&key))
            .unwrap_or(false)
    }

    pub fn get(&self, key: Instrument) -> Option<String> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.entries.get(&key).map(|e| e.status.clone()))
    }

    /// Point-in-time copy of every status
    pub fn snapshot(&self) -> BTreeMap<Instrument, StatusEntry> {
        self.inner
            .read()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }

    fn write(&self, key: Instrument, status: String) {
        let updated = self.clock.now();
        if let Ok(mut inner) = self.inner.write() {
            inner.entries.insert(
                key,
                StatusEntry {
                    status,
                    updated,
                },
            );
        }
    }

    fn release(&self, key: Instrument) {
        if let Ok(mut inner) = self.inner.write() {
            inner.claimed.remove(&key);
        }
    }
}

/// Exclusive writer for one status key
pub struct StatusWriter {
    key: Instrument,
    registry: StatusRegistry,
}

impl StatusWriter {
    pub fn key(&self) -> Instrument {
        self.key
    }

    pub fn set(&self, status: impl Into<String>) {
        self.registry.write(self.key, status.into());
    }
}

impl fmt::Debug for StatusWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusWriter").field("key", &self.key).finish()
    }
}

impl Drop for StatusWriter {
    fn drop(&mut self) {
        self.registry.release(self.key);
    }
}
