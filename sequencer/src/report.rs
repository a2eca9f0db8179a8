//! End-of-run summary report

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SequencerError, SequencerResult};
use crate::queue::ScanStatus;

/// What happened to one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub scan_id: Uuid,
    pub name: String,
    pub status: ScanStatus,
    pub message: Option<String>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub exposures: u32,
    pub filter: Option<String>,
    /// `None` when no repositioning was requested
    pub centered: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schedule_id: Option<Uuid>,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub outcomes: Vec<ScanOutcome>,
}

impl RunSummary {
    pub fn new(started: DateTime<Utc>) -> Self {
        Self {
            schedule_id: None,
            started,
            finished: None,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: ScanOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn count(&self, status: ScanStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn exposures(&self) -> u32 {
        self.outcomes.iter().map(|o| o.exposures).sum()
    }

    /// Name of the report file for the night the run started
    pub fn file_name(&self) -> String {
        format!("report_{}.txt", self.started.format("%Y-%m-%d"))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let schedule = self
            .schedule_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let finished = self
            .finished
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "in progress".to_string());

        out.push_str("Observing run summary\n");
        out.push_str("=====================\n");
        out.push_str(&format!("Schedule:  {}\n", schedule));
        out.push_str(&format!("Started:   {} UTC\n", self.started.format("%Y-%m-%d %H:%M:%S")));
        out.push_str(&format!("Finished:  {}\n", finished));
        out.push_str(&format!(
            "Scans:     {} processed, {} done, {} failed\n",
            self.outcomes.len(),
            self.count(ScanStatus::Done),
            self.count(ScanStatus::Failed)
        ));
        out.push_str(&format!("Exposures: {}\n\n", self.exposures()));

        out.push_str(&format!(
            "{:<24} {:<8} {:<6} {:>4} {:<9} {:<8} {}\n",
            "Scan", "Status", "Filter", "Exp", "Centered", "Start", "Message"
        ));
        for o in &self.outcomes {
            let status = match o.status {
                ScanStatus::New => "New",
                ScanStatus::Done => "Done",
                ScanStatus::Failed => "Failed",
            };
            let centered = match o.centered {
                Some(true) => "yes",
                Some(false) => "no",
                None => "-",
            };
            out.push_str(&format!(
                "{:<24} {:<8} {:<6} {:>4} {:<9} {:<8} {}\n",
                o.name,
                status,
                o.filter.as_deref().unwrap_or("-"),
                o.exposures,
                centered,
                o.started.format("%H:%M:%S"),
                o.message.as_deref().unwrap_or("")
            ));
        }
        out
    }

    /// Append the rendered report to the night's report file in `dir`
    pub fn write_to(&self, dir: &Path) -> SequencerResult<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| SequencerError::Io(format!("{}: {}", dir.display(), e)))?;
        let path = dir.join(self.file_name());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SequencerError::Io(format!("{}: {}", path.display(), e)))?;
        writeln!(file, "{}", self.render())?;
        tracing::info!("Run summary written to {}", path.display());
        Ok(path)
    }
}
