//! Background plate-solve and finalize jobs
//!
//! Frames taken through a plate-solve filter are saved to the temp directory
//! and handed off here, so the executor can move on to the next scan while
//! the solve runs. Each job solves the frame, attaches the solution through
//! the image sink and moves the file to its final location. A failed or
//! timed-out solve still finalizes the frame, without a WCS.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::devices::{ImageData, ImageSink, PlateSolver, SolveHints};
use crate::error::SequencerResult;
use crate::status::{Instrument, StatusRegistry, StatusWriter};
use crate::watchdog::Watchdog;

/// One frame awaiting solve and finalize
#[derive(Debug, Clone)]
pub struct PostProcessJob {
    pub scan_name: String,
    pub image: ImageData,
    /// Where the frame was saved
    pub saved: PathBuf,
    /// Where the finalized frame belongs
    pub dest: PathBuf,
    pub hints: SolveHints,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicUsize,
    solved: AtomicUsize,
    unsolved: AtomicUsize,
    finalize_failed: AtomicUsize,
}

/// Totals over the processor's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostProcessStats {
    pub submitted: usize,
    pub solved: usize,
    pub unsolved: usize,
    pub finalize_failed: usize,
}

/// Result of waiting for outstanding jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub abandoned: usize,
}

pub struct AsyncPostProcessor {
    solver: Option<Arc<dyn PlateSolver>>,
    sink: Arc<dyn ImageSink>,
    status: Arc<StatusWriter>,
    cancel: CancellationToken,
    jobs: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl AsyncPostProcessor {
    /// Claims the WCS status key for the processor's lifetime
    pub fn new(
        solver: Option<Arc<dyn PlateSolver>>,
        sink: Arc<dyn ImageSink>,
        registry: &StatusRegistry,
        parent: &CancellationToken,
    ) -> SequencerResult<Self> {
        let status = registry.claim(Instrument::Wcs)?;
        status.set("Idle");
        Ok(Self {
            solver,
            sink,
            status: Arc::new(status),
            cancel: parent.child_token(),
            jobs: Vec::new(),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Number of jobs that have not finished
    pub fn outstanding(&mut self) -> usize {
        self.prune();
        self.jobs.len()
    }

    pub fn stats(&self) -> PostProcessStats {
        PostProcessStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            solved: self.counters.solved.load(Ordering::SeqCst),
            unsolved: self.counters.unsolved.load(Ordering::SeqCst),
            finalize_failed: self.counters.finalize_failed.load(Ordering::SeqCst),
        }
    }

    fn prune(&mut self) {
        self.jobs.retain(|job| !job.is_finished());
    }

    /// Start a job and return immediately
    pub fn submit(&mut self, job: PostProcessJob) {
        self.prune();
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Submitting {} for plate solving", job.saved.display());

        let solver = self.solver.clone();
        let sink = self.sink.clone();
        let status = self.status.clone();
        let counters = self.counters.clone();
        let cancel = self.cancel.clone();

        self.jobs.push(tokio::spawn(async move {
            status.set(format!("Solving {}", job.scan_name));
            let wcs = match solver {
                Some(solver) => {
                    let watchdog = Watchdog::new(format!("plate solve {}", job.scan_name), job.hints.timeout);
                    match watchdog.guard(&cancel, solver.solve(&job.image, &job.hints)).await {
                        Ok(Some(wcs)) => Some(wcs),
                        Ok(None) => {
                            tracing::warn!("Plate solve of {} found no solution", job.saved.display());
                            None
                        }
                        Err(e) => {
                            tracing::warn!("Plate solve of {} failed: {}", job.saved.display(), e);
                            None
                        }
                    }
                }
                None => {
                    tracing::warn!("No plate solver available, finalizing {} without WCS", job.saved.display());
                    None
                }
            };
            if wcs.is_some() {
                counters.solved.fetch_add(1, Ordering::SeqCst);
            } else {
                counters.unsolved.fetch_add(1, Ordering::SeqCst);
            }

            match sink.finalize(&job.saved, &job.dest, wcs.as_ref()).await {
                Ok(()) => {
                    tracing::info!("Finalized {}", job.dest.display());
                    status.set(format!("Finalized {}", job.scan_name));
                }
                Err(e) => {
                    counters.finalize_failed.fetch_add(1, Ordering::SeqCst);
                    tracing::error!("Failed to finalize {}: {}", job.saved.display(), e);
                    status.set(format!("Finalize failed for {}", job.scan_name));
                }
            }
        }));
    }

    /// Wait up to `timeout` for every outstanding job. Jobs still running
    /// after that are aborted.
    pub async fn drain(&mut self, timeout: Duration) -> DrainReport {
        self.prune();
        let jobs = std::mem::take(&mut self.jobs);
        let total = jobs.len();
        if total == 0 {
            return DrainReport { completed: 0, abandoned: 0 };
        }

        tracing::info!("Waiting up to {:.0}s for {} post-processing jobs", timeout.as_secs_f64(), total);
        let aborts: Vec<_> = jobs.iter().map(|job| job.abort_handle()).collect();

        match tokio::time::timeout(timeout, join_all(jobs)).await {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    tracing::error!("{} post-processing jobs ended abnormally", panicked);
                }
                self.status.set("Idle");
                DrainReport {
                    completed: total - panicked,
                    abandoned: panicked,
                }
            }
            Err(_) => {
                self.cancel.cancel();
                let abandoned = aborts.iter().filter(|a| !a.is_finished()).count();
                for abort in &aborts {
                    abort.abort();
                }
                tracing::warn!("Abandoned {} post-processing jobs after {:.0}s", abandoned, timeout.as_secs_f64());
                self.status.set("Abandoned outstanding jobs");
                DrainReport {
                    completed: total - abandoned,
                    abandoned,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::SkyPosition;
    use crate::sim::{MemoryImageSink, SimPlateSolver, SimTelescope};

    fn job(name: &str) -> PostProcessJob {
        PostProcessJob {
            scan_name: name.to_string(),
            image: ImageData::default(),
            saved: PathBuf::from(format!("temp/{}.fits", name)),
            dest: PathBuf::from(format!("images/{}.fits", name)),
            hints: SolveHints {
                center: Some(SkyPosition::new(1.0, 20.0)),
                scale_arcsec: Some(1.0),
                timeout: Duration::from_secs(1),
            },
        }
    }

    fn following_solver() -> Arc<dyn PlateSolver> {
        Arc::new(SimPlateSolver::following(Arc::new(SimTelescope::new()), (0.0, 0.0), 1.0, (10.0, 10.0)))
    }

    #[tokio::test]
    async fn test_jobs_finalize_with_wcs() {
        let sink = Arc::new(MemoryImageSink::default());
        let registry = StatusRegistry::new();
        let root = CancellationToken::new();
        let mut processor =
            AsyncPostProcessor::new(Some(following_solver()), sink.clone(), &registry, &root).unwrap();

        processor.submit(job("a"));
        processor.submit(job("b"));
        let report = processor.drain(Duration::from_secs(2)).await;

        assert_eq!(report, DrainReport { completed: 2, abandoned: 0 });
        let finalized = sink.finalized();
        assert_eq!(finalized.len(), 2);
        assert!(finalized.iter().all(|(_, _, wcs)| wcs.is_some()));
        assert_eq!(processor.stats().solved, 2);
        assert_eq!(registry.get(Instrument::Wcs).as_deref(), Some("Idle"));
    }

    #[tokio::test]
    async fn test_failed_solve_still_finalizes() {
        let sink = Arc::new(MemoryImageSink::default());
        let solver: Arc<dyn PlateSolver> =
            Arc::new(SimPlateSolver::scripted(SkyPosition::new(1.0, 20.0), (10.0, 10.0), vec![None], 1.0));
        let root = CancellationToken::new();
        let mut processor = AsyncPostProcessor::new(Some(solver), sink.clone(), &StatusRegistry::new(), &root).unwrap();

        processor.submit(job("c"));
        processor.drain(Duration::from_secs(2)).await;
        let finalized = sink.finalized();
        assert_eq!(finalized.len(), 1);
        assert!(finalized[0].2.is_none());
        assert_eq!(processor.stats().unsolved, 1);
    }

    #[tokio::test]
    async fn test_drain_abandons_slow_jobs() {
        let sink = Arc::new(MemoryImageSink::default());
        sink.set_finalize_delay(Duration::from_secs(10));
        let root = CancellationToken::new();
        let mut processor = AsyncPostProcessor::new(None, sink.clone(), &StatusRegistry::new(), &root).unwrap();

        processor.submit(job("slow"));
        let report = processor.drain(Duration::from_millis(30)).await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(processor.outstanding(), 0);
        assert!(sink.finalized().is_empty());
    }

    #[tokio::test]
    async fn test_wcs_key_is_exclusive() {
        let registry = StatusRegistry::new();
        let root = CancellationToken::new();
        let sink: Arc<dyn ImageSink> = Arc::new(MemoryImageSink::default());
        let _first = AsyncPostProcessor::new(None, sink.clone(), &registry, &root).unwrap();
        assert!(AsyncPostProcessor::new(None, sink, &registry, &root).is_err());
    }
}
