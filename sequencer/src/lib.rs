//! Observing Run Sequencer
//!
//! Drives an observatory through a queue of scans without supervision:
//! timing and environment gates, pointing and repositioning, instrument
//! configuration, exposure and background plate solving. Device access goes
//! through the capability traits in [`devices`], so the same executor runs
//! against real hardware bridges or the simulated rig in [`sim`].

pub mod config;
pub mod coords;
pub mod devices;
pub mod error;
pub mod executor;
pub mod logging;
pub mod observatory;
pub mod pollers;
pub mod postprocess;
pub mod queue;
pub mod report;
pub mod repositioning;
pub mod sim;
pub mod status;
pub mod watchdog;
pub mod wcs;

pub use config::{DomeMode, RunConfig, StartTimePolicy};
pub use coords::{EquatorialFrame, SkyPosition};
pub use error::{DeviceError, DeviceResult, SequencerError, SequencerResult};
pub use executor::{ExecutorEvent, ExecutorHandle, PassOutcome, ScanExecutor};
pub use logging::{init_logging, LoggingGuard};
pub use observatory::{Observatory, ObservatorySettings};
pub use pollers::{BackgroundPollers, SafetyFaultHandler, ShutdownOnUnsafe};
pub use postprocess::AsyncPostProcessor;
pub use queue::{QueueHandle, ScanQueue, ScanRequest, ScanStatus, ScheduleStore, ScheduleWatcher};
pub use report::RunSummary;
pub use repositioning::{RepositioningReport, RepositioningRequest, RepositioningSession};
pub use status::{Instrument, StatusRegistry, StatusWriter};
pub use watchdog::Watchdog;
pub use wcs::Wcs;
