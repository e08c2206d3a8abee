//! # ECAT Master Library
//!
//! Cyclic coordination of a fieldbus master and its shared process data.
//!
//! # Module Structure
//!
//! - [`timing`] - Cycle timing source (self-timed thread or link-driven)
//! - [`cycle`] - Cyclic job runner, cycle statistics, overload detection
//! - [`coordinator`] - Bus state coordinator and its transition table
//! - [`directory`] - Resolution of configured variables to byte offsets
//! - [`supervisor`] - Supervisory loop owning all of the above
//! - [`registry`] - Master backend factories
//! - [`drivers`] - Master backends (simulation)
//! - [`rt`] - Real-time thread setup (`rt` feature)
//! - [`error`] - Error types
//!
//! # Threads
//!
//! ```text
//! ecat-timer  (RT)   absolute sleeps → TickSignal
//! ecat-job    (RT)   TickSignal → jobs → bridge → consumer pulse
//! main        (non-RT) supervisor: state requests, setup, diagnostics
//! ```

#![warn(missing_docs)]

pub mod coordinator;
pub mod cycle;
pub mod directory;
pub mod drivers;
pub mod error;
pub mod registry;
pub mod rt;
pub mod supervisor;
pub mod timing;

pub use coordinator::{StateCoordinator, StepOutcome, next_expected_state};
pub use cycle::{CycleRunner, CycleStats, JobThread};
pub use error::{CoordinatorError, SupervisorError, TimingError};
pub use registry::MasterRegistry;
pub use supervisor::Supervisor;
pub use timing::{CycleTimer, TickSignal, TimingSource};
