//! Bus-master service trait and related types.
//!
//! This module defines:
//! - `BusMaster` trait - Interface to the fieldbus master engine
//! - `StatusCode` / `JobReport` - Results of master calls
//! - `MasterError` enum - Error types for backend handling
//! - `MasterFactory` type alias - Backend factory function type
//!
//! The master engine itself (frame transmission, clock distribution,
//! mailbox protocols) lives behind this trait. Everything in the workspace
//! talks to the bus through it.

use crate::bus::config::MasterConfig;
use crate::bus::{BusState, Direction};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result code of a master service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Call succeeded.
    Ok,
    /// The master is not in a state that allows the call.
    InvalidState,
    /// No link on the bus interface.
    LinkDisconnected,
    /// The master is busy with a previous request.
    Busy,
    /// The call did not complete in time.
    Timeout,
    /// A requested object does not exist.
    NotFound,
    /// A parameter was rejected.
    InvalidParameter,
    /// The backend does not implement the call.
    NotSupported,
    /// Any other backend specific failure code.
    Failed(u32),
}

impl StatusCode {
    /// True if the call succeeded.
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Codes the cyclic path expects during start-up and cable faults.
    #[inline]
    pub const fn is_tolerated(self) -> bool {
        matches!(self, Self::InvalidState | Self::LinkDisconnected | Self::Busy)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::InvalidState => f.write_str("invalid state"),
            Self::LinkDisconnected => f.write_str("link disconnected"),
            Self::Busy => f.write_str("busy"),
            Self::Timeout => f.write_str("timeout"),
            Self::NotFound => f.write_str("not found"),
            Self::InvalidParameter => f.write_str("invalid parameter"),
            Self::NotSupported => f.write_str("not supported"),
            Self::Failed(code) => write!(f, "failed (0x{code:08x})"),
        }
    }
}

/// Cyclic jobs executed by the job runner, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Process all received frames; reports frame completeness.
    ProcessRxFrames,
    /// Send the cyclic process-data frames.
    SendCyclicFrames,
    /// Master timer and housekeeping.
    MasterTimer,
    /// Send queued acyclic (mailbox) frames.
    SendAcyclicFrames,
}

/// Outcome of [`BusMaster::execute_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    /// Status of the call.
    pub status: StatusCode,
    /// For `ProcessRxFrames`: every cyclic frame sent last cycle came back.
    /// Always `true` for the other jobs.
    pub frames_complete: bool,
}

impl JobReport {
    /// Successful job with all frames accounted for.
    pub const OK: JobReport = JobReport {
        status: StatusCode::Ok,
        frames_complete: true,
    };

    /// Report with the given status and complete frames.
    pub const fn status(status: StatusCode) -> Self {
        Self {
            status,
            frames_complete: true,
        }
    }
}

/// Bit location of a named process-data variable in a process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessVariable {
    /// Offset from the start of the process image, in bits.
    pub bit_offset: u32,
    /// Width of the variable, in bits.
    pub bit_size: u32,
}

/// Process image sizes reported by the master, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRequirements {
    /// Input process image size.
    pub input: usize,
    /// Output process image size.
    pub output: usize,
}

impl MemoryRequirements {
    /// Size for the given direction.
    #[inline]
    pub const fn size(&self, direction: Direction) -> usize {
        match direction {
            Direction::Input => self.input,
            Direction::Output => self.output,
        }
    }
}

/// Raw pointer into a process image owned by the master or by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePtr {
    /// First byte of the image.
    pub ptr: NonNull<u8>,
    /// Image length in bytes.
    pub len: usize,
}

// SAFETY: an ImagePtr is an address plus length. The memory behind it is
// shared between the job thread and the master by contract; all copies are
// done by the job thread.
unsafe impl Send for ImagePtr {}
unsafe impl Sync for ImagePtr {}

/// Externally owned memory handed to the master for its process images.
#[derive(Debug, Clone, Copy)]
pub struct MemoryProvider {
    /// Input process image memory.
    pub input: ImagePtr,
    /// Output process image memory.
    pub output: ImagePtr,
}

/// Distributed-clock synchronization diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// Clock synchronization not configured.
    #[default]
    Disabled,
    /// Clocks are converging.
    Settling,
    /// Slave clocks are within tolerance.
    InSync,
    /// Slave clocks drifted out of tolerance.
    OutOfSync,
}

/// Callback a link layer invokes once per bus cycle.
pub type LinkTrigger = Arc<dyn Fn() + Send + Sync>;

/// Error types for bus-master backends.
#[derive(Debug, Clone, Error)]
pub enum MasterError {
    /// Backend initialization failed.
    #[error("Master initialization failed: {0}")]
    InitFailed(String),

    /// Requested backend is not registered.
    #[error("Master backend not found: {0}")]
    BackendNotFound(String),

    /// A master call returned a failure status.
    #[error("{operation} failed: {status}")]
    Status {
        /// Name of the failing call.
        operation: &'static str,
        /// Returned status.
        status: StatusCode,
    },
}

/// Factory function type for creating master backends from configuration.
pub type MasterFactory = fn(&MasterConfig) -> Result<Arc<dyn BusMaster>, MasterError>;

/// Interface to the fieldbus master engine.
///
/// All methods take `&self`: the job thread and the supervisory loop call
/// into the same master concurrently, so backends synchronize internally.
///
/// # Timing Contracts
///
/// | Operation | Caller | RT Constraint |
/// |-----------|--------|---------------|
/// | `execute_job()` | job thread | **HARD** |
/// | `set_master_state()` | supervisor | None (may block up to `timeout`) |
/// | `find_variable()` | supervisor | None |
pub trait BusMaster: Send + Sync {
    /// Returns the backend's identifier (e.g., "simulation").
    fn name(&self) -> &'static str;

    /// Execute one cyclic job.
    ///
    /// Must not block beyond the job's own work.
    fn execute_job(&self, job: JobKind) -> JobReport;

    /// Current actual bus state.
    fn master_state(&self) -> BusState;

    /// Request a bus state, waiting at most `timeout` for it to be reached.
    fn set_master_state(&self, timeout: Duration, target: BusState) -> StatusCode;

    /// Look up a process-data variable by its qualified name
    /// (`<slave name>.<variable name>`).
    fn find_variable(&self, direction: Direction, name: &str) -> Option<ProcessVariable>;

    /// Pointer to the live process image, `None` before configuration.
    fn process_image(&self, direction: Direction) -> Option<ImagePtr>;

    /// Process image sizes required by the current configuration.
    fn memory_requirements(&self) -> MemoryRequirements;

    /// Make the master use externally owned memory for its process images.
    ///
    /// # Safety
    ///
    /// Both regions must stay mapped, at least as large as
    /// [`memory_requirements`](Self::memory_requirements), for as long as
    /// the master is alive.
    unsafe fn register_memory_provider(&self, provider: MemoryProvider) -> StatusCode;

    /// Number of slaves found on the bus.
    fn slave_count(&self) -> usize;

    /// License / authorization check result.
    fn is_authorized(&self) -> bool {
        true
    }

    /// Distributed-clock diagnostics.
    fn sync_status(&self) -> SyncStatus {
        SyncStatus::Disabled
    }

    /// Let the link layer drive cycle timing through `trigger`.
    ///
    /// Default: not supported.
    fn attach_link_timer(&self, _trigger: LinkTrigger) -> StatusCode {
        StatusCode::NotSupported
    }

    /// Stop the link-layer timer, if any, and release the bus.
    fn shutdown(&self) -> Result<(), MasterError> {
        Ok(())
    }
}
