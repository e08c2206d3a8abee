//! Error types of the master process.
//!
//! One enum per concern: the timing source, the state coordinator, and the
//! supervisor that owns both. The job thread has no error type; its
//! failures become log lines and counters.

use ecat_common::bus::BusState;
use ecat_common::bus::master::{MasterError, StatusCode};
use ecat_common::config::ConfigError;
use ecat_shared_memory::ShmError;
use std::time::Duration;
use thiserror::Error;

/// Real-time setup failure (memory locking, affinity, scheduler).
#[derive(Debug, Clone, Error)]
#[error("RT setup failed: {0}")]
pub struct RtSetupError(pub String);

/// Timing source errors.
#[derive(Debug, Clone, Error)]
pub enum TimingError {
    /// `stop` without a running timer, or `start` while running.
    #[error("timing source in invalid state: {0}")]
    InvalidState(&'static str),

    /// The link layer owns the cycle timing.
    #[error("operation not supported by externally driven timing")]
    NotSupported,

    /// The timer thread could not be started.
    #[error("timer thread creation failed: {0}")]
    ThreadCreationFailed(String),

    /// Real-time setup of the timer thread failed.
    #[error(transparent)]
    RtSetup(#[from] RtSetupError),
}

/// Bus state coordinator errors. All are fatal for startup.
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    /// Slaves found on the bus differ from the configured inventory.
    #[error("configuration mismatch: {configured} slaves configured, {found} found on the bus")]
    ConfigurationMismatch {
        /// Configured slave count.
        configured: usize,
        /// Slave count reported by the master.
        found: usize,
    },

    /// A resolved variable does not have the size of its configured type.
    #[error("variable '{name}': configured type is {expected} bytes, bus layout has {actual_bits} bits")]
    VariableSizeMismatch {
        /// Qualified variable name.
        name: String,
        /// Size of the configured type in bytes.
        expected: usize,
        /// Size reported by the master in bits.
        actual_bits: u32,
    },

    /// A transition request failed in a state where retrying makes no sense.
    #[error("transition to {target} failed: {status}")]
    TransitionFailed {
        /// Requested state.
        target: BusState,
        /// Status returned by the master.
        status: StatusCode,
    },

    /// Resolved directory does not fit the snapshot.
    #[error("slave directory exceeds snapshot capacity ({capacity})")]
    DirectoryCapacity {
        /// Capacity that was exceeded.
        capacity: usize,
    },

    /// Master backend failure.
    #[error(transparent)]
    Master(#[from] MasterError),
}

/// Errors of the supervisory loop and process setup.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shared-memory bridge could not be built.
    #[error("process-data bridge: {0}")]
    Bridge(#[from] ShmError),

    /// Timing source failure.
    #[error(transparent)]
    Timing(#[from] TimingError),

    /// State coordinator failure.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// Master backend failure.
    #[error(transparent)]
    Master(#[from] MasterError),

    /// Real-time setup failure.
    #[error(transparent)]
    RtSetup(#[from] RtSetupError),

    /// The job thread could not be spawned.
    #[error("job thread creation failed: {0}")]
    ThreadCreationFailed(String),

    /// The job thread panicked.
    #[error("job thread panicked")]
    JobPanicked,

    /// The job thread did not stop within the bound.
    #[error("job thread did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_messages_name_both_sides() {
        let err = CoordinatorError::ConfigurationMismatch {
            configured: 2,
            found: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('2') && msg.contains('3'));

        let err = CoordinatorError::VariableSizeMismatch {
            name: "EL3102.Value".into(),
            expected: 2,
            actual_bits: 32,
        };
        assert!(err.to_string().contains("EL3102.Value"));
    }

    #[test]
    fn supervisor_wraps_timing_errors() {
        let err: SupervisorError = TimingError::NotSupported.into();
        assert!(matches!(err, SupervisorError::Timing(TimingError::NotSupported)));
    }
}
