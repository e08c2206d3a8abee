//! System-wide constants for the ECAT workspace.
//!
//! Single source of truth for all capacity limits and defaults.
//! The shared-memory layout depends on the capacities below, so every
//! attaching process must be built against the same values.

/// Maximum number of slaves held in the shared bus snapshot.
pub const MAX_SLAVES: usize = 50;

/// Maximum number of process-data variables per slave and direction.
pub const MAX_VARIABLES: usize = 32;

/// Capacity of a fixed-length name (slave or variable) in bytes.
pub const NAME_LEN: usize = 64;

/// Size of the named semaphore pool (one slot per registered consumer).
pub const MAX_CONSUMERS: usize = 10;

/// Default size of the snapshot segment (5 MiB).
pub const DEFAULT_SEGMENT_SIZE: usize = 5 * 1024 * 1024;

/// Default cycle period in microseconds (1 kHz).
pub const DEFAULT_CYCLE_PERIOD_US: u64 = 1000;

/// Lower bound for the timing source period (1 ms).
pub const MIN_CYCLE_PERIOD_NS: u64 = 1_000_000;

/// Overload counter increment for a cycle with missing frames.
pub const FRAME_LOSS_PENALTY: u32 = 10;

/// Overload counter value above which frame loss is reported as overload.
pub const OVERLOAD_THRESHOLD: u32 = 50;

/// Saturation value of the overload counter.
pub const OVERLOAD_CEILING: u32 = 100;

/// Default supervisory loop interval in milliseconds.
pub const DEFAULT_SUPERVISOR_INTERVAL_MS: u64 = 20;

/// Default synchronization diagnostics poll interval while in OP.
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 5000;

/// Default timeout handed to the master for a single state change.
pub const DEFAULT_STATE_TIMEOUT_MS: u64 = 5000;

/// Default bound for joining the job thread at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2000;

/// Default snapshot segment name.
pub const DEFAULT_SEGMENT_NAME: &str = "ecat_bus";

/// Default semaphore base name (slots are suffixed `0..N-1`).
pub const DEFAULT_SEMAPHORE_BASE: &str = "ecat_pulse";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ecat/master.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(MAX_SLAVES > 0 && MAX_SLAVES <= u16::MAX as usize);
        assert!(MAX_VARIABLES > 0);
        assert!(NAME_LEN > 1 && NAME_LEN <= 255);
        assert!(MAX_CONSUMERS > 0);
        assert!(OVERLOAD_THRESHOLD < OVERLOAD_CEILING);
        assert!(FRAME_LOSS_PENALTY > 0);
    }

    #[test]
    fn default_period_respects_minimum() {
        assert!(DEFAULT_CYCLE_PERIOD_US * 1000 >= MIN_CYCLE_PERIOD_NS);
    }
}
