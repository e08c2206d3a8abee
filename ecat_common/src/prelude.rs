//! Prelude module for common re-exports.
//!
//! ```rust
//! use ecat_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::bus::config::{BridgeConfig, BusConfig, CycleConfig, MasterConfig, SlaveConfig};
pub use crate::config::{ConfigError, ConfigLoader, SharedConfig};

// ─── Bus ────────────────────────────────────────────────────────────
pub use crate::bus::master::{BusMaster, JobKind, JobReport, MasterError, StatusCode};
pub use crate::bus::{BusState, Direction};

// ─── Process data ───────────────────────────────────────────────────
pub use crate::pdo::access::{PdoValue, VarKind};
pub use crate::pdo::snapshot::{
    BusSnapshot, CycleTimes, DirectoryError, SlaveDescriptor, VariableDescriptor,
};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{MAX_CONSUMERS, MAX_SLAVES, MAX_VARIABLES};
