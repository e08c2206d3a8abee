//! Bus lifecycle types and the bus-master service contract.
//!
//! - `master`: The [`master::BusMaster`] trait, job kinds and status codes.
//! - `config`: TOML configuration of the master process.

pub mod config;
pub mod master;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of the fieldbus master.
///
/// Discriminants follow the application-layer state codes so the value
/// stored in shared memory is meaningful to any bus tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BusState {
    /// State not known (master not started, or indeterminate).
    #[default]
    Unknown = 0,
    /// Initialization.
    Init = 1,
    /// Pre-operational: mailbox up, no process data.
    #[serde(alias = "pre_op", alias = "pre-op")]
    PreOp = 2,
    /// Firmware update state.
    Bootstrap = 3,
    /// Safe-operational: inputs valid, outputs held safe.
    #[serde(alias = "safe_op", alias = "safe-op")]
    SafeOp = 4,
    /// Operational: full cyclic process data exchange.
    Op = 8,
}

impl BusState {
    /// All states, in discriminant order.
    pub const ALL: [BusState; 6] = [
        BusState::Unknown,
        BusState::Init,
        BusState::PreOp,
        BusState::Bootstrap,
        BusState::SafeOp,
        BusState::Op,
    ];

    /// Convert from raw `u8` value. Unrecognised values map to `Unknown`.
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Init,
            2 => Self::PreOp,
            3 => Self::Bootstrap,
            4 => Self::SafeOp,
            8 => Self::Op,
            _ => Self::Unknown,
        }
    }

    /// True for states that carry no usable information about the bus.
    #[inline]
    pub const fn is_indeterminate(self) -> bool {
        matches!(self, Self::Unknown | Self::Bootstrap)
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Init => "INIT",
            Self::PreOp => "PREOP",
            Self::Bootstrap => "BOOTSTRAP",
            Self::SafeOp => "SAFEOP",
            Self::Op => "OP",
        };
        f.write_str(s)
    }
}

/// Unrecognised state name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown bus state '{0}' (expected init, preop, bootstrap, safeop or op)")]
pub struct ParseStateError(pub String);

impl FromStr for BusState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "unknown" => Ok(Self::Unknown),
            "init" => Ok(Self::Init),
            "preop" => Ok(Self::PreOp),
            "bootstrap" => Ok(Self::Bootstrap),
            "safeop" => Ok(Self::SafeOp),
            "op" => Ok(Self::Op),
            _ => Err(ParseStateError(s.to_string())),
        }
    }
}

/// Process-image direction, seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Slave → master (sensors, status words).
    Input,
    /// Master → slave (actuators, control words).
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}
