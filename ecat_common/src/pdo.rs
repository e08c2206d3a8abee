//! Process-data model shared between the master and consumer processes.
//!
//! This module contains:
//! - `snapshot`: The fixed-layout `BusSnapshot` placed in shared memory.
//! - `access`: Bit-exact copies between raw process images and typed values.

pub mod access;
pub mod snapshot;
