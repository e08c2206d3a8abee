//! Bus-master backends.
//!
//! - [`simulation`] - In-process master for development and testing
//!
//! # Adding New Backends
//!
//! 1. Create a new submodule under `drivers/`
//! 2. Implement the `BusMaster` trait from `ecat_common::bus::master`
//! 3. Register its factory in [`MasterRegistry::with_builtin`](crate::registry::MasterRegistry::with_builtin)

pub mod simulation;
