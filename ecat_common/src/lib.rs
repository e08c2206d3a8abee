//! ECAT Common Library
//!
//! This crate provides shared constants, configuration loading and the
//! fixed-layout process-data model for all ECAT workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Capacity limits and defaults
//! - [`config`] - Configuration loading traits and types
//! - [`bus`] - Bus states, the bus-master service contract and master config
//! - [`pdo`] - Shared snapshot layout and bit-exact process-data access
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! ecat = { package = "ecat_common", path = "../ecat_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use ecat_common::bus::BusState;
//! use ecat_common::config::{ConfigLoader, SharedConfig};
//! ```

#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod consts;
pub mod pdo;
pub mod prelude;
