//! Platform specific mapping and process helpers.

pub mod linux;

pub use linux::*;
