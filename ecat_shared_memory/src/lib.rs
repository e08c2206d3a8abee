//! # ECAT Shared Process-Data Bridge
//!
//! Exposes the live process data of the fieldbus to other, independently
//! scheduled processes through POSIX shared memory.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────────────┐     ┌─────────────────┐
//! │ Job runner       │     │ /dev/shm                 │     │ Consumer 1..N   │
//! │ (producer)       │     │                          │     │                 │
//! │ ProcessDataBridge├────►│ <seg>      BusSnapshot   ├────►│ ProcessDataBridge│
//! │   ::create       │     │ <seg>_in   raw inputs    │     │   ::open        │
//! │                  │     │ <seg>_out  raw outputs   │◄────┤ set_value       │
//! │ publish_cycle()  ├────►│ sem.<base>0..N-1 pulses  ├────►│ wait(identity)  │
//! └──────────────────┘     └──────────────────────────┘     └─────────────────┘
//! ```
//!
//! ## Consistency
//!
//! No transactional snapshot is offered. Consumers read while the producer
//! writes and must tolerate torn reads across fields; the pulse only says
//! "a new cycle completed". The slave directory is the exception: it is
//! guarded by a generation counter and only changes during configuration.
//!
//! ## Error Handling
//!
//! ```rust,no_run
//! use ecat_common::bus::config::BridgeConfig;
//! use ecat_shared_memory::{ProcessDataBridge, ShmError};
//!
//! match ProcessDataBridge::open(&BridgeConfig::default()) {
//!     Ok(bridge) => { /* use bridge */ }
//!     Err(ShmError::NotFound { name }) => {
//!         eprintln!("'{name}' not found - is the master running?");
//!     }
//!     Err(e) => eprintln!("Unexpected error: {e}"),
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod error;
pub mod platform;
pub mod pool;
pub mod process_image;
pub mod segment;
pub mod semaphore;

pub use bridge::{ProcessDataBridge, VarRef};
pub use error::{ShmError, ShmResult};
pub use pool::{ConsumerRegistry, SemaphorePool, consumer_identity};
pub use process_image::RawRegion;
pub use segment::{SegmentHeader, SnapshotSegment, required_size, struct_version_hash};
pub use semaphore::NamedSemaphore;
