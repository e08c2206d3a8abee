//! Simulated bus master.
//!
//! Stands in for the master engine during development and in tests: the
//! configured slaves are "found" on the bus, their variables are packed
//! into process images in configuration order, and outputs are looped
//! back onto same-named inputs while the bus is in OP.

mod layout;
mod master;

pub use layout::SimLayout;
pub use master::SimulatedMaster;

use ecat_common::bus::config::MasterConfig;
use ecat_common::bus::master::{BusMaster, MasterError};
use std::sync::Arc;

/// Factory function to create a simulated master.
///
/// With distributed clocks enabled the first SAFEOP request fails while
/// the clocks settle, like a real bus does.
pub fn create_master(config: &MasterConfig) -> Result<Arc<dyn BusMaster>, MasterError> {
    let master = SimulatedMaster::new(config);
    if config.bus.dc_enabled {
        master.set_dc_settle_attempts(1);
    }
    Ok(Arc::new(master))
}
