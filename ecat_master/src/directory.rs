//! Process-data variable directory.
//!
//! Resolves every configured variable against the master's live layout
//! once per PREOP entry and publishes the result into the bus snapshot.
//! The job thread and consumer processes only ever see byte offsets.
//!
//! | Live layout                        | Result                        |
//! |------------------------------------|-------------------------------|
//! | not found                          | absent (sentinel), warning    |
//! | size ≠ configured type size        | `VariableSizeMismatch`, fatal |
//! | bit offset not byte aligned        | absent (sentinel), warning    |
//! | beyond the process image           | absent (sentinel), warning    |
//! | otherwise                          | `(bit_offset / 8, size)`      |

use crate::error::CoordinatorError;
use ecat_common::bus::Direction;
use ecat_common::bus::config::SlaveConfig;
use ecat_common::bus::master::BusMaster;
use ecat_common::pdo::access::ABSENT_OFFSET;
use ecat_common::pdo::snapshot::{BusSnapshot, SlaveDescriptor, VariableDescriptor};
use tracing::{info, warn};

/// Result of resolving one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Byte offset in the process image, or [`ABSENT_OFFSET`].
    pub offset: u32,
    /// False when the variable is absent.
    pub found: bool,
}

impl Resolved {
    const ABSENT: Resolved = Resolved {
        offset: ABSENT_OFFSET,
        found: false,
    };
}

/// Resolve `variable` of `slave` to a byte offset.
///
/// # Errors
///
/// `VariableSizeMismatch` if the live size differs from `expected_size`.
pub fn resolve(
    master: &dyn BusMaster,
    slave: &SlaveConfig,
    variable: &str,
    expected_size: usize,
    direction: Direction,
) -> Result<Resolved, CoordinatorError> {
    let name = slave.qualified_name(variable);
    let Some(pv) = master.find_variable(direction, &name) else {
        warn!(variable = %name, %direction, "Process variable not found, marked absent");
        return Ok(Resolved::ABSENT);
    };

    if pv.bit_size as usize != expected_size * 8 {
        return Err(CoordinatorError::VariableSizeMismatch {
            name,
            expected: expected_size,
            actual_bits: pv.bit_size,
        });
    }
    if pv.bit_offset % 8 != 0 {
        warn!(
            variable = %name,
            bit_offset = pv.bit_offset,
            "Process variable not byte aligned, marked absent"
        );
        return Ok(Resolved::ABSENT);
    }

    let offset = pv.bit_offset / 8;
    let image_len = master.memory_requirements().size(direction);
    if offset as usize + expected_size > image_len {
        warn!(
            variable = %name,
            offset,
            image_len,
            "Process variable outside the process image, marked absent"
        );
        return Ok(Resolved::ABSENT);
    }

    Ok(Resolved {
        offset,
        found: true,
    })
}

/// Resolve every variable of every configured slave.
pub fn build(
    master: &dyn BusMaster,
    slaves: &[SlaveConfig],
) -> Result<Vec<SlaveDescriptor>, CoordinatorError> {
    let mut directory = Vec::with_capacity(slaves.len());
    let (mut resolved, mut absent) = (0usize, 0usize);

    for slave in slaves {
        let mut desc = SlaveDescriptor::new(slave.id, &slave.name);
        for (direction, vars) in [
            (Direction::Input, &slave.inputs),
            (Direction::Output, &slave.outputs),
        ] {
            for var in vars {
                let size = var.kind.size();
                let r = resolve(master, slave, &var.name, size, direction)?;
                let entry = if r.found {
                    resolved += 1;
                    VariableDescriptor::new(&var.name, r.offset, size as u32)
                } else {
                    absent += 1;
                    VariableDescriptor::absent(&var.name, size as u32)
                };
                desc.push(direction, entry)
                    .map_err(|e| CoordinatorError::DirectoryCapacity {
                        capacity: e.capacity,
                    })?;
            }
        }
        directory.push(desc);
    }

    info!(
        slaves = directory.len(),
        resolved, absent, "Process-data directory resolved"
    );
    Ok(directory)
}

/// Resolve and publish into `snapshot`.
pub fn resolve_and_publish(
    master: &dyn BusMaster,
    slaves: &[SlaveConfig],
    snapshot: &BusSnapshot,
) -> Result<(), CoordinatorError> {
    let directory = build(master, slaves)?;
    snapshot
        .publish_directory(&directory)
        .map_err(|e| CoordinatorError::DirectoryCapacity {
            capacity: e.capacity,
        })
}
