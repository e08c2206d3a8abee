//! Master process configuration.
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! service_name = "ecat-master"
//!
//! [cycle]
//! period_us = 1000
//! timing = "self_timed"
//!
//! [bus]
//! requested_state = "op"
//! dc_enabled = true
//!
//! [bridge]
//! segment_name = "ecat_bus"
//!
//! [[slaves]]
//! id = 1001
//! name = "EL1008"
//! inputs = [{ name = "Channel1", kind = "u8" }]
//! ```

use crate::bus::BusState;
use crate::config::{ConfigError, SharedConfig};
use crate::consts::{
    DEFAULT_CYCLE_PERIOD_US, DEFAULT_MONITOR_INTERVAL_MS, DEFAULT_SEGMENT_NAME,
    DEFAULT_SEGMENT_SIZE, DEFAULT_SEMAPHORE_BASE, DEFAULT_SHUTDOWN_TIMEOUT_MS,
    DEFAULT_STATE_TIMEOUT_MS, DEFAULT_SUPERVISOR_INTERVAL_MS, MAX_CONSUMERS, MAX_SLAVES,
    MAX_VARIABLES, NAME_LEN,
};
use crate::pdo::access::VarKind;
use crate::pdo::snapshot::BusSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Fixed-capacity name as used in configuration and shared memory.
pub type Name = heapless::String<NAME_LEN>;

/// Top-level configuration of the master process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Common service fields.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Cycle timing.
    #[serde(default)]
    pub cycle: CycleConfig,
    /// Supervisory loop and state requests.
    #[serde(default)]
    pub bus: BusConfig,
    /// Shared process-data bridge.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Configured slave inventory, in bus order.
    #[serde(default)]
    pub slaves: Vec<SlaveConfig>,
}

/// How the cycle is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    /// Local timer thread with absolute-deadline sleeps.
    #[default]
    SelfTimed,
    /// The master's link layer signals each cycle.
    ExternallyDriven,
}

/// `[cycle]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Cycle period in microseconds.
    pub period_us: u64,
    /// Pacing mode.
    pub timing: TimingMode,
    /// CPU core for the timing thread.
    pub timer_cpu: usize,
    /// CPU core for the job thread.
    pub job_cpu: usize,
    /// SCHED_FIFO priority of the timing thread (`rt` feature only).
    pub timer_priority: i32,
    /// SCHED_FIFO priority of the job thread (`rt` feature only).
    pub job_priority: i32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period_us: DEFAULT_CYCLE_PERIOD_US,
            timing: TimingMode::SelfTimed,
            timer_cpu: 1,
            job_cpu: 1,
            timer_priority: 85,
            job_priority: 80,
        }
    }
}

impl CycleConfig {
    /// Cycle period in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.period_us.saturating_mul(1000)
    }
}

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// State the supervisor drives the bus towards.
    pub requested_state: BusState,
    /// Timeout handed to each state-change request.
    pub state_timeout_ms: u64,
    /// Supervisory loop period.
    pub supervisor_interval_ms: u64,
    /// Synchronization diagnostics poll period while in OP.
    pub monitor_interval_ms: u64,
    /// Distributed clocks configured; SAFEOP failures are then retried.
    pub dc_enabled: bool,
    /// Bound for joining the job thread at shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            requested_state: BusState::Op,
            state_timeout_ms: DEFAULT_STATE_TIMEOUT_MS,
            supervisor_interval_ms: DEFAULT_SUPERVISOR_INTERVAL_MS,
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            dc_enabled: false,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl BusConfig {
    /// State change timeout as `Duration`.
    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }

    /// Supervisory loop period as `Duration`.
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }

    /// Diagnostics poll period as `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Shutdown join bound as `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// `[bridge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Snapshot segment name; raw regions use `<name>_in` / `<name>_out`.
    pub segment_name: String,
    /// Semaphore base name; slots are `<base>0 .. <base>N-1`.
    pub semaphore_base: String,
    /// Number of semaphore slots.
    pub semaphore_count: usize,
    /// Snapshot segment size in bytes.
    pub segment_size: usize,
    /// Register the shared raw regions as the master's process images.
    pub map_process_image: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            segment_name: DEFAULT_SEGMENT_NAME.to_string(),
            semaphore_base: DEFAULT_SEMAPHORE_BASE.to_string(),
            semaphore_count: MAX_CONSUMERS,
            segment_size: DEFAULT_SEGMENT_SIZE,
            map_process_image: false,
        }
    }
}

impl BridgeConfig {
    /// Bridge config with custom names and defaults elsewhere.
    pub fn named(segment_name: &str, semaphore_base: &str) -> Self {
        Self {
            segment_name: segment_name.to_string(),
            semaphore_base: semaphore_base.to_string(),
            ..Self::default()
        }
    }

    /// Validate names and capacities.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("segment_name", &self.segment_name),
            ("semaphore_base", &self.semaphore_base),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(ConfigError::ValidationError(format!(
                    "bridge.{field} must be non-empty and must not contain '/': {value:?}"
                )));
            }
        }
        if self.semaphore_count == 0 || self.semaphore_count > MAX_CONSUMERS {
            return Err(ConfigError::ValidationError(format!(
                "bridge.semaphore_count must be in 1..={MAX_CONSUMERS}, got {}",
                self.semaphore_count
            )));
        }
        let needed = std::mem::size_of::<BusSnapshot>() + 4096;
        if self.segment_size < needed {
            return Err(ConfigError::ValidationError(format!(
                "bridge.segment_size {} too small for bus snapshot ({needed} bytes)",
                self.segment_size
            )));
        }
        Ok(())
    }
}

/// One process-data variable of a slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    /// Variable name as known to the master (without slave prefix).
    pub name: Name,
    /// Destination type; fixes the expected byte size.
    pub kind: VarKind,
}

/// One configured slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Numeric slave id (station address or alias).
    pub id: u32,
    /// Display name, also the prefix of its variable names.
    pub name: Name,
    /// Variables read from the input process image.
    #[serde(default)]
    pub inputs: Vec<VariableConfig>,
    /// Variables written to the output process image.
    #[serde(default)]
    pub outputs: Vec<VariableConfig>,
}

impl SlaveConfig {
    /// Name under which the master knows `variable`.
    pub fn qualified_name(&self, variable: &str) -> String {
        format!("{}.{}", self.name, variable)
    }
}

impl MasterConfig {
    /// Validate the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.bridge.validate()?;

        if self.cycle.period_us == 0 {
            return Err(ConfigError::ValidationError(
                "cycle.period_us must be > 0".to_string(),
            ));
        }
        if self.bus.supervisor_interval_ms == 0 || self.bus.monitor_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus intervals must be > 0".to_string(),
            ));
        }
        if self.slaves.len() > MAX_SLAVES {
            return Err(ConfigError::ValidationError(format!(
                "{} slaves configured, maximum is {MAX_SLAVES}",
                self.slaves.len()
            )));
        }

        let mut ids = HashSet::new();
        for slave in &self.slaves {
            if !ids.insert(slave.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate slave id {}",
                    slave.id
                )));
            }
            if slave.name.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "slave {} has an empty name",
                    slave.id
                )));
            }
            for (direction, vars) in [("inputs", &slave.inputs), ("outputs", &slave.outputs)] {
                if vars.len() > MAX_VARIABLES {
                    return Err(ConfigError::ValidationError(format!(
                        "slave '{}' has {} {direction}, maximum is {MAX_VARIABLES}",
                        slave.name,
                        vars.len()
                    )));
                }
                let mut names = HashSet::new();
                for var in vars {
                    if var.name.is_empty() || !names.insert(var.name.as_str()) {
                        return Err(ConfigError::ValidationError(format!(
                            "slave '{}' {direction}: empty or duplicate variable '{}'",
                            slave.name, var.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    const MASTER_TOML: &str = r#"
[shared]
service_name = "ecat-test"
log_level = "debug"

[cycle]
period_us = 2000
timing = "externally_driven"

[bus]
requested_state = "safeop"
dc_enabled = true

[bridge]
segment_name = "ecat_cfg_test"
semaphore_count = 4

[[slaves]]
id = 1
name = "EK1100"

[[slaves]]
id = 2
name = "EL3102"
inputs = [
    { name = "Status", kind = "u16" },
    { name = "Value", kind = "i16" },
]
outputs = [{ name = "Control", kind = "u16" }]
"#;

    #[test]
    fn parses_full_document() {
        let cfg = MasterConfig::from_toml(MASTER_TOML).unwrap();
        assert_eq!(cfg.cycle.period_ns(), 2_000_000);
        assert_eq!(cfg.cycle.timing, TimingMode::ExternallyDriven);
        assert_eq!(cfg.bus.requested_state, BusState::SafeOp);
        assert!(cfg.bus.dc_enabled);
        assert_eq!(cfg.bus.monitor_interval_ms, DEFAULT_MONITOR_INTERVAL_MS);
        assert_eq!(cfg.bridge.semaphore_count, 4);
        assert_eq!(cfg.slaves.len(), 2);
        assert_eq!(cfg.slaves[1].inputs[1].kind, VarKind::I16);
        assert_eq!(cfg.slaves[1].qualified_name("Value"), "EL3102.Value");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = MasterConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.bus.requested_state, BusState::Op);
        assert_eq!(cfg.bridge.semaphore_count, MAX_CONSUMERS);
    }

    #[test]
    fn rejects_duplicate_slave_ids() {
        let mut cfg = MasterConfig::from_toml(MASTER_TOML).unwrap();
        cfg.slaves[1].id = 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("duplicate slave id")
        ));
    }

    #[test]
    fn rejects_oversized_semaphore_pool() {
        let mut cfg = MasterConfig::default();
        cfg.bridge.semaphore_count = MAX_CONSUMERS + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_too_small_segment() {
        let mut cfg = MasterConfig::default();
        cfg.bridge.segment_size = 4096;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "x".repeat(NAME_LEN + 1);
        let doc = format!("[[slaves]]\nid = 1\nname = \"{long}\"\n");
        assert!(MasterConfig::from_toml(&doc).is_err());
    }
}
