//! Master configuration loading tests.
//!
//! Tests for `MasterConfig::load()` + `validate()`: defaults, slave tables,
//! duplicate detection, bridge naming rules and capacity limits.

use ecat_common::bus::BusState;
use ecat_common::bus::config::{MasterConfig, TimingMode};
use ecat_common::config::{ConfigError, ConfigLoader};
use ecat_common::consts::{MAX_CONSUMERS, MAX_VARIABLES};
use ecat_common::pdo::access::VarKind;
use std::fs;
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("master.toml");
    fs::write(&path, body).unwrap();
    path
}

fn load(body: &str) -> Result<MasterConfig, ConfigError> {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, body);
    let config = MasterConfig::load(&path)?;
    config.validate()?;
    Ok(config)
}

#[test]
fn empty_file_yields_defaults() {
    let config = load("").unwrap();
    assert_eq!(config.bus.requested_state, BusState::Op);
    assert_eq!(config.cycle.timing, TimingMode::SelfTimed);
    assert_eq!(config.bridge.semaphore_count, MAX_CONSUMERS);
    assert!(config.slaves.is_empty());
}

#[test]
fn full_file_loads() {
    let config = load(
        r#"
[shared]
service_name = "line-3"
log_level = "debug"

[cycle]
period_us = 2000
timing = "externally_driven"

[bus]
requested_state = "safeop"
dc_enabled = true

[bridge]
segment_name = "line3_bus"
semaphore_base = "line3_pulse"
semaphore_count = 4

[[slaves]]
id = 1
name = "EL1008"
inputs = [{ name = "Input1", kind = "u8" }]

[[slaves]]
id = 2
name = "EL4102"
outputs = [{ name = "Ch1", kind = "i16" }, { name = "Ch2", kind = "i16" }]
"#,
    )
    .unwrap();

    assert_eq!(config.cycle.period_ns(), 2_000_000);
    assert_eq!(config.cycle.timing, TimingMode::ExternallyDriven);
    assert_eq!(config.bus.requested_state, BusState::SafeOp);
    assert!(config.bus.dc_enabled);
    assert_eq!(config.bridge.semaphore_count, 4);
    assert_eq!(config.slaves.len(), 2);
    assert_eq!(config.slaves[1].outputs[1].kind, VarKind::I16);
    assert_eq!(config.slaves[1].qualified_name("Ch2"), "EL4102.Ch2");
}

#[test]
fn duplicate_slave_id_is_rejected() {
    let err = load(
        r#"
[[slaves]]
id = 1
name = "a"

[[slaves]]
id = 1
name = "b"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn semaphore_base_with_slash_is_rejected() {
    let err = load("[bridge]\nsemaphore_base = \"/pulse\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn too_many_variables_is_rejected() {
    let inputs: Vec<String> = (0..=MAX_VARIABLES)
        .map(|i| format!("{{ name = \"v{i}\", kind = \"u8\" }}"))
        .collect();
    let body = format!(
        "[[slaves]]\nid = 1\nname = \"big\"\ninputs = [{}]\n",
        inputs.join(", ")
    );
    assert!(matches!(
        load(&body),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn unknown_kind_is_a_parse_error() {
    let err = load(
        r#"
[[slaves]]
id = 1
name = "x"
inputs = [{ name = "v", kind = "u128" }]
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}
