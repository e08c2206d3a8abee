//! End-to-end tests against the simulated master.

use ecat_common::bus::BusState;
use ecat_common::bus::Direction;
use ecat_common::bus::config::MasterConfig;
use ecat_common::bus::master::{BusMaster, JobKind, StatusCode};
use ecat_common::config::ConfigLoader;
use ecat_master::coordinator::StepOutcome;
use ecat_master::cycle::CycleRunner;
use ecat_master::drivers::simulation::SimulatedMaster;
use ecat_master::error::{CoordinatorError, SupervisorError};
use ecat_master::timing::TickSignal;
use ecat_master::Supervisor;
use ecat_shared_memory::{ProcessDataBridge, consumer_identity};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const T: Duration = Duration::from_millis(10);

/// Config with unique shared-memory names; removes the bridge on drop.
struct TestSetup {
    config: MasterConfig,
}

impl TestSetup {
    fn new(tag: &str, extra: &str) -> Self {
        let id = format!("ecat_mt_{tag}_{}", std::process::id());
        let doc = format!(
            r#"
[shared]
service_name = "ecat-test"

[cycle]
period_us = 1000

[bus]
supervisor_interval_ms = 5
monitor_interval_ms = 10

[bridge]
segment_name = "{id}"
semaphore_base = "{id}_sem"
semaphore_count = 4

[[slaves]]
id = 1
name = "EK1100"

[[slaves]]
id = 2
name = "IO"
inputs = [
    {{ name = "Status", kind = "u16" }},
    {{ name = "Echo", kind = "u32" }},
]
outputs = [{{ name = "Echo", kind = "u32" }}]

{extra}
"#
        );
        let config = MasterConfig::from_toml(&doc).unwrap();
        let _ = ProcessDataBridge::remove(&config.bridge);
        Self { config }
    }

    fn master(&self) -> Arc<SimulatedMaster> {
        Arc::new(SimulatedMaster::new(&self.config))
    }

    fn supervisor(&self, master: &Arc<SimulatedMaster>) -> Supervisor {
        Supervisor::new(self.config.clone(), Arc::clone(master) as Arc<dyn BusMaster>).unwrap()
    }
}

impl Drop for TestSetup {
    fn drop(&mut self) {
        let _ = ProcessDataBridge::remove(&self.config.bridge);
    }
}

fn entered(outcome: StepOutcome) -> BusState {
    match outcome {
        StepOutcome::Entered(state) => state,
        other => panic!("expected a transition, got {other:?}"),
    }
}

#[test]
fn op_from_unknown_in_four_iterations() {
    let setup = TestSetup::new("seq", "");
    let master = setup.master();
    let mut sup = setup.supervisor(&master);

    let snapshot = sup.bridge().snapshot();
    assert_eq!(snapshot.current_state(), BusState::Unknown);
    assert_eq!(snapshot.requested_state(), BusState::Op);

    let path: Vec<_> = (0..4).map(|_| entered(sup.step().unwrap())).collect();
    assert_eq!(
        path,
        [BusState::Init, BusState::PreOp, BusState::SafeOp, BusState::Op]
    );
    assert_eq!(sup.step().unwrap(), StepOutcome::Holding(BusState::Op));

    let snapshot = sup.bridge().snapshot();
    assert_eq!(snapshot.current_state(), BusState::Op);
    assert_eq!(snapshot.next_expected_state(), BusState::Op);
    assert!(snapshot.is_authorized.load(Ordering::Relaxed));

    let directory = snapshot.copy_directory().expect("published at PREOP");
    assert_eq!(directory.len(), 2);
    assert_eq!(directory[1].name.as_str(), "IO");
    assert_eq!(directory[1].variables(Direction::Input).len(), 2);
}

#[test]
fn step_down_on_new_request() {
    let setup = TestSetup::new("down", "");
    let master = setup.master();
    let mut sup = setup.supervisor(&master);
    for _ in 0..4 {
        sup.step().unwrap();
    }
    sup.request_state(BusState::PreOp);
    assert_eq!(entered(sup.step().unwrap()), BusState::PreOp);
    assert_eq!(sup.step().unwrap(), StepOutcome::Holding(BusState::PreOp));
}

#[test]
fn slave_count_mismatch_is_fatal() {
    let setup = TestSetup::new("count", "");
    let master = setup.master();
    master.set_slave_count(3);
    let mut sup = setup.supervisor(&master);

    let err = sup.step().unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Coordinator(CoordinatorError::ConfigurationMismatch {
            configured: 2,
            found: 3
        })
    ));
}

#[test]
fn slave_count_checked_when_master_starts_in_init() {
    let setup = TestSetup::new("initcount", "");
    let master = setup.master();
    assert!(master.set_master_state(T, BusState::Init).is_ok());
    master.set_slave_count(3);
    let mut sup = setup.supervisor(&master);

    sup.request_state(BusState::Init);
    assert!(matches!(
        sup.step(),
        Err(SupervisorError::Coordinator(CoordinatorError::ConfigurationMismatch {
            configured: 2,
            found: 3
        }))
    ));

    sup.request_state(BusState::Op);
    assert!(matches!(
        sup.step(),
        Err(SupervisorError::Coordinator(CoordinatorError::ConfigurationMismatch { .. }))
    ));
    assert_eq!(master.master_state(), BusState::Init);

    master.set_slave_count(2);
    assert_eq!(entered(sup.step().unwrap()), BusState::PreOp);
}

#[test]
fn variable_size_mismatch_aborts_preop() {
    let setup = TestSetup::new("size", "");
    let master = setup.master();
    master.override_variable(
        Direction::Input,
        "IO.Echo",
        ecat_common::bus::master::ProcessVariable {
            bit_offset: 16,
            bit_size: 16,
        },
    );
    let mut sup = setup.supervisor(&master);
    assert_eq!(entered(sup.step().unwrap()), BusState::Init);
    assert!(matches!(
        sup.step(),
        Err(SupervisorError::Coordinator(CoordinatorError::VariableSizeMismatch { .. }))
    ));
}

#[test]
fn missing_variable_does_not_stop_startup() {
    let setup = TestSetup::new("absent", "");
    let master = setup.master();
    master.hide_variable(Direction::Input, "IO.Status");
    let mut sup = setup.supervisor(&master);
    for _ in 0..4 {
        sup.step().unwrap();
    }
    let slaves = sup.bridge().snapshot().copy_directory().unwrap();
    let (_, status) = slaves[1].find("Status").unwrap();
    assert!(!status.is_present());
}

#[test]
fn safeop_retried_while_clocks_settle() {
    let setup = TestSetup::new("dc", "");
    let mut config = setup.config.clone();
    config.bus.dc_enabled = true;
    let master = Arc::new(SimulatedMaster::new(&config));
    master.set_dc_settle_attempts(2);
    let mut sup = Supervisor::new(config, Arc::clone(&master) as Arc<dyn BusMaster>).unwrap();

    assert_eq!(entered(sup.step().unwrap()), BusState::Init);
    assert_eq!(entered(sup.step().unwrap()), BusState::PreOp);
    for _ in 0..2 {
        assert_eq!(
            sup.step().unwrap(),
            StepOutcome::Retry {
                target: BusState::SafeOp,
                status: StatusCode::Timeout
            }
        );
    }
    assert_eq!(entered(sup.step().unwrap()), BusState::SafeOp);
    assert_eq!(entered(sup.step().unwrap()), BusState::Op);
}

#[test]
fn preop_failure_is_fatal() {
    let setup = TestSetup::new("preop", "");
    let master = setup.master();
    master.fail_transitions(BusState::PreOp, 1);
    let mut sup = setup.supervisor(&master);
    sup.step().unwrap();
    assert!(matches!(
        sup.step(),
        Err(SupervisorError::Coordinator(CoordinatorError::TransitionFailed {
            target: BusState::PreOp,
            status: StatusCode::Timeout
        }))
    ));
}

#[test]
fn job_runner_counts_overload_and_publishes() {
    let setup = TestSetup::new("overload", "");
    let master = setup.master();
    let bridge = Arc::new(
        ProcessDataBridge::create(&setup.config.bridge, master.memory_requirements()).unwrap(),
    );
    let mut runner = CycleRunner::new(
        Arc::clone(&master) as Arc<dyn BusMaster>,
        Arc::clone(&bridge),
        Arc::new(TickSignal::new()),
        1_000_000,
    );

    // Before PREOP the cyclic jobs are refused; the runner carries on.
    runner.run_cycle();
    assert_eq!(master.job_count(JobKind::SendAcyclicFrames), 1);

    assert!(master.set_master_state(T, BusState::Init).is_ok());
    assert!(master.set_master_state(T, BusState::PreOp).is_ok());
    master.inject_frame_loss(6);
    for _ in 0..6 {
        runner.run_cycle();
    }
    assert_eq!(runner.overload().counter(), 60);
    assert!(runner.overload().is_overloaded());

    let snapshot = bridge.snapshot();
    assert_eq!(snapshot.overload_counter.load(Ordering::Relaxed), 60);
    assert_eq!(snapshot.cycle_count.load(Ordering::Relaxed), 7);
    let times = snapshot.cycle_times();
    assert!(times.min_ns <= times.max_ns);

    runner.run_cycle();
    assert_eq!(runner.overload().counter(), 59);
}

#[test]
fn consumer_sees_looped_back_outputs() {
    let setup = TestSetup::new("loop", "");
    let master = setup.master();
    let mut sup = setup.supervisor(&master);
    for _ in 0..4 {
        sup.step().unwrap();
    }
    sup.start().unwrap();
    assert!(sup.is_cycling());

    let consumer = ProcessDataBridge::open(&setup.config.bridge).unwrap();
    let me = consumer_identity();
    let io = consumer.slave_index("IO").unwrap();
    consumer.set_value::<u32>(io, "Echo", 0xC0FF_EE00).unwrap();

    let mut echoed = false;
    for _ in 0..200 {
        consumer.wait_timeout(me, Duration::from_secs(1)).unwrap();
        if consumer.get_value::<u32>(io, "Echo").ok() == Some(0xC0FF_EE00) {
            echoed = true;
            break;
        }
    }
    assert!(echoed, "output never looped back to the input image");

    sup.shutdown().unwrap();
    assert!(!sup.is_cycling());
}

#[test]
fn loopback_continues_while_directory_is_republished() {
    let setup = TestSetup::new("republish", "");
    let master = setup.master();
    let mut sup = setup.supervisor(&master);
    for _ in 0..4 {
        sup.step().unwrap();
    }
    sup.start().unwrap();

    let consumer = ProcessDataBridge::open(&setup.config.bridge).unwrap();
    let me = consumer_identity();
    let io = consumer.slave_index("IO").unwrap();
    let bridge = Arc::clone(sup.bridge());

    for value in 1..=20u32 {
        ecat_master::directory::resolve_and_publish(
            master.as_ref(),
            &setup.config.slaves,
            bridge.snapshot(),
        )
        .unwrap();
        consumer.set_value::<u32>(io, "Echo", value).unwrap();

        let mut echoed = false;
        for _ in 0..200 {
            consumer.wait_timeout(me, Duration::from_secs(1)).unwrap();
            if consumer.get_value::<u32>(io, "Echo").ok() == Some(value) {
                echoed = true;
                break;
            }
        }
        assert!(echoed, "value {value} never looped back");
    }

    sup.shutdown().unwrap();
}

#[test]
fn bounded_run_stops_cleanly() {
    let setup = TestSetup::new("bounded", "");
    let master = setup.master();
    let mut sup = setup.supervisor(&master);
    sup.run(Some(50)).unwrap();

    let snapshot = sup.bridge().snapshot();
    assert!(snapshot.cycle_count.load(Ordering::Relaxed) >= 50);
    assert!(!sup.is_cycling());
    assert!(!sup.running_flag().load(Ordering::Relaxed));
}

#[test]
fn link_driven_timing_runs_cycles() {
    let setup = TestSetup::new("link", "");
    let mut config = setup.config.clone();
    config.cycle.timing = ecat_common::bus::config::TimingMode::ExternallyDriven;
    let master = Arc::new(SimulatedMaster::new(&config));
    let mut sup = Supervisor::new(config, Arc::clone(&master) as Arc<dyn BusMaster>).unwrap();
    sup.run(Some(20)).unwrap();
    assert!(master.job_count(JobKind::ProcessRxFrames) >= 20);
}

#[test]
fn mapped_process_images_alias_shared_regions() {
    let setup = TestSetup::new("mapped", "");
    let mut config = setup.config.clone();
    config.bridge.map_process_image = true;
    let master = Arc::new(SimulatedMaster::new(&config));
    let sup = Supervisor::new(config, Arc::clone(&master) as Arc<dyn BusMaster>).unwrap();

    let shared = sup.bridge().input().image().unwrap();
    let live = master.process_image(Direction::Input).unwrap();
    assert_eq!(shared.ptr, live.ptr);
}
