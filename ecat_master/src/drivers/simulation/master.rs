//! `SimulatedMaster`: the `BusMaster` implementation of the simulation backend.

use super::layout::SimLayout;
use ecat_common::bus::BusState;
use ecat_common::bus::Direction;
use ecat_common::bus::config::MasterConfig;
use ecat_common::bus::master::{
    BusMaster, ImagePtr, JobKind, JobReport, LinkTrigger, MasterError, MemoryProvider,
    MemoryRequirements, ProcessVariable, StatusCode, SyncStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Process images, either owned or provided by the bridge.
struct Images {
    input: ImagePtr,
    output: ImagePtr,
    _owned: Option<(Box<[u8]>, Box<[u8]>)>,
}

impl Images {
    fn owned(requirements: MemoryRequirements) -> Self {
        let mut input = vec![0u8; requirements.input].into_boxed_slice();
        let mut output = vec![0u8; requirements.output].into_boxed_slice();
        Self {
            input: image_ptr(&mut input),
            output: image_ptr(&mut output),
            _owned: Some((input, output)),
        }
    }
}

fn image_ptr(buf: &mut [u8]) -> ImagePtr {
    ImagePtr {
        ptr: NonNull::from(&mut *buf).cast::<u8>(),
        len: buf.len(),
    }
}

/// Bus state plus injected faults.
struct BusModel {
    state: BusState,
    sync: SyncStatus,
    dc_settle_attempts: u32,
    link_up: bool,
    failures: HashMap<BusState, u32>,
}

/// Link-layer timer thread.
struct LinkTimer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// In-process bus master.
pub struct SimulatedMaster {
    layout: Mutex<SimLayout>,
    requirements: MemoryRequirements,
    images: Mutex<Images>,
    bus: Mutex<BusModel>,
    dc_enabled: bool,
    slave_count: AtomicUsize,
    frame_loss: AtomicU32,
    jobs: [AtomicU64; 4],
    period: Duration,
    link_timer: Mutex<Option<LinkTimer>>,
}

impl SimulatedMaster {
    /// Master with the slaves and variables of `config` on its bus.
    pub fn new(config: &MasterConfig) -> Self {
        let layout = SimLayout::pack(&config.slaves);
        let requirements = layout.requirements();
        debug!(
            slaves = config.slaves.len(),
            input_bytes = requirements.input,
            output_bytes = requirements.output,
            "Simulated bus layout packed"
        );
        Self {
            layout: Mutex::new(layout),
            requirements,
            images: Mutex::new(Images::owned(requirements)),
            bus: Mutex::new(BusModel {
                state: BusState::Unknown,
                sync: SyncStatus::Settling,
                dc_settle_attempts: 0,
                link_up: true,
                failures: HashMap::new(),
            }),
            dc_enabled: config.bus.dc_enabled,
            slave_count: AtomicUsize::new(config.slaves.len()),
            frame_loss: AtomicU32::new(0),
            jobs: Default::default(),
            period: Duration::from_nanos(config.cycle.period_ns().max(1)),
            link_timer: Mutex::new(None),
        }
    }

    // ── Fault injection ──

    /// Report `count` slaves on the bus regardless of configuration.
    pub fn set_slave_count(&self, count: usize) {
        self.slave_count.store(count, Ordering::Relaxed);
    }

    /// Remove `name` from the live layout.
    pub fn hide_variable(&self, direction: Direction, name: &str) {
        self.layout.lock().hide(direction, name);
    }

    /// Place `name` at `variable` in the live layout.
    pub fn override_variable(&self, direction: Direction, name: &str, variable: ProcessVariable) {
        self.layout.lock().set(direction, name, variable);
    }

    /// Lose the cyclic frames of the next `cycles` receive jobs.
    pub fn inject_frame_loss(&self, cycles: u32) {
        self.frame_loss.fetch_add(cycles, Ordering::Relaxed);
    }

    /// Let the next `times` requests for `target` time out.
    pub fn fail_transitions(&self, target: BusState, times: u32) {
        self.bus.lock().failures.insert(target, times);
    }

    /// SAFEOP requests failing while distributed clocks settle.
    pub fn set_dc_settle_attempts(&self, attempts: u32) {
        self.bus.lock().dc_settle_attempts = attempts;
    }

    /// Plug or unplug the bus cable.
    pub fn set_link_connected(&self, connected: bool) {
        self.bus.lock().link_up = connected;
    }

    /// Number of times `job` was executed.
    pub fn job_count(&self, job: JobKind) -> u64 {
        self.jobs[job_index(job)].load(Ordering::Relaxed)
    }

    fn loop_back_outputs(&self) {
        let images = self.images.lock();
        let layout = self.layout.lock();
        for lb in layout.loopback() {
            if lb.output + lb.size > images.output.len || lb.input + lb.size > images.input.len {
                continue;
            }
            // SAFETY: ranges checked against both image lengths; the images
            // are separate allocations.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    images.output.ptr.as_ptr().add(lb.output),
                    images.input.ptr.as_ptr().add(lb.input),
                    lb.size,
                );
            }
        }
    }

    fn stop_link_timer(&self) {
        if let Some(timer) = self.link_timer.lock().take() {
            timer.stop.store(true, Ordering::Release);
            if timer.handle.join().is_err() {
                warn!("Link timer thread panicked");
            }
        }
    }
}

fn job_index(job: JobKind) -> usize {
    match job {
        JobKind::ProcessRxFrames => 0,
        JobKind::SendCyclicFrames => 1,
        JobKind::MasterTimer => 2,
        JobKind::SendAcyclicFrames => 3,
    }
}

/// One-step transitions a real bus accepts. Any state may fall back to INIT.
fn step_allowed(from: BusState, to: BusState) -> bool {
    use BusState::*;
    from == to
        || to == Init
        || matches!(
            (from, to),
            (Init, PreOp) | (Init, Bootstrap) | (PreOp, SafeOp) | (SafeOp, Op) | (SafeOp, PreOp)
                | (Op, SafeOp) | (Op, PreOp)
        )
}

impl BusMaster for SimulatedMaster {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn execute_job(&self, job: JobKind) -> JobReport {
        self.jobs[job_index(job)].fetch_add(1, Ordering::Relaxed);
        let (state, link_up) = {
            let bus = self.bus.lock();
            (bus.state, bus.link_up)
        };
        if !link_up {
            return JobReport::status(StatusCode::LinkDisconnected);
        }

        match job {
            JobKind::ProcessRxFrames | JobKind::SendCyclicFrames
                if !matches!(state, BusState::PreOp | BusState::SafeOp | BusState::Op) =>
            {
                JobReport::status(StatusCode::InvalidState)
            }
            JobKind::ProcessRxFrames => {
                if state == BusState::Op {
                    self.loop_back_outputs();
                }
                let lost = self
                    .frame_loss
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                    .is_ok();
                JobReport {
                    status: StatusCode::Ok,
                    frames_complete: !lost,
                }
            }
            _ => JobReport::OK,
        }
    }

    fn master_state(&self) -> BusState {
        self.bus.lock().state
    }

    fn set_master_state(&self, _timeout: Duration, target: BusState) -> StatusCode {
        let mut bus = self.bus.lock();
        if !bus.link_up {
            return StatusCode::LinkDisconnected;
        }
        if let Some(remaining) = bus.failures.get_mut(&target) {
            if *remaining > 0 {
                *remaining -= 1;
                return StatusCode::Timeout;
            }
        }
        if !step_allowed(bus.state, target) {
            return StatusCode::InvalidState;
        }
        if target == BusState::SafeOp && self.dc_enabled && bus.sync != SyncStatus::InSync {
            if bus.dc_settle_attempts > 0 {
                bus.dc_settle_attempts -= 1;
                return StatusCode::Timeout;
            }
            bus.sync = SyncStatus::InSync;
        }
        if bus.state != target {
            debug!(from = %bus.state, to = %target, "Simulated bus state change");
        }
        bus.state = target;
        StatusCode::Ok
    }

    fn find_variable(&self, direction: Direction, name: &str) -> Option<ProcessVariable> {
        self.layout.lock().find(direction, name)
    }

    fn process_image(&self, direction: Direction) -> Option<ImagePtr> {
        let images = self.images.lock();
        let image = match direction {
            Direction::Input => images.input,
            Direction::Output => images.output,
        };
        (image.len > 0).then_some(image)
    }

    fn memory_requirements(&self) -> MemoryRequirements {
        self.requirements
    }

    unsafe fn register_memory_provider(&self, provider: MemoryProvider) -> StatusCode {
        if provider.input.len < self.requirements.input
            || provider.output.len < self.requirements.output
        {
            return StatusCode::InvalidParameter;
        }
        if matches!(self.master_state(), BusState::SafeOp | BusState::Op) {
            return StatusCode::InvalidState;
        }
        *self.images.lock() = Images {
            input: provider.input,
            output: provider.output,
            _owned: None,
        };
        info!("Simulated master uses provided process-image memory");
        StatusCode::Ok
    }

    fn slave_count(&self) -> usize {
        self.slave_count.load(Ordering::Relaxed)
    }

    fn sync_status(&self) -> SyncStatus {
        if self.dc_enabled {
            self.bus.lock().sync
        } else {
            SyncStatus::Disabled
        }
    }

    fn attach_link_timer(&self, trigger: LinkTrigger) -> StatusCode {
        self.stop_link_timer();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let period = self.period;
        let spawned = thread::Builder::new()
            .name("ecat-sim-link".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    thread::sleep(period);
                    trigger();
                }
            });
        match spawned {
            Ok(handle) => {
                *self.link_timer.lock() = Some(LinkTimer { stop, handle });
                info!(period_us = period.as_micros() as u64, "Simulated link timer attached");
                StatusCode::Ok
            }
            Err(e) => {
                warn!(error = %e, "Simulated link timer could not start");
                StatusCode::Failed(1)
            }
        }
    }

    fn shutdown(&self) -> Result<(), MasterError> {
        self.stop_link_timer();
        self.bus.lock().state = BusState::Init;
        info!("Simulated master shut down");
        Ok(())
    }
}

impl Drop for SimulatedMaster {
    fn drop(&mut self) {
        self.stop_link_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecat_common::config::ConfigLoader;

    fn master(dc: bool) -> SimulatedMaster {
        let doc = format!(
            r#"
[bus]
dc_enabled = {dc}

[[slaves]]
id = 1
name = "IO"
inputs = [{{ name = "Echo", kind = "u16" }}]
outputs = [{{ name = "Echo", kind = "u16" }}]
"#
        );
        SimulatedMaster::new(&MasterConfig::from_toml(&doc).unwrap())
    }

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn transitions_are_one_step() {
        let m = master(false);
        assert_eq!(m.master_state(), BusState::Unknown);
        assert_eq!(m.set_master_state(T, BusState::PreOp), StatusCode::InvalidState);
        assert_eq!(m.set_master_state(T, BusState::Init), StatusCode::Ok);
        assert_eq!(m.set_master_state(T, BusState::SafeOp), StatusCode::InvalidState);
        assert_eq!(m.set_master_state(T, BusState::PreOp), StatusCode::Ok);
        assert_eq!(m.set_master_state(T, BusState::SafeOp), StatusCode::Ok);
        assert_eq!(m.set_master_state(T, BusState::Op), StatusCode::Ok);
        assert_eq!(m.set_master_state(T, BusState::Init), StatusCode::Ok);
        assert_eq!(m.master_state(), BusState::Init);
    }

    #[test]
    fn cyclic_jobs_need_preop() {
        let m = master(false);
        assert_eq!(
            m.execute_job(JobKind::ProcessRxFrames).status,
            StatusCode::InvalidState
        );
        assert!(m.execute_job(JobKind::MasterTimer).status.is_ok());
        m.set_master_state(T, BusState::Init);
        m.set_master_state(T, BusState::PreOp);
        assert!(m.execute_job(JobKind::SendCyclicFrames).status.is_ok());
        assert_eq!(m.job_count(JobKind::SendCyclicFrames), 1);
    }

    #[test]
    fn frame_loss_is_counted_down() {
        let m = master(false);
        m.set_master_state(T, BusState::Init);
        m.set_master_state(T, BusState::PreOp);
        m.inject_frame_loss(2);
        assert!(!m.execute_job(JobKind::ProcessRxFrames).frames_complete);
        assert!(!m.execute_job(JobKind::ProcessRxFrames).frames_complete);
        assert!(m.execute_job(JobKind::ProcessRxFrames).frames_complete);
    }

    #[test]
    fn dc_settling_fails_first_safeop() {
        let m = master(true);
        m.set_dc_settle_attempts(1);
        m.set_master_state(T, BusState::Init);
        m.set_master_state(T, BusState::PreOp);
        assert_eq!(m.sync_status(), SyncStatus::Settling);
        assert_eq!(m.set_master_state(T, BusState::SafeOp), StatusCode::Timeout);
        assert_eq!(m.master_state(), BusState::PreOp);
        assert_eq!(m.set_master_state(T, BusState::SafeOp), StatusCode::Ok);
        assert_eq!(m.sync_status(), SyncStatus::InSync);
    }

    #[test]
    fn outputs_loop_back_in_op() {
        let m = master(false);
        for s in [BusState::Init, BusState::PreOp, BusState::SafeOp, BusState::Op] {
            assert!(m.set_master_state(T, s).is_ok());
        }
        let out = m.process_image(Direction::Output).unwrap();
        let inp = m.process_image(Direction::Input).unwrap();
        // SAFETY: both images are two bytes and owned by `m`.
        unsafe {
            out.ptr.as_ptr().write(0x34);
            out.ptr.as_ptr().add(1).write(0x12);
        }
        m.execute_job(JobKind::ProcessRxFrames);
        let value = unsafe { u16::from_le_bytes([*inp.ptr.as_ptr(), *inp.ptr.as_ptr().add(1)]) };
        assert_eq!(value, 0x1234);
    }

    #[test]
    fn provider_must_be_large_enough() {
        let m = master(false);
        let mut small_in = [0u8; 1];
        let mut small_out = [0u8; 1];
        let provider = MemoryProvider {
            input: image_ptr(&mut small_in),
            output: image_ptr(&mut small_out),
        };
        assert_eq!(
            unsafe { m.register_memory_provider(provider) },
            StatusCode::InvalidParameter
        );

        let mut big_in = [0u8; 8];
        let mut big_out = [0u8; 8];
        let provider = MemoryProvider {
            input: image_ptr(&mut big_in),
            output: image_ptr(&mut big_out),
        };
        assert!(unsafe { m.register_memory_provider(provider) }.is_ok());
        assert_eq!(m.process_image(Direction::Input).unwrap().ptr, provider.input.ptr);
        m.shutdown().unwrap();
    }

    #[test]
    fn link_timer_triggers_until_shutdown() {
        let m = master(false);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let trigger: LinkTrigger = Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(m.attach_link_timer(trigger).is_ok());
        thread::sleep(Duration::from_millis(30));
        m.shutdown().unwrap();
        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(10));
        assert!(ticks.load(Ordering::Relaxed) <= seen + 1);
    }
}
