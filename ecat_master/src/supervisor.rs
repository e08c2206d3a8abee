//! Supervisory loop.
//!
//! Owns everything non-real-time: the process-data bridge, the timing
//! source, the job thread handle and the state coordinator.
//!
//! ```text
//! ┌──────────────┐ tick ┌────────────┐ jobs ┌──────────┐
//! │ TimingSource │─────►│ JobThread  │─────►│ BusMaster│
//! └──────────────┘      └─────┬──────┘      └────▲─────┘
//!                             │ snapshot + pulse │ state requests
//!                       ┌─────▼──────┐      ┌────┴──────────────┐
//!                       │   Bridge   │◄─────│ StateCoordinator  │
//!                       └────────────┘      └───────────────────┘
//! ```
//!
//! Each iteration runs one coordinator step. Once the bus holds OP as
//! requested, the loop drops into a monitoring sub-loop that polls clock
//! synchronization until the request changes, the bus leaves OP, or a
//! shutdown is requested.

use crate::coordinator::{StateCoordinator, StepOutcome};
use crate::cycle::{CycleRunner, JobThread, Stage};
use crate::error::{SupervisorError, TimingError};
use crate::timing::{CycleTimer, TickSignal, TimingSource};
use ecat_common::bus::BusState;
use ecat_common::bus::config::MasterConfig;
use ecat_common::bus::master::{BusMaster, MasterError, SyncStatus};
use ecat_shared_memory::ProcessDataBridge;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};

/// The master process minus argument parsing.
pub struct Supervisor {
    config: MasterConfig,
    master: Arc<dyn BusMaster>,
    bridge: Arc<ProcessDataBridge>,
    coordinator: StateCoordinator,
    signal: Arc<TickSignal>,
    timing: TimingSource,
    job: Option<JobThread>,
    running: Arc<AtomicBool>,
    last_sync: Option<SyncStatus>,
}

impl Supervisor {
    /// Validate `config`, build the bridge sized for `master` and set the
    /// initial requested state.
    pub fn new(config: MasterConfig, master: Arc<dyn BusMaster>) -> Result<Self, SupervisorError> {
        config.validate()?;

        let bridge = Arc::new(ProcessDataBridge::create(
            &config.bridge,
            master.memory_requirements(),
        )?);
        if config.bridge.map_process_image {
            map_process_images(master.as_ref(), &bridge);
        }
        bridge
            .snapshot()
            .set_requested_state(config.bus.requested_state);

        let signal = Arc::new(TickSignal::new());
        let timing = TimingSource::from_config(&config.cycle, Arc::clone(&signal));
        let coordinator =
            StateCoordinator::new(Arc::clone(&master), Arc::clone(&bridge), config.clone());

        info!(
            master = master.name(),
            slaves = config.slaves.len(),
            requested = %config.bus.requested_state,
            "Supervisor ready"
        );

        Ok(Self {
            config,
            master,
            bridge,
            coordinator,
            signal,
            timing,
            job: None,
            running: Arc::new(AtomicBool::new(true)),
            last_sync: None,
        })
    }

    /// Shared bridge (for in-process consumers and tests).
    pub fn bridge(&self) -> &Arc<ProcessDataBridge> {
        &self.bridge
    }

    /// The bus master.
    pub fn master(&self) -> &Arc<dyn BusMaster> {
        &self.master
    }

    /// Flag that keeps [`run`](Self::run) going; clear it to shut down.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Change the requested bus state.
    pub fn request_state(&self, state: BusState) {
        self.coordinator.request(state);
    }

    /// True while the job thread runs.
    pub fn is_cycling(&self) -> bool {
        self.job.as_ref().is_some_and(JobThread::is_running)
    }

    /// Spawn the job thread, then start the timing source.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.job.is_some() {
            return Ok(());
        }
        let runner = CycleRunner::new(
            Arc::clone(&self.master),
            Arc::clone(&self.bridge),
            Arc::clone(&self.signal),
            self.config.cycle.period_ns(),
        );
        self.job = Some(runner.spawn(self.config.cycle.job_cpu, self.config.cycle.job_priority)?);

        let started = match self.timing.link_trigger() {
            Some(trigger) => {
                let status = self.master.attach_link_timer(trigger);
                if status.is_ok() {
                    info!("Cycle timing driven by the link layer");
                    Ok(())
                } else {
                    Err(SupervisorError::Master(MasterError::Status {
                        operation: "attach_link_timer",
                        status,
                    }))
                }
            }
            None => self
                .timing
                .start(self.config.cycle.period_ns())
                .map_err(SupervisorError::from),
        };

        if let Err(e) = started {
            self.stop_job();
            return Err(e);
        }
        Ok(())
    }

    /// One coordinator iteration.
    pub fn step(&mut self) -> Result<StepOutcome, SupervisorError> {
        Ok(self.coordinator.step()?)
    }

    /// Start, supervise until the running flag clears (or `max_cycles`
    /// cycles completed), then shut down.
    pub fn run(&mut self, max_cycles: Option<u64>) -> Result<(), SupervisorError> {
        self.start()?;
        let result = self.supervise(max_cycles);
        if let Err(e) = &result {
            error!(error = %e, "Supervisory loop aborted");
        }
        let shutdown = self.shutdown();
        result.and(shutdown)
    }

    fn supervise(&mut self, max_cycles: Option<u64>) -> Result<(), SupervisorError> {
        let interval = self.config.bus.supervisor_interval();
        while self.keep_going(max_cycles) {
            let outcome = self.step()?;
            if outcome == StepOutcome::Holding(BusState::Op)
                && self.coordinator.requested() == BusState::Op
            {
                self.monitor(max_cycles);
            }
            thread::sleep(interval);
        }
        Ok(())
    }

    fn keep_going(&self, max_cycles: Option<u64>) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        match max_cycles {
            Some(max) if self.bridge.snapshot().cycle_count.load(Ordering::Acquire) >= max => {
                info!(cycles = max, "Cycle limit reached");
                self.running.store(false, Ordering::Release);
                false
            }
            _ => true,
        }
    }

    /// Poll synchronization diagnostics while OP holds.
    fn monitor(&mut self, max_cycles: Option<u64>) {
        info!("Bus operational, monitoring");
        let poll = self.config.bus.monitor_interval();
        let slice = self.config.bus.supervisor_interval().min(poll);
        let mut next_poll = Instant::now();

        while self.keep_going(max_cycles)
            && self.coordinator.requested() == BusState::Op
            && self.master.master_state() == BusState::Op
        {
            if Instant::now() >= next_poll {
                self.poll_sync();
                next_poll += poll;
            }
            thread::sleep(slice);
        }
        info!(
            requested = %self.coordinator.requested(),
            actual = %self.master.master_state(),
            "Leaving OP monitoring"
        );
    }

    fn poll_sync(&mut self) {
        let sync = self.master.sync_status();
        if self.last_sync == Some(sync) {
            return;
        }
        match sync {
            SyncStatus::OutOfSync => warn!(?sync, "Clock synchronization lost"),
            _ => info!(?sync, "Clock synchronization status"),
        }
        self.last_sync = Some(sync);
    }

    fn stop_job(&mut self) -> Option<SupervisorError> {
        let mut job = self.job.take()?;
        match job.stop(self.config.bus.shutdown_timeout()) {
            Ok(()) => {
                if let Some(stats) = job.stats() {
                    for stage in Stage::ALL {
                        info!(
                            ?stage,
                            max_ns = stats.stage_max_ns[stage as usize],
                            "Stage timing"
                        );
                    }
                }
                None
            }
            Err(e) => {
                error!(error = %e, "Job thread did not stop");
                Some(e)
            }
        }
    }

    /// Stop the job thread (bounded), then the timing source, then the
    /// master. The bridge stays in place for consumers.
    pub fn shutdown(&mut self) -> Result<(), SupervisorError> {
        self.running.store(false, Ordering::Release);
        let job_error = self.stop_job();

        match self.timing.stop() {
            Ok(()) | Err(TimingError::NotSupported) | Err(TimingError::InvalidState(_)) => {}
            Err(e) => warn!(error = %e, "Timing source did not stop cleanly"),
        }
        self.master.shutdown()?;
        self.bridge
            .snapshot()
            .set_current_state(self.master.master_state());

        match job_error {
            Some(e) => Err(e),
            None => {
                info!("Supervisor shut down");
                Ok(())
            }
        }
    }
}

/// Hand the shared raw regions to the master as its process images.
///
/// Falls back to per-cycle copying when the master refuses.
fn map_process_images(master: &dyn BusMaster, bridge: &ProcessDataBridge) {
    let Some(provider) = bridge.memory_provider() else {
        warn!("Process image is empty, nothing to map");
        return;
    };
    // SAFETY: the regions stay mapped while the supervisor holds the
    // bridge, and the job thread (the only user of the images) is joined
    // before the bridge is dropped.
    let status = unsafe { master.register_memory_provider(provider) };
    if status.is_ok() {
        info!("Shared regions registered as master process images");
    } else {
        warn!(%status, "Process-image mapping refused, copying every cycle");
    }
}
