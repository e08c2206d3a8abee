//! Cyclic job runner.
//!
//! One iteration per tick of the timing source:
//!
//! ```text
//! wait(tick) → ProcessRxFrames → overload check → process-data exchange
//!            → SendCyclicFrames → MasterTimer → SendAcyclicFrames
//!            → publish statistics → pulse consumers
//! ```
//!
//! Nothing in the loop body returns an error. Job statuses become log
//! lines (rate limited) and counters; the loop ends only when the
//! shutdown flag is set.

use crate::error::SupervisorError;
use crate::rt;
use crate::timing::TickSignal;
use ecat_common::bus::Direction;
use ecat_common::bus::master::{BusMaster, ImagePtr, JobKind, JobReport, StatusCode};
use ecat_common::consts::{FRAME_LOSS_PENALTY, OVERLOAD_CEILING, OVERLOAD_THRESHOLD};
use ecat_common::pdo::access::mirror_variable;
use ecat_common::pdo::snapshot::CycleTimes;
use ecat_shared_memory::ProcessDataBridge;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Warnings always emitted before rate limiting kicks in.
pub const WARN_BURST: u64 = 10;

/// After the burst, every n-th occurrence is emitted.
pub const WARN_EVERY: u64 = 1000;

// ─── Stages ─────────────────────────────────────────────────────────

/// Timed stages of one cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Receive and process frames.
    ProcessRx,
    /// Copy process data between master and shared images.
    Exchange,
    /// Send cyclic frames.
    SendCyclic,
    /// Master housekeeping.
    MasterTimer,
    /// Send acyclic frames.
    SendAcyclic,
}

impl Stage {
    /// All stages in cycle order.
    pub const ALL: [Stage; 5] = [
        Stage::ProcessRx,
        Stage::Exchange,
        Stage::SendCyclic,
        Stage::MasterTimer,
        Stage::SendAcyclic,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    fn for_job(job: JobKind) -> Self {
        match job {
            JobKind::ProcessRxFrames => Self::ProcessRx,
            JobKind::SendCyclicFrames => Self::SendCyclic,
            JobKind::MasterTimer => Self::MasterTimer,
            JobKind::SendAcyclicFrames => Self::SendAcyclic,
        }
    }
}

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics.
#[derive(Debug, Clone)]
pub struct CycleStats {
    /// Total cycles executed.
    pub cycle_count: u64,
    /// Last cycle duration [ns].
    pub last_cycle_ns: u64,
    /// Minimum cycle duration [ns].
    pub min_cycle_ns: u64,
    /// Maximum cycle duration [ns].
    pub max_cycle_ns: u64,
    /// Running sum for average computation.
    pub sum_cycle_ns: u128,
    /// Cycles whose body took longer than the period.
    pub overruns: u64,
    /// Last duration per stage [ns].
    pub stage_last_ns: [u64; 5],
    /// Maximum duration per stage [ns].
    pub stage_max_ns: [u64; 5],
}

impl CycleStats {
    /// Zeroed stats.
    pub const fn new() -> Self {
        Self {
            cycle_count: 0,
            last_cycle_ns: 0,
            min_cycle_ns: u64::MAX,
            max_cycle_ns: 0,
            sum_cycle_ns: 0,
            overruns: 0,
            stage_last_ns: [0; 5],
            stage_max_ns: [0; 5],
        }
    }

    /// Record a cycle duration.
    #[inline]
    pub fn record(&mut self, duration_ns: u64) {
        self.cycle_count += 1;
        self.last_cycle_ns = duration_ns;
        self.min_cycle_ns = self.min_cycle_ns.min(duration_ns);
        self.max_cycle_ns = self.max_cycle_ns.max(duration_ns);
        self.sum_cycle_ns += u128::from(duration_ns);
    }

    /// Record the duration of one stage.
    #[inline]
    pub fn record_stage(&mut self, stage: Stage, duration_ns: u64) {
        let i = stage.index();
        self.stage_last_ns[i] = duration_ns;
        self.stage_max_ns[i] = self.stage_max_ns[i].max(duration_ns);
    }

    /// Average cycle time [ns] (0 if no cycles).
    #[inline]
    pub fn avg_cycle_ns(&self) -> u64 {
        if self.cycle_count == 0 {
            0
        } else {
            (self.sum_cycle_ns / u128::from(self.cycle_count)) as u64
        }
    }

    /// Values published into the bus snapshot.
    pub fn times(&self) -> CycleTimes {
        CycleTimes {
            min_ns: self.min_cycle_ns,
            max_ns: self.max_cycle_ns,
            avg_ns: self.avg_cycle_ns(),
            current_ns: self.last_cycle_ns,
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Log Rate Limiting ──────────────────────────────────────────────

/// Occurrence counter deciding which repetitions get logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateLimiter {
    count: u64,
}

impl RateLimiter {
    /// Count one occurrence. Returns the occurrence number if it should be
    /// logged.
    #[inline]
    pub fn hit(&mut self) -> Option<u64> {
        self.count += 1;
        (self.count <= WARN_BURST || self.count % WARN_EVERY == 0).then_some(self.count)
    }

    /// Occurrences so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

// ─── Overload Detection ─────────────────────────────────────────────

/// What a cycle's frame reception meant for the overload counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadEvent {
    /// All frames returned, nothing to report.
    Quiet,
    /// Frames missing, counter still at or below the threshold (or already
    /// escalated).
    FrameLoss,
    /// Counter crossed the threshold in this cycle.
    Escalated,
    /// Counter dropped back to the threshold after an escalation.
    Recovered,
}

/// Frame-loss counter with one-shot escalation.
///
/// Complete cycles decrement (floor 0), incomplete ones add
/// [`FRAME_LOSS_PENALTY`] (ceiling [`OVERLOAD_CEILING`]). Crossing
/// [`OVERLOAD_THRESHOLD`] escalates once; dropping back to it re-arms.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverloadMonitor {
    counter: u32,
    escalated: bool,
}

impl OverloadMonitor {
    /// Fresh monitor.
    pub const fn new() -> Self {
        Self {
            counter: 0,
            escalated: false,
        }
    }

    /// Account for one cycle.
    pub fn record(&mut self, frames_complete: bool) -> OverloadEvent {
        if frames_complete {
            self.counter = self.counter.saturating_sub(1);
            if self.escalated && self.counter <= OVERLOAD_THRESHOLD {
                self.escalated = false;
                return OverloadEvent::Recovered;
            }
            OverloadEvent::Quiet
        } else {
            self.counter = (self.counter + FRAME_LOSS_PENALTY).min(OVERLOAD_CEILING);
            if !self.escalated && self.counter > OVERLOAD_THRESHOLD {
                self.escalated = true;
                return OverloadEvent::Escalated;
            }
            OverloadEvent::FrameLoss
        }
    }

    /// Current counter value.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// True between escalation and recovery.
    pub fn is_overloaded(&self) -> bool {
        self.escalated
    }
}

// ─── Cycle Runner ───────────────────────────────────────────────────

/// Owns everything the job thread touches.
pub struct CycleRunner {
    master: Arc<dyn BusMaster>,
    bridge: Arc<ProcessDataBridge>,
    signal: Arc<TickSignal>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    period_ns: u64,
    stats: CycleStats,
    overload: OverloadMonitor,
    frame_loss_log: RateLimiter,
    overrun_log: RateLimiter,
    job_log: [RateLimiter; 5],
}

impl CycleRunner {
    /// Runner for `master`, publishing into `bridge`, paced by `signal`.
    pub fn new(
        master: Arc<dyn BusMaster>,
        bridge: Arc<ProcessDataBridge>,
        signal: Arc<TickSignal>,
        period_ns: u64,
    ) -> Self {
        Self {
            master,
            bridge,
            signal,
            shutdown: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            period_ns,
            stats: CycleStats::new(),
            overload: OverloadMonitor::new(),
            frame_loss_log: RateLimiter::default(),
            overrun_log: RateLimiter::default(),
            job_log: [RateLimiter::default(); 5],
        }
    }

    /// Statistics so far.
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Overload monitor state.
    pub fn overload(&self) -> &OverloadMonitor {
        &self.overload
    }

    /// Execute one full cycle without waiting for a tick.
    pub fn run_cycle(&mut self) {
        let cycle_start = Instant::now();

        let rx = self.job(JobKind::ProcessRxFrames);
        self.check_overload(rx.frames_complete);

        let exchange_start = Instant::now();
        self.exchange_process_data();
        self.stats
            .record_stage(Stage::Exchange, elapsed_ns(exchange_start));

        self.job(JobKind::SendCyclicFrames);
        self.job(JobKind::MasterTimer);
        self.job(JobKind::SendAcyclicFrames);

        let duration_ns = elapsed_ns(cycle_start);
        self.stats.record(duration_ns);
        if duration_ns > self.period_ns {
            self.stats.overruns += 1;
            if let Some(n) = self.overrun_log.hit() {
                warn!(
                    duration_ns,
                    period_ns = self.period_ns,
                    occurrences = n,
                    "Cycle overrun"
                );
            }
        }

        let snapshot = self.bridge.snapshot();
        snapshot
            .overload_counter
            .store(self.overload.counter(), Ordering::Relaxed);
        snapshot.record_cycle(self.stats.cycle_count, self.stats.times(), unix_time_ns());
        self.bridge.publish_cycle();
    }

    fn job(&mut self, job: JobKind) -> JobReport {
        let start = Instant::now();
        let report = self.master.execute_job(job);
        self.stats.record_stage(Stage::for_job(job), elapsed_ns(start));
        if !report.status.is_ok() {
            self.log_job_status(job, report.status);
        }
        report
    }

    fn log_job_status(&mut self, job: JobKind, status: StatusCode) {
        let Some(n) = self.job_log[Stage::for_job(job).index()].hit() else {
            return;
        };
        if status.is_tolerated() {
            debug!(?job, %status, occurrences = n, "Job skipped");
        } else {
            error!(?job, %status, occurrences = n, "Job failed");
        }
    }

    fn check_overload(&mut self, frames_complete: bool) {
        match self.overload.record(frames_complete) {
            OverloadEvent::Quiet => {}
            OverloadEvent::FrameLoss => {
                if let Some(n) = self.frame_loss_log.hit() {
                    warn!(
                        counter = self.overload.counter(),
                        occurrences = n,
                        "Frame loss"
                    );
                }
            }
            OverloadEvent::Escalated => {
                error!(
                    counter = self.overload.counter(),
                    "System overload: cyclic frames lost repeatedly"
                );
            }
            OverloadEvent::Recovered => {
                info!(counter = self.overload.counter(), "Overload cleared");
            }
        }
    }

    /// Copy inputs master → shared and outputs shared → master for every
    /// resolved variable. Skipped while the directory is unpublished or
    /// being rewritten, and per direction when both sides alias.
    ///
    /// Each slave entry is copied out of the snapshot before use; a pass
    /// ends early if the directory generation moves on under it.
    fn exchange_process_data(&self) {
        let snapshot = self.bridge.snapshot();
        let Ok((generation, count)) = snapshot.read_directory(|dir| (dir.generation(), dir.len()))
        else {
            return;
        };
        let inputs = distinct(
            self.master.process_image(Direction::Input),
            self.bridge.input().image(),
        );
        let outputs = distinct(
            self.bridge.output().image(),
            self.master.process_image(Direction::Output),
        );
        if inputs.is_none() && outputs.is_none() {
            return;
        }

        for index in 0..count {
            let Ok((seen, Some(slave))) =
                snapshot.read_directory(|dir| (dir.generation(), dir.slave(index)))
            else {
                return;
            };
            if seen != generation {
                return;
            }
            if let Some((src, dst)) = inputs {
                for var in slave.variables(Direction::Input) {
                    // SAFETY: both images stay mapped for the runner's
                    // lifetime and are distinct allocations.
                    unsafe { mirror_variable(src, dst, var.offset, var.size) };
                }
            }
            if let Some((src, dst)) = outputs {
                for var in slave.variables(Direction::Output) {
                    // SAFETY: as above.
                    unsafe { mirror_variable(src, dst, var.offset, var.size) };
                }
            }
        }
    }

    /// Loop until shutdown. Returns the final statistics.
    pub fn run(mut self) -> CycleStats {
        info!(period_ns = self.period_ns, "Job loop running");
        while !self.shutdown.load(Ordering::Acquire) {
            self.signal.wait();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.run_cycle();
        }
        self.running.store(false, Ordering::Release);
        info!(
            cycles = self.stats.cycle_count,
            avg_ns = self.stats.avg_cycle_ns(),
            max_ns = self.stats.max_cycle_ns,
            overruns = self.stats.overruns,
            "Job loop stopped"
        );
        self.stats
    }

    /// Run the loop on a dedicated thread pinned to `cpu`.
    pub fn spawn(self, cpu: usize, priority: i32) -> Result<JobThread, SupervisorError> {
        let shutdown = Arc::clone(&self.shutdown);
        let running = Arc::clone(&self.running);
        let signal = Arc::clone(&self.signal);
        running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("ecat-job".into())
            .spawn(move || {
                if let Err(e) = rt::setup_thread(cpu, priority) {
                    error!(error = %e, "Job thread RT setup failed, continuing without it");
                }
                self.run()
            })
            .map_err(|e| {
                running.store(false, Ordering::Release);
                SupervisorError::ThreadCreationFailed(e.to_string())
            })?;

        Ok(JobThread {
            handle: Some(handle),
            shutdown,
            running,
            signal,
            stats: None,
        })
    }
}

fn distinct(src: Option<ImagePtr>, dst: Option<ImagePtr>) -> Option<(ImagePtr, ImagePtr)> {
    match (src, dst) {
        (Some(s), Some(d)) if s.ptr != d.ptr => Some((s, d)),
        _ => None,
    }
}

#[inline]
fn elapsed_ns(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn unix_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ─── Job Thread Handle ──────────────────────────────────────────────

/// Handle to a spawned job loop.
pub struct JobThread {
    handle: Option<JoinHandle<CycleStats>>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    signal: Arc<TickSignal>,
    stats: Option<CycleStats>,
}

impl JobThread {
    /// True until the loop has exited.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Final statistics, once stopped.
    pub fn stats(&self) -> Option<&CycleStats> {
        self.stats.as_ref()
    }

    /// Set the shutdown flag and join, waiting at most `timeout` for the
    /// loop to notice.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::Release);

        let deadline = Instant::now() + timeout;
        while self.running.load(Ordering::Acquire) && !handle.is_finished() {
            if Instant::now() >= deadline {
                self.handle = Some(handle);
                return Err(SupervisorError::ShutdownTimeout(timeout));
            }
            // The loop may be parked on the tick signal.
            self.signal.notify();
            thread::sleep(Duration::from_millis(1));
        }

        let stats = handle.join().map_err(|_| SupervisorError::JobPanicked)?;
        self.stats = Some(stats);
        Ok(())
    }
}

impl Drop for JobThread {
    fn drop(&mut self) {
        // Never blocks: a thread that did not stop in `stop` is detached.
        self.shutdown.store(true, Ordering::Release);
        self.signal.notify();
    }
}
