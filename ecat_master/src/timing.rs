//! Cycle timing source.
//!
//! The job thread blocks on a [`TickSignal`]. Who raises it is decided at
//! construction:
//!
//! - [`SelfTimed`]: a dedicated thread sleeping to absolute deadlines on
//!   `CLOCK_MONOTONIC` (`clock_nanosleep(TIMER_ABSTIME)`), so wake-up error
//!   does not accumulate.
//! - [`LinkDriven`]: the master's link layer calls a [`LinkTrigger`] once
//!   per cycle from its own context. It owns the timing, so start, stop and
//!   period changes are not supported.
//!
//! Both implement [`CycleTimer`]; [`TimingSource`] is the tagged variant the
//! supervisor holds.

use crate::error::TimingError;
use crate::rt;
use ecat_common::bus::config::{CycleConfig, TimingMode};
use ecat_common::bus::master::LinkTrigger;
use ecat_common::consts::MIN_CYCLE_PERIOD_NS;
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const NSEC_PER_SEC: i64 = 1_000_000_000;

// ─── Tick Signal ────────────────────────────────────────────────────

/// Auto-reset wake-up event.
///
/// Ticks raised while nobody waits coalesce into one pending tick.
#[derive(Debug, Default)]
pub struct TickSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl TickSignal {
    /// New signal with no tick pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake one waiter.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Block until a tick is pending, then consume it.
    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while !*pending {
            self.cond.wait(&mut pending);
        }
        *pending = false;
    }

    /// Like [`wait`](Self::wait) with a bound. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let result = self.cond.wait_while_for(&mut pending, |p| !*p, timeout);
            if result.timed_out() && !*pending {
                return false;
            }
        }
        *pending = false;
        true
    }
}

// ─── Common Capability ──────────────────────────────────────────────

/// Start/stop/adjust capability shared by both timing variants.
pub trait CycleTimer {
    /// Start ticking every `period_ns` (clamped to at least 1 ms).
    ///
    /// Blocks until the timer reports running.
    fn start(&mut self, period_ns: u64) -> Result<(), TimingError>;

    /// Scale the original period by `permil / 1000`. No-op when stopped.
    fn adjust_period(&mut self, permil: u32) -> Result<(), TimingError>;

    /// Stop ticking and wait for the timer to terminate.
    ///
    /// `InvalidState` when the timer is not running, including a timer that
    /// already ended on its own. Its resources are released either way.
    fn stop(&mut self) -> Result<(), TimingError>;

    /// True while ticks are being produced by this timer.
    fn is_running(&self) -> bool;
}

// ─── Self-Timed ─────────────────────────────────────────────────────

/// Local timer thread with absolute-deadline sleeps.
pub struct SelfTimed {
    signal: Arc<TickSignal>,
    cpu: usize,
    priority: i32,
    original_period_ns: u64,
    period_ns: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SelfTimed {
    /// Timer pinned to `cpu` at SCHED_FIFO `priority` (`rt` feature).
    pub fn new(signal: Arc<TickSignal>, cpu: usize, priority: i32) -> Self {
        Self {
            signal,
            cpu,
            priority,
            original_period_ns: 0,
            period_ns: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Period currently in effect, in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.period_ns.load(Ordering::Relaxed)
    }
}

impl CycleTimer for SelfTimed {
    fn start(&mut self, period_ns: u64) -> Result<(), TimingError> {
        if self.handle.is_some() {
            return Err(TimingError::InvalidState("timer already started"));
        }
        let period_ns = if period_ns < MIN_CYCLE_PERIOD_NS {
            warn!(
                requested_ns = period_ns,
                clamped_ns = MIN_CYCLE_PERIOD_NS,
                "Cycle period below minimum, clamped"
            );
            MIN_CYCLE_PERIOD_NS
        } else {
            period_ns
        };
        self.original_period_ns = period_ns;
        self.period_ns.store(period_ns, Ordering::Relaxed);
        self.shutdown.store(false, Ordering::Release);

        let (ready_tx, ready_rx) = mpsc::channel();
        let ticker = Ticker {
            signal: Arc::clone(&self.signal),
            period_ns: Arc::clone(&self.period_ns),
            shutdown: Arc::clone(&self.shutdown),
            running: Arc::clone(&self.running),
        };
        let (cpu, priority) = (self.cpu, self.priority);

        let handle = thread::Builder::new()
            .name("ecat-timer".into())
            .spawn(move || {
                if let Err(e) = rt::setup_thread(cpu, priority) {
                    let _ = ready_tx.send(Err(TimingError::from(e)));
                    return;
                }
                ticker.run(ready_tx);
            })
            .map_err(|e| TimingError::ThreadCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.handle = Some(handle);
                info!(period_ns, cpu, "Self-timed cycle timer running");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(TimingError::ThreadCreationFailed(
                    "timer thread exited before reporting".into(),
                ))
            }
        }
    }

    fn adjust_period(&mut self, permil: u32) -> Result<(), TimingError> {
        if self.running.load(Ordering::Acquire) {
            let scaled = (self.original_period_ns * u64::from(permil) / 1000).max(1);
            self.period_ns.store(scaled, Ordering::Relaxed);
            debug!(permil, period_ns = scaled, "Cycle period adjusted");
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TimingError> {
        let Some(handle) = self.handle.take() else {
            return Err(TimingError::InvalidState("timer not running"));
        };
        let was_running = self.running.load(Ordering::Acquire);
        self.shutdown.store(true, Ordering::Release);
        if handle.join().is_err() {
            error!("Timer thread panicked");
        }
        if !was_running {
            warn!("Self-timed cycle timer had already stopped");
            return Err(TimingError::InvalidState("timer already stopped"));
        }
        info!("Self-timed cycle timer stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SelfTimed {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

/// State moved into the timer thread.
struct Ticker {
    signal: Arc<TickSignal>,
    period_ns: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl Ticker {
    fn run(self, ready: mpsc::Sender<Result<(), TimingError>>) {
        let clock = ClockId::CLOCK_MONOTONIC;
        let mut deadline = match clock_gettime(clock) {
            Ok(now) => now,
            Err(e) => {
                let _ = ready.send(Err(TimingError::ThreadCreationFailed(format!(
                    "clock_gettime: {e}"
                ))));
                return;
            }
        };
        self.running.store(true, Ordering::Release);
        let _ = ready.send(Ok(()));

        while !self.shutdown.load(Ordering::Acquire) {
            let period = i64::try_from(self.period_ns.load(Ordering::Relaxed)).unwrap_or(i64::MAX);
            deadline = timespec_add_ns(deadline, period);
            if let Err(e) = sleep_until(clock, &deadline) {
                error!(error = %e, "Timer wait failed, stopping cycle timer");
                break;
            }
            self.signal.notify();
        }
        self.running.store(false, Ordering::Release);
    }
}

/// Absolute sleep, resumed after signal interruptions.
fn sleep_until(clock: ClockId, deadline: &TimeSpec) -> Result<(), Errno> {
    loop {
        match clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, deadline) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Add nanoseconds to a TimeSpec, normalizing into `[0, 1 s)` nanoseconds.
fn timespec_add_ns(ts: TimeSpec, ns: i64) -> TimeSpec {
    let mut secs = ts.tv_sec() + ns / NSEC_PER_SEC;
    let mut nanos = ts.tv_nsec() + ns % NSEC_PER_SEC;
    while nanos >= NSEC_PER_SEC {
        secs += 1;
        nanos -= NSEC_PER_SEC;
    }
    while nanos < 0 {
        secs -= 1;
        nanos += NSEC_PER_SEC;
    }
    TimeSpec::new(secs, nanos)
}

// ─── Link-Driven ────────────────────────────────────────────────────

/// Timing owned by the master's link layer.
#[derive(Clone)]
pub struct LinkDriven {
    signal: Arc<TickSignal>,
}

impl LinkDriven {
    /// Variant raising `signal` from the link layer.
    pub fn new(signal: Arc<TickSignal>) -> Self {
        Self { signal }
    }

    /// Callback to hand to [`BusMaster::attach_link_timer`](ecat_common::bus::master::BusMaster::attach_link_timer).
    pub fn trigger(&self) -> LinkTrigger {
        let signal = Arc::clone(&self.signal);
        Arc::new(move || signal.notify())
    }
}

impl CycleTimer for LinkDriven {
    fn start(&mut self, _period_ns: u64) -> Result<(), TimingError> {
        Err(TimingError::NotSupported)
    }

    fn adjust_period(&mut self, _permil: u32) -> Result<(), TimingError> {
        Err(TimingError::NotSupported)
    }

    fn stop(&mut self) -> Result<(), TimingError> {
        Err(TimingError::NotSupported)
    }

    fn is_running(&self) -> bool {
        false
    }
}

// ─── Tagged Variant ─────────────────────────────────────────────────

/// Timing source selected from configuration.
pub enum TimingSource {
    /// Local timer thread.
    SelfTimed(SelfTimed),
    /// Link-layer callback.
    LinkDriven(LinkDriven),
}

impl TimingSource {
    /// Build the variant named by `config.timing`, raising `signal`.
    pub fn from_config(config: &CycleConfig, signal: Arc<TickSignal>) -> Self {
        match config.timing {
            TimingMode::SelfTimed => Self::SelfTimed(SelfTimed::new(
                signal,
                config.timer_cpu,
                config.timer_priority,
            )),
            TimingMode::ExternallyDriven => Self::LinkDriven(LinkDriven::new(signal)),
        }
    }

    /// Link trigger, for the externally driven variant only.
    pub fn link_trigger(&self) -> Option<LinkTrigger> {
        match self {
            Self::SelfTimed(_) => None,
            Self::LinkDriven(link) => Some(link.trigger()),
        }
    }

    fn timer(&mut self) -> &mut dyn CycleTimer {
        match self {
            Self::SelfTimed(t) => t,
            Self::LinkDriven(t) => t,
        }
    }
}

impl CycleTimer for TimingSource {
    fn start(&mut self, period_ns: u64) -> Result<(), TimingError> {
        self.timer().start(period_ns)
    }

    fn adjust_period(&mut self, permil: u32) -> Result<(), TimingError> {
        self.timer().adjust_period(permil)
    }

    fn stop(&mut self) -> Result<(), TimingError> {
        self.timer().stop()
    }

    fn is_running(&self) -> bool {
        match self {
            Self::SelfTimed(t) => t.is_running(),
            Self::LinkDriven(t) => t.is_running(),
        }
    }
}
