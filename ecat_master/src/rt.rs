//! Real-time thread setup.
//!
//! ## RT Setup Sequence
//! 1. `mlockall(MCL_CURRENT | MCL_FUTURE)`, once per process.
//! 2. Prefault stack pages.
//! 3. `sched_setaffinity`, pin the calling thread to its core.
//! 4. `sched_setscheduler(SCHED_FIFO, prio)`.
//!
//! Without the `rt` feature every call is a logged no-op, so the master
//! runs unprivileged on a development machine.

use crate::error::RtSetupError;
use tracing::debug;

/// Lock all current and future memory pages.
#[cfg(feature = "rt")]
pub fn lock_memory() -> Result<(), RtSetupError> {
    use nix::sys::mman::{MlockallFlags, mlockall};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| RtSetupError(format!("mlockall failed: {e}")))?;
    debug!("Memory locked");
    Ok(())
}

/// No-op without the `rt` feature.
#[cfg(not(feature = "rt"))]
pub fn lock_memory() -> Result<(), RtSetupError> {
    debug!("rt feature disabled, skipping mlockall");
    Ok(())
}

/// Touch the stack so the RT loop does not fault on it later.
pub fn prefault_stack() {
    let mut buf = [0u8; 256 * 1024];
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid exclusive reference into `buf`.
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

/// Pin the calling thread to `cpu`.
#[cfg(feature = "rt")]
pub fn set_affinity(cpu: usize) -> Result<(), RtSetupError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| RtSetupError(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| RtSetupError(format!("sched_setaffinity failed: {e}")))?;
    Ok(())
}

/// No-op without the `rt` feature.
#[cfg(not(feature = "rt"))]
pub fn set_affinity(cpu: usize) -> Result<(), RtSetupError> {
    debug!(cpu, "rt feature disabled, skipping affinity");
    Ok(())
}

/// Switch the calling thread to SCHED_FIFO at `priority`.
#[cfg(feature = "rt")]
pub fn set_fifo_priority(priority: i32) -> Result<(), RtSetupError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: plain syscall on the calling thread with a valid param.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(RtSetupError(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

/// No-op without the `rt` feature.
#[cfg(not(feature = "rt"))]
pub fn set_fifo_priority(priority: i32) -> Result<(), RtSetupError> {
    debug!(priority, "rt feature disabled, skipping SCHED_FIFO");
    Ok(())
}

/// Per-thread setup: prefault, pin, prioritize.
///
/// Call at the top of every real-time thread.
pub fn setup_thread(cpu: usize, priority: i32) -> Result<(), RtSetupError> {
    prefault_stack();
    set_affinity(cpu)?;
    set_fifo_priority(priority)?;
    Ok(())
}
