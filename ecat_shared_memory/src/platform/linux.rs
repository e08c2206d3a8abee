//! Linux-specific shared memory operations
//!
//! Named objects live as files under `/dev/shm`. Named semaphores share the
//! same namespace with a `sem.` prefix, so a segment and a semaphore pool
//! may use the same base name.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use tracing::debug;

/// Directory holding POSIX shared memory objects.
pub const SHM_DIR: &str = "/dev/shm";

/// Check that `name` can be used as a shared object name.
pub fn validate_name(name: &str) -> ShmResult<()> {
    if name.is_empty() || name.len() > 200 || name.contains('/') || name.contains('\0') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Filesystem path of the shared object `name`.
pub fn shm_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIR).join(name)
}

fn not_found(name: &str, err: std::io::Error) -> ShmError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ShmError::NotFound {
            name: name.to_string(),
        }
    } else {
        ShmError::Io { source: err }
    }
}

/// Open `name`, creating it with `min_size` bytes if it does not exist yet.
///
/// An existing object keeps its size and contents.
pub fn open_or_create_mmap(name: &str, min_size: usize) -> ShmResult<MmapMut> {
    validate_name(name)?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(shm_path(name))?;

    let len = file.metadata()?.len() as usize;
    if len == 0 {
        file.set_len(min_size as u64)?;
    } else if len < min_size {
        return Err(ShmError::InvalidSize {
            size: len,
            required: min_size,
        });
    }

    // Pages are faulted in up front so the cyclic path never takes a fault.
    let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
    Ok(mmap)
}

/// Create `name` with exactly `size` bytes, replacing any previous object.
///
/// A previous object is unlinked, never resized: processes still mapping it
/// keep valid pages until they unmap.
///
/// Returns `None` for a zero-sized object (the file still exists so
/// consumers can attach).
pub fn create_exact_mmap(name: &str, size: usize) -> ShmResult<Option<MmapMut>> {
    validate_name(name)?;
    if remove_segment(name)? {
        debug!(name, "Stale shared object unlinked");
    }
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(shm_path(name))?;
    file.set_len(size as u64)?;

    if size == 0 {
        return Ok(None);
    }
    let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
    Ok(Some(mmap))
}

/// Attach to an existing object at its current size.
pub fn attach_segment_mmap(name: &str) -> ShmResult<Option<MmapMut>> {
    validate_name(name)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(shm_path(name))
        .map_err(|e| not_found(name, e))?;

    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(Some(mmap))
}

/// Unlink `name`. Returns `false` if it did not exist.
pub fn remove_segment(name: &str) -> ShmResult<bool> {
    validate_name(name)?;
    match std::fs::remove_file(shm_path(name)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ShmError::Io { source: e }),
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        // Exists, but owned by someone else.
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Get current thread ID
pub fn get_current_tid() -> u32 {
    nix::unistd::gettid().as_raw() as u32
}
