//! Named POSIX binary semaphores.

use crate::error::{ShmError, ShmResult};
use crate::platform::validate_name;
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_gettime};
use std::ffi::CString;
use std::io;
use std::time::Duration;
use tracing::warn;

/// One named semaphore (`/<name>`).
pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// SAFETY: sem_* calls are thread-safe on a shared handle.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn sem_error(name: &str) -> ShmError {
    ShmError::Semaphore {
        name: name.to_string(),
        source: io::Error::last_os_error(),
    }
}

fn c_name(name: &str) -> ShmResult<CString> {
    validate_name(name)?;
    CString::new(format!("/{name}")).map_err(|_| ShmError::InvalidName {
        name: name.to_string(),
    })
}

impl NamedSemaphore {
    /// Open or create `name` with initial value 1.
    ///
    /// An existing semaphore whose value is not 1 is left over from a
    /// crashed run: it is unlinked and recreated at 1.
    pub fn open_or_create(name: &str) -> ShmResult<Self> {
        let sem = Self::raw_open(name, libc::O_CREAT)?;
        let value = sem.value()?;
        if value == 1 {
            return Ok(sem);
        }
        warn!(semaphore = name, value, "Semaphore in inconsistent state, recreating");
        drop(sem);
        Self::unlink(name)?;
        Self::raw_open(name, libc::O_CREAT)
    }

    /// Open an existing semaphore without touching its value.
    pub fn open(name: &str) -> ShmResult<Self> {
        Self::raw_open(name, 0).map_err(|e| match e {
            ShmError::Semaphore { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                ShmError::NotFound {
                    name: name.to_string(),
                }
            }
            other => other,
        })
    }

    fn raw_open(name: &str, flags: libc::c_int) -> ShmResult<Self> {
        let c_name = c_name(name)?;
        // SAFETY: valid NUL-terminated name; mode and value are passed as
        // the variadic arguments sem_open expects with O_CREAT.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                flags,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(sem_error(name));
        }
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }

    /// Remove `name` from the system. Missing semaphores are ignored.
    pub fn unlink(name: &str) -> ShmResult<()> {
        let c_name = c_name(name)?;
        // SAFETY: valid NUL-terminated name.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(ShmError::Semaphore {
                name: name.to_string(),
                source: err,
            })
        }
    }

    /// Semaphore name (without leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> ShmResult<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: sem is a live handle, value a valid out pointer.
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            return Err(sem_error(&self.name));
        }
        Ok(value)
    }

    /// Increment the semaphore.
    pub fn post(&self) -> ShmResult<()> {
        // SAFETY: sem is a live handle.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(sem_error(&self.name));
        }
        Ok(())
    }

    /// Post only if no pulse is pending. Returns true if posted.
    pub fn post_if_clear(&self) -> ShmResult<bool> {
        if self.value()? < 1 {
            self.post()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Block until posted.
    pub fn wait(&self) -> ShmResult<()> {
        loop {
            // SAFETY: sem is a live handle.
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ShmError::Semaphore {
                    name: self.name.clone(),
                    source: err,
                });
            }
        }
    }

    /// Take a pending pulse without blocking.
    pub fn try_wait(&self) -> ShmResult<bool> {
        loop {
            // SAFETY: sem is a live handle.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(ShmError::Semaphore {
                        name: self.name.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    /// Wait at most `timeout`. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> ShmResult<bool> {
        // sem_timedwait takes an absolute CLOCK_REALTIME deadline.
        let now = clock_gettime(ClockId::CLOCK_REALTIME)?;
        let deadline = now + TimeSpec::from_duration(timeout);
        loop {
            // SAFETY: sem is a live handle, deadline a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem, deadline.as_ref()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(ShmError::Semaphore {
                        name: self.name.clone(),
                        source: err,
                    });
                }
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: sem is a live handle, closed exactly once.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;

    fn unique(tag: &str) -> String {
        format!("ecat_sem_{tag}_{}", get_current_pid())
    }

    #[test]
    fn created_at_one() {
        let name = unique("one");
        let sem = NamedSemaphore::open_or_create(&name).unwrap();
        assert_eq!(sem.value().unwrap(), 1);
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn post_if_clear_never_stacks() {
        let name = unique("stack");
        let sem = NamedSemaphore::open_or_create(&name).unwrap();
        assert!(!sem.post_if_clear().unwrap());
        sem.wait().unwrap();
        assert!(sem.post_if_clear().unwrap());
        assert!(!sem.post_if_clear().unwrap());
        assert_eq!(sem.value().unwrap(), 1);
        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn inconsistent_value_is_healed() {
        let name = unique("heal");
        let first = NamedSemaphore::open_or_create(&name).unwrap();
        first.post().unwrap();
        first.post().unwrap();
        assert_eq!(first.value().unwrap(), 3);
        drop(first);

        let healed = NamedSemaphore::open_or_create(&name).unwrap();
        assert_eq!(healed.value().unwrap(), 1);
        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let name = unique("timeout");
        let sem = NamedSemaphore::open_or_create(&name).unwrap();
        assert!(sem.wait_timeout(Duration::from_millis(10)).unwrap());
        assert!(!sem.wait_timeout(Duration::from_millis(10)).unwrap());
        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing_is_not_found() {
        assert!(matches!(
            NamedSemaphore::open(&unique("missing")),
            Err(ShmError::NotFound { .. })
        ));
    }
}
