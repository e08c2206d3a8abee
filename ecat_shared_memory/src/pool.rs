//! Consumer pulse semaphores and the shared identity → slot registry.
//!
//! Each registered consumer owns one binary semaphore of a fixed-size pool.
//! After every completed cycle the producer posts each slot that has no
//! pending pulse, so a slow consumer never builds up a backlog: its next
//! wait returns at once and it sees the latest cycle. Delivery is best
//! effort; a consumer that checks between the value probe and the post may
//! miss one pulse and pick up the next.
//!
//! The registry lives in the segment header so that every attached process
//! sees the same assignment. A slot holds the consumer identity, 0 = free.

use crate::error::{ShmError, ShmResult};
use crate::platform::{get_current_pid, get_current_tid, is_process_alive};
use crate::semaphore::NamedSemaphore;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Opaque identity of the calling thread: `pid << 32 | tid`. Never zero.
pub fn consumer_identity() -> u64 {
    (u64::from(get_current_pid()) << 32) | u64::from(get_current_tid())
}

/// Name of pool slot `index`.
pub fn slot_name(base: &str, index: usize) -> String {
    format!("{base}{index}")
}

/// Fixed-size pool of named binary semaphores.
pub struct SemaphorePool {
    base: String,
    slots: Vec<NamedSemaphore>,
}

impl SemaphorePool {
    /// Producer: open or create `count` semaphores at value 1, healing any
    /// left in an inconsistent state.
    pub fn create(base: &str, count: usize) -> ShmResult<Self> {
        let slots = (0..count)
            .map(|i| NamedSemaphore::open_or_create(&slot_name(base, i)))
            .collect::<ShmResult<Vec<_>>>()?;
        debug!(base, count, "Semaphore pool ready");
        Ok(Self {
            base: base.to_string(),
            slots,
        })
    }

    /// Consumer: open the producer's semaphores as they are.
    pub fn open(base: &str, count: usize) -> ShmResult<Self> {
        let slots = (0..count)
            .map(|i| NamedSemaphore::open(&slot_name(base, i)))
            .collect::<ShmResult<Vec<_>>>()?;
        Ok(Self {
            base: base.to_string(),
            slots,
        })
    }

    /// Unlink all `count` semaphores of `base`.
    pub fn remove(base: &str, count: usize) -> ShmResult<()> {
        for i in 0..count {
            NamedSemaphore::unlink(&slot_name(base, i))?;
        }
        Ok(())
    }

    /// Base name.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Semaphore of slot `index`.
    pub fn slot(&self, index: usize) -> Option<&NamedSemaphore> {
        self.slots.get(index)
    }

    /// Post every slot without a pending pulse. Returns the number posted.
    ///
    /// Failures are counted, not propagated: one broken slot must not
    /// starve the others.
    pub fn pulse_all(&self) -> usize {
        self.slots
            .iter()
            .filter(|sem| sem.post_if_clear().unwrap_or(false))
            .count()
    }
}

/// View of the shared registry slots.
pub struct ConsumerRegistry<'a> {
    slots: &'a [AtomicU64],
}

impl<'a> ConsumerRegistry<'a> {
    /// Registry over the first `capacity` header slots.
    pub fn new(slots: &'a [AtomicU64], capacity: usize) -> Self {
        Self {
            slots: &slots[..capacity.min(slots.len())],
        }
    }

    /// Slot of `identity`, if registered.
    pub fn lookup(&self, identity: u64) -> Option<usize> {
        if identity == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|s| s.load(Ordering::Acquire) == identity)
    }

    /// Slot of `identity`, claiming the first free one on first use.
    ///
    /// When the pool is full, slots held by processes that no longer exist
    /// are reclaimed before giving up.
    pub fn register(&self, identity: u64) -> ShmResult<usize> {
        if identity == 0 {
            return Err(ShmError::InvalidIdentity);
        }
        if let Some(slot) = self.lookup(identity) {
            return Ok(slot);
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(0, identity, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(identity, slot = index, "Consumer registered");
                return Ok(index);
            }
        }
        for (index, slot) in self.slots.iter().enumerate() {
            let owner = slot.load(Ordering::Acquire);
            let pid = (owner >> 32) as u32;
            if owner != 0
                && !is_process_alive(pid)
                && slot
                    .compare_exchange(owner, identity, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                warn!(slot = index, dead_pid = pid, "Reclaimed slot of dead consumer");
                return Ok(index);
            }
        }
        Err(ShmError::PoolExhausted {
            capacity: self.slots.len(),
        })
    }

    /// Free the slot of `identity`. Returns false if it held none.
    pub fn release(&self, identity: u64) -> bool {
        match self.lookup(identity) {
            Some(index) => self.slots[index]
                .compare_exchange(identity, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Number of occupied slots.
    pub fn registered(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Acquire) != 0)
            .count()
    }
}
