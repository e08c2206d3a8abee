//! Snapshot segment: header plus one [`BusSnapshot`].
//!
//! ```text
//! offset 0                     size_of::<SegmentHeader>()
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ SegmentHeader            │ BusSnapshot                  │
//! │ magic, layout hash, pid, │ state, statistics, directory │
//! │ state, consumer registry │                              │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The snapshot is constructed at most once per segment lifetime. The
//! header `state` word moves `UNINIT → BUILDING → READY`; whoever wins the
//! `UNINIT → BUILDING` exchange constructs, everyone else waits for `READY`
//! and attaches.

use crate::error::{ShmError, ShmResult};
use crate::platform::{attach_segment_mmap, get_current_pid, open_or_create_mmap, remove_segment};
use ecat_common::consts::MAX_CONSUMERS;
use ecat_common::pdo::snapshot::BusSnapshot;
use memmap2::MmapMut;
use static_assertions::const_assert;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Magic number: `"ECATBUS\0"` little endian.
pub const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"ECATBUS\0");

const STATE_UNINIT: u32 = 0;
const STATE_BUILDING: u32 = 1;
const STATE_READY: u32 = 2;

/// How long an attacher waits for a concurrent constructor.
const CONSTRUCT_WAIT: Duration = Duration::from_secs(1);

/// Compile-time layout fingerprint of a shared struct.
///
/// Changes whenever the size or alignment changes; a segment written by a
/// binary with a different layout is refused.
pub const fn struct_version_hash<T>() -> u32 {
    let size = core::mem::size_of::<T>() as u32;
    let align = core::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E3779B9) ^ align.wrapping_mul(0x517CC1B7)
}

/// Segment header with cache-line alignment
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number for validation
    pub magic: AtomicU64,
    /// `struct_version_hash::<BusSnapshot>()` of the constructor
    pub layout_hash: AtomicU32,
    /// Construction state word
    state: AtomicU32,
    /// Process that constructed the snapshot
    pub creator_pid: AtomicU32,
    /// Consumer identity per semaphore slot, 0 = free
    pub consumers: [AtomicU64; MAX_CONSUMERS],
}

const_assert!(core::mem::size_of::<SegmentHeader>() % 64 == 0);

impl SegmentHeader {
    /// True once the snapshot has been constructed.
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Validate header magic and layout hash
    pub fn validate(&self, name: &str) -> ShmResult<()> {
        if self.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(ShmError::NotConstructed {
                name: name.to_string(),
            });
        }
        let found = self.layout_hash.load(Ordering::Acquire);
        let expected = struct_version_hash::<BusSnapshot>();
        if found != expected {
            return Err(ShmError::LayoutMismatch {
                name: name.to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }
}

/// Bytes needed for header plus snapshot.
pub const fn required_size() -> usize {
    core::mem::size_of::<SegmentHeader>() + core::mem::size_of::<BusSnapshot>()
}

/// Mapped snapshot segment.
pub struct SnapshotSegment {
    name: String,
    header: NonNull<SegmentHeader>,
    snapshot: NonNull<BusSnapshot>,
    _map: MmapMut,
}

// SAFETY: header and snapshot consist of atomics plus the generation
// guarded directory (see `BusSnapshot`); the mapping lives as long as self.
unsafe impl Send for SnapshotSegment {}
unsafe impl Sync for SnapshotSegment {}

impl SnapshotSegment {
    /// Producer: remove any stale segment, then create and construct.
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        if remove_segment(name)? {
            info!(segment = name, "Removed stale segment");
        }
        Self::find_or_construct(name, size)
    }

    /// Open `name`, constructing the snapshot only if nobody did so yet.
    ///
    /// Attaching to an already constructed segment leaves its contents
    /// untouched.
    pub fn find_or_construct(name: &str, size: usize) -> ShmResult<Self> {
        let required = required_size();
        if size < required {
            return Err(ShmError::InvalidSize { size, required });
        }
        let map = open_or_create_mmap(name, size)?;
        let segment = Self::from_map(name, map)?;
        let header = segment.header();

        match header.state.compare_exchange(
            STATE_UNINIT,
            STATE_BUILDING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: we own the BUILDING state; nobody else touches the
                // snapshot until READY is published.
                unsafe { BusSnapshot::init_in_place(segment.snapshot.as_ptr()) };
                for slot in &header.consumers {
                    slot.store(0, Ordering::Relaxed);
                }
                header
                    .layout_hash
                    .store(struct_version_hash::<BusSnapshot>(), Ordering::Relaxed);
                header.creator_pid.store(get_current_pid(), Ordering::Relaxed);
                header.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
                header.state.store(STATE_READY, Ordering::Release);
                info!(segment = name, size, "Constructed bus snapshot");
            }
            Err(_) => {
                segment.wait_ready()?;
                header.validate(name)?;
                debug!(
                    segment = name,
                    creator = header.creator_pid.load(Ordering::Relaxed),
                    "Attached to existing bus snapshot"
                );
            }
        }
        Ok(segment)
    }

    /// Consumer: attach to an existing, constructed segment. Never constructs.
    pub fn open(name: &str) -> ShmResult<Self> {
        let map = attach_segment_mmap(name)?.ok_or_else(|| ShmError::NotConstructed {
            name: name.to_string(),
        })?;
        let segment = Self::from_map(name, map)?;
        if !segment.header().is_ready() {
            return Err(ShmError::NotConstructed {
                name: name.to_string(),
            });
        }
        segment.header().validate(name)?;
        Ok(segment)
    }

    fn from_map(name: &str, mut map: MmapMut) -> ShmResult<Self> {
        let required = required_size();
        if map.len() < required {
            return Err(ShmError::InvalidSize {
                size: map.len(),
                required,
            });
        }
        let base = map.as_mut_ptr();
        // SAFETY: mmap returns page-aligned memory of at least `required`
        // bytes; the header size is a multiple of 64, so the snapshot is
        // aligned as well.
        let (header, snapshot) = unsafe {
            (
                NonNull::new_unchecked(base as *mut SegmentHeader),
                NonNull::new_unchecked(
                    base.add(core::mem::size_of::<SegmentHeader>()) as *mut BusSnapshot
                ),
            )
        };
        Ok(Self {
            name: name.to_string(),
            header,
            snapshot,
            _map: map,
        })
    }

    fn wait_ready(&self) -> ShmResult<()> {
        let deadline = Instant::now() + CONSTRUCT_WAIT;
        while !self.header().is_ready() {
            if Instant::now() >= deadline {
                return Err(ShmError::NotConstructed {
                    name: self.name.clone(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment header.
    #[inline]
    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: points into the mapping owned by self.
        unsafe { self.header.as_ref() }
    }

    /// The shared bus snapshot.
    #[inline]
    pub fn snapshot(&self) -> &BusSnapshot {
        // SAFETY: constructed (READY) before any SnapshotSegment is returned.
        unsafe { self.snapshot.as_ref() }
    }
}
