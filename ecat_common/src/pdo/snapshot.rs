//! Fixed-layout bus snapshot placed in the shared segment.
//!
//! All structs: `#[repr(C)]` for cross-process compatibility. Fixed-size
//! types only (no `String`, `Vec`, etc.): every attaching process must
//! agree on the layout without coordination.
//!
//! ## Concurrency
//!
//! Scalar live fields are atomics. The job thread is the only writer of the
//! statistics; the supervisor writes the state fields and the slave
//! directory. Consumers tolerate torn reads across fields.
//!
//! The slave directory is a seqlock on `directory_generation`:
//! - `0` = never published (job thread skips the copy)
//! - odd = rewrite in progress
//! - even, non-zero = published
//!
//! Readers never borrow the table. [`BusSnapshot::read_directory`] copies
//! what it needs through a [`DirectoryView`] and keeps the result only if
//! the generation is the same, and even, before and after the copy.

use crate::bus::{BusState, Direction};
use crate::consts::{MAX_SLAVES, MAX_VARIABLES, NAME_LEN};
use crate::pdo::access::ABSENT_OFFSET;
use static_assertions::const_assert;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering, fence};
use thiserror::Error;

/// NUL-padded UTF-8 name of at most `NAME_LEN` bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FixedName {
    bytes: [u8; NAME_LEN],
}

impl FixedName {
    /// Empty name.
    pub const EMPTY: FixedName = FixedName {
        bytes: [0; NAME_LEN],
    };

    /// Build from `s`, truncated on a character boundary to `NAME_LEN` bytes.
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(NAME_LEN);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; NAME_LEN];
        bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self { bytes }
    }

    /// Name as string slice (empty if the bytes are not valid UTF-8).
    pub fn as_str(&self) -> &str {
        let len = self.bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        std::str::from_utf8(&self.bytes[..len]).unwrap_or("")
    }
}

impl Default for FixedName {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for FixedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for FixedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of one variable inside a raw process image.
///
/// Size: 72 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VariableDescriptor {
    /// Variable name (without slave prefix).
    pub name: FixedName,
    /// Byte offset in the raw buffer, or `ABSENT_OFFSET`.
    pub offset: u32,
    /// Size in bytes.
    pub size: u32,
}

impl VariableDescriptor {
    /// Descriptor for a resolved variable.
    pub fn new(name: &str, offset: u32, size: u32) -> Self {
        Self {
            name: FixedName::new(name),
            offset,
            size,
        }
    }

    /// Descriptor for a variable missing from the live layout.
    pub fn absent(name: &str, size: u32) -> Self {
        Self::new(name, ABSENT_OFFSET, size)
    }

    /// True unless the variable carries the sentinel offset.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.offset != ABSENT_OFFSET
    }
}

impl Default for VariableDescriptor {
    fn default() -> Self {
        Self {
            name: FixedName::EMPTY,
            offset: ABSENT_OFFSET,
            size: 0,
        }
    }
}

/// Capacity error when filling a fixed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("capacity of {capacity} entries exceeded")]
pub struct CapacityError {
    /// Maximum number of entries.
    pub capacity: usize,
}

/// Read attempts before a directory read gives up with
/// [`DirectoryError::Busy`].
pub const DIRECTORY_READ_ATTEMPTS: usize = 16;

/// Why the slave directory could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// No directory has been published yet.
    #[error("slave directory not published")]
    Unpublished,
    /// The directory was being rewritten during every attempt.
    #[error("slave directory rewritten during read")]
    Busy,
}

/// Per-slave entry of the shared directory.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SlaveDescriptor {
    /// Numeric slave id.
    pub id: u32,
    /// Number of used entries in `inputs`.
    pub input_count: u32,
    /// Number of used entries in `outputs`.
    pub output_count: u32,
    /// Display name.
    pub name: FixedName,
    /// Input variables.
    pub inputs: [VariableDescriptor; MAX_VARIABLES],
    /// Output variables.
    pub outputs: [VariableDescriptor; MAX_VARIABLES],
}

impl SlaveDescriptor {
    /// Empty descriptor for a slave.
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            input_count: 0,
            output_count: 0,
            name: FixedName::new(name),
            inputs: [VariableDescriptor::default(); MAX_VARIABLES],
            outputs: [VariableDescriptor::default(); MAX_VARIABLES],
        }
    }

    /// Append a variable descriptor.
    pub fn push(
        &mut self,
        direction: Direction,
        descriptor: VariableDescriptor,
    ) -> Result<(), CapacityError> {
        let (slots, count) = match direction {
            Direction::Input => (&mut self.inputs, &mut self.input_count),
            Direction::Output => (&mut self.outputs, &mut self.output_count),
        };
        let slot = slots
            .get_mut(*count as usize)
            .ok_or(CapacityError {
                capacity: MAX_VARIABLES,
            })?;
        *slot = descriptor;
        *count += 1;
        Ok(())
    }

    /// Used variable descriptors for `direction`.
    #[inline]
    pub fn variables(&self, direction: Direction) -> &[VariableDescriptor] {
        match direction {
            Direction::Input => &self.inputs[..(self.input_count as usize).min(MAX_VARIABLES)],
            Direction::Output => &self.outputs[..(self.output_count as usize).min(MAX_VARIABLES)],
        }
    }

    /// Find a variable by name, inputs first.
    pub fn find(&self, name: &str) -> Option<(Direction, &VariableDescriptor)> {
        [Direction::Input, Direction::Output]
            .into_iter()
            .find_map(|dir| {
                self.variables(dir)
                    .iter()
                    .find(|v| v.name.as_str() == name)
                    .map(|v| (dir, v))
            })
    }
}

/// Cycle timing values published once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleTimes {
    /// Shortest cycle [ns].
    pub min_ns: u64,
    /// Longest cycle [ns].
    pub max_ns: u64,
    /// Running average [ns].
    pub avg_ns: u64,
    /// Last cycle [ns].
    pub current_ns: u64,
}

/// The bus snapshot shared with consumer processes.
///
/// Constructed exactly once per segment by zero-filling (every field has a
/// valid all-zero representation) followed by [`BusSnapshot::init_in_place`].
#[repr(C, align(64))]
pub struct BusSnapshot {
    /// Completion time of the last cycle [ns since UNIX epoch].
    pub timestamp_ns: AtomicU64,
    /// Number of completed cycles.
    pub cycle_count: AtomicU64,
    /// Shortest cycle [ns].
    pub min_cycle_ns: AtomicU64,
    /// Longest cycle [ns].
    pub max_cycle_ns: AtomicU64,
    /// Average cycle [ns].
    pub avg_cycle_ns: AtomicU64,
    /// Last cycle [ns].
    pub current_cycle_ns: AtomicU64,
    current_state: AtomicU8,
    requested_state: AtomicU8,
    next_expected_state: AtomicU8,
    /// License / authorization check result of the master.
    pub is_authorized: AtomicBool,
    /// Frame-loss overload counter of the job runner.
    pub overload_counter: AtomicU32,
    directory_generation: AtomicU32,
    slave_count: AtomicU32,
    slaves: UnsafeCell<[SlaveDescriptor; MAX_SLAVES]>,
}

const_assert!(core::mem::size_of::<VariableDescriptor>() == NAME_LEN + 8);
const_assert!(core::mem::align_of::<BusSnapshot>() == 64);

// SAFETY: scalar fields are atomics. The directory behind the UnsafeCell is
// only accessed through raw pointers: written while the generation is odd,
// read by copy and discarded unless the generation stayed even and equal.
unsafe impl Sync for BusSnapshot {}
unsafe impl Send for BusSnapshot {}

impl BusSnapshot {
    /// Initialize a zero-filled snapshot in place.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `size_of::<BusSnapshot>()` bytes and
    /// suitably aligned, and no other reference to it may exist yet.
    pub unsafe fn init_in_place(ptr: *mut BusSnapshot) {
        // SAFETY: caller guarantees validity; all-zero is a valid value for
        // every field (atomics, integers, byte arrays).
        unsafe {
            ptr.write_bytes(0, 1);
            (*ptr).reset_statistics();
        }
    }

    /// Reset the cycle statistics to "no cycle seen yet".
    pub fn reset_statistics(&self) {
        self.cycle_count.store(0, Ordering::Relaxed);
        self.min_cycle_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_cycle_ns.store(0, Ordering::Relaxed);
        self.avg_cycle_ns.store(0, Ordering::Relaxed);
        self.current_cycle_ns.store(0, Ordering::Relaxed);
    }

    /// Publish the statistics of a finished cycle. Job thread only.
    #[inline]
    pub fn record_cycle(&self, cycle_count: u64, times: CycleTimes, timestamp_ns: u64) {
        self.min_cycle_ns.store(times.min_ns, Ordering::Relaxed);
        self.max_cycle_ns.store(times.max_ns, Ordering::Relaxed);
        self.avg_cycle_ns.store(times.avg_ns, Ordering::Relaxed);
        self.current_cycle_ns
            .store(times.current_ns, Ordering::Relaxed);
        self.timestamp_ns.store(timestamp_ns, Ordering::Relaxed);
        self.cycle_count.store(cycle_count, Ordering::Release);
    }

    /// Read the cycle statistics.
    pub fn cycle_times(&self) -> CycleTimes {
        CycleTimes {
            min_ns: self.min_cycle_ns.load(Ordering::Relaxed),
            max_ns: self.max_cycle_ns.load(Ordering::Relaxed),
            avg_ns: self.avg_cycle_ns.load(Ordering::Relaxed),
            current_ns: self.current_cycle_ns.load(Ordering::Relaxed),
        }
    }

    /// Actual bus state as last observed.
    pub fn current_state(&self) -> BusState {
        BusState::from_u8(self.current_state.load(Ordering::Acquire))
    }

    /// Store the actual bus state.
    pub fn set_current_state(&self, state: BusState) {
        self.current_state.store(state as u8, Ordering::Release);
    }

    /// Goal state set by the operator / configuration.
    pub fn requested_state(&self) -> BusState {
        BusState::from_u8(self.requested_state.load(Ordering::Acquire))
    }

    /// Store the goal state.
    pub fn set_requested_state(&self, state: BusState) {
        self.requested_state.store(state as u8, Ordering::Release);
    }

    /// Next state the supervisor is stepping to.
    pub fn next_expected_state(&self) -> BusState {
        BusState::from_u8(self.next_expected_state.load(Ordering::Acquire))
    }

    /// Store the next expected state.
    pub fn set_next_expected_state(&self, state: BusState) {
        self.next_expected_state.store(state as u8, Ordering::Release);
    }

    /// Number of slaves in the directory.
    pub fn slave_count(&self) -> usize {
        (self.slave_count.load(Ordering::Acquire) as usize).min(MAX_SLAVES)
    }

    /// Current directory generation (see module docs).
    #[inline]
    pub fn directory_generation(&self) -> u32 {
        self.directory_generation.load(Ordering::Acquire)
    }

    /// Replace the slave directory. Single writer (supervisor) only.
    ///
    /// The generation is odd while the copy is in progress; readers that
    /// overlap the rewrite discard what they copied.
    pub fn publish_directory(&self, slaves: &[SlaveDescriptor]) -> Result<(), CapacityError> {
        if slaves.len() > MAX_SLAVES {
            return Err(CapacityError {
                capacity: MAX_SLAVES,
            });
        }
        let generation = self.directory_generation.load(Ordering::Relaxed);
        let writing = if generation % 2 == 0 {
            generation.wrapping_add(1)
        } else {
            generation
        };
        self.directory_generation.store(writing, Ordering::Relaxed);
        fence(Ordering::Release);

        let table = self.slaves.get().cast::<SlaveDescriptor>();
        for (index, slave) in slaves.iter().enumerate() {
            // SAFETY: index < MAX_SLAVES (checked above); no reference into
            // the table exists, readers only copy through raw pointers.
            unsafe { table.add(index).write_volatile(*slave) };
        }
        self.slave_count.store(slaves.len() as u32, Ordering::Relaxed);

        let published = match writing.wrapping_add(1) {
            0 => 2,
            g => g,
        };
        self.directory_generation.store(published, Ordering::Release);
        Ok(())
    }

    /// Run `read` against a consistent view of the slave directory.
    ///
    /// `read` may run several times; its result is returned only from a
    /// pass that no rewrite overlapped. It must copy what it needs out of
    /// the view and have no side effects.
    pub fn read_directory<T>(
        &self,
        mut read: impl FnMut(&DirectoryView<'_>) -> T,
    ) -> Result<T, DirectoryError> {
        for _ in 0..DIRECTORY_READ_ATTEMPTS {
            let before = self.directory_generation.load(Ordering::Acquire);
            if before == 0 {
                return Err(DirectoryError::Unpublished);
            }
            if before % 2 == 0 {
                let view = DirectoryView {
                    table: self.slaves.get().cast::<SlaveDescriptor>().cast_const(),
                    len: (self.slave_count.load(Ordering::Relaxed) as usize).min(MAX_SLAVES),
                    generation: before,
                    _snapshot: PhantomData,
                };
                let value = read(&view);
                fence(Ordering::Acquire);
                if self.directory_generation.load(Ordering::Relaxed) == before {
                    return Ok(value);
                }
            }
            std::hint::spin_loop();
        }
        Err(DirectoryError::Busy)
    }

    /// Consistent copy of slave `index`, `None` if out of range.
    pub fn slave(&self, index: usize) -> Result<Option<SlaveDescriptor>, DirectoryError> {
        self.read_directory(|dir| dir.slave(index))
    }

    /// Consistent copy of the whole directory. Allocates; not for the
    /// cyclic path.
    pub fn copy_directory(&self) -> Result<Vec<SlaveDescriptor>, DirectoryError> {
        self.read_directory(|dir| (0..dir.len()).filter_map(|i| dir.slave(i)).collect())
    }

    /// Find a slave by display name.
    pub fn find_slave(&self, name: &str) -> Option<(usize, SlaveDescriptor)> {
        self.read_directory(|dir| {
            let index = dir.position(name)?;
            dir.slave(index).map(|slave| (index, slave))
        })
        .ok()
        .flatten()
    }
}

/// Copy-out access to the directory inside one
/// [`read_directory`](BusSnapshot::read_directory) pass.
///
/// Values read here may be torn; they only count once the pass validates.
/// Every field of [`SlaveDescriptor`] is valid for any bit pattern.
pub struct DirectoryView<'a> {
    table: *const SlaveDescriptor,
    len: usize,
    generation: u32,
    _snapshot: PhantomData<&'a BusSnapshot>,
}

impl DirectoryView<'_> {
    /// Number of published slaves.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the published directory has no slaves.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Generation this pass reads.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Copy of slave `index`.
    #[inline]
    pub fn slave(&self, index: usize) -> Option<SlaveDescriptor> {
        // SAFETY: index < len <= MAX_SLAVES; the table lives as long as the
        // snapshot borrowed by 'a.
        (index < self.len).then(|| unsafe { self.table.add(index).read_volatile() })
    }

    /// Copy of the name of slave `index`.
    #[inline]
    pub fn name(&self, index: usize) -> Option<FixedName> {
        // SAFETY: as in `slave`; only the name field is read.
        (index < self.len)
            .then(|| unsafe { std::ptr::addr_of!((*self.table.add(index)).name).read_volatile() })
    }

    /// Index of the slave named `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        (0..self.len).find(|&i| self.name(i).is_some_and(|n| n.as_str() == name))
    }
}
