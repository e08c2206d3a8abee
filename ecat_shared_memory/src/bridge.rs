//! The shared process-data bridge.
//!
//! One [`ProcessDataBridge`] bundles everything a process needs to exchange
//! process data with the bus outside the master's own API:
//!
//! - the snapshot segment (state, statistics, slave directory)
//! - the raw input and output process images
//! - the consumer pulse semaphores and their shared registry
//!
//! The producer (master process) builds it with [`ProcessDataBridge::create`]
//! and hands it to the job runner; consumers attach with
//! [`ProcessDataBridge::open`]. There is no global instance.
//!
//! # Consumer usage
//!
//! ```rust,no_run
//! use ecat_common::bus::config::BridgeConfig;
//! use ecat_shared_memory::{ProcessDataBridge, consumer_identity};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = ProcessDataBridge::open(&BridgeConfig::default())?;
//! let me = consumer_identity();
//! loop {
//!     bridge.wait(me)?;
//!     let value: u16 = bridge.get_value(1, "Status")?;
//!     bridge.set_value::<u16>(1, "Control", value | 0x1)?;
//! }
//! # }
//! ```
//!
//! Consumers writing outputs race with the producer's once-per-cycle copy;
//! the write lands in the next cycle at the latest.

use crate::error::{ShmError, ShmResult};
use crate::platform::remove_segment;
use crate::pool::{ConsumerRegistry, SemaphorePool};
use crate::process_image::{RawRegion, region_name};
use crate::segment::{SegmentHeader, SnapshotSegment};
use ecat_common::bus::Direction;
use ecat_common::bus::config::BridgeConfig;
use ecat_common::bus::master::{MemoryProvider, MemoryRequirements};
use ecat_common::pdo::access::PdoValue;
use ecat_common::pdo::snapshot::{BusSnapshot, DirectoryError, VariableDescriptor};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::time::Duration;
use tracing::info;

/// Handle to the shared process-data bridge.
pub struct ProcessDataBridge {
    segment: SnapshotSegment,
    input: RawRegion,
    output: RawRegion,
    pool: SemaphorePool,
}

impl ProcessDataBridge {
    /// Producer: replace any stale bridge and build a fresh one.
    ///
    /// Raw regions are sized exactly to `images`.
    pub fn create(config: &BridgeConfig, images: MemoryRequirements) -> ShmResult<Self> {
        let segment = SnapshotSegment::create(&config.segment_name, config.segment_size)?;
        let input = RawRegion::create(&config.segment_name, Direction::Input, images.input)?;
        let output = RawRegion::create(&config.segment_name, Direction::Output, images.output)?;
        let pool = SemaphorePool::create(&config.semaphore_base, config.semaphore_count)?;
        info!(
            segment = %config.segment_name,
            input_bytes = images.input,
            output_bytes = images.output,
            semaphores = config.semaphore_count,
            "Process-data bridge created"
        );
        Ok(Self {
            segment,
            input,
            output,
            pool,
        })
    }

    /// Producer: reuse an existing bridge, constructing only what is missing.
    ///
    /// The snapshot contents survive. Raw regions are kept if their size
    /// still matches `images`, otherwise recreated.
    pub fn attach(config: &BridgeConfig, images: MemoryRequirements) -> ShmResult<Self> {
        let segment = SnapshotSegment::find_or_construct(&config.segment_name, config.segment_size)?;
        let input = Self::reuse_region(&config.segment_name, Direction::Input, images.input)?;
        let output = Self::reuse_region(&config.segment_name, Direction::Output, images.output)?;
        let pool = SemaphorePool::create(&config.semaphore_base, config.semaphore_count)?;
        Ok(Self {
            segment,
            input,
            output,
            pool,
        })
    }

    /// Keep a region of matching size; otherwise unlink and recreate it so
    /// that consumers mapping the old one are never cut short.
    fn reuse_region(segment: &str, direction: Direction, size: usize) -> ShmResult<RawRegion> {
        match RawRegion::open(segment, direction) {
            Ok(region) if region.len() == size => Ok(region),
            Ok(region) => {
                info!(
                    region = region.name(),
                    old_bytes = region.len(),
                    new_bytes = size,
                    "Process image size changed, recreating region"
                );
                drop(region);
                RawRegion::create(segment, direction, size)
            }
            Err(ShmError::NotFound { .. }) => RawRegion::create(segment, direction, size),
            Err(e) => Err(e),
        }
    }

    /// Consumer: attach to the bridge a producer created. Never constructs.
    pub fn open(config: &BridgeConfig) -> ShmResult<Self> {
        let segment = SnapshotSegment::open(&config.segment_name)?;
        let input = RawRegion::open(&config.segment_name, Direction::Input)?;
        let output = RawRegion::open(&config.segment_name, Direction::Output)?;
        let pool = SemaphorePool::open(&config.semaphore_base, config.semaphore_count)?;
        Ok(Self {
            segment,
            input,
            output,
            pool,
        })
    }

    /// Unlink the segment, both raw regions and all semaphores.
    ///
    /// Processes still attached keep their mappings until they drop them.
    pub fn remove(config: &BridgeConfig) -> ShmResult<()> {
        remove_segment(&config.segment_name)?;
        remove_segment(&region_name(&config.segment_name, Direction::Input))?;
        remove_segment(&region_name(&config.segment_name, Direction::Output))?;
        SemaphorePool::remove(&config.semaphore_base, config.semaphore_count)?;
        info!(segment = %config.segment_name, "Process-data bridge removed");
        Ok(())
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// The shared bus snapshot.
    #[inline]
    pub fn snapshot(&self) -> &BusSnapshot {
        self.segment.snapshot()
    }

    /// Segment header (creator, layout hash, consumer registry).
    pub fn header(&self) -> &SegmentHeader {
        self.segment.header()
    }

    /// Raw input process image.
    #[inline]
    pub fn input(&self) -> &RawRegion {
        &self.input
    }

    /// Raw output process image.
    #[inline]
    pub fn output(&self) -> &RawRegion {
        &self.output
    }

    /// Raw process image for `direction`.
    #[inline]
    pub fn region(&self, direction: Direction) -> &RawRegion {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    /// Both raw regions as master process-image memory, if non-empty.
    pub fn memory_provider(&self) -> Option<MemoryProvider> {
        Some(MemoryProvider {
            input: self.input.image()?,
            output: self.output.image()?,
        })
    }

    /// Signal consumers that a cycle completed. Returns slots posted.
    #[inline]
    pub fn publish_cycle(&self) -> usize {
        self.pool.pulse_all()
    }

    fn registry(&self) -> ConsumerRegistry<'_> {
        ConsumerRegistry::new(&self.header().consumers, self.pool.capacity())
    }

    /// Assign `identity` a semaphore slot (idempotent).
    pub fn register(&self, identity: u64) -> ShmResult<usize> {
        self.registry().register(identity)
    }

    /// Give up the slot of `identity`.
    pub fn release(&self, identity: u64) -> bool {
        self.registry().release(identity)
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.registry().registered()
    }

    fn slot_for(&self, identity: u64) -> ShmResult<&crate::semaphore::NamedSemaphore> {
        let index = self.register(identity)?;
        self.pool.slot(index).ok_or(ShmError::PoolExhausted {
            capacity: self.pool.capacity(),
        })
    }

    /// Block until the next completed cycle. Registers on first use.
    pub fn wait(&self, identity: u64) -> ShmResult<()> {
        self.slot_for(identity)?.wait()
    }

    /// Consume a pending pulse without blocking.
    pub fn try_wait(&self, identity: u64) -> ShmResult<bool> {
        self.slot_for(identity)?.try_wait()
    }

    /// Wait at most `timeout` for a pulse. Returns false on timeout.
    pub fn wait_timeout(&self, identity: u64, timeout: Duration) -> ShmResult<bool> {
        self.slot_for(identity)?.wait_timeout(timeout)
    }

    /// Index of the slave named `name` in the directory.
    pub fn slave_index(&self, name: &str) -> Option<usize> {
        self.snapshot().find_slave(name).map(|(i, _)| i)
    }

    fn locate<T: PdoValue>(
        &self,
        slave_index: usize,
        name: &str,
        writable: bool,
    ) -> ShmResult<(Direction, VariableDescriptor)> {
        let slave = self
            .snapshot()
            .slave(slave_index)
            .map_err(|e| match e {
                DirectoryError::Unpublished => ShmError::DirectoryNotPublished,
                DirectoryError::Busy => ShmError::DirectoryBusy,
            })?
            .ok_or(ShmError::SlaveNotFound { index: slave_index })?;
        let found = if writable {
            slave
                .variables(Direction::Output)
                .iter()
                .find(|v| v.name.as_str() == name)
                .map(|v| (Direction::Output, v))
                .or_else(|| slave.find(name))
        } else {
            slave.find(name)
        };
        let (direction, var) = found.ok_or_else(|| ShmError::VariableNotFound {
            name: name.to_string(),
        })?;
        if var.size as usize != T::SIZE {
            return Err(ShmError::VariableSizeMismatch {
                name: name.to_string(),
                expected: T::SIZE,
                actual: var.size as usize,
            });
        }
        if !var.is_present() {
            return Err(ShmError::VariableAbsent {
                name: name.to_string(),
            });
        }
        Ok((direction, *var))
    }

    /// Read a variable of slave `slave_index` (inputs searched first).
    pub fn get_value<T: PdoValue>(&self, slave_index: usize, name: &str) -> ShmResult<T> {
        let (direction, var) = self.locate::<T>(slave_index, name, false)?;
        let mut buf = [0u8; 8];
        if !self.region(direction).read(&mut buf, var.offset, var.size) {
            return Err(ShmError::VariableAbsent {
                name: name.to_string(),
            });
        }
        Ok(T::decode(&buf))
    }

    /// Write an output variable of slave `slave_index` (outputs searched first).
    pub fn set_value<T: PdoValue>(&self, slave_index: usize, name: &str, value: T) -> ShmResult<()> {
        let (direction, var) = self.locate::<T>(slave_index, name, true)?;
        if direction != Direction::Output {
            return Err(ShmError::ReadOnlyVariable {
                name: name.to_string(),
            });
        }
        let mut buf = [0u8; 8];
        value.encode(&mut buf);
        if !self.output.write(&buf, var.offset, var.size) {
            return Err(ShmError::VariableAbsent {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Zero-copy handle aliasing the variable inside the raw region.
    pub fn get_pointer<T: PdoValue>(&self, slave_index: usize, name: &str) -> ShmResult<VarRef<'_, T>> {
        let (direction, var) = self.locate::<T>(slave_index, name, false)?;
        let image = self
            .region(direction)
            .image()
            .filter(|img| var.offset as usize + T::SIZE <= img.len)
            .ok_or_else(|| ShmError::VariableAbsent {
                name: name.to_string(),
            })?;
        // SAFETY: offset + SIZE checked against the image length above.
        let ptr = unsafe { NonNull::new_unchecked(image.ptr.as_ptr().add(var.offset as usize)) };
        Ok(VarRef {
            ptr,
            direction,
            name: name.to_string(),
            _marker: PhantomData,
        })
    }
}

/// Typed alias of one variable in a raw process image.
///
/// Borrowed from the bridge, so it cannot outlive the mapping. Reads and
/// writes are volatile: another process may change the bytes at any time.
pub struct VarRef<'a, T: PdoValue> {
    ptr: NonNull<u8>,
    direction: Direction,
    name: String,
    _marker: PhantomData<(&'a ProcessDataBridge, T)>,
}

impl<T: PdoValue> VarRef<'_, T> {
    /// Direction of the aliased variable.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Variable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw address inside the shared region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> T {
        let mut buf = [0u8; 8];
        for (i, b) in buf.iter_mut().take(T::SIZE).enumerate() {
            // SAFETY: SIZE bytes from ptr were bounds checked at creation.
            *b = unsafe { self.ptr.as_ptr().add(i).read_volatile() };
        }
        T::decode(&buf)
    }

    /// Store `value`. Inputs are read-only.
    #[inline]
    pub fn set(&self, value: T) -> ShmResult<()> {
        if self.direction != Direction::Output {
            return Err(ShmError::ReadOnlyVariable {
                name: self.name.clone(),
            });
        }
        let mut buf = [0u8; 8];
        value.encode(&mut buf);
        for (i, b) in buf.iter().take(T::SIZE).enumerate() {
            // SAFETY: see `get`; the region is mapped writable.
            unsafe { self.ptr.as_ptr().add(i).write_volatile(*b) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;
    use ecat_common::pdo::snapshot::SlaveDescriptor;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    fn config() -> BridgeConfig {
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        let pid = get_current_pid();
        let mut cfg = BridgeConfig::named(&format!("ecat_br_{pid}_{n}"), &format!("ecat_brs_{pid}_{n}_"));
        cfg.semaphore_count = 2;
        cfg
    }

    fn directory() -> Vec<SlaveDescriptor> {
        let mut slave = SlaveDescriptor::new(10, "EL3102");
        slave
            .push(Direction::Input, VariableDescriptor::new("Status", 0, 2))
            .unwrap();
        slave
            .push(Direction::Input, VariableDescriptor::absent("Missing", 2))
            .unwrap();
        slave
            .push(Direction::Output, VariableDescriptor::new("Control", 2, 2))
            .unwrap();
        vec![slave]
    }

    #[test]
    fn accessors_follow_directory() {
        let cfg = config();
        let producer = ProcessDataBridge::create(&cfg, MemoryRequirements { input: 4, output: 4 }).unwrap();
        producer.snapshot().publish_directory(&directory()).unwrap();
        producer.input().write(&0x1234u16.to_le_bytes(), 0, 2);

        let consumer = ProcessDataBridge::open(&cfg).unwrap();
        assert_eq!(consumer.slave_index("EL3102"), Some(0));
        assert_eq!(consumer.get_value::<u16>(0, "Status").unwrap(), 0x1234);

        consumer.set_value::<u16>(0, "Control", 0xBEEF).unwrap();
        assert_eq!(producer.get_value::<u16>(0, "Control").unwrap(), 0xBEEF);

        assert!(matches!(
            consumer.set_value::<u16>(0, "Status", 1),
            Err(ShmError::ReadOnlyVariable { .. })
        ));
        assert!(matches!(
            consumer.get_value::<u32>(0, "Status"),
            Err(ShmError::VariableSizeMismatch { expected: 4, actual: 2, .. })
        ));
        assert!(matches!(
            consumer.get_value::<u16>(0, "Missing"),
            Err(ShmError::VariableAbsent { .. })
        ));
        assert!(matches!(
            consumer.get_value::<u16>(3, "Status"),
            Err(ShmError::SlaveNotFound { index: 3 })
        ));

        ProcessDataBridge::remove(&cfg).unwrap();
    }

    #[test]
    fn unpublished_directory_is_reported() {
        let cfg = config();
        let producer = ProcessDataBridge::create(&cfg, MemoryRequirements::default()).unwrap();
        assert!(producer.memory_provider().is_none());
        assert!(matches!(
            producer.get_value::<u8>(0, "x"),
            Err(ShmError::DirectoryNotPublished)
        ));
        ProcessDataBridge::remove(&cfg).unwrap();
    }

    #[test]
    fn pointer_aliases_region() {
        let cfg = config();
        let producer = ProcessDataBridge::create(&cfg, MemoryRequirements { input: 4, output: 4 }).unwrap();
        producer.snapshot().publish_directory(&directory()).unwrap();

        let control = producer.get_pointer::<u16>(0, "Control").unwrap();
        control.set(0x0102).unwrap();
        assert_eq!(producer.output().to_vec()[2..4], [0x02, 0x01]);
        assert_eq!(control.get(), 0x0102);

        let status = producer.get_pointer::<u16>(0, "Status").unwrap();
        assert!(status.set(1).is_err());
        ProcessDataBridge::remove(&cfg).unwrap();
    }

    #[test]
    fn consumers_get_distinct_slots() {
        let cfg = config();
        let producer = ProcessDataBridge::create(&cfg, MemoryRequirements::default()).unwrap();
        let me = crate::pool::consumer_identity();
        assert_eq!(producer.register(me).unwrap(), 0);
        let other = std::thread::spawn(crate::pool::consumer_identity).join().unwrap();
        assert_eq!(producer.register(other).unwrap(), 1);
        assert!(matches!(
            producer.register(other + 1),
            Err(ShmError::PoolExhausted { capacity: 2 })
        ));
        assert!(producer.release(other));
        assert_eq!(producer.consumer_count(), 1);
        ProcessDataBridge::remove(&cfg).unwrap();
    }
}
