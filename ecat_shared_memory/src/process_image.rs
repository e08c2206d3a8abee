//! Raw process-image regions (`<segment>_in`, `<segment>_out`).
//!
//! Each region is a separate shared object sized exactly to the process
//! image reported by the master. The base pointer is cached at map time and
//! stays valid for the lifetime of the region.

use crate::error::ShmResult;
use crate::platform::{attach_segment_mmap, create_exact_mmap};
use ecat_common::bus::Direction;
use ecat_common::bus::master::ImagePtr;
use ecat_common::pdo::access::{read_into, write_from};
use memmap2::MmapMut;
use std::ptr::NonNull;

/// Shared object name of the raw region for `direction`.
pub fn region_name(segment_name: &str, direction: Direction) -> String {
    match direction {
        Direction::Input => format!("{segment_name}_in"),
        Direction::Output => format!("{segment_name}_out"),
    }
}

/// One mapped raw process image.
pub struct RawRegion {
    name: String,
    image: Option<ImagePtr>,
    _map: Option<MmapMut>,
}

impl RawRegion {
    /// Producer: create the region with exactly `size` bytes, zero filled.
    pub fn create(segment_name: &str, direction: Direction, size: usize) -> ShmResult<Self> {
        let name = region_name(segment_name, direction);
        let map = create_exact_mmap(&name, size)?;
        Ok(Self::from_map(name, map))
    }

    /// Consumer: attach at the size the producer created.
    pub fn open(segment_name: &str, direction: Direction) -> ShmResult<Self> {
        let name = region_name(segment_name, direction);
        let map = attach_segment_mmap(&name)?;
        Ok(Self::from_map(name, map))
    }

    fn from_map(name: String, mut map: Option<MmapMut>) -> Self {
        let image = map.as_mut().and_then(|m| {
            NonNull::new(m.as_mut_ptr()).map(|ptr| ImagePtr { ptr, len: m.len() })
        });
        Self {
            name,
            image,
            _map: map,
        }
    }

    /// Shared object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.image.map_or(0, |i| i.len)
    }

    /// True for a zero-sized process image.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached base pointer, `None` for a zero-sized region.
    #[inline]
    pub fn image(&self) -> Option<ImagePtr> {
        self.image
    }

    /// Copy of the whole region.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.read(&mut out, 0, self.len() as u32);
        out
    }

    /// Copy `size` bytes at `offset` into `dest`; see [`read_into`].
    ///
    /// Other processes may write the region concurrently; the copy is not
    /// atomic with respect to them.
    #[inline]
    pub fn read(&self, dest: &mut [u8], offset: u32, size: u32) -> bool {
        match self.image {
            Some(image) => {
                // SAFETY: the mapping outlives self and spans `len` bytes.
                let raw = unsafe { std::slice::from_raw_parts(image.ptr.as_ptr(), image.len) };
                read_into(dest, raw, offset, size)
            }
            None => false,
        }
    }

    /// Copy `size` bytes of `src` to `offset`; see [`write_from`].
    #[inline]
    pub fn write(&self, src: &[u8], offset: u32, size: u32) -> bool {
        match self.image {
            Some(image) => {
                // SAFETY: the mapping outlives self, spans `len` bytes and is
                // writable; concurrent writers are tolerated by contract.
                let raw =
                    unsafe { std::slice::from_raw_parts_mut(image.ptr.as_ptr(), image.len) };
                write_from(src, raw, offset, size)
            }
            None => false,
        }
    }
}

// SAFETY: the region is plain shared bytes; all access goes through the
// cached pointer with explicit bounds checks.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}
