//! Bit-exact process-data access.
//!
//! Variables are located by `(offset, size)` in bytes inside a contiguous
//! raw process image. A variable that was not found during resolution
//! carries [`ABSENT_OFFSET`] and every copy helper skips it.
//!
//! ## Performance
//!
//! These helpers sit on the per-cycle path: one sentinel check, one bounds
//! check, one fixed-size copy. No allocation, no logging.

use crate::bus::master::ImagePtr;
use serde::{Deserialize, Serialize};

/// Offset marking a variable that is absent from the live layout.
pub const ABSENT_OFFSET: u32 = u32::MAX;

/// Destination type of a configured variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarKind {
    /// Unsigned 8 bit.
    U8,
    /// Signed 8 bit.
    I8,
    /// Unsigned 16 bit.
    U16,
    /// Signed 16 bit.
    I16,
    /// Unsigned 32 bit.
    U32,
    /// Signed 32 bit.
    I32,
    /// Unsigned 64 bit.
    U64,
    /// Signed 64 bit.
    I64,
    /// IEEE 754 single precision.
    F32,
    /// IEEE 754 double precision.
    F64,
}

impl VarKind {
    /// Natural size of the type in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width value that can live in a process image (little endian).
pub trait PdoValue: Copy + Send + 'static + sealed::Sealed {
    /// Matching configuration kind.
    const KIND: VarKind;
    /// Size in bytes.
    const SIZE: usize = Self::KIND.size();

    /// Decode from the first `SIZE` bytes of `bytes`.
    fn decode(bytes: &[u8]) -> Self;

    /// Encode into the first `SIZE` bytes of `out`.
    fn encode(self, out: &mut [u8]);
}

macro_rules! impl_pdo_value {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl PdoValue for $ty {
                const KIND: VarKind = VarKind::$kind;

                #[inline]
                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; core::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..core::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(buf)
                }

                #[inline]
                fn encode(self, out: &mut [u8]) {
                    out[..core::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_pdo_value!(
    u8 => U8, i8 => I8,
    u16 => U16, i16 => I16,
    u32 => U32, i32 => I32,
    u64 => U64, i64 => I64,
    f32 => F32, f64 => F64,
);

#[inline]
fn span(offset: u32, size: u32) -> Option<core::ops::Range<usize>> {
    if offset == ABSENT_OFFSET {
        return None;
    }
    let start = offset as usize;
    Some(start..start + size as usize)
}

/// Copy `size` bytes at `offset` of `raw` into `dest`.
///
/// Returns `false` (and leaves `dest` untouched) for an absent variable or
/// an out-of-range descriptor.
#[inline]
pub fn read_into(dest: &mut [u8], raw: &[u8], offset: u32, size: u32) -> bool {
    let Some(range) = span(offset, size) else {
        return false;
    };
    match (raw.get(range), dest.get_mut(..size as usize)) {
        (Some(src), Some(dst)) => {
            dst.copy_from_slice(src);
            true
        }
        _ => false,
    }
}

/// Copy `size` bytes of `src` into `raw` at `offset`.
///
/// Returns `false` (and leaves `raw` untouched) for an absent variable or
/// an out-of-range descriptor.
#[inline]
pub fn write_from(src: &[u8], raw: &mut [u8], offset: u32, size: u32) -> bool {
    let Some(range) = span(offset, size) else {
        return false;
    };
    match (raw.get_mut(range), src.get(..size as usize)) {
        (Some(dst), Some(src)) => {
            dst.copy_from_slice(src);
            true
        }
        _ => false,
    }
}

/// Copy one variable between two images that share the same layout.
///
/// # Safety
///
/// `src` and `dst` must point to live, non-overlapping images of at least
/// their stated lengths for the duration of the call.
#[inline]
pub unsafe fn mirror_variable(src: ImagePtr, dst: ImagePtr, offset: u32, size: u32) -> bool {
    let Some(range) = span(offset, size) else {
        return false;
    };
    if range.end > src.len || range.end > dst.len {
        return false;
    }
    // SAFETY: range checked against both lengths above; caller guarantees
    // liveness and non-overlap.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.ptr.as_ptr().add(range.start),
            dst.ptr.as_ptr().add(range.start),
            range.len(),
        );
    }
    true
}
