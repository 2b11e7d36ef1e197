//! Size classes for the segregated free lists.
//!
//! Blocks are bucketed, not sorted: a block of size `s` belongs to the
//! smallest class `i` with `s <= 2^(6 + i)`, giving boundaries at 64,
//! 128, 256, 512, 1024, 2048, 4096, 8192 and 16384 bytes; everything
//! larger lands in the last class.

use super::block::WSIZE;

/// The number of size classes.
pub(super) const NUM_CLASSES: u32 = 10;

/// Sizes up to this many bytes map to class 0.
const SMALLEST_CLASS_LIMIT: u32 = 64;

/// Bytes occupied by the free-list directory at the base of the region:
/// one head slot per class.
pub(super) const DIRECTORY_BYTES: u32 = NUM_CLASSES * WSIZE;

/// Index of one of the ten segregated free lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct SizeClass(u32);

impl SizeClass {
    /// The class holding blocks of `size` bytes.
    pub(super) fn from_size(size: u32) -> Self {
        if size <= SMALLEST_CLASS_LIMIT {
            return SizeClass(0);
        }
        let class = (size - 1).ilog2() - SMALLEST_CLASS_LIMIT.ilog2() + 1;
        SizeClass(class.min(NUM_CLASSES - 1))
    }

    /// Byte offset of this class's head slot within the directory.
    pub(super) fn slot(self) -> u32 {
        self.0 * WSIZE
    }

    /// The next larger class, if any. Used by the finder to escalate when
    /// a class's chain is exhausted.
    pub(super) fn larger(self) -> Option<SizeClass> {
        if self.0 + 1 < NUM_CLASSES {
            Some(SizeClass(self.0 + 1))
        } else {
            None
        }
    }

    /// All classes, smallest first.
    pub(super) fn all() -> impl Iterator<Item = SizeClass> {
        (0..NUM_CLASSES).map(SizeClass)
    }
}
