//! The host memory primitive.
//!
//! The heap operates over a single contiguous byte region that only ever
//! grows, in the manner of the classic `brk`/`sbrk` facility. The region
//! is addressed by 32-bit byte offsets from its base, which is what lets
//! free-list links fit in a 4-byte word regardless of the host's pointer
//! width.

use cfg_if::cfg_if;

use crate::AllocError;

/// A brk-like host facility backing a [`Heap`](crate::Heap).
///
/// The region is contiguous and byte-addressable; offsets are measured
/// from the base of the region, and the region never shrinks. Word
/// accesses are little-endian and may target any in-bounds offset.
pub trait Memory {
    /// Append `bytes` bytes to the region, preserving existing contents.
    ///
    /// Returns the offset of the first newly-added byte, or `Err` if the
    /// host cannot grow the region any further.
    fn extend(&mut self, bytes: u32) -> Result<u32, AllocError>;

    /// The lowest valid byte offset in the region.
    fn lo(&self) -> u32;

    /// The highest valid byte offset currently in the region.
    fn hi(&self) -> u32;

    /// Read the 32-bit word at offset `at`.
    fn read_word(&self, at: u32) -> u32;

    /// Write the 32-bit word at offset `at`.
    fn write_word(&mut self, at: u32, word: u32);
}

cfg_if! {
    if #[cfg(feature = "alloc")] {
        use alloc::vec::Vec;

        /// A `Vec`-backed [`Memory`] with an optional growth limit.
        ///
        /// This is the host primitive used by the test suite: a fresh
        /// region per heap, and a byte limit that makes out-of-memory
        /// deterministic.
        #[derive(Debug, Default)]
        pub struct GrowableRegion {
            bytes: Vec<u8>,
            limit: Option<usize>,
        }

        impl GrowableRegion {
            /// Create a region that refuses to grow past `limit` bytes.
            pub fn with_limit(limit: usize) -> Self {
                GrowableRegion {
                    bytes: Vec::new(),
                    limit: Some(limit),
                }
            }

            /// Create a region with no growth limit.
            pub fn unbounded() -> Self {
                GrowableRegion::default()
            }

            /// The region contents.
            pub fn bytes(&self) -> &[u8] {
                &self.bytes
            }

            /// The region contents, mutably.
            ///
            /// Callers own the payload interiors the heap hands out; this
            /// is how they reach them.
            pub fn bytes_mut(&mut self) -> &mut [u8] {
                &mut self.bytes
            }
        }

        impl Memory for GrowableRegion {
            fn extend(&mut self, bytes: u32) -> Result<u32, AllocError> {
                let old_len = self.bytes.len();
                let new_len = old_len.checked_add(bytes as usize).ok_or(AllocError)?;
                if self.limit.is_some_and(|limit| new_len > limit) {
                    return Err(AllocError);
                }
                if u32::try_from(new_len).is_err() {
                    return Err(AllocError);
                }
                self.bytes.resize(new_len, 0);
                Ok(old_len as u32)
            }

            fn lo(&self) -> u32 {
                0
            }

            fn hi(&self) -> u32 {
                // Meaningful only once the region is non-empty; the heap
                // never reads before its first extension.
                (self.bytes.len().saturating_sub(1)) as u32
            }

            fn read_word(&self, at: u32) -> u32 {
                let at = at as usize;
                let bytes = self.bytes[at..at + 4].try_into().unwrap();
                u32::from_le_bytes(bytes)
            }

            fn write_word(&mut self, at: u32, word: u32) {
                let at = at as usize;
                self.bytes[at..at + 4].copy_from_slice(&word.to_le_bytes());
            }
        }
    }
}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;

    #[test]
    fn extend_returns_offset_of_first_new_byte() {
        let mut region = GrowableRegion::unbounded();

        assert_eq!(region.extend(40), Ok(0));
        assert_eq!(region.extend(16), Ok(40));
        assert_eq!(region.lo(), 0);
        assert_eq!(region.hi(), 55);
    }

    #[test]
    fn extend_past_limit_fails_without_growing() {
        let mut region = GrowableRegion::with_limit(64);

        assert_eq!(region.extend(64), Ok(0));
        assert_eq!(region.extend(1), Err(AllocError));
        assert_eq!(region.hi(), 63);
    }

    #[test]
    fn extension_preserves_existing_contents() {
        let mut region = GrowableRegion::unbounded();

        region.extend(8).unwrap();
        region.write_word(4, 0xDEAD_BEEF);
        region.extend(4096).unwrap();

        assert_eq!(region.read_word(4), 0xDEAD_BEEF);
    }

    #[test]
    fn words_round_trip_at_any_alignment() {
        let mut region = GrowableRegion::unbounded();
        region.extend(32).unwrap();

        region.write_word(12, 4_480_113);
        assert_eq!(region.read_word(12), 4_480_113);

        // Tag reads sit at payload - 4, so odd multiples of 4 matter too.
        region.write_word(20, u32::MAX);
        assert_eq!(region.read_word(20), u32::MAX);
    }
}
