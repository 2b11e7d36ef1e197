//! In-band block metadata.
//!
//! Every block, allocated or free, is flanked by a 4-byte header and a
//! 4-byte footer holding the same packed word: the block's total size
//! (tags included) or-ed with the allocation bit. Sizes are multiples of
//! 8, so the low three bits of the size are always clear and the lowest
//! is free to carry the flag.
//!
//! A free block reuses the first eight bytes of its payload area for two
//! link words that thread it into its size class's list:
//!
//! ```ignore
//! allocated: [ header | payload ...                        | footer ]
//! free:      [ header | prev-link | next-link | ... unused | footer ]
//! ```
//!
//! Link words hold payload offsets of other free blocks; the raw value 0
//! is the null link (offset 0 is inside the free-list directory and can
//! never name a payload).

/// Word and tag size in bytes.
pub(super) const WSIZE: u32 = 4;

/// Double word size in bytes; the alignment unit.
pub(super) const DSIZE: u32 = 8;

/// The smallest legal block: header + footer + room for two link words.
pub(super) const MIN_BLOCK: u32 = 16;

/// A boundary tag: one 32-bit word packing `(size, allocated)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Tag(u32);

impl Tag {
    /// Pack a size and allocation flag. `size` must be a multiple of 8.
    pub(super) fn new(size: u32, allocated: bool) -> Self {
        debug_assert_eq!(size % DSIZE, 0);
        Tag(size | allocated as u32)
    }

    pub(super) fn from_raw(raw: u32) -> Self {
        Tag(raw)
    }

    pub(super) fn into_raw(self) -> u32 {
        self.0
    }

    /// The block's total size, tags included.
    pub(super) fn size(self) -> u32 {
        self.0 & !0x7
    }

    pub(super) fn is_allocated(self) -> bool {
        self.0 & 0x1 != 0
    }
}

/// A free-list link: the payload offset of another free block, or null.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Link {
    /// End of chain, or an empty class head.
    Null,
    /// Payload offset of the linked block.
    Ptr(u32),
}

impl Link {
    pub(super) fn from_raw(raw: u32) -> Self {
        if raw == 0 {
            Link::Null
        } else {
            Link::Ptr(raw)
        }
    }

    pub(super) fn into_raw(self) -> u32 {
        match self {
            Link::Null => 0,
            Link::Ptr(payload) => payload,
        }
    }
}

/// Header offset for the block whose payload starts at `payload`.
pub(super) fn header(payload: u32) -> u32 {
    payload - WSIZE
}

/// Footer offset, given the payload offset and the block's size.
pub(super) fn footer(payload: u32, size: u32) -> u32 {
    payload + size - DSIZE
}

/// Payload offset of the physically next block.
pub(super) fn next_payload(payload: u32, size: u32) -> u32 {
    payload + size
}

/// Offset of the previous block's footer, from which its size (and hence
/// its payload offset) is read.
pub(super) fn prev_footer(payload: u32) -> u32 {
    payload - DSIZE
}

/// Offset of a free block's predecessor link word.
pub(super) fn prev_link(payload: u32) -> u32 {
    payload
}

/// Offset of a free block's successor link word.
pub(super) fn next_link(payload: u32) -> u32 {
    payload + WSIZE
}
