//! The segregated-fit heap.
//!
//! Free memory is organized into a 2-level structure to facilitate fast
//! first-fit allocation:
//!
//! 1. By size, into ten classes with boundaries at powers of two from 64
//!    up to 16384 bytes, in a fixed-size directory at the base of the
//!    region.
//!
//! 2. Within a class, into a doubly linked LIFO list threaded through the
//!    free blocks' payload areas.
//!
//! When allocating we start at the class matching the rounded request and
//! take the first block large enough, escalating to larger and larger
//! classes until one fits or the directory is exhausted. LIFO insertion
//! keeps inserts O(1); first fit within a bucket gives good throughput at
//! a modest fragmentation cost.
//!
//! When freeing, boundary tags make coalescing O(1): the footer of the
//! physical predecessor and the header of the physical successor are one
//! word away from the freed block, and any free neighbor is unlinked and
//! absorbed before the merged block is reinserted. Two synthetic
//! always-allocated blocks bracket the heap so the coalescer never has to
//! special-case the ends.
//!
//! The overall region layout, by byte offset from the region base:
//!
//! ```ignore
//! +-----------+-----+----------+----------+--------------------+----------+
//! | directory | pad | prologue | prologue | blocks ...         | epilogue |
//! | 10 words  |     | header   | footer   |                    | header   |
//! |           |     | (8, 1)   | (8, 1)   |                    | (0, 1)   |
//! +-----------+-----+----------+----------+--------------------+----------+
//!                                                              ^
//!                                                              |_ frontier
//! ```
//!
//! The heap only ever grows. Extension happens in 4096-byte chunks (or
//! the rounded request, if larger); the old epilogue header becomes the
//! new free block's header and a fresh epilogue is written at the new
//! frontier, so the new tail coalesces with any free block that was
//! already there.

use cfg_if::cfg_if;

use crate::{AllocError, Memory};

mod block;
mod classes;

cfg_if! {
    if #[cfg(feature = "checker")] {
        pub(crate) mod check;
    }
}

#[cfg(all(test, feature = "alloc"))]
mod tests;

use block::{
    footer, header, next_link, next_payload, prev_footer, prev_link, Link, Tag, DSIZE, MIN_BLOCK,
    WSIZE,
};
use classes::{SizeClass, DIRECTORY_BYTES};

/// Extend the heap by at least this many bytes at a time.
const CHUNK: u32 = 4096;

/// A segregated-fit heap over a host memory region.
///
/// The heap owns the region and hands out payload offsets: 8-aligned
/// 32-bit byte offsets from the region base that stay valid for the
/// block's lifetime. Offset 0 falls inside the free-list directory and
/// never names a payload, so it doubles as the null address accepted by
/// [`reallocate`](Heap::reallocate).
///
/// All operations take `&mut self`; the heap is single-threaded by
/// contract and performs no internal locking.
pub struct Heap<M: Memory> {
    /// The host region.
    mem: M,

    /// Base offset of the ten free-list head slots.
    directory: u32,

    /// Payload offset of the prologue sentinel block.
    prologue: u32,
}

impl<M: Memory> Heap<M> {
    /// Initialize a heap over the given host memory.
    ///
    /// Grows the region three times: the free-list directory (cleared to
    /// all-null heads), the alignment pad plus the prologue and epilogue
    /// sentinels, and one initial 4096-byte free chunk. Fails iff any
    /// growth fails, leaving no partial heap behind.
    pub fn new(mut mem: M) -> Result<Self, AllocError> {
        let directory = mem.extend(DIRECTORY_BYTES)?;
        let mut heap = Heap {
            mem,
            directory,
            prologue: 0,
        };
        for class in SizeClass::all() {
            heap.write_head(class, Link::Null);
        }

        let start = heap.mem.extend(2 * DSIZE)?;
        heap.mem.write_word(start, 0); // alignment pad
        heap.put_tag(start + WSIZE, Tag::new(DSIZE, true)); // prologue header
        heap.put_tag(start + 2 * WSIZE, Tag::new(DSIZE, true)); // prologue footer
        heap.put_tag(start + 3 * WSIZE, Tag::new(0, true)); // epilogue header
        heap.prologue = start + 2 * WSIZE;

        heap.extend_words(CHUNK / WSIZE)?;
        Ok(heap)
    }

    /// Get a shared reference to the host memory.
    #[inline]
    pub fn memory(&self) -> &M {
        &self.mem
    }

    /// Get an exclusive reference to the host memory.
    ///
    /// Callers own the payload interiors the heap hands out and reach
    /// them through here. Writing outside a live payload corrupts the
    /// heap's bookkeeping.
    #[inline]
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Returns the 8-aligned payload offset of the new block. The request
    /// is rounded up to cover the two boundary tags and keep alignment,
    /// with a floor at the 16-byte minimum block size. Zero-sized
    /// requests are not backed by a block and report `AllocError`, as
    /// does exhaustion of the host region.
    pub fn allocate(&mut self, size: u32) -> Result<u32, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }
        let asize = adjusted_size(size)?;

        if let Some(bp) = self.find_fit(asize) {
            self.place(bp, asize);
            return Ok(bp);
        }

        let bp = self.extend_words(asize.max(CHUNK) / WSIZE)?;
        self.place(bp, asize);
        Ok(bp)
    }

    /// Free the block at payload offset `payload`.
    ///
    /// Offsets that are null, out of range, misaligned, not currently
    /// allocated, or whose boundary tags disagree are silently ignored.
    /// The tag comparison is a cheap corruption heuristic against
    /// double-free and stray writes, not a security feature.
    pub fn free(&mut self, payload: u32) {
        if !self.is_valid_payload(payload) {
            return;
        }
        let size = self.block_size(payload);
        self.put_tag(header(payload), Tag::new(size, false));
        self.put_tag(footer(payload, size), Tag::new(size, false));
        self.coalesce(payload);
    }

    /// Resize the block at `payload` to at least `size` bytes.
    ///
    /// A null (zero) `payload` behaves as [`allocate`](Heap::allocate).
    /// A zero `size` frees the block and reports `AllocError` in place of
    /// the departed payload. An offset that fails the same validation as
    /// [`free`](Heap::free) is redirected to a fresh allocation, with no
    /// attempt to preserve whatever it pointed at.
    ///
    /// When the block is already large enough the shrink happens in
    /// place: the address is unchanged and any split-off tail is merged
    /// with a free physical successor. Otherwise the payload moves: the
    /// old contents are copied in full, the old block is freed, and the
    /// new offset is returned. If the move fails for want of memory the
    /// old block is left untouched.
    pub fn reallocate(&mut self, payload: u32, size: u32) -> Result<u32, AllocError> {
        if payload == 0 {
            return self.allocate(size);
        }
        if size == 0 {
            self.free(payload);
            return Err(AllocError);
        }
        if !self.is_valid_payload(payload) {
            return self.allocate(size);
        }

        let asize = adjusted_size(size)?;
        let old_size = self.block_size(payload);
        if asize <= old_size {
            self.place(payload, asize);
            return Ok(payload);
        }

        let new = self.allocate(size)?;
        // The entire old payload, trailing slack included.
        for i in 0..(old_size - DSIZE) / WSIZE {
            let word = self.mem.read_word(payload + i * WSIZE);
            self.mem.write_word(new + i * WSIZE, word);
        }
        self.free(payload);
        Ok(new)
    }

    /// One past the highest byte currently in the region; the epilogue
    /// header occupies the word just below it.
    #[inline]
    fn frontier(&self) -> u32 {
        self.mem.hi() + 1
    }

    #[inline]
    fn tag_at(&self, at: u32) -> Tag {
        Tag::from_raw(self.mem.read_word(at))
    }

    #[inline]
    fn put_tag(&mut self, at: u32, tag: Tag) {
        self.mem.write_word(at, tag.into_raw());
    }

    /// Total size of the block whose payload starts at `payload`.
    #[inline]
    fn block_size(&self, payload: u32) -> u32 {
        self.tag_at(header(payload)).size()
    }

    #[inline]
    fn head(&self, class: SizeClass) -> Link {
        Link::from_raw(self.mem.read_word(self.directory + class.slot()))
    }

    /// Head updates always write through to the directory slot in the
    /// region, never to a local copy.
    #[inline]
    fn write_head(&mut self, class: SizeClass, link: Link) {
        self.mem.write_word(self.directory + class.slot(), link.into_raw());
    }

    #[inline]
    fn prev_of(&self, payload: u32) -> Link {
        Link::from_raw(self.mem.read_word(prev_link(payload)))
    }

    #[inline]
    fn next_of(&self, payload: u32) -> Link {
        Link::from_raw(self.mem.read_word(next_link(payload)))
    }

    #[inline]
    fn set_prev(&mut self, payload: u32, link: Link) {
        self.mem.write_word(prev_link(payload), link.into_raw());
    }

    #[inline]
    fn set_next(&mut self, payload: u32, link: Link) {
        self.mem.write_word(next_link(payload), link.into_raw());
    }

    /// LIFO-insert a free block at the head of its class's list.
    ///
    /// The class is derived from the block's current size, never cached.
    fn insert(&mut self, payload: u32) {
        let class = SizeClass::from_size(self.block_size(payload));
        let head = self.head(class);
        self.set_prev(payload, Link::Null);
        self.set_next(payload, head);
        if let Link::Ptr(old_head) = head {
            self.set_prev(old_head, Link::Ptr(payload));
        }
        self.write_head(class, Link::Ptr(payload));
    }

    /// Unlink a free block from its class's list.
    fn unlink(&mut self, payload: u32) {
        let class = SizeClass::from_size(self.block_size(payload));
        let prev = self.prev_of(payload);
        let next = self.next_of(payload);
        match prev {
            Link::Ptr(prev) => self.set_next(prev, next),
            Link::Null => self.write_head(class, next),
        }
        if let Link::Ptr(next) = next {
            self.set_prev(next, prev);
        }
    }

    /// Grow the heap by `words` words (rounded up to an even count to
    /// preserve 8-byte alignment), forming a free block at the frontier.
    ///
    /// The old epilogue header becomes the new block's header and a fresh
    /// epilogue is written one word past the new footer. Returns the
    /// payload offset of the block after coalescing with the old tail.
    fn extend_words(&mut self, words: u32) -> Result<u32, AllocError> {
        let words = if words % 2 == 1 {
            words.checked_add(1).ok_or(AllocError)?
        } else {
            words
        };
        let size = words.checked_mul(WSIZE).ok_or(AllocError)?;

        let bp = self.mem.extend(size)?;
        self.put_tag(header(bp), Tag::new(size, false));
        self.put_tag(footer(bp, size), Tag::new(size, false));
        self.put_tag(header(next_payload(bp, size)), Tag::new(0, true));

        Ok(self.coalesce(bp))
    }

    /// Merge the free block at `payload` with any free physical
    /// neighbors and thread the result into its class's list.
    ///
    /// The block's tags already read `(size, 0)` but it is not yet in any
    /// list. Free neighbors are unlinked *before* the tags are rewritten
    /// (their class lookup must see their old sizes) and the merged block
    /// is inserted *after* (its class lookup must see the final size).
    /// Returns the payload offset of the merged block.
    fn coalesce(&mut self, payload: u32) -> u32 {
        let mut size = self.block_size(payload);
        let prev_allocated = self.tag_at(prev_footer(payload)).is_allocated();
        let next = next_payload(payload, size);
        let next_allocated = self.tag_at(header(next)).is_allocated();

        match (prev_allocated, next_allocated) {
            (true, true) => {
                self.insert(payload);
                payload
            }

            (true, false) => {
                self.unlink(next);
                size += self.block_size(next);
                self.put_tag(header(payload), Tag::new(size, false));
                self.put_tag(footer(payload, size), Tag::new(size, false));
                self.insert(payload);
                payload
            }

            (false, true) => {
                let prev = payload - self.tag_at(prev_footer(payload)).size();
                self.unlink(prev);
                size += self.block_size(prev);
                self.put_tag(header(prev), Tag::new(size, false));
                self.put_tag(footer(prev, size), Tag::new(size, false));
                self.insert(prev);
                prev
            }

            (false, false) => {
                let prev = payload - self.tag_at(prev_footer(payload)).size();
                self.unlink(prev);
                self.unlink(next);
                size += self.block_size(prev) + self.block_size(next);
                self.put_tag(header(prev), Tag::new(size, false));
                self.put_tag(footer(prev, size), Tag::new(size, false));
                self.insert(prev);
                prev
            }
        }
    }

    /// Mark the block at `payload` allocated with `asize` of its bytes,
    /// splitting off the remainder when it can stand as a block of its
    /// own.
    ///
    /// The victim is unlinked only when it is currently free; the
    /// in-place shrink path of [`reallocate`](Heap::reallocate) places
    /// into a block that is allocated and in no list. A remainder of at
    /// least the minimum block size is written up as a free block and
    /// routed through the coalescer, which merges it with a free
    /// physical successor on the shrink path and degenerates to a plain
    /// insert on the allocation path. A smaller remainder stays inside
    /// the block as slack.
    fn place(&mut self, payload: u32, asize: u32) {
        if !self.tag_at(header(payload)).is_allocated() {
            self.unlink(payload);
        }
        let size = self.block_size(payload);
        let remainder = size - asize;
        if remainder >= MIN_BLOCK {
            self.put_tag(header(payload), Tag::new(asize, true));
            self.put_tag(footer(payload, asize), Tag::new(asize, true));
            let tail = next_payload(payload, asize);
            self.put_tag(header(tail), Tag::new(remainder, false));
            self.put_tag(footer(tail, remainder), Tag::new(remainder, false));
            self.coalesce(tail);
        } else {
            self.put_tag(header(payload), Tag::new(size, true));
            self.put_tag(footer(payload, size), Tag::new(size, true));
        }
    }

    /// First-fit search for a free block of at least `asize` bytes.
    ///
    /// Starts at the class matching `asize` and walks each chain in
    /// insertion order, escalating through larger classes until the
    /// directory is exhausted.
    fn find_fit(&self, asize: u32) -> Option<u32> {
        let mut class = SizeClass::from_size(asize);
        loop {
            let mut link = self.head(class);
            while let Link::Ptr(payload) = link {
                let tag = self.tag_at(header(payload));
                if !tag.is_allocated() && tag.size() >= asize {
                    return Some(payload);
                }
                link = self.next_of(payload);
            }
            class = class.larger()?;
        }
    }

    /// Defensive validation for [`free`](Heap::free) and
    /// [`reallocate`](Heap::reallocate): `payload` names a plausible live
    /// block iff it is non-null, 8-aligned, in range, marked allocated
    /// with a sane size, and its header and footer agree.
    fn is_valid_payload(&self, payload: u32) -> bool {
        if payload == 0 || payload % DSIZE != 0 {
            return false;
        }
        // Inside the host region. The directory words at the low end can
        // never hold a payload, and skipping them keeps the header read
        // below in bounds whatever the region base is.
        if payload < self.mem.lo() + DIRECTORY_BYTES || payload > self.mem.hi() {
            return false;
        }

        let head = self.tag_at(header(payload));
        if !head.is_allocated() || head.size() < MIN_BLOCK {
            return false;
        }
        // A garbage size would send the footer read out of the region.
        let end = match payload.checked_add(head.size()) {
            Some(end) => end,
            None => return false,
        };
        if end > self.frontier() {
            return false;
        }

        head == self.tag_at(footer(payload, head.size()))
    }
}

/// Round a request up to a legal block size: one 8-byte tag pair plus the
/// payload, rounded to a multiple of 8, with a floor at the minimum block
/// size.
fn adjusted_size(size: u32) -> Result<u32, AllocError> {
    if size <= DSIZE {
        return Ok(MIN_BLOCK);
    }
    let padded = size.checked_add(DSIZE + (DSIZE - 1)).ok_or(AllocError)?;
    Ok(padded & !(DSIZE - 1))
}
