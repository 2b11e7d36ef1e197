//! The heap consistency checker.
//!
//! A full invariant scan over the block sequence and every free list,
//! meant to run after every operation in tests. It is not on any hot
//! path and favors completeness over speed: free-list membership is
//! verified by walking the owning chain, which makes the scan quadratic
//! in the number of free blocks.

use core::fmt;

use super::block::{footer, header, next_payload, Link, Tag, DSIZE, MIN_BLOCK, WSIZE};
use super::classes::SizeClass;
use crate::{Heap, Memory};

/// A violated heap invariant, reported by [`Heap::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckError {
    /// Byte offset of the offending block or word.
    pub at: u32,
    /// What went wrong.
    pub what: &'static str,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap inconsistency at offset {}: {}", self.at, self.what)
    }
}

macro_rules! ensure {
    ( $cond:expr , $at:expr , $what:expr ) => {
        if !$cond {
            return Err(CheckError {
                at: $at,
                what: $what,
            });
        }
    };
}

impl<M: Memory> Heap<M> {
    /// Scan the whole heap and verify every invariant.
    ///
    /// Checks, in order: the sentinels, then every block from prologue to
    /// epilogue (tag agreement, legal sizes, no two adjacent free blocks,
    /// free-list membership in exactly the block's size class, and that
    /// the block sizes tile the region up to the frontier), then every
    /// free-list chain (free nodes only, correct class, consistent
    /// back-links, no cycles), and finally that the chains collectively
    /// hold exactly the free blocks the block walk saw.
    pub fn check(&self) -> Result<(), CheckError> {
        let frontier = self.frontier();

        let prologue = Tag::new(DSIZE, true);
        ensure!(
            self.tag_at(header(self.prologue)) == prologue
                && self.tag_at(footer(self.prologue, DSIZE)) == prologue,
            self.prologue,
            "prologue sentinel clobbered"
        );

        // Walk the block sequence.
        let start_of_blocks = self.prologue + WSIZE;
        let mut bp = next_payload(self.prologue, DSIZE);
        let mut prev_free = false;
        let mut free_blocks: u32 = 0;
        let mut total: u32 = 0;

        loop {
            ensure!(bp <= frontier, bp, "block overruns the frontier");
            let head = self.tag_at(header(bp));

            if head.size() == 0 {
                ensure!(head.is_allocated(), bp, "epilogue not marked allocated");
                ensure!(
                    header(bp) + WSIZE == frontier,
                    bp,
                    "epilogue not at the frontier"
                );
                break;
            }

            let size = head.size();
            ensure!(size >= MIN_BLOCK, bp, "block below the minimum size");
            ensure!(
                next_payload(bp, size) <= frontier,
                bp,
                "block extends past the frontier"
            );
            ensure!(
                head == self.tag_at(footer(bp, size)),
                bp,
                "header and footer disagree"
            );

            if !head.is_allocated() {
                ensure!(!prev_free, bp, "two adjacent free blocks");
                ensure!(
                    self.chain_contains(SizeClass::from_size(size), bp),
                    bp,
                    "free block missing from its class's list"
                );
                free_blocks += 1;
            }

            prev_free = !head.is_allocated();
            total += size;
            bp = next_payload(bp, size);
        }

        // The blocks must tile everything between the prologue footer and
        // the epilogue header exactly.
        ensure!(
            total == (frontier - WSIZE) - start_of_blocks,
            start_of_blocks,
            "block sizes do not tile the region"
        );

        // Walk every free-list chain.
        let mut chained: u32 = 0;
        for class in SizeClass::all() {
            let mut link = self.head(class);
            let mut prev = Link::Null;
            let mut steps: u32 = 0;

            while let Link::Ptr(node) = link {
                let tag = self.tag_at(header(node));
                ensure!(!tag.is_allocated(), node, "allocated block in a free list");
                ensure!(
                    SizeClass::from_size(tag.size()) == class,
                    node,
                    "free block chained into the wrong class"
                );
                ensure!(
                    self.prev_of(node) == prev,
                    node,
                    "back-link does not match the chain"
                );

                steps += 1;
                ensure!(steps <= free_blocks, node, "free list contains a cycle");

                prev = link;
                link = self.next_of(node);
                chained += 1;
            }
        }
        ensure!(
            chained == free_blocks,
            self.directory,
            "free-list population does not match the heap"
        );

        Ok(())
    }

    /// Whether the chain for `class` contains the block at `payload`.
    fn chain_contains(&self, class: SizeClass, payload: u32) -> bool {
        let mut link = self.head(class);
        let mut steps: u32 = 0;
        while let Link::Ptr(node) = link {
            if node == payload {
                return true;
            }
            // Give up rather than loop forever on a corrupt chain; the
            // full chain walk reports the cycle itself.
            steps += 1;
            if steps > self.frontier() / MIN_BLOCK {
                return false;
            }
            link = self.next_of(node);
        }
        false
    }
}
