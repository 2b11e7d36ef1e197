use super::*;
use crate::GrowableRegion;

/// Offset of the first real block's payload in a fresh heap: 40 bytes of
/// directory, the pad word, and the prologue pair.
const FIRST: u32 = 56;

fn new_heap() -> Heap<GrowableRegion> {
    Heap::new(GrowableRegion::unbounded()).unwrap()
}

fn fill(heap: &mut Heap<GrowableRegion>, payload: u32, len: usize, byte: u8) {
    let at = payload as usize;
    heap.memory_mut().bytes_mut()[at..at + len].fill(byte);
}

#[test]
fn init_lays_out_sentinels_and_one_free_chunk() {
    let heap = new_heap();

    assert_eq!(heap.tag_at(header(heap.prologue)), Tag::new(DSIZE, true));
    assert_eq!(
        heap.tag_at(footer(heap.prologue, DSIZE)),
        Tag::new(DSIZE, true)
    );

    let tag = heap.tag_at(header(FIRST));
    assert!(!tag.is_allocated());
    assert_eq!(tag.size(), CHUNK);
    assert_eq!(heap.head(SizeClass::from_size(CHUNK)), Link::Ptr(FIRST));

    assert_eq!(heap.frontier(), FIRST + CHUNK);
    heap.check().unwrap();
}

#[test]
fn single_allocation_rounds_up_and_splits_the_chunk() {
    let mut heap = new_heap();

    let p = heap.allocate(24).unwrap();

    assert_eq!(p, FIRST);
    assert_eq!(p % DSIZE, 0);
    assert_eq!(heap.block_size(p), 32);
    assert!(heap.tag_at(header(p)).is_allocated());

    // Exactly one free block remains: the split remainder.
    let tail = next_payload(p, 32);
    let tag = heap.tag_at(header(tail));
    assert!(!tag.is_allocated());
    assert_eq!(tag.size(), CHUNK - 32);

    heap.check().unwrap();
}

#[test]
fn requests_clamp_to_the_minimum_block() {
    let mut heap = new_heap();

    let p = heap.allocate(1).unwrap();
    assert_eq!(heap.block_size(p), 16);

    let q = heap.allocate(8).unwrap();
    assert_eq!(heap.block_size(q), 16);

    let r = heap.allocate(9).unwrap();
    assert_eq!(heap.block_size(r), 24);

    heap.check().unwrap();
}

#[test]
fn payloads_are_always_8_aligned() {
    let mut heap = new_heap();

    for size in [1, 2, 3, 7, 8, 9, 24, 100, 555, 4097] {
        let p = heap.allocate(size).unwrap();
        assert_eq!(p % DSIZE, 0, "allocate({size}) returned {p}");
        heap.check().unwrap();
    }
}

#[test]
fn zero_size_allocate_yields_no_block() {
    let mut heap = new_heap();

    assert_eq!(heap.allocate(0), Err(AllocError));
    heap.check().unwrap();
}

#[test]
fn free_null_is_a_noop() {
    let mut heap = new_heap();

    heap.free(0);
    heap.check().unwrap();
}

#[test]
fn allocate_then_free_restores_a_single_free_chunk() {
    let mut heap = new_heap();

    let p = heap.allocate(100).unwrap();
    heap.free(p);

    let tag = heap.tag_at(header(FIRST));
    assert!(!tag.is_allocated());
    assert_eq!(tag.size(), CHUNK);
    heap.check().unwrap();
}

#[test]
fn freeing_forward_coalesces_into_one_block() {
    let mut heap = new_heap();

    let p1 = heap.allocate(24).unwrap();
    let p2 = heap.allocate(24).unwrap();
    let p3 = heap.allocate(24).unwrap();
    assert_eq!([p1, p2, p3], [FIRST, FIRST + 32, FIRST + 64]);

    heap.free(p2);
    heap.check().unwrap();

    // Freeing p3 merges it with p2 on the left and the free tail on the
    // right, leaving a single free block from p2 to the frontier.
    heap.free(p3);

    let tag = heap.tag_at(header(p2));
    assert!(!tag.is_allocated());
    assert_eq!(tag.size(), heap.frontier() - WSIZE - header(p2));
    heap.check().unwrap();
}

#[test]
fn freeing_the_middle_block_coalesces_both_ways() {
    let mut heap = new_heap();

    let p1 = heap.allocate(24).unwrap();
    let p2 = heap.allocate(24).unwrap();
    let p3 = heap.allocate(24).unwrap();
    let p4 = heap.allocate(24).unwrap();

    heap.free(p1);
    heap.free(p3);
    heap.check().unwrap();

    heap.free(p2);

    let tag = heap.tag_at(header(p1));
    assert!(!tag.is_allocated());
    assert_eq!(tag.size(), 96);
    assert!(heap.tag_at(header(p4)).is_allocated());
    heap.check().unwrap();
}

#[test]
fn lifo_lists_hand_back_the_most_recently_freed_block() {
    let mut heap = new_heap();

    let p1 = heap.allocate(24).unwrap();
    let _s1 = heap.allocate(24).unwrap();
    let p2 = heap.allocate(24).unwrap();
    let _s2 = heap.allocate(24).unwrap();

    heap.free(p1);
    heap.free(p2);
    assert_eq!(heap.head(SizeClass::from_size(32)), Link::Ptr(p2));

    assert_eq!(heap.allocate(24).unwrap(), p2);
    heap.check().unwrap();
}

#[test]
fn a_remainder_of_exactly_the_minimum_block_is_split() {
    let mut heap = new_heap();

    let p = heap.allocate(40).unwrap();
    let _spacer = heap.allocate(24).unwrap();
    heap.free(p);
    assert_eq!(heap.block_size(p), 48);

    let q = heap.allocate(24).unwrap();

    assert_eq!(q, p);
    assert_eq!(heap.block_size(q), 32);
    let tail = heap.tag_at(header(next_payload(q, 32)));
    assert!(!tail.is_allocated());
    assert_eq!(tail.size(), MIN_BLOCK);
    heap.check().unwrap();
}

#[test]
fn a_remainder_below_the_minimum_block_stays_in_the_block() {
    let mut heap = new_heap();

    let p = heap.allocate(32).unwrap();
    let _spacer = heap.allocate(24).unwrap();
    heap.free(p);
    assert_eq!(heap.block_size(p), 40);

    let q = heap.allocate(24).unwrap();

    assert_eq!(q, p);
    assert_eq!(heap.block_size(q), 40);
    assert!(heap.tag_at(header(q)).is_allocated());
    heap.check().unwrap();
}

#[test]
fn reallocate_shrinks_in_place_and_recycles_the_tail() {
    let mut heap = new_heap();

    let p = heap.allocate(128).unwrap();
    assert_eq!(heap.block_size(p), 136);
    fill(&mut heap, p, 24, 0x5A);

    let q = heap.reallocate(p, 32).unwrap();

    assert_eq!(q, p);
    assert_eq!(heap.block_size(p), 40);
    let at = p as usize;
    assert!(heap.memory().bytes()[at..at + 24].iter().all(|b| *b == 0x5A));

    // The split-off tail merged with the free block that followed.
    let tail = heap.tag_at(header(next_payload(p, 40)));
    assert!(!tail.is_allocated());
    assert_eq!(tail.size(), CHUNK - 40);
    heap.check().unwrap();
}

#[test]
fn reallocate_growth_moves_and_copies_the_payload() {
    let mut heap = new_heap();

    let p = heap.allocate(16).unwrap();
    for (i, b) in (0u8..8).enumerate() {
        heap.memory_mut().bytes_mut()[p as usize + i] = b;
    }

    let q = heap.reallocate(p, 200).unwrap();

    assert_ne!(q, p);
    let at = q as usize;
    assert_eq!(&heap.memory().bytes()[at..at + 8], &[0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(!heap.tag_at(header(p)).is_allocated());
    heap.check().unwrap();
}

#[test]
fn reallocate_null_behaves_as_allocate() {
    let mut heap = new_heap();

    let p = heap.reallocate(0, 40).unwrap();

    assert_eq!(p, FIRST);
    assert_eq!(heap.block_size(p), 48);
    heap.check().unwrap();
}

#[test]
fn reallocate_to_zero_frees_the_block() {
    let mut heap = new_heap();

    let p = heap.allocate(24).unwrap();
    assert_eq!(heap.reallocate(p, 0), Err(AllocError));

    let tag = heap.tag_at(header(FIRST));
    assert!(!tag.is_allocated());
    assert_eq!(tag.size(), CHUNK);
    heap.check().unwrap();
}

#[test]
fn reallocate_of_a_bogus_offset_falls_back_to_allocate() {
    let mut heap = new_heap();

    let p = heap.allocate(24).unwrap();

    // An 8-aligned offset inside p's payload; the word there is not a
    // plausible allocated header.
    let q = heap.reallocate(p + 8, 8).unwrap();

    assert_ne!(q, p + 8);
    assert!(heap.tag_at(header(p)).is_allocated());
    heap.check().unwrap();
}

#[test]
fn a_request_beyond_the_free_lists_extends_the_heap() {
    let mut heap = new_heap();
    let frontier_before = heap.frontier();

    let p = heap.allocate(8000).unwrap();

    // The extension merged with the original free chunk, the placement
    // split the merged block, and the heap grew by the full request.
    assert_eq!(p, FIRST);
    assert_eq!(heap.block_size(p), 8008);
    assert_eq!(heap.frontier(), frontier_before + 8008);

    let tail = heap.tag_at(header(next_payload(p, 8008)));
    assert!(!tail.is_allocated());
    assert_eq!(tail.size(), CHUNK);
    heap.check().unwrap();
}

#[test]
fn init_fails_when_the_host_cannot_grow() {
    assert!(Heap::new(GrowableRegion::with_limit(32)).is_err());
    assert!(Heap::new(GrowableRegion::with_limit(100)).is_err());

    // The directory, sentinels, and first chunk fit exactly.
    assert!(Heap::new(GrowableRegion::with_limit(4152)).is_ok());
}

#[test]
fn out_of_memory_leaves_the_heap_consistent() {
    let mut heap = Heap::new(GrowableRegion::with_limit(4152)).unwrap();

    assert_eq!(heap.allocate(5000), Err(AllocError));
    heap.check().unwrap();

    // Requests that fit the surviving free block still succeed.
    let p = heap.allocate(100).unwrap();
    assert_eq!(p, FIRST);
    heap.check().unwrap();
}

#[test]
fn reallocate_growth_failure_keeps_the_old_block() {
    let mut heap = Heap::new(GrowableRegion::with_limit(4152)).unwrap();

    let p = heap.allocate(24).unwrap();
    fill(&mut heap, p, 24, 0x77);

    assert_eq!(heap.reallocate(p, 8000), Err(AllocError));

    assert!(heap.tag_at(header(p)).is_allocated());
    let at = p as usize;
    assert!(heap.memory().bytes()[at..at + 24].iter().all(|b| *b == 0x77));
    heap.check().unwrap();
}

#[test]
fn free_ignores_pointers_that_fail_validation() {
    let mut heap = new_heap();

    let p = heap.allocate(24).unwrap();
    fill(&mut heap, p, 24, 0xAA);

    // Misaligned, mid-payload, out of range: all ignored.
    heap.free(p + 4);
    heap.free(p + 8);
    heap.free(heap.memory().hi() + 1000);

    // A crafted mid-payload word that looks allocated but whose size
    // would run past the frontier is caught by the bounds check.
    heap.memory_mut().write_word(p + 4, 0x7FFF_FFF8 | 1);
    heap.free(p + 8);

    assert!(heap.tag_at(header(p)).is_allocated());
    assert_eq!(heap.block_size(p), 32);
    heap.check().unwrap();
}

#[test]
fn double_free_is_ignored() {
    let mut heap = new_heap();

    let p1 = heap.allocate(24).unwrap();
    let _p2 = heap.allocate(24).unwrap();

    heap.free(p1);
    heap.check().unwrap();

    // The block is already free; the allocation-bit check rejects it.
    heap.free(p1);
    heap.check().unwrap();
}
