//! Shared fuzzing and testing infrastructure for `segfit`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use segfit::{GrowableRegion, Heap};
use std::collections::BTreeMap;

/// The largest request the generators produce.
///
/// Mutation can still push sizes past this; the allocation limit in
/// [`Ops::run`] skips anything the heap should not be asked to hold.
const MAX_GENERATED_SIZE: u32 = 4096;

/// A test operation against the heap.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Allocate `size` bytes and bind the payload to `id`, replacing and
    /// freeing any previous binding.
    Alloc { id: u32, size: u32 },
    /// Free the payload bound to `id`; a no-op for unknown ids.
    Free { id: u32 },
    /// Reallocate the payload bound to `id` to `size` bytes.
    Realloc { id: u32, size: u32 },
    /// Free an offset that is misaligned by construction and therefore
    /// can never name a live payload; the heap must ignore it.
    WildFree { offset: u32 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::range(0..=MAX_GENERATED_SIZE).generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::range(0..=MAX_GENERATED_SIZE).generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::WildFree {
                    offset: ctx.rng().gen_u32(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default)]
pub struct Ops {
    ops: Vec<Op>,
}

// `Ops` is serialized as a length-prefixed run of `Op`s, with hand-written
// `Encode`/`Decode` impls rather than derives so the decoder can reject an
// oversized length prefix up front. Every decoded op costs a full heap scan
// plus a live-payload sweep in `Ops::run`, and a derived decoder would also
// happily reserve a `Vec` for whatever length the fuzzer wrote.
const MAX_DECODED_OPS: u64 = 1_000;

impl<C> bincode::Decode<C> for Ops {
    fn decode<D: bincode::de::Decoder<Context = C>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let len = u64::decode(decoder)?;
        if len > MAX_DECODED_OPS {
            return Err(bincode::error::DecodeError::OtherString(format!(
                "refusing to decode {len} heap operations; sequences are capped at \
                 {MAX_DECODED_OPS}"
            )));
        }
        let mut ops = Vec::with_capacity(len as usize);
        for _ in 0..len {
            ops.push(Op::decode(decoder)?);
        }
        Ok(Ops { ops })
    }
}

impl bincode::Encode for Ops {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        (self.ops.len() as u64).encode(encoder)?;
        for op in &self.ops {
            op.encode(encoder)?;
        }
        Ok(())
    }
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Free { id } | Op::Realloc { id, .. } => {
                        *id = new_id;
                    }
                    Op::WildFree { .. } => {}
                }
            }
            Ok(())
        })?;

        // Free an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::range(0..=MAX_GENERATED_SIZE).generate(ctx)?;
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let file = file!();
            let line = line!();
            let msg = format!($msg $( , $args )* );
            let cond = stringify!($cond);
            return Err(format!("{file}:{line}: check failed: `{cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Pop an operation off the end of this sequence. Returns whether an
    /// operation was actually popped or not (i.e. whether this sequence was
    /// non-empty before calling `pop`).
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh heap, keeping total live
    /// bytes under the given limit.
    ///
    /// After every operation the heap's invariant checker must pass and
    /// every live payload must still hold its fill pattern.
    pub fn run(&self, allocation_limit: u32) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut heap = Heap::new(GrowableRegion::unbounded())
            .map_err(|e| format!("failed to initialize the heap: {e:?}"))?;
        let mut live = LiveMap::new(allocation_limit);

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, size } => {
                    if *size == 0 {
                        ensure!(
                            heap.allocate(0).is_err(),
                            "zero-size allocate must not return a block",
                        );
                    } else if !live.beyond_allocation_limit(*size) {
                        if let Ok(payload) = heap.allocate(*size) {
                            new_alloc(&mut heap, &mut live, *id, payload, *size)?;
                        }
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        log::debug!("freeing id{id} -> {alloc:?}");
                        heap.free(alloc.payload);
                    }
                }

                Op::Realloc { id, size } => {
                    if let Some(alloc) = live.remove(*id) {
                        if *size == 0 {
                            ensure!(
                                heap.reallocate(alloc.payload, 0).is_err(),
                                "reallocate to size zero must free and return no block",
                            );
                        } else if live.beyond_allocation_limit(*size) {
                            live.insert(*id, alloc);
                        } else {
                            match heap.reallocate(alloc.payload, *size) {
                                Ok(payload) => {
                                    log::debug!(
                                        "reallocated id{id}: {:#x} -> {payload:#x} ({} -> {} bytes)",
                                        alloc.payload,
                                        alloc.size,
                                        size,
                                    );

                                    let preserved = alloc.size.min(*size);
                                    check_pattern(&heap, payload, preserved, fill_byte(*id))
                                        .map_err(|e| {
                                            format!("id{id}: reallocation lost the preserved prefix: {e}")
                                        })?;
                                    if *size <= alloc.size {
                                        ensure!(
                                            payload == alloc.payload,
                                            "an in-place shrink must not move the block",
                                        );
                                    }

                                    fill(&mut heap, payload, *size, fill_byte(*id));
                                    live.insert(
                                        *id,
                                        LiveAlloc {
                                            payload,
                                            size: *size,
                                        },
                                    );
                                }
                                Err(_) => {
                                    // Growing failed; the old block must
                                    // survive untouched.
                                    live.insert(*id, alloc);
                                }
                            }
                        }
                    }
                }

                Op::WildFree { offset } => {
                    // Forced odd so it can never name an 8-aligned payload.
                    heap.free(*offset | 1);
                }
            }

            heap.check().map_err(|e| e.to_string())?;
            check_live(&heap, &live)?;
        }

        // Finally, free any remaining live allocations.
        for (id, alloc) in live.map {
            log::debug!("freeing id{id} -> {alloc:?}");
            heap.free(alloc.payload);
        }
        heap.check().map_err(|e| e.to_string())?;

        Ok(())
    }
}

/// Process a new allocation, checking properties and inserting it into the
/// live set.
fn new_alloc(
    heap: &mut Heap<GrowableRegion>,
    live: &mut LiveMap,
    id: u32,
    payload: u32,
    size: u32,
) -> Result<(), String> {
    if let Some(old) = live.remove(id) {
        log::debug!("freeing id{id} -> {old:?}");
        heap.free(old.payload);
    }

    log::debug!("new allocation: id{id} -> {{ payload: {payload:#x}, size: {size} }}");

    ensure!(
        payload % 8 == 0,
        "payload offset {payload:#x} is not 8-aligned",
    );
    assert_not_overlapping(live, payload, size)?;
    fill(heap, payload, size, fill_byte(id));

    live.insert(id, LiveAlloc { payload, size });

    Ok(())
}

/// The byte pattern an allocation's payload is filled with. Derived from
/// the id so that overlapping payloads clobber each other detectably, and
/// never zero so that freshly-extended (zeroed) region bytes cannot pass
/// for it by accident.
fn fill_byte(id: u32) -> u8 {
    0x80 | (id as u8 & 0x7F)
}

/// Fill an allocation with the given byte pattern.
fn fill(heap: &mut Heap<GrowableRegion>, payload: u32, size: u32, byte: u8) {
    log::trace!(
        "fill [{payload:#x}..{:#x}) with {byte:#04x}",
        payload + size
    );
    let at = payload as usize;
    heap.memory_mut().bytes_mut()[at..at + size as usize].fill(byte);
}

/// Assert that `size` bytes at `payload` all hold `byte`.
fn check_pattern(
    heap: &Heap<GrowableRegion>,
    payload: u32,
    size: u32,
    byte: u8,
) -> Result<(), String> {
    let at = payload as usize;
    let bytes = &heap.memory().bytes()[at..at + size as usize];
    for (i, b) in bytes.iter().enumerate() {
        ensure!(
            *b == byte,
            "expected {byte:#04x} at offset {:#x}, found {b:#04x}",
            payload + i as u32,
        );
    }
    Ok(())
}

/// Assert that every live allocation still holds its fill pattern.
fn check_live(heap: &Heap<GrowableRegion>, live: &LiveMap) -> Result<(), String> {
    for (id, alloc) in &live.map {
        check_pattern(heap, alloc.payload, alloc.size, fill_byte(*id))
            .map_err(|e| format!("live allocation id{id} was clobbered: {e}"))?;
    }
    Ok(())
}

/// Assert that the given allocation does not overlap any other live
/// allocation.
fn assert_not_overlapping(live: &LiveMap, payload: u32, size: u32) -> Result<(), String> {
    let start = payload;
    let end = payload + size;
    for other in live.map.values() {
        let other_start = other.payload;
        let other_end = other.payload + other.size;
        ensure!(
            end <= other_start || other_end <= start,
            "two distinct live allocations should never overlap",
        );
    }
    Ok(())
}

/// A currently-live allocation.
#[derive(Debug)]
struct LiveAlloc {
    /// Payload offset handed out by the heap.
    payload: u32,
    /// Requested size at allocation time.
    size: u32,
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    ///
    /// Note: this is a sum of the requested allocation sizes, and does not
    /// include tag overhead or rounding slack.
    total_allocated_bytes: u32,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: u32,
}

impl LiveMap {
    fn new(allocation_limit: u32) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: u32) -> bool {
        self.total_allocated_bytes
            .checked_add(size)
            .is_none_or(|n| n > self.allocation_limit)
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.size;
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and free old entries before adding new ones"
        );
    }

    /// Remove a live allocation for freeing.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }
}
