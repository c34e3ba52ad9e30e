//! Block allocator over the single memory region the host hands the server.
//!
//! The region is split into `BLOCK_SIZE` byte blocks. One state byte per
//! block lives at the front of the region and usable memory starts right
//! after it. Allocations are first-fit contiguous runs: a `Head` block
//! followed by zero or more `Tail` blocks. There is no compaction, so a
//! fragmented arena can refuse a request it has the total bytes for.

use std::error::Error;
use std::fmt;

pub const BLOCK_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    AllocatedHead = 1,
    AllocatedTail = 2,
}
impl BlockState {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::AllocatedHead,
            2 => Self::AllocatedTail,
            _ => Self::Free,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// The region cannot hold a single block plus its bookkeeping byte.
    RegionTooSmall { size: usize },
    /// Zero-byte requests are refused.
    ZeroSized,
    /// `count * size_of::<T>()` overflowed.
    SizeOverflow,
    /// No run of free blocks is long enough.
    OutOfBlocks { requested: usize, free: usize },
    /// The address is misaligned, out of range or not the head of a live allocation.
    InvalidAddress { offset: usize },
}
impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegionTooSmall { size } => {
                write!(f, "memory region of {size} bytes holds no block")
            }
            Self::ZeroSized => write!(f, "zero-sized allocation"),
            Self::SizeOverflow => write!(f, "allocation size overflows usize"),
            Self::OutOfBlocks { requested, free } => write!(
                f,
                "out of contiguous blocks: requested {requested} bytes, {free} bytes free in total"
            ),
            Self::InvalidAddress { offset } => {
                write!(f, "offset {offset} is not a live allocation")
            }
        }
    }
}
impl Error for ArenaError {}

/// A live allocation. `offset` is relative to the start of usable memory
/// and is always a multiple of `BLOCK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    offset: usize,
    len: usize,
}
impl Allocation {
    pub fn offset(&self) -> usize {
        self.offset
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn blocks(&self) -> usize {
        blocks_for(self.len)
    }
}

fn blocks_for(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE)
}

pub struct Arena {
    region: Box<[u8]>,
    block_count: usize,
}
impl Arena {
    pub fn new(region: Box<[u8]>) -> Result<Self, ArenaError> {
        let block_count = region.len() / (BLOCK_SIZE + 1);
        if block_count == 0 {
            return Err(ArenaError::RegionTooSmall { size: region.len() });
        }
        let mut arena = Self { region, block_count };
        arena.reset();
        Ok(arena)
    }
    /// Region sized for exactly `blocks` blocks and their bookkeeping.
    pub fn with_blocks(blocks: usize) -> Result<Self, ArenaError> {
        Self::new(vec![0; blocks * (BLOCK_SIZE + 1)].into_boxed_slice())
    }
    pub fn block_count(&self) -> usize {
        self.block_count
    }
    pub fn capacity(&self) -> usize {
        self.block_count * BLOCK_SIZE
    }
    pub fn free_blocks(&self) -> usize {
        self.states().iter().filter(|&&b| b == BlockState::Free as u8).count()
    }
    pub fn block_state(&self, block: usize) -> Option<BlockState> {
        self.states().get(block).map(|&b| BlockState::from_byte(b))
    }
    /// Releases every allocation and zeroes the whole region.
    pub fn reset(&mut self) {
        self.region.fill(0);
    }

    pub fn allocate(&mut self, size: usize) -> Result<Allocation, ArenaError> {
        if size == 0 {
            return Err(ArenaError::ZeroSized);
        }
        let required = blocks_for(size);
        let Some(first) = self.find_free_run(required) else {
            let free = self.free_blocks() * BLOCK_SIZE;
            log::warn!("arena allocation failed: requested {size} bytes, {free} bytes free");
            return Err(ArenaError::OutOfBlocks { requested: size, free });
        };
        let states = &mut self.region[..self.block_count];
        states[first] = BlockState::AllocatedHead as u8;
        states[first + 1..first + required].fill(BlockState::AllocatedTail as u8);

        let start = self.block_count + first * BLOCK_SIZE;
        self.region[start..start + required * BLOCK_SIZE].fill(0);
        log::trace!("allocated {size} bytes at block {first} ({required} blocks)");
        Ok(Allocation { offset: first * BLOCK_SIZE, len: size })
    }

    /// Zeroed room for `count` values of `T`.
    pub fn allocate_zeroed<T>(&mut self, count: usize) -> Result<Allocation, ArenaError> {
        let size = core::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(ArenaError::SizeOverflow)?;
        self.allocate(size)
    }

    /// Frees the allocation whose head block starts at `offset`, along with
    /// the run of tail blocks directly after it. Returns the number of
    /// blocks released.
    pub fn free(&mut self, offset: usize) -> Result<usize, ArenaError> {
        let block = offset / BLOCK_SIZE;
        if offset % BLOCK_SIZE != 0
            || block >= self.block_count
            || self.block_state(block) != Some(BlockState::AllocatedHead)
        {
            log::error!("failed to free memory: offset {offset} is not a live allocation");
            return Err(ArenaError::InvalidAddress { offset });
        }
        let states = &mut self.region[..self.block_count];
        states[block] = BlockState::Free as u8;
        let mut released = 1;
        for state in &mut states[block + 1..] {
            if *state != BlockState::AllocatedTail as u8 {
                break;
            }
            *state = BlockState::Free as u8;
            released += 1;
        }
        Ok(released)
    }

    pub fn bytes(&self, allocation: &Allocation) -> &[u8] {
        let start = self.block_count + allocation.offset;
        &self.region[start..start + allocation.len]
    }
    pub fn bytes_mut(&mut self, allocation: &Allocation) -> &mut [u8] {
        let start = self.block_count + allocation.offset;
        &mut self.region[start..start + allocation.len]
    }

    /// Reads `source` while writing `dest`. Fails if they are the same
    /// allocation or overlap.
    pub fn split(
        &mut self,
        source: &Allocation,
        dest: &Allocation,
    ) -> Result<(&[u8], &mut [u8]), ArenaError> {
        let usable = &mut self.region[self.block_count..];
        if source.offset + source.len <= dest.offset {
            let (lo, hi) = usable.split_at_mut(dest.offset);
            let lo: &[u8] = lo;
            Ok((&lo[source.offset..source.offset + source.len], &mut hi[..dest.len]))
        } else if dest.offset + dest.len <= source.offset {
            let (lo, hi) = usable.split_at_mut(source.offset);
            let hi: &[u8] = hi;
            Ok((&hi[..source.len], &mut lo[dest.offset..dest.offset + dest.len]))
        } else {
            Err(ArenaError::InvalidAddress { offset: source.offset })
        }
    }

    fn states(&self) -> &[u8] {
        &self.region[..self.block_count]
    }
    fn find_free_run(&self, required: usize) -> Option<usize> {
        let states = self.states();
        let mut start = 0;
        while start + required <= states.len() {
            match states[start..start + required]
                .iter()
                .rposition(|&b| b != BlockState::Free as u8)
            {
                None => return Some(start),
                Some(taken) => start += taken + 1,
            }
        }
        None
    }
}
impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("block_count", &self.block_count)
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exhausted_arena_recovers_after_free() {
        let mut arena = Arena::with_blocks(10).unwrap();
        let big = arena.allocate(300).unwrap();
        assert_eq!(big.blocks(), 10);
        assert_eq!(
            arena.allocate(1),
            Err(ArenaError::OutOfBlocks { requested: 1, free: 0 })
        );
        assert_eq!(arena.free(big.offset()), Ok(10));
        let small = arena.allocate(32).unwrap();
        assert_eq!(small.offset(), big.offset());
        assert_eq!(small.blocks(), 1);
    }

    #[test]
    fn exact_block_multiple_takes_no_extra_block() {
        let mut arena = Arena::with_blocks(4).unwrap();
        assert_eq!(arena.allocate(32).unwrap().blocks(), 1);
        assert_eq!(arena.allocate(33).unwrap().blocks(), 2);
        assert_eq!(arena.free_blocks(), 1);
    }

    #[test]
    fn zero_sized_and_tiny_regions_are_refused() {
        assert_eq!(
            Arena::new(vec![0; BLOCK_SIZE].into_boxed_slice()).unwrap_err(),
            ArenaError::RegionTooSmall { size: BLOCK_SIZE }
        );
        let mut arena = Arena::with_blocks(1).unwrap();
        assert_eq!(arena.allocate(0), Err(ArenaError::ZeroSized));
        assert_eq!(arena.allocate_zeroed::<()>(4), Err(ArenaError::ZeroSized));
        assert_eq!(arena.allocate_zeroed::<u64>(usize::MAX), Err(ArenaError::SizeOverflow));
    }

    #[test]
    fn bookkeeping_sits_in_front_of_usable_memory() {
        let arena = Arena::new(vec![0; 1000].into_boxed_slice()).unwrap();
        assert_eq!(arena.block_count(), 1000 / 33);
        assert_eq!(arena.capacity(), (1000 / 33) * BLOCK_SIZE);
    }

    #[test]
    fn free_rejects_non_head_offsets_without_mutation() {
        let mut arena = Arena::with_blocks(4).unwrap();
        let a = arena.allocate(70).unwrap();
        assert_eq!(arena.free(a.offset() + 1), Err(ArenaError::InvalidAddress { offset: 1 }));
        assert_eq!(arena.free(BLOCK_SIZE), Err(ArenaError::InvalidAddress { offset: BLOCK_SIZE }));
        let inside = BLOCK_SIZE * 3;
        assert_eq!(arena.free(inside), Err(ArenaError::InvalidAddress { offset: inside }));
        let outside = BLOCK_SIZE * 40;
        assert_eq!(arena.free(outside), Err(ArenaError::InvalidAddress { offset: outside }));
        assert_eq!(arena.free_blocks(), 1);
        assert_eq!(arena.free(a.offset()), Ok(3));
        assert_eq!(arena.free(a.offset()), Err(ArenaError::InvalidAddress { offset: 0 }));
    }

    #[test]
    fn free_stops_at_the_next_head() {
        let mut arena = Arena::with_blocks(6).unwrap();
        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();
        arena.free(a.offset()).unwrap();
        assert_eq!(arena.block_state(2), Some(BlockState::AllocatedHead));
        assert_eq!(arena.block_state(3), Some(BlockState::AllocatedTail));
        assert_eq!(arena.free_blocks(), 4);
        arena.free(b.offset()).unwrap();
        assert_eq!(arena.free_blocks(), 6);
    }

    #[test]
    fn first_fit_skips_fragmented_holes() {
        let mut arena = Arena::with_blocks(5).unwrap();
        let a = arena.allocate(32).unwrap();
        let _b = arena.allocate(32).unwrap();
        let c = arena.allocate(32).unwrap();
        arena.free(a.offset()).unwrap();
        arena.free(c.offset()).unwrap();
        // holes at blocks 0 and 2..5; a two-block request lands in the second
        let d = arena.allocate(64).unwrap();
        assert_eq!(d.offset(), 2 * BLOCK_SIZE);
        let e = arena.allocate(16).unwrap();
        assert_eq!(e.offset(), 0);
    }

    #[test]
    fn split_views_two_allocations_at_once() {
        let mut arena = Arena::with_blocks(4).unwrap();
        let a = arena.allocate(40).unwrap();
        let b = arena.allocate(8).unwrap();
        arena.bytes_mut(&a).fill(7);
        let (src, dst) = arena.split(&a, &b).unwrap();
        dst.copy_from_slice(&src[..8]);
        assert_eq!(arena.bytes(&b), &[7; 8]);
        let (src, dst) = arena.split(&b, &a).unwrap();
        assert_eq!((src.len(), dst.len()), (8, 40));
        assert!(arena.split(&a, &a).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Free(usize),
    }
    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..200).prop_map(Op::Alloc),
            (0usize..16).prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn live_allocations_are_aligned_disjoint_and_zeroed(
            ops in prop::collection::vec(op(), 1..64),
        ) {
            let mut arena = Arena::with_blocks(64).unwrap();
            let mut live: Vec<Allocation> = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        if let Ok(a) = arena.allocate(size) {
                            prop_assert_eq!(a.offset() % BLOCK_SIZE, 0);
                            prop_assert!(arena.bytes(&a).iter().all(|&b| b == 0));
                            for other in &live {
                                let a_end = a.offset() + a.blocks() * BLOCK_SIZE;
                                let other_end = other.offset() + other.blocks() * BLOCK_SIZE;
                                let disjoint = a_end <= other.offset()
                                    || other_end <= a.offset();
                                prop_assert!(disjoint);
                            }
                            arena.bytes_mut(&a).fill(0xAB);
                            live.push(a);
                        } else {
                            let used: usize = live.iter().map(Allocation::blocks).sum();
                            prop_assert_eq!(arena.free_blocks(), 64 - used);
                        }
                    }
                    Op::Free(i) if !live.is_empty() => {
                        let a = live.swap_remove(i % live.len());
                        prop_assert_eq!(arena.free(a.offset()), Ok(a.blocks()));
                    }
                    Op::Free(_) => {}
                }
            }
            let used: usize = live.iter().map(Allocation::blocks).sum();
            prop_assert_eq!(arena.free_blocks(), 64 - used);
        }
    }
}
