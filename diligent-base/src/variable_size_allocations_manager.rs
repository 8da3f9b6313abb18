use std::collections::{BTreeMap, BTreeSet};

use crate::memory::{align_up_pow2_usize, largest_pow2_at_most};

/// A block handed out by `VariableSizeAllocationsManager`. `size` includes the padding needed to
/// align the start of the block, so `unaligned_offset + size` is the end of the reserved range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VariableSizeAllocation {
    pub unaligned_offset: usize,
    pub size: usize,
}

impl VariableSizeAllocation {
    pub const INVALID_OFFSET: usize = usize::MAX;

    pub fn invalid() -> Self {
        VariableSizeAllocation {
            unaligned_offset: Self::INVALID_OFFSET,
            size: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.unaligned_offset != Self::INVALID_OFFSET
    }
}

impl Default for VariableSizeAllocation {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Free-list allocator over an abstract range `[0, max_size)`. Free blocks are indexed both by
/// offset (to merge neighbors on free) and by size (to find the smallest block that fits).
///
/// Not thread-safe, callers serialize access.
#[derive(Debug)]
pub struct VariableSizeAllocationsManager {
    // offset -> size
    free_blocks_by_offset: BTreeMap<usize, usize>,
    // (size, offset)
    free_blocks_by_size: BTreeSet<(usize, usize)>,
    max_size: usize,
    free_size: usize,
    // Every free block offset is a multiple of this
    curr_alignment: usize,
}

impl VariableSizeAllocationsManager {
    pub fn new(max_size: usize) -> Self {
        let mut manager = VariableSizeAllocationsManager {
            free_blocks_by_offset: Default::default(),
            free_blocks_by_size: Default::default(),
            max_size,
            free_size: max_size,
            curr_alignment: 1,
        };

        if max_size > 0 {
            manager.add_new_block(0, max_size);
        }
        manager.reset_curr_alignment();
        manager.debug_verify();
        manager
    }

    /// Reserves `size` units aligned to `alignment` (a power of two). Returns an invalid allocation
    /// if no free block can hold it.
    pub fn allocate(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> VariableSizeAllocation {
        assert!(size > 0, "allocation size must be non-zero");
        assert!(
            alignment.is_power_of_two(),
            "alignment ({}) must be a power of two",
            alignment
        );

        let size = align_up_pow2_usize(size, alignment);
        if self.free_size < size {
            return VariableSizeAllocation::invalid();
        }

        // Free block offsets are only guaranteed to be aligned to curr_alignment, so a stricter
        // alignment may need up to this much padding
        let alignment_reserve = if alignment > self.curr_alignment {
            alignment - self.curr_alignment
        } else {
            0
        };

        let (block_size, offset) = match self
            .free_blocks_by_size
            .range((size + alignment_reserve, 0)..)
            .next()
        {
            Some(&block) => block,
            None => return VariableSizeAllocation::invalid(),
        };

        debug_assert_eq!(offset % self.curr_alignment, 0);
        let aligned_offset = align_up_pow2_usize(offset, alignment);
        let adjusted_size = size + (aligned_offset - offset);
        debug_assert!(adjusted_size <= size + alignment_reserve);

        self.remove_block(offset, block_size);
        let remaining_size = block_size - adjusted_size;
        if remaining_size > 0 {
            self.add_new_block(offset + adjusted_size, remaining_size);
        }

        self.free_size -= adjusted_size;

        if (size & (self.curr_alignment - 1)) != 0 {
            if size.is_power_of_two() {
                debug_assert!(size >= alignment && size < self.curr_alignment);
                self.curr_alignment = size;
            } else {
                self.curr_alignment = self.curr_alignment.min(alignment);
            }
        }

        self.debug_verify();

        VariableSizeAllocation {
            unaligned_offset: offset,
            size: adjusted_size,
        }
    }

    /// Returns `[offset, offset + size)` to the free list, merging it with adjacent free blocks
    pub fn free(
        &mut self,
        offset: usize,
        size: usize,
    ) {
        assert!(
            offset + size <= self.max_size,
            "freed range [{}, {}) is outside of the managed range",
            offset,
            offset + size
        );

        let next_block = self
            .free_blocks_by_offset
            .range(offset..)
            .next()
            .map(|(&o, &s)| (o, s));
        if let Some((next_offset, _)) = next_block {
            assert!(
                offset + size <= next_offset,
                "freed range overlaps a free block"
            );
        }

        let prev_block = self
            .free_blocks_by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = prev_block {
            assert!(
                offset >= prev_offset + prev_size,
                "freed range overlaps a free block"
            );
        }

        let mut new_offset = offset;
        let mut new_size = size;

        if let Some((prev_offset, prev_size)) = prev_block {
            if prev_offset + prev_size == offset {
                self.remove_block(prev_offset, prev_size);
                new_offset = prev_offset;
                new_size += prev_size;
            }
        }

        if let Some((next_offset, next_size)) = next_block {
            if offset + size == next_offset {
                self.remove_block(next_offset, next_size);
                new_size += next_size;
            }
        }

        self.add_new_block(new_offset, new_size);
        self.free_size += size;

        if self.is_empty() {
            debug_assert_eq!(self.num_free_blocks(), 1);
            self.reset_curr_alignment();
        }

        self.debug_verify();
    }

    pub fn free_allocation(
        &mut self,
        allocation: VariableSizeAllocation,
    ) {
        self.free(allocation.unaligned_offset, allocation.size);
    }

    /// Grows the managed range by `extra_size`. A free block touching the old end is extended in
    /// place.
    pub fn extend(
        &mut self,
        extra_size: usize,
    ) {
        let mut new_block_offset = self.max_size;
        let mut new_block_size = extra_size;

        let last_block = self
            .free_blocks_by_offset
            .iter()
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((last_offset, last_size)) = last_block {
            if last_offset + last_size == self.max_size {
                self.remove_block(last_offset, last_size);
                new_block_offset = last_offset;
                new_block_size += last_size;
            }
        }

        self.add_new_block(new_block_offset, new_block_size);
        self.max_size += extra_size;
        self.free_size += extra_size;

        self.debug_verify();
    }

    pub fn is_full(&self) -> bool {
        self.free_size == 0
    }

    pub fn is_empty(&self) -> bool {
        self.free_size == self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn free_size(&self) -> usize {
        self.free_size
    }

    pub fn used_size(&self) -> usize {
        self.max_size - self.free_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks_by_offset.len()
    }

    /// Free blocks as (offset, size) pairs in offset order
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks_by_offset.iter().map(|(&o, &s)| (o, s))
    }

    fn add_new_block(
        &mut self,
        offset: usize,
        size: usize,
    ) {
        let inserted = self.free_blocks_by_offset.insert(offset, size).is_none();
        debug_assert!(inserted, "free block at offset {} already exists", offset);
        self.free_blocks_by_size.insert((size, offset));
    }

    fn remove_block(
        &mut self,
        offset: usize,
        size: usize,
    ) {
        self.free_blocks_by_offset.remove(&offset);
        let removed = self.free_blocks_by_size.remove(&(size, offset));
        debug_assert!(removed);
    }

    fn reset_curr_alignment(&mut self) {
        self.curr_alignment = largest_pow2_at_most(self.max_size).max(1);
    }

    #[cfg(debug_assertions)]
    fn debug_verify(&self) {
        assert_eq!(
            self.free_blocks_by_offset.len(),
            self.free_blocks_by_size.len()
        );

        let mut total_free_size = 0;
        let mut prev_end: Option<usize> = None;
        for (&offset, &size) in &self.free_blocks_by_offset {
            assert!(size > 0);
            assert!(offset + size <= self.max_size);
            assert!(self.free_blocks_by_size.contains(&(size, offset)));
            // Adjacent free blocks must have been merged
            if let Some(prev_end) = prev_end {
                assert!(offset > prev_end);
            }
            prev_end = Some(offset + size);
            total_free_size += size;
        }

        assert_eq!(total_free_size, self.free_size);
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn debug_verify(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(manager: &VariableSizeAllocationsManager) -> Vec<(usize, usize)> {
        manager.free_blocks().collect()
    }

    #[test]
    fn test_allocate_and_coalesce() {
        let mut manager = VariableSizeAllocationsManager::new(128);
        assert!(manager.is_empty());

        let a = manager.allocate(16, 1);
        let b = manager.allocate(16, 1);
        let c = manager.allocate(32, 1);
        assert_eq!(a.unaligned_offset, 0);
        assert_eq!(b.unaligned_offset, 16);
        assert_eq!(c.unaligned_offset, 32);
        assert_eq!(manager.used_size(), 64);
        assert_eq!(snapshot(&manager), vec![(64, 64)]);

        manager.free_allocation(a);
        manager.free_allocation(c);
        assert_eq!(snapshot(&manager), vec![(0, 16), (32, 96)]);

        // Freeing the middle block merges with both neighbors
        manager.free_allocation(b);
        assert_eq!(snapshot(&manager), vec![(0, 128)]);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_best_fit() {
        let mut manager = VariableSizeAllocationsManager::new(100);
        let a = manager.allocate(10, 1);
        let _b = manager.allocate(10, 1);
        let c = manager.allocate(30, 1);
        let _d = manager.allocate(10, 1);
        manager.free_allocation(a);
        manager.free_allocation(c);

        // The 10-unit hole at offset 0 is the smallest that fits
        let e = manager.allocate(8, 1);
        assert_eq!(e.unaligned_offset, 0);
        let f = manager.allocate(25, 1);
        assert_eq!(f.unaligned_offset, 20);
    }

    #[test]
    fn test_exhaustion() {
        let mut manager = VariableSizeAllocationsManager::new(32);
        let a = manager.allocate(32, 1);
        assert!(a.is_valid());
        assert!(manager.is_full());
        assert!(!manager.allocate(1, 1).is_valid());

        manager.free_allocation(a);
        let b = manager.allocate(20, 1);
        let _c = manager.allocate(4, 1);
        manager.free_allocation(b);
        // 28 units are free but the largest block is 20
        assert_eq!(manager.free_size(), 28);
        assert!(!manager.allocate(24, 1).is_valid());
    }

    #[test]
    fn test_alignment() {
        let mut manager = VariableSizeAllocationsManager::new(1024);
        let a = manager.allocate(3, 1);
        assert_eq!(a, VariableSizeAllocation { unaligned_offset: 0, size: 3 });

        let b = manager.allocate(16, 16);
        assert_eq!(b.unaligned_offset, 3);
        assert_eq!(b.size, 29);
        assert_eq!(align_up_pow2_usize(b.unaligned_offset, 16), 16);

        manager.free_allocation(a);
        manager.free_allocation(b);
        assert!(manager.is_empty());
        assert_eq!(snapshot(&manager), vec![(0, 1024)]);
    }

    #[test]
    fn test_extend() {
        let mut manager = VariableSizeAllocationsManager::new(64);
        let a = manager.allocate(32, 1);
        manager.extend(64);
        assert_eq!(manager.max_size(), 128);
        assert_eq!(snapshot(&manager), vec![(32, 96)]);

        let b = manager.allocate(96, 1);
        assert!(manager.is_full());
        // No free block at the end, the extension is a new block
        manager.extend(16);
        assert_eq!(snapshot(&manager), vec![(128, 16)]);

        manager.free_allocation(a);
        manager.free_allocation(b);
        assert_eq!(snapshot(&manager), vec![(0, 144)]);
    }

    #[test]
    #[should_panic(expected = "overlaps a free block")]
    fn test_double_free_panics() {
        let mut manager = VariableSizeAllocationsManager::new(64);
        let a = manager.allocate(8, 1);
        manager.free_allocation(a);
        manager.free_allocation(a);
    }

    // Interleaved allocations and frees always bring the free list back to where it started
    #[test]
    fn test_round_trip() {
        let mut manager = VariableSizeAllocationsManager::new(4096);
        let mut seed = 0x2545_f491_u32;
        let mut next_random = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        let warmup = manager.allocate(100, 1);
        let initial = snapshot(&manager);

        for _ in 0..50 {
            let mut live = Vec::new();
            for _ in 0..20 {
                let size = (next_random() % 64 + 1) as usize;
                let alignment = 1 << (next_random() % 4);
                let allocation = manager.allocate(size, alignment);
                if allocation.is_valid() {
                    live.push(allocation);
                }
                if next_random() % 3 == 0 && !live.is_empty() {
                    let index = next_random() as usize % live.len();
                    manager.free_allocation(live.swap_remove(index));
                }
            }

            while let Some(allocation) = live.pop() {
                manager.free_allocation(allocation);
            }
            assert_eq!(snapshot(&manager), initial);
        }

        manager.free_allocation(warmup);
        assert!(manager.is_empty());
    }
}
