// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::io;
use std::sync::Arc;

use rangemap::RangeSet;

use crate::{align_down, align_up, page_size, MemoryBlock};

/// A range of host memory handed out by a [`PrivateMemoryAllocator`].
///
/// An allocation is owned: it must be returned to the allocator it came from
/// using [`PrivateMemoryAllocator::free`]. It can be [`split`] into two
/// allocations covering the same memory, which are then freed independently.
///
/// [`split`]: PrivateAllocation::split
#[derive(Debug)]
pub struct PrivateAllocation {
    memory: Arc<MemoryBlock>,
    block_index: usize,
    offset: usize,
    size: usize,
}

impl PrivateAllocation {
    /// The block the allocation lives in.
    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryBlock> {
        &self.memory
    }

    /// Offset of the allocation inside its block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the allocation in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Split the allocation into two, with the first one being `left_size`
    /// bytes long.
    ///
    /// # Panics
    /// Panics if `left_size` is zero or not smaller than the allocation.
    #[must_use]
    pub fn split(self, left_size: usize) -> (Self, Self) {
        assert!(
            left_size > 0 && left_size < self.size,
            "Split point {left_size:#x} outside of allocation of size {:#x}",
            self.size
        );

        let right = Self {
            memory: self.memory.clone(),
            block_index: self.block_index,
            offset: self.offset + left_size,
            size: self.size - left_size,
        };
        let left = Self {
            size: left_size,
            ..self
        };

        (left, right)
    }

    /// A non-owning description of `size` bytes of the allocation, starting
    /// `offset` bytes into it.
    ///
    /// # Panics
    /// Panics if the range is outside of the allocation.
    #[must_use]
    pub fn range(&self, offset: usize, size: usize) -> PrivateRange {
        assert!(
            offset + size <= self.size,
            "Range {offset:#x}+{size:#x} outside of allocation of size {:#x}",
            self.size
        );

        PrivateRange {
            memory: self.memory.clone(),
            offset: self.offset + offset,
            size,
        }
    }
}

/// A non-owning view of part of a [`PrivateAllocation`].
#[derive(Debug, Clone)]
pub struct PrivateRange {
    /// Block the range lives in.
    pub memory: Arc<MemoryBlock>,
    /// Offset of the range inside the block.
    pub offset: usize,
    /// Size of the range in bytes.
    pub size: usize,
}

#[derive(Debug)]
struct PooledBlock {
    memory: Arc<MemoryBlock>,
    free: RangeSet<usize>,
}

impl PooledBlock {
    fn new(size: usize) -> io::Result<Self> {
        let memory = Arc::new(MemoryBlock::new(size)?);

        let mut free = RangeSet::new();
        free.insert(0..size);

        Ok(Self { memory, free })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn find_free(&self, size: usize, alignment: usize) -> Option<usize> {
        self.free.iter().find_map(|range| {
            let start = align_up(range.start as u64, alignment as u64) as usize;
            (start + size <= range.end).then_some(start)
        })
    }
}

/// Pools host memory in [`MemoryBlock`]s and hands out [`PrivateAllocation`]s
/// from them.
///
/// Blocks are created on demand, each at least `block_size` bytes large, and
/// are kept until the allocator is dropped. An optional limit caps the total
/// amount of memory pooled; once reached, allocations that don't fit in the
/// existing blocks fail with [`io::ErrorKind::OutOfMemory`].
///
/// Freed ranges are decommitted, so memory handed out again reads as zeroes.
#[derive(Debug)]
pub struct PrivateMemoryAllocator {
    block_size: usize,
    limit: Option<usize>,
    blocks: Vec<PooledBlock>,
}

impl PrivateMemoryAllocator {
    /// Create a new allocator creating blocks of at least `block_size` bytes.
    ///
    /// # Panics
    /// Panics if `block_size` is not a non-zero multiple of the system page
    /// size.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        assert!(
            block_size > 0 && block_size % page_size() == 0,
            "Block size {block_size:#x} must be a multiple of the system page size"
        );

        Self {
            block_size,
            limit: None,
            blocks: Vec::new(),
        }
    }

    /// Create a new allocator that pools at most `limit` bytes.
    #[must_use]
    pub fn with_limit(block_size: usize, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(block_size)
        }
    }

    /// Allocate `size` bytes, aligned to `alignment` inside their block.
    ///
    /// # Errors
    /// If there is no space in the existing blocks and the pool is at its
    /// limit, an error of kind [`io::ErrorKind::OutOfMemory`] is returned.
    /// Failure to create a new block is also reported.
    ///
    /// # Panics
    /// Panics if `size` is zero, or `alignment` is not a power of two.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> io::Result<PrivateAllocation> {
        assert!(size > 0, "Allocations must not be empty");
        assert!(
            alignment.is_power_of_two(),
            "Alignment {alignment:#x} must be a power of two"
        );

        let found = self.blocks.iter().enumerate().find_map(|(index, block)| {
            block.find_free(size, alignment).map(|offset| (index, offset))
        });

        let (block_index, offset) = match found {
            Some(found) => found,
            None => {
                let page_size = page_size() as u64;
                let needed = align_up(size as u64, page_size) as usize;
                let mut block_size = needed.max(self.block_size);

                // Near the limit the last block is shrunk to what is left.
                if let Some(limit) = self.limit {
                    let pooled = self.pooled_bytes();
                    let available = limit.saturating_sub(pooled);
                    if needed > available {
                        return Err(io::Error::new(
                            io::ErrorKind::OutOfMemory,
                            format!("Allocating {size:#x} bytes would exceed the pool limit of {limit:#x} bytes ({pooled:#x} pooled)"),
                        ));
                    }
                    block_size = block_size.min(
                        align_down(available as u64, page_size) as usize,
                    );
                }

                self.blocks.push(PooledBlock::new(block_size)?);
                (self.blocks.len() - 1, 0)
            }
        };

        let block = &mut self.blocks[block_index];
        block.free.remove(offset..offset + size);

        Ok(PrivateAllocation {
            memory: block.memory.clone(),
            block_index,
            offset,
            size,
        })
    }

    /// Return an allocation to the pool.
    ///
    /// The memory is decommitted on a best-effort basis: if the host refuses,
    /// the range is still returned to the pool.
    ///
    /// # Panics
    /// Panics if the allocation did not come from this allocator.
    pub fn free(&mut self, allocation: PrivateAllocation) {
        let block = self
            .blocks
            .get_mut(allocation.block_index)
            .filter(|block| Arc::ptr_eq(&block.memory, &allocation.memory))
            .expect("Allocation should belong to this allocator");

        let range = allocation.offset..allocation.offset + allocation.size;
        assert!(
            !block.free.overlaps(&range),
            "Allocation range {range:?} is already free"
        );

        let _ = block.memory.decommit(allocation.offset, allocation.size);
        block.free.insert(range);
    }

    /// Total number of bytes held in pooled blocks.
    #[must_use]
    pub fn pooled_bytes(&self) -> usize {
        self.blocks.iter().map(|block| block.memory.size()).sum()
    }

    /// Number of bytes currently handed out.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        let free: usize = self
            .blocks
            .iter()
            .flat_map(|block| block.free.iter())
            .map(|range| range.end - range.start)
            .sum();
        self.pooled_bytes() - free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::prelude::*;

    #[test]
    fn reuses_freed_memory() {
        let page = page_size();
        let mut allocator = PrivateMemoryAllocator::new(4 * page);

        let a = allocator.allocate(page, page).expect("Allocation succeeds");
        let b = allocator.allocate(page, page).expect("Allocation succeeds");
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), page);
        assert_eq!(allocator.allocated_bytes(), 2 * page);

        allocator.free(a);
        let c = allocator.allocate(page, page).expect("Allocation succeeds");
        assert_eq!(c.offset(), 0, "Freed range should be handed out again");
        assert_eq!(allocator.pooled_bytes(), 4 * page);

        allocator.free(b);
        allocator.free(c);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn large_allocations_get_their_own_block() {
        let page = page_size();
        let mut allocator = PrivateMemoryAllocator::new(2 * page);

        let big = allocator
            .allocate(5 * page, page)
            .expect("Allocation succeeds");
        assert_eq!(big.size(), 5 * page);
        assert_eq!(allocator.pooled_bytes(), 5 * page);

        allocator.free(big);
    }

    #[test]
    fn split_allocations_free_independently() {
        let page = page_size();
        let mut allocator = PrivateMemoryAllocator::new(4 * page);

        let allocation = allocator
            .allocate(3 * page, page)
            .expect("Allocation succeeds");
        let (left, right) = allocation.split(page);

        assert_eq!(left.offset(), 0);
        assert_eq!(left.size(), page);
        assert_eq!(right.offset(), page);
        assert_eq!(right.size(), 2 * page);

        allocator.free(right);
        assert_eq!(allocator.allocated_bytes(), page);
        allocator.free(left);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn respects_alignment() {
        let page = page_size();
        let mut allocator = PrivateMemoryAllocator::new(16 * page);

        let small =
            allocator.allocate(page, page).expect("Allocation succeeds");
        let aligned = allocator
            .allocate(4 * page, 4 * page)
            .expect("Allocation succeeds");
        assert_eq!(aligned.offset() % (4 * page), 0);

        allocator.free(small);
        allocator.free(aligned);
    }

    #[test]
    fn limit_is_enforced() {
        let page = page_size();
        let mut allocator =
            PrivateMemoryAllocator::with_limit(2 * page, 2 * page);

        let a = allocator
            .allocate(2 * page, page)
            .expect("Allocation within the limit succeeds");
        let err = allocator
            .allocate(page, page)
            .expect_err("Allocation past the limit fails");
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);

        allocator.free(a);
        let b = allocator
            .allocate(page, page)
            .expect("Freed memory is reusable under the limit");
        allocator.free(b);
    }

    #[test]
    fn freed_memory_is_zeroed() {
        let page = page_size();
        let mut allocator = PrivateMemoryAllocator::new(page);
        let mut reservation =
            crate::Reservation::new(page).expect("Reservation is created");

        let a = allocator.allocate(page, page).expect("Allocation succeeds");
        reservation
            .map_view(a.memory(), a.offset(), 0, page)
            .expect("Mapping succeeds");
        unsafe { reservation.pointer(0, 1).as_ptr().write(7) };
        allocator.free(a);

        let b = allocator.allocate(page, page).expect("Allocation succeeds");
        assert_eq!(unsafe { reservation.pointer(0, 1).as_ptr().read() }, 0);
        allocator.free(b);
    }

    #[test]
    fn random_churn() {
        let page = page_size();
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut allocator = PrivateMemoryAllocator::new(8 * page);
        let mut live = Vec::new();

        for _ in 0..256 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let pages = rng.gen_range(1..=4);
                live.push(
                    allocator
                        .allocate(pages * page, page)
                        .expect("Allocation succeeds"),
                );
            } else {
                let index = rng.gen_range(0..live.len());
                allocator.free(live.swap_remove(index));
            }
        }

        let live_bytes: usize = live.iter().map(PrivateAllocation::size).sum();
        assert_eq!(allocator.allocated_bytes(), live_bytes);

        for allocation in live {
            allocator.free(allocation);
        }
        assert_eq!(allocator.allocated_bytes(), 0);
    }
}
