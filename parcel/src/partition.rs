// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::ops::Range;
use std::ptr::{self, NonNull};

use parcel_host::{
    align_down, align_up, MemoryPermission, PrivateAllocation,
    PrivateMemoryAllocator, PrivateRange, Reservation,
};
use parking_lot::{Mutex, RwLock};

use crate::bridge::BridgeState;
use crate::config::PartitionConfig;
use crate::mapping::MappingKind;
use crate::tracker::ProtectionTracker;
use crate::tree::IntervalTree;
use crate::{Error, GUEST_PAGE_SIZE};

/// The fixed address range of a partition, and the host page size it is
/// mapped with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub address: u64,
    pub size: u64,
    pub host_page_size: u64,
}

impl Geometry {
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    /// Offset of `va` into the reservation.
    pub fn offset(&self, va: u64) -> usize {
        (va - self.address) as usize
    }

    pub fn last_host_page(&self) -> u64 {
        self.end() - self.host_page_size
    }

    pub fn last_guest_page(&self) -> u64 {
        self.end() - GUEST_PAGE_SIZE
    }

    /// Offset of the bridge region in the reservation. The first host page of
    /// the region holds a view of the partition's own trailing host page, the
    /// second one a view of the next partition's leading host page.
    pub fn bridge_offset(&self) -> usize {
        self.size as usize
    }

    pub fn reservation_len(&self) -> usize {
        (self.size + 2 * self.host_page_size) as usize
    }
}

/// Everything guarded by the partition lock.
#[derive(Debug)]
pub(crate) struct State {
    pub geometry: Geometry,
    pub mappings: IntervalTree<MappingKind>,
    pub privates: IntervalTree<Option<PrivateAllocation>>,
    pub allocator: PrivateMemoryAllocator,
    pub reservation: Reservation,
    pub first_page_pa: Option<u64>,
    pub last_page_pa: Option<u64>,
    pub bridge: BridgeState,
}

/// A contiguous partition of a guest address space.
///
/// Ranges of the partition are mapped and unmapped using [`map`] and
/// [`unmap`]. Mapping a range lazily creates private host memory backing it,
/// allocated at the granularity of host pages. Pointers to the backing memory
/// are obtained with [`get_pointer`].
///
/// When the host page size is larger than the guest page size, the trailing
/// host page of a partition and the leading host page of the next one may
/// need to be accessed as if they were contiguous. This is achieved by
/// [bridging] the two.
///
/// All operations take `&self`, and may be called concurrently from multiple
/// threads. Structural changes take a write lock on the partition, lookups a
/// read lock.
///
/// [`map`]: Partition::map
/// [`unmap`]: Partition::unmap
/// [`get_pointer`]: Partition::get_pointer
/// [bridging]: Partition::insert_bridge_at_end
#[derive(Debug)]
pub struct Partition {
    geometry: Geometry,
    state: RwLock<State>,
    tracker: Mutex<ProtectionTracker>,
}

impl Partition {
    /// Create a new, fully unmapped, partition covering
    /// `[address, address + size)` using the default configuration.
    pub fn new(address: u64, size: u64) -> Result<Self, Error> {
        Self::with_config(address, size, PartitionConfig::default())
    }

    /// Create a new, fully unmapped, partition covering
    /// `[address, address + size)`.
    ///
    /// # Panics
    /// Panics if the range is empty, or not aligned to the host page size.
    pub fn with_config(
        address: u64,
        size: u64,
        config: PartitionConfig,
    ) -> Result<Self, Error> {
        let host_page_size = config.host_page_size();
        assert!(size > 0, "Partitions must not be empty");
        assert!(
            address % host_page_size == 0 && size % host_page_size == 0,
            "Partition {address:#x}+{size:#x} must be aligned to the host page size {host_page_size:#x}"
        );

        let geometry = Geometry {
            address,
            size,
            host_page_size,
        };

        let reservation = Reservation::new(geometry.reservation_len())?;
        let allocator = match config.private_memory_limit() {
            Some(limit) => {
                PrivateMemoryAllocator::with_limit(config.block_size(), limit)
            }
            None => PrivateMemoryAllocator::new(config.block_size()),
        };

        let range = address..geometry.end();
        let state = State {
            geometry,
            mappings: IntervalTree::new(range.clone(), MappingKind::Unmapped),
            privates: IntervalTree::new(range, None),
            allocator,
            reservation,
            first_page_pa: None,
            last_page_pa: None,
            bridge: BridgeState::default(),
        };

        tracing::debug!(
            "created partition {address:#x}+{size:#x} with host page size {host_page_size:#x}"
        );

        Ok(Self {
            geometry,
            state: RwLock::new(state),
            tracker: Mutex::new(ProtectionTracker::default()),
        })
    }

    /// First guest address of the partition.
    pub fn address(&self) -> u64 {
        self.geometry.address
    }

    pub fn size(&self) -> u64 {
        self.geometry.size
    }

    /// One past the last guest address of the partition.
    pub fn end(&self) -> u64 {
        self.geometry.end()
    }

    pub fn host_page_size(&self) -> u64 {
        self.geometry.host_page_size
    }

    /// Returns `true` if nothing in the partition is mapped.
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Map `size` bytes at guest address `va` to guest physical address `pa`.
    ///
    /// Host memory is allocated for any part of the range not already backed.
    /// The operation is applied range by range, in address order: if an
    /// allocation fails, the ranges processed before the failure stay mapped,
    /// while the rest of the request is left untouched.
    ///
    /// # Panics
    /// Panics if the range is not contained in the partition.
    pub fn map(&self, va: u64, pa: u64, size: u64) -> Result<(), Error> {
        self.assert_contains(va, size);
        if size == 0 {
            return Ok(());
        }

        tracing::trace!("map {va:#x}+{size:#x} to {pa:#x}");

        let mut tracker = self.tracker.lock();
        let mut state = self.state.write();

        let result = state.update(va, pa, size, MappingKind::Private);

        let applied = applied_size(va, size, &result);
        if applied > 0 {
            tracker.update_mappings(va, pa, applied);
            tracker.sync_host_pages(&mut state, va, applied)?;
        }

        result.map_err(|(_, err)| err)
    }

    /// Unmap `size` bytes at guest address `va`.
    ///
    /// Host memory backing the range is released, except for host pages still
    /// partially used by adjacent mappings.
    ///
    /// # Panics
    /// Panics if the range is not contained in the partition.
    pub fn unmap(&self, va: u64, size: u64) -> Result<(), Error> {
        self.assert_contains(va, size);
        if size == 0 {
            return Ok(());
        }

        tracing::trace!("unmap {va:#x}+{size:#x}");

        let mut tracker = self.tracker.lock();
        let mut state = self.state.write();

        let result = state.update(va, 0, size, MappingKind::Unmapped);

        let applied = applied_size(va, size, &result);
        if applied > 0 {
            tracker.remove(va, applied);
            // Host pages kept for their remaining guest pages may now need
            // less permissive protection.
            tracker.sync_host_pages(&mut state, va, applied)?;
        }

        result.map_err(|(_, err)| err)
    }

    /// Change the protection of the guest pages in `[va, va + size)`.
    ///
    /// Host pages shared between guest pages with different protections get
    /// the union of the permissions. `update_pt` is called for every mapped
    /// range whose protection changed, with the guest address, the host
    /// pointer and the size of the range.
    ///
    /// # Panics
    /// Panics if the range is not contained in the partition.
    pub fn reprotect<F>(
        &self,
        va: u64,
        size: u64,
        permission: MemoryPermission,
        mut update_pt: F,
    ) -> Result<(), Error>
    where
        F: FnMut(u64, NonNull<u8>, u64),
    {
        self.assert_contains(va, size);
        if size == 0 {
            return Ok(());
        }

        let start = align_down(va, GUEST_PAGE_SIZE);
        let end = align_up(va + size, GUEST_PAGE_SIZE);

        let mut tracker = self.tracker.lock();

        let mapped = tracker.protect(start, end, permission);
        if mapped.is_empty() {
            return Ok(());
        }

        let updates: Vec<_> = {
            let mut state = self.state.write();
            tracker.sync_host_pages(&mut state, start, end - start)?;

            mapped
                .into_iter()
                .map(|range| {
                    let size = range.end - range.start;
                    (range.start, state.pointer(range.start, size), size)
                })
                .collect()
        };

        drop(tracker);

        for (va, ptr, size) in updates {
            update_pt(va, ptr, size);
        }

        Ok(())
    }

    /// Change the host protection of a host page aligned range.
    ///
    /// If the range includes the trailing host page, the protection is
    /// remembered and also applied to the bridge, now and whenever it is
    /// inserted again.
    ///
    /// # Panics
    /// Panics if the range is not contained in the partition, or not aligned
    /// to the host page size.
    pub fn reprotect_aligned(
        &self,
        va: u64,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), Error> {
        self.assert_contains(va, size);
        let host_page_size = self.geometry.host_page_size;
        assert!(
            va % host_page_size == 0 && size % host_page_size == 0,
            "Range {va:#x}+{size:#x} must be aligned to the host page size {host_page_size:#x}"
        );
        if size == 0 {
            return Ok(());
        }

        self.state.write().reprotect_aligned(va, size, permission)
    }

    /// Host pointer to the memory backing `[va, va + size)`.
    ///
    /// The pointer is only valid to dereference over ranges that are mapped,
    /// and stays valid until the range is unmapped or the bridge state of the
    /// trailing host page changes. While the partition is bridged, memory past
    /// the end of the partition is accessible through pointers into the
    /// trailing host page.
    ///
    /// # Panics
    /// Panics if the range is not contained in the partition.
    pub fn get_pointer(&self, va: u64, size: u64) -> NonNull<u8> {
        self.assert_contains(va, size);
        self.state.read().pointer(va, size)
    }

    /// Returns `true` if every byte of `[va, va + size)` is backed by private
    /// host memory.
    pub fn has_private_allocation(&self, va: u64, size: u64) -> bool {
        self.assert_contains(va, size);
        self.state.read().has_private_allocation(va, size)
    }

    /// The private memory backing `va`, clipped to at most `size` bytes and to
    /// the allocation `va` falls in.
    pub fn private_range(&self, va: u64, size: u64) -> Option<PrivateRange> {
        self.assert_contains(va, size);
        self.state.read().private_range(va, size)
    }

    /// Bridge the trailing host page of this partition with the leading host
    /// page of `after`, the partition immediately following this one.
    ///
    /// If both the last guest page of this partition and the first guest page
    /// of `after` are mapped, pointers into the trailing host page resolve to
    /// a region where the leading host page of `after` directly follows.
    /// Otherwise, the bridge is removed. `update_pt` is called with the guest
    /// address, the new host pointer and the size of the trailing host page
    /// whenever the pointer changes.
    ///
    /// Calling this again with no changes to either page is a no-op. `after`
    /// is only ever read-locked.
    ///
    /// # Panics
    /// Panics if `after` is not adjacent to this partition, or has a different
    /// host page size.
    pub fn insert_bridge_at_end<F>(
        &self,
        after: Option<&Partition>,
        mut update_pt: F,
    ) -> Result<(), Error>
    where
        F: FnMut(u64, NonNull<u8>, u64),
    {
        let first_page = after.and_then(|after| {
            assert!(
                !ptr::eq(after, self),
                "Can't bridge a partition to itself"
            );
            assert_eq!(
                after.address(),
                self.end(),
                "Bridged partitions must be adjacent"
            );
            assert_eq!(
                after.host_page_size(),
                self.host_page_size(),
                "Bridged partitions must use the same host page size"
            );
            after.state.read().first_page()
        });

        let update = self.state.write().insert_bridge(first_page)?;
        if let Some((va, ptr, size)) = update {
            update_pt(va, ptr, size);
        }

        Ok(())
    }

    /// Revert the trailing host page to be backed only by this partition's
    /// memory, and forget the cached identities of the bridged pages.
    /// `update_pt` is always called with the resulting pointer.
    pub fn remove_bridge_from_end<F>(
        &self,
        mut update_pt: F,
    ) -> Result<(), Error>
    where
        F: FnMut(u64, NonNull<u8>, u64),
    {
        let (va, ptr, size) = self.state.write().remove_bridge()?;
        update_pt(va, ptr, size);
        Ok(())
    }

    /// Returns `true` if the trailing host page is currently bridged.
    pub fn is_bridged(&self) -> bool {
        self.state.read().bridge.is_active()
    }

    /// Snapshot of the classification of the whole partition, in address
    /// order.
    pub fn mappings(&self) -> Vec<(Range<u64>, MappingKind)> {
        let state = self.state.read();
        state
            .mappings
            .iter()
            .map(|(range, kind)| (range, *kind))
            .collect()
    }

    /// Snapshot of the private backing of the whole partition, in address
    /// order, with `true` marking ranges backed by host memory.
    pub fn backing(&self) -> Vec<(Range<u64>, bool)> {
        let state = self.state.read();
        state
            .privates
            .iter()
            .map(|(range, allocation)| (range, allocation.is_some()))
            .collect()
    }

    /// Host permission of the memory [`get_pointer`] resolves `va` to.
    ///
    /// [`get_pointer`]: Partition::get_pointer
    pub fn host_permission(&self, va: u64) -> Option<MemoryPermission> {
        self.assert_contains(va, 1);
        self.state.read().host_permission(va)
    }

    /// Permission last set on the guest page containing `va`, if mapped.
    pub fn guest_permission(&self, va: u64) -> Option<MemoryPermission> {
        self.tracker.lock().permission(va)
    }

    /// Guest physical address `va` is mapped to, if mapped.
    pub fn physical_address(&self, va: u64) -> Option<u64> {
        self.tracker.lock().physical_address(va)
    }

    /// Number of bytes of private host memory currently in use.
    pub fn allocated_bytes(&self) -> usize {
        self.state.read().allocator.allocated_bytes()
    }

    /// Release the private memory pool, the protection tracker and the host
    /// address space reserved for the partition.
    pub fn dispose(self) {
        tracing::debug!(
            "disposing partition {:#x}+{:#x}",
            self.geometry.address,
            self.geometry.size
        );
    }

    fn assert_contains(&self, va: u64, size: u64) {
        assert!(
            va >= self.address()
                && va.checked_add(size).map_or(false, |end| end <= self.end()),
            "Range {va:#x}+{size:#x} out of partition {:#x}..{:#x}",
            self.address(),
            self.end()
        );
    }
}

fn applied_size(va: u64, size: u64, result: &Result<(), (u64, Error)>) -> u64 {
    match result {
        Ok(()) => size,
        Err((applied_end, _)) => applied_end - va,
    }
}
