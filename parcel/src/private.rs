// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::sync::Arc;

use parcel_host::{align_down, align_up, PrivateAllocation, PrivateRange};

use crate::partition::State;
use crate::tree::Split;
use crate::Error;

impl Split for Option<PrivateAllocation> {
    fn split_off(&mut self, offset: u64) -> Self {
        let allocation = self.take()?;
        let (left, right) = allocation.split(offset as usize);
        *self = Some(left);
        Some(right)
    }
}

impl State {
    /// Ensure `[va, va + size)` is backed by private memory.
    ///
    /// The range is expanded to host page boundaries, and every run in it not
    /// yet backed gets its own allocation. If an allocation fails, the runs
    /// allocated by this call are released again.
    pub fn map_private(&mut self, va: u64, size: u64) -> Result<(), Error> {
        let host_page_size = self.geometry.host_page_size;

        let start = align_down(va, host_page_size);
        let end = align_up(va + size, host_page_size);

        let mut bound = Vec::new();
        let mut map = self
            .privates
            .covering(start)
            .expect("The partition should be fully tiled");

        loop {
            if self.privates.value(map).is_none() {
                if map < start {
                    map = self.privates.split(map, start);
                }
                if self.privates.end(map) > end {
                    self.privates.split(map, end);
                }

                if let Err(err) = self.bind(map) {
                    self.coalesce_private(map);
                    // Releasing only merges unbound neighbors, so the handles
                    // of the other runs stay valid.
                    for map in bound {
                        if let Err(release_err) = self.release(map) {
                            tracing::warn!(
                                "failed releasing {map:#x} after failed allocation: {release_err}"
                            );
                        }
                    }
                    return Err(err);
                }
                bound.push(map);
            }

            if self.privates.end(map) >= end {
                return Ok(());
            }

            map = self
                .privates
                .successor(map)
                .expect("The partition should be fully tiled");
        }
    }

    /// Release the private memory backing `[va, va + size)`.
    ///
    /// The range is expanded to host page boundaries on the sides where the
    /// neighboring range is unmapped, and shrunk to them otherwise, so host
    /// pages still used by a neighbor are kept.
    pub fn unmap_private(
        &mut self,
        va: u64,
        size: u64,
        unmapped_before: bool,
        unmapped_after: bool,
    ) -> Result<(), Error> {
        let geometry = self.geometry;
        let host_page_size = geometry.host_page_size;

        let start = match unmapped_before {
            true => align_down(va, host_page_size),
            false => align_up(va, host_page_size),
        };
        let end = match unmapped_after {
            true => align_up(va + size, host_page_size),
            false => align_down(va + size, host_page_size),
        };

        if end <= start {
            return Ok(());
        }

        let mut map = self
            .privates
            .covering(start)
            .expect("The partition should be fully tiled");

        loop {
            if self.privates.value(map).is_some() {
                if map < start {
                    map = self.privates.split(map, start);
                }
                if self.privates.end(map) > end {
                    self.privates.split(map, end);
                }

                map = self.release(map)?;
            }

            if self.privates.end(map) >= end {
                break;
            }

            map = self
                .privates
                .successor(map)
                .expect("The partition should be fully tiled");
        }

        // The bridge holds a view of the trailing host page, which must not
        // outlive its allocation.
        if end > geometry.last_host_page() {
            self.release_trailing_page()?;
        }

        Ok(())
    }

    pub fn has_private_allocation(&self, va: u64, size: u64) -> bool {
        let end = va + size;

        let mut addr = va;
        while addr < end {
            let map = match self.privates.covering(addr) {
                Some(map) => map,
                None => return false,
            };
            if self.privates.value(map).is_none() {
                return false;
            }
            addr = self.privates.end(map);
        }

        true
    }

    pub fn private_range(&self, va: u64, size: u64) -> Option<PrivateRange> {
        let map = self.privates.covering(va)?;
        let allocation = self.privates.value(map).as_ref()?;

        let size = size.min(self.privates.end(map) - va);
        Some(allocation.range((va - map) as usize, size as usize))
    }

    /// Private memory backing the whole host page containing `va`.
    pub fn host_page_backing(&self, va: u64) -> Option<PrivateRange> {
        let host_page_size = self.geometry.host_page_size;
        self.private_range(align_down(va, host_page_size), host_page_size)
    }

    /// Allocate memory for the unbound interval at `map`, and map it into the
    /// reservation.
    fn bind(&mut self, map: u64) -> Result<(), Error> {
        let geometry = self.geometry;
        let range = self.privates.range(map);
        let size = range.end - range.start;

        let allocation = self
            .allocator
            .allocate(size as usize, geometry.host_page_size as usize)
            .map_err(|source| Error::AllocationFailed {
                size,
                source: Arc::new(source),
            })?;

        if let Err(err) = self.reservation.map_view(
            allocation.memory(),
            allocation.offset(),
            geometry.offset(range.start),
            size as usize,
        ) {
            self.allocator.free(allocation);
            return Err(err.into());
        }

        *self.privates.value_mut(map) = Some(allocation);

        Ok(())
    }

    /// Unmap and free the allocation of the interval at `map`, returning the
    /// handle of the interval it ends up in after coalescing.
    fn release(&mut self, map: u64) -> Result<u64, Error> {
        let geometry = self.geometry;
        let range = self.privates.range(map);

        let allocation = match self.privates.value_mut(map).take() {
            Some(allocation) => allocation,
            None => return Ok(map),
        };

        if let Err(err) = self.reservation.unmap_view(
            geometry.offset(range.start),
            (range.end - range.start) as usize,
        ) {
            *self.privates.value_mut(map) = Some(allocation);
            return Err(err.into());
        }
        self.allocator.free(allocation);

        Ok(self.coalesce_private(map))
    }

    /// Merge the interval at `map` with its neighbors if none of them are
    /// bound to an allocation.
    fn coalesce_private(&mut self, mut map: u64) -> u64 {
        if self.privates.value(map).is_some() {
            return map;
        }

        if let Some(prev) = self.privates.predecessor(map) {
            if self.privates.value(prev).is_none() {
                self.privates.merge(prev, map);
                map = prev;
            }
        }
        if let Some(next) = self.privates.successor(map) {
            if self.privates.value(next).is_none() {
                self.privates.merge(map, next);
            }
        }

        map
    }
}
