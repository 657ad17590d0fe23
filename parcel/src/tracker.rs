// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::ops::Range;

use parcel_host::{align_down, align_up, MemoryPermission};
use rangemap::RangeMap;

use crate::partition::State;
use crate::Error;

/// Records which guest pages are mapped to which physical addresses, and
/// with which protection.
///
/// The host can only protect whole host pages, so when a host page holds
/// several guest pages it is given the union of their permissions.
#[derive(Debug, Default)]
pub(crate) struct ProtectionTracker {
    // Stores `pa - va`, so that contiguous mappings coalesce.
    mappings: RangeMap<u64, u64>,
    protections: RangeMap<u64, MemoryPermission>,
}

impl ProtectionTracker {
    pub fn update_mappings(&mut self, va: u64, pa: u64, size: u64) {
        let range = va..va + size;
        self.mappings.insert(range.clone(), pa.wrapping_sub(va));
        self.protections.insert(range, MemoryPermission::READ_WRITE);
    }

    pub fn remove(&mut self, va: u64, size: u64) {
        let range = va..va + size;
        self.mappings.remove(range.clone());
        self.protections.remove(range);
    }

    pub fn physical_address(&self, va: u64) -> Option<u64> {
        self.mappings
            .get(&va)
            .map(|offset| va.wrapping_add(*offset))
    }

    pub fn permission(&self, va: u64) -> Option<MemoryPermission> {
        self.protections.get(&va).copied()
    }

    /// Protect the mapped guest pages in `[va, end_va)` with `permission`,
    /// returning the mapped ranges.
    pub fn protect(
        &mut self,
        va: u64,
        end_va: u64,
        permission: MemoryPermission,
    ) -> Vec<Range<u64>> {
        let mapped: Vec<Range<u64>> = self
            .mappings
            .overlapping(&(va..end_va))
            .map(|(range, _)| range.start.max(va)..range.end.min(end_va))
            .collect();

        if !mapped.is_empty() {
            tracing::trace!(
                "reprotect {va:#x}..{end_va:#x} as {permission:?} ({} ranges)",
                mapped.len()
            );
        }

        for range in &mapped {
            self.protections.insert(range.clone(), permission);
        }

        mapped
    }

    /// Give every host page overlapping `[va, va + size)` that still holds
    /// mapped guest pages the union of their permissions.
    pub fn sync_host_pages(
        &self,
        state: &mut State,
        va: u64,
        size: u64,
    ) -> Result<(), Error> {
        let host_page_size = state.geometry.host_page_size;

        let mut page = align_down(va, host_page_size);
        let end = align_up(va + size, host_page_size);
        while page < end {
            if let Some(permission) =
                self.host_page_permission(page..page + host_page_size)
            {
                state.reprotect_aligned(page, host_page_size, permission)?;
            }
            page += host_page_size;
        }

        Ok(())
    }

    /// The union of the permissions of the mapped guest pages in a host page,
    /// or `None` if none are mapped.
    fn host_page_permission(
        &self,
        host_page: Range<u64>,
    ) -> Option<MemoryPermission> {
        self.protections
            .overlapping(&host_page)
            .map(|(_, permission)| *permission)
            .reduce(|a, b| a | b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mappings_coalesce_by_offset() {
        let mut tracker = ProtectionTracker::default();

        tracker.update_mappings(0x1000, 0x10000, 0x1000);
        tracker.update_mappings(0x2000, 0x11000, 0x1000);

        assert_eq!(tracker.mappings.iter().count(), 1);
        assert_eq!(tracker.physical_address(0x2800), Some(0x11800));
        assert_eq!(tracker.physical_address(0x3000), None);

        tracker.remove(0x1000, 0x1000);
        assert_eq!(tracker.physical_address(0x1000), None);
        assert_eq!(tracker.physical_address(0x2000), Some(0x11000));
        assert_eq!(tracker.permission(0x1000), None);
        assert_eq!(
            tracker.permission(0x2000),
            Some(MemoryPermission::READ_WRITE)
        );
    }

    #[test]
    fn protect_only_touches_mapped_pages() {
        let mut tracker = ProtectionTracker::default();

        tracker.update_mappings(0x1000, 0x0, 0x1000);
        tracker.update_mappings(0x3000, 0x0, 0x2000);

        let mapped = tracker.protect(0x0, 0x4000, MemoryPermission::READ);

        assert_eq!(mapped, vec![0x1000..0x2000, 0x3000..0x4000]);
        assert_eq!(tracker.permission(0x1000), Some(MemoryPermission::READ));
        assert_eq!(tracker.permission(0x2000), None);
        assert_eq!(
            tracker.permission(0x4000),
            Some(MemoryPermission::READ_WRITE)
        );
    }

    #[test]
    fn host_page_takes_union_of_guest_pages() {
        let mut tracker = ProtectionTracker::default();

        tracker.update_mappings(0x0, 0x0, 0x4000);
        tracker.protections.insert(0x0..0x1000, MemoryPermission::READ);
        tracker
            .protections
            .insert(0x1000..0x2000, MemoryPermission::READ_EXECUTE);
        tracker.protections.insert(0x2000..0x4000, MemoryPermission::NONE);

        assert_eq!(
            tracker.host_page_permission(0x0..0x4000),
            Some(MemoryPermission::READ_EXECUTE)
        );
        assert_eq!(
            tracker.host_page_permission(0x2000..0x4000),
            Some(MemoryPermission::NONE)
        );
        assert_eq!(tracker.host_page_permission(0x4000..0x8000), None);
    }
}
