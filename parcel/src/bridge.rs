// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Bridging of the trailing host page of a partition.
//!
//! With host pages larger than guest pages, the last host page of a partition
//! may hold guest pages whose accesses run over into the first guest page of
//! the next partition. Since the partitions live in unrelated host memory,
//! such accesses would otherwise read and write past the partition's
//! reservation.
//!
//! Each reservation has room for two extra host pages past the end of the
//! partition. When bridged, the first holds a view of the partition's own
//! trailing host page, and the second a view of the next partition's leading
//! host page. Pointers into the trailing host page then resolve into the
//! first extra page, so that contiguous accesses continue into the next
//! partition's memory.

use std::io;
use std::ptr::NonNull;

use parcel_host::{MemoryPermission, PrivateRange};

use crate::partition::State;
use crate::Error;

/// What a bridged page is backed by. A change of identity means the view of
/// the page must be mapped again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageIdentity {
    pa: u64,
    block: usize,
    offset: usize,
}

/// A mapped guest page at the edge of a partition, along with the private
/// memory backing the host page it is part of.
#[derive(Debug, Clone)]
pub(crate) struct EdgePage {
    identity: PageIdentity,
    backing: PrivateRange,
}

impl EdgePage {
    fn new(pa: u64, backing: PrivateRange) -> Self {
        Self {
            identity: PageIdentity {
                pa,
                block: backing.memory.id(),
                offset: backing.offset,
            },
            backing,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BridgeState {
    active: bool,
    last_page_protection: MemoryPermission,
    cached_last_page: Option<PageIdentity>,
    cached_first_page: Option<PageIdentity>,
    stale: bool,
}

impl Default for BridgeState {
    fn default() -> Self {
        Self {
            active: false,
            last_page_protection: MemoryPermission::READ_WRITE,
            cached_last_page: None,
            cached_first_page: None,
            stale: true,
        }
    }
}

impl BridgeState {
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Guest address, host pointer and size of a range whose pointer changed.
pub(crate) type PointerUpdate = (u64, NonNull<u8>, u64);

impl State {
    /// The first guest page, if it is mapped.
    pub fn first_page(&self) -> Option<EdgePage> {
        let pa = self.first_page_pa?;
        let backing = self.host_page_backing(self.geometry.address)?;
        Some(EdgePage::new(pa, backing))
    }

    /// The last guest page, if it is mapped.
    pub fn last_page(&self) -> Option<EdgePage> {
        let pa = self.last_page_pa?;
        let backing = self.host_page_backing(self.geometry.last_guest_page())?;
        Some(EdgePage::new(pa, backing))
    }

    /// Bridge the trailing host page with `first_page_after`, the first page of
    /// the next partition, or remove the bridge if either page is not mapped.
    ///
    /// Returns the pointer update to apply if anything changed.
    pub fn insert_bridge(
        &mut self,
        first_page_after: Option<EdgePage>,
    ) -> Result<Option<PointerUpdate>, Error> {
        let last_page = self.last_page();

        let last_identity = last_page.as_ref().map(|page| page.identity);
        let first_identity =
            first_page_after.as_ref().map(|page| page.identity);

        if !self.bridge.stale
            && self.bridge.cached_last_page == last_identity
            && self.bridge.cached_first_page == first_identity
        {
            return Ok(None);
        }

        match (last_page, first_page_after) {
            (Some(last_page), Some(first_page_after)) => {
                self.map_bridge(&last_page.backing, &first_page_after.backing)?
            }
            _ => self.unmap_bridge()?,
        }

        self.bridge.cached_last_page = last_identity;
        self.bridge.cached_first_page = first_identity;
        self.bridge.stale = false;

        Ok(Some(self.trailing_page_update()))
    }

    /// Unconditionally remove the bridge, forgetting the bridged pages.
    pub fn remove_bridge(&mut self) -> Result<PointerUpdate, Error> {
        self.invalidate_bridge()?;
        self.bridge.cached_last_page = None;
        self.bridge.cached_first_page = None;

        Ok(self.trailing_page_update())
    }

    /// Remove the bridge if there is one, and make sure the next insertion
    /// recomputes it.
    pub fn invalidate_bridge(&mut self) -> Result<(), Error> {
        self.unmap_bridge()?;
        self.bridge.stale = true;
        Ok(())
    }

    /// The trailing host page lost its backing: remove the bridge, and forget
    /// the protection it was given.
    pub fn release_trailing_page(&mut self) -> Result<(), Error> {
        self.invalidate_bridge()?;
        self.bridge.last_page_protection = MemoryPermission::READ_WRITE;
        Ok(())
    }

    pub fn reprotect_aligned(
        &mut self,
        va: u64,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), Error> {
        let geometry = self.geometry;
        let host_page_size = geometry.host_page_size as usize;

        self.reservation.reprotect(
            geometry.offset(va),
            size as usize,
            permission,
            false,
        )?;

        // Accesses to the trailing host page go through the bridge while it
        // is active, so it must follow the same protection.
        if va + size > geometry.last_host_page() {
            if self.bridge.active {
                self.reservation.reprotect(
                    geometry.bridge_offset(),
                    host_page_size,
                    permission,
                    false,
                )?;
            }
            self.bridge.last_page_protection = permission;
        }

        Ok(())
    }

    /// Host pointer to `[va, va + size)`, resolving into the bridge while it
    /// is active.
    pub fn pointer(&self, va: u64, size: u64) -> NonNull<u8> {
        let offset = self.resolve(va);
        self.reservation.pointer(offset, size as usize)
    }

    pub fn host_permission(&self, va: u64) -> Option<MemoryPermission> {
        self.reservation.permission(self.resolve(va))
    }

    fn resolve(&self, va: u64) -> usize {
        let geometry = self.geometry;
        let last_host_page = geometry.last_host_page();

        match self.bridge.active && va >= last_host_page {
            true => geometry.bridge_offset() + (va - last_host_page) as usize,
            false => geometry.offset(va),
        }
    }

    fn map_bridge(
        &mut self,
        last_page: &PrivateRange,
        first_page_after: &PrivateRange,
    ) -> Result<(), Error> {
        let geometry = self.geometry;
        let host_page_size = geometry.host_page_size as usize;
        let offset = geometry.bridge_offset();

        let result = self.map_bridge_views(last_page, first_page_after);

        if let Err(err) = result {
            tracing::warn!("failed mapping bridge: {err}");
            if let Err(err) =
                self.reservation.unmap_view(offset, 2 * host_page_size)
            {
                tracing::warn!("failed clearing bridge region: {err}");
            }
            self.bridge.active = false;
            self.bridge.stale = true;
            return Err(err.into());
        }

        tracing::debug!(
            "bridged partition end {:#x} with block {}",
            geometry.end(),
            first_page_after.memory.id()
        );
        self.bridge.active = true;

        Ok(())
    }

    fn map_bridge_views(
        &mut self,
        last_page: &PrivateRange,
        first_page_after: &PrivateRange,
    ) -> io::Result<()> {
        let geometry = self.geometry;
        let host_page_size = geometry.host_page_size as usize;
        let offset = geometry.bridge_offset();

        self.reservation.map_view(
            &last_page.memory,
            last_page.offset,
            offset,
            host_page_size,
        )?;
        self.reservation.map_view(
            &first_page_after.memory,
            first_page_after.offset,
            offset + host_page_size,
            host_page_size,
        )?;
        self.reservation.reprotect(
            offset,
            host_page_size,
            self.bridge.last_page_protection,
            false,
        )
    }

    fn unmap_bridge(&mut self) -> Result<(), Error> {
        if !self.bridge.active {
            return Ok(());
        }

        let geometry = self.geometry;
        let host_page_size = geometry.host_page_size as usize;

        self.reservation
            .unmap_view(geometry.bridge_offset(), 2 * host_page_size)?;
        self.bridge.active = false;

        tracing::debug!(
            "removed bridge at partition end {:#x}",
            geometry.end()
        );

        Ok(())
    }

    fn trailing_page_update(&self) -> PointerUpdate {
        let geometry = self.geometry;
        let va = geometry.last_host_page();
        let size = geometry.host_page_size;

        (va, self.pointer(va, size), size)
    }
}
