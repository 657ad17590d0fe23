// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use crate::{Error, GUEST_PAGE_SIZE};

/// Default size of the blocks pooled by a partition's private allocator.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Configuration of a [`Partition`].
///
/// [`Partition`]: crate::Partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionConfig {
    host_page_size: u64,
    block_size: usize,
    private_memory_limit: Option<usize>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            host_page_size: parcel_host::page_size() as u64,
            block_size: DEFAULT_BLOCK_SIZE,
            private_memory_limit: None,
        }
    }
}

impl PartitionConfig {
    pub fn builder() -> PartitionConfigBuilder {
        PartitionConfigBuilder {
            host_page_size: None,
            block_size: None,
            private_memory_limit: None,
        }
    }

    /// Granularity at which host memory is mapped and protected.
    pub fn host_page_size(&self) -> u64 {
        self.host_page_size
    }

    /// Minimum size of the blocks pooled for private allocations.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximum number of bytes pooled for private allocations, if any.
    pub fn private_memory_limit(&self) -> Option<usize> {
        self.private_memory_limit
    }
}

pub struct PartitionConfigBuilder {
    host_page_size: Option<u64>,
    block_size: Option<usize>,
    private_memory_limit: Option<usize>,
}

impl PartitionConfigBuilder {
    /// Overrides the host page size.
    ///
    /// Larger values than the system page size emulate hosts with bigger pages
    /// than the one the partition is running on.
    pub fn host_page_size(mut self, host_page_size: u64) -> Self {
        self.host_page_size = Some(host_page_size);
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn private_memory_limit(mut self, limit: usize) -> Self {
        self.private_memory_limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<PartitionConfig, Error> {
        let defaults = PartitionConfig::default();
        let system_page_size = parcel_host::page_size() as u64;

        let host_page_size =
            self.host_page_size.unwrap_or(defaults.host_page_size);
        if !host_page_size.is_power_of_two() {
            return Err(Error::InvalidConfig(
                format!("host page size {host_page_size:#x} is not a power of two")
                    .into(),
            ));
        }
        if host_page_size < GUEST_PAGE_SIZE
            || host_page_size % system_page_size != 0
        {
            return Err(Error::InvalidConfig(
                format!(
                    "host page size {host_page_size:#x} must be a multiple of both the guest page size and the system page size {system_page_size:#x}"
                )
                .into(),
            ));
        }

        let block_size = self.block_size.unwrap_or(defaults.block_size);
        if block_size == 0 || block_size as u64 % host_page_size != 0 {
            return Err(Error::InvalidConfig(
                format!(
                    "block size {block_size:#x} must be a multiple of the host page size {host_page_size:#x}"
                )
                .into(),
            ));
        }

        Ok(PartitionConfig {
            host_page_size,
            block_size,
            private_memory_limit: self.private_memory_limit,
        })
    }
}
