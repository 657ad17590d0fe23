// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Parcel is a partition of an emulated guest address space.
//!
//! A [`Partition`] covers a fixed, host page aligned, range of guest
//! addresses. Ranges of it are mapped to guest physical addresses, and are
//! lazily backed by private host memory. Host pointers to the backing memory
//! are obtained with [`Partition::get_pointer`], and stay valid for as long as
//! the range stays mapped.
//!
//! Guest pages are always [`GUEST_PAGE_SIZE`] bytes, while host pages may be
//! larger. Backing memory is allocated at host page granularity, and a host
//! page is only released once none of the guest pages it holds are mapped.
//! Protections are tracked per guest page, with each host page getting the
//! union of the permissions of the guest pages it holds.
//!
//! # Example
//! ```rust
//! # fn main() -> Result<(), parcel::Error> {
//! use parcel::{MappingKind, Partition, PartitionConfig};
//!
//! let config = PartitionConfig::builder().host_page_size(0x1000).build()?;
//! let partition = Partition::with_config(0x10000, 0x4000, config)?;
//!
//! partition.map(0x11000, 0x8000_0000, 0x3000)?;
//! partition.unmap(0x12000, 0x1000)?;
//!
//! assert!(partition.has_private_allocation(0x11000, 0x1000));
//! assert!(!partition.has_private_allocation(0x12000, 0x1000));
//! assert_eq!(partition.physical_address(0x13000), Some(0x8000_2000));
//!
//! let ptr = partition.get_pointer(0x11000, 0x1000);
//! unsafe { ptr.as_ptr().write(0xfe) };
//!
//! assert_eq!(
//!     partition.mappings(),
//!     vec![
//!         (0x10000..0x11000, MappingKind::Unmapped),
//!         (0x11000..0x12000, MappingKind::Private),
//!         (0x12000..0x13000, MappingKind::Unmapped),
//!         (0x13000..0x14000, MappingKind::Private),
//!     ]
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # Bridging
//! When a host page holds more than one guest page, the last host page of a
//! partition can hold guest pages whose accesses run over into the next
//! partition. [`Partition::insert_bridge_at_end`] makes the leading host page
//! of the next partition directly follow the trailing host page, as seen
//! through the pointers returned by [`Partition::get_pointer`].
//!
//! # Concurrency
//! A partition is `Send + Sync`, and all its operations take `&self`.
//! Structural changes are serialized by a per-partition reader-writer lock,
//! while lookups may happen concurrently.

mod bridge;
mod config;
mod error;
mod mapping;
mod partition;
mod private;
mod tracker;
mod tree;

pub use config::{PartitionConfig, PartitionConfigBuilder, DEFAULT_BLOCK_SIZE};
pub use error::Error;
pub use mapping::MappingKind;
pub use partition::Partition;

// re-exports

pub use parcel_host::{MemoryPermission, PrivateRange};

/// Size of a guest page, in bytes.
pub const GUEST_PAGE_SIZE: u64 = 0x1000;
