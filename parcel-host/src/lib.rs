// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Host memory primitives for a partitioned guest address space.
//!
//! The crate offers three building blocks:
//!
//! - [`MemoryBlock`], a fixed-size region of shareable host memory that can be
//!   mapped into several places of the address space at once.
//! - [`Reservation`], a contiguous range of host address space, initially
//!   inaccessible, into which views of memory blocks are mapped.
//! - [`PrivateMemoryAllocator`], a pool of memory blocks handing out
//!   splittable [`PrivateAllocation`]s.
//!
//! # Example
//! ```rust
//! # use std::io;
//! # fn main() -> io::Result<()> {
//! use parcel_host::{page_size, PrivateMemoryAllocator, Reservation};
//!
//! let page = page_size();
//!
//! let mut allocator = PrivateMemoryAllocator::new(16 * page);
//! let mut reservation = Reservation::new(4 * page)?;
//!
//! let allocation = allocator.allocate(page, page)?;
//! reservation.map_view(
//!     allocation.memory(),
//!     allocation.offset(),
//!     page,
//!     page,
//! )?;
//!
//! let ptr = reservation.pointer(page, page);
//! unsafe { ptr.as_ptr().write(42) };
//! assert_eq!(unsafe { ptr.as_ptr().read() }, 42);
//!
//! reservation.unmap_view(page, page)?;
//! allocator.free(allocation);
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! This crate currently only builds for 64-bit Unix targets, since it relies
//! on `mmap` with file descriptors to alias the same memory at several
//! addresses.
#![cfg(all(unix, target_pointer_width = "64"))]
#![deny(missing_docs)]
#![deny(clippy::pedantic)]

mod alloc;
mod block;
mod permission;
mod reservation;

use std::sync::OnceLock;

pub use alloc::{PrivateAllocation, PrivateMemoryAllocator, PrivateRange};
pub use block::MemoryBlock;
pub use permission::MemoryPermission;
pub use reservation::Reservation;

/// Returns the page size of the host system.
///
/// The value is queried once and cached for the lifetime of the process.
#[must_use]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    })
}

/// Rounds `value` down to a multiple of `alignment`, which must be a power of
/// two.
#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Rounds `value` up to a multiple of `alignment`, which must be a power of
/// two.
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
