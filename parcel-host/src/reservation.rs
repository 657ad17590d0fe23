// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::io;
use std::ptr::{self, NonNull};

use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_NORESERVE, MAP_PRIVATE,
    MAP_SHARED, PROT_NONE,
};
use rangemap::RangeMap;

use crate::{page_size, MemoryBlock, MemoryPermission};

/// A contiguous range of reserved host address space.
///
/// When first created the whole range is inaccessible. Views of
/// [`MemoryBlock`]s are mapped into it with [`map_view`], and removed again
/// with [`unmap_view`], which returns the range to the inaccessible state.
///
/// The reservation keeps track of the permission of every byte, which can be
/// queried using [`permission`].
///
/// [`map_view`]: Reservation::map_view
/// [`unmap_view`]: Reservation::unmap_view
/// [`permission`]: Reservation::permission
#[derive(Debug)]
pub struct Reservation {
    ptr: NonNull<u8>,
    len: usize,
    permissions: RangeMap<usize, MemoryPermission>,
}

// The reservation exclusively owns its range of address space. Mutating
// operations require `&mut self`, while pointers handed out are raw.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve `len` bytes of inaccessible address space.
    ///
    /// # Errors
    /// If `len` is not a non-zero multiple of the system page size, or the
    /// underlying call to map memory fails, an error is returned.
    pub fn new(len: usize) -> io::Result<Self> {
        check_page_aligned(0, len)?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Reservation must not be empty",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mut permissions = RangeMap::new();
        permissions.insert(0..len, MemoryPermission::NONE);

        Ok(Self {
            // mmap never returns null on success
            ptr: NonNull::new(ptr.cast()).ok_or_else(io::Error::last_os_error)?,
            len,
            permissions,
        })
    }

    /// Length of the reservation in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the reservation has a length of zero, which is never
    /// the case for a successfully created reservation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Map `size` bytes of `block`, starting at `src_offset`, into the
    /// reservation at `dst_offset`. The view is readable and writable.
    ///
    /// # Errors
    /// If either offset or the size is not page aligned, or the underlying call
    /// to map memory fails, an error is returned.
    ///
    /// # Panics
    /// Panics if the destination or source range is out of bounds.
    #[allow(clippy::cast_possible_wrap)]
    pub fn map_view(
        &mut self,
        block: &MemoryBlock,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> io::Result<()> {
        self.check_range(dst_offset, size);
        assert!(
            src_offset + size <= block.size(),
            "Source range out of the bounds of the block"
        );
        check_page_aligned(src_offset, size)?;
        check_page_aligned(dst_offset, size)?;

        let permission = MemoryPermission::READ_WRITE;

        unsafe {
            let addr = self.ptr.as_ptr().add(dst_offset);
            let ptr = libc::mmap(
                addr.cast(),
                size,
                permission.to_prot(),
                MAP_SHARED | MAP_FIXED,
                block.raw_fd(),
                src_offset as libc::off_t,
            );

            if ptr == MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
        }

        self.permissions
            .insert(dst_offset..dst_offset + size, permission);

        Ok(())
    }

    /// Remove whatever is mapped in the given range, leaving it inaccessible.
    ///
    /// # Errors
    /// If the range is not page aligned, or the underlying call to map memory
    /// fails, an error is returned.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn unmap_view(&mut self, offset: usize, size: usize) -> io::Result<()> {
        self.check_range(offset, size);
        check_page_aligned(offset, size)?;

        unsafe {
            let addr = self.ptr.as_ptr().add(offset);
            let ptr = libc::mmap(
                addr.cast(),
                size,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE | MAP_FIXED,
                -1,
                0,
            );

            if ptr == MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
        }

        self.permissions
            .insert(offset..offset + size, MemoryPermission::NONE);

        Ok(())
    }

    /// Change the permission of the given range.
    ///
    /// When `exact` is `false` a failure of the host to change the permission
    /// is tolerated, and reported as success with the previous permissions
    /// left in place.
    ///
    /// # Errors
    /// If the range is not page aligned, or `exact` is set and the underlying
    /// call to protect memory fails, an error is returned.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn reprotect(
        &mut self,
        offset: usize,
        size: usize,
        permission: MemoryPermission,
        exact: bool,
    ) -> io::Result<()> {
        self.check_range(offset, size);
        check_page_aligned(offset, size)?;

        let ret = unsafe {
            let addr = self.ptr.as_ptr().add(offset);
            libc::mprotect(addr.cast(), size, permission.to_prot())
        };

        if ret != 0 {
            return match exact {
                true => Err(io::Error::last_os_error()),
                false => Ok(()),
            };
        }

        self.permissions.insert(offset..offset + size, permission);

        Ok(())
    }

    /// The permission of the byte at `offset`.
    #[must_use]
    pub fn permission(&self, offset: usize) -> Option<MemoryPermission> {
        self.permissions.get(&offset).copied()
    }

    /// A raw pointer to the given range.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    #[must_use]
    pub fn pointer(&self, offset: usize, size: usize) -> NonNull<u8> {
        self.check_range(offset, size);
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    fn check_range(&self, offset: usize, size: usize) {
        assert!(
            offset
                .checked_add(size)
                .map_or(false, |end| end <= self.len),
            "Range {offset:#x}+{size:#x} out of the bounds of the reservation ({:#x})",
            self.len
        );
    }
}

/// When a reservation is dropped, its whole range is unmapped, including any
/// views still mapped into it.
impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

fn check_page_aligned(offset: usize, size: usize) -> io::Result<()> {
    let page_size = page_size();
    if offset % page_size != 0 || size % page_size != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Range {offset:#x}+{size:#x} must be aligned to the system page size {page_size}"),
        ));
    }
    Ok(())
}
