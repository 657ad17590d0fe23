// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::page_size;

static NEXT_BLOCK_ID: AtomicUsize = AtomicUsize::new(0);

/// A fixed-size region of shareable host memory.
///
/// The memory is backed by an anonymous file - a `memfd` on Linux, an unlinked
/// temporary file elsewhere - so the same bytes can be mapped at several host
/// addresses at once using [`Reservation::map_view`]. The contents start out
/// zeroed.
///
/// [`Reservation::map_view`]: crate::Reservation::map_view
#[derive(Debug)]
pub struct MemoryBlock {
    file: File,
    size: usize,
    id: usize,
}

impl MemoryBlock {
    /// Create a new block of `size` bytes.
    ///
    /// # Errors
    /// If `size` is not a multiple of the system page size, or the backing file
    /// can't be created or sized, an error is returned.
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        if size == 0 || size % page_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Block size {size} must be a non-zero multiple of the system page size {page_size}"),
            ));
        }

        let file = shared_file()?;
        file.set_len(size as u64)?;

        Ok(Self {
            file,
            size,
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// The page size of the host, which is the granularity at which blocks can
    /// be mapped.
    #[must_use]
    pub fn page_size() -> usize {
        page_size()
    }

    /// Size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Process-unique identifier of the block.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Release the memory backing the given range, zeroing it.
    ///
    /// Views of the range stay mapped and observe zeroes afterwards.
    ///
    /// # Errors
    /// If the range is out of the bounds of the block, or the host fails to
    /// release the memory, an error is returned.
    pub fn decommit(&self, offset: usize, size: usize) -> io::Result<()> {
        if offset + size > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Decommit range out of the bounds of the block",
            ));
        }
        decommit_file(&self.file, offset, size)
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(target_os = "linux")]
fn shared_file() -> io::Result<File> {
    use std::os::fd::FromRawFd;

    let name = b"parcel-block\0";
    let fd = unsafe {
        libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC)
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn shared_file() -> io::Result<File> {
    tempfile::tempfile()
}

// Since we only build for 64-bit targets, offsets always fit in an `off_t`.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
fn decommit_file(file: &File, offset: usize, size: usize) -> io::Result<()> {
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            size as libc::off_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn decommit_file(file: &File, offset: usize, size: usize) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    const ZEROES: [u8; 4096] = [0; 4096];

    let mut written = 0;
    while written < size {
        let n = ZEROES.len().min(size - written);
        file.write_all_at(&ZEROES[..n], (offset + written) as u64)?;
        written += n;
    }
    Ok(())
}
