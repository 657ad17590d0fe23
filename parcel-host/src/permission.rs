// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use bitflags::bitflags;
use libc::{c_int, PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};

bitflags! {
    /// Access permissions of a range of host memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u8 {
        /// The memory may be read.
        const READ = 1;
        /// The memory may be written.
        const WRITE = 1 << 1;
        /// The memory may be executed.
        const EXECUTE = 1 << 2;

        /// Shorthand for `READ | WRITE`.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Shorthand for `READ | EXECUTE`.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl MemoryPermission {
    /// No access at all.
    pub const NONE: Self = Self::empty();

    pub(crate) fn to_prot(self) -> c_int {
        let mut prot = PROT_NONE;

        if self.contains(Self::READ) {
            prot |= PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= PROT_EXEC;
        }

        prot
    }
}
