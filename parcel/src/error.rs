// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::borrow::Cow;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// The error type returned by partition operations.
///
/// Contract violations, such as addressing memory outside of a partition, are
/// not errors: they panic.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Private allocation of {size:#x} bytes failed: {source}")]
    AllocationFailed { size: u64, source: Arc<io::Error> },
    #[error(transparent)]
    HostMemory(Arc<io::Error>),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl Error {
    /// Returns `true` if the error is due to the private memory pool running
    /// out of space.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::AllocationFailed { source, .. } => {
                source.kind() == io::ErrorKind::OutOfMemory
            }
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::HostMemory(Arc::new(err))
    }
}
