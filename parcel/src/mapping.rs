// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::ops::Range;

use parcel_host::{align_down, align_up};

use crate::partition::State;
use crate::tree::Split;
use crate::Error;

/// Classification of a range of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// Nothing is mapped.
    Unmapped,
    /// Mapped to private host memory.
    Private,
}

impl Split for MappingKind {
    fn split_off(&mut self, _offset: u64) -> Self {
        *self
    }
}

impl State {
    pub fn is_empty(&self) -> bool {
        let address = self.geometry.address;
        self.mappings.len() == 1
            && *self.mappings.value(address) == MappingKind::Unmapped
    }

    /// Reclassify `[va, va + size)` as `kind`, allocating or releasing the
    /// backing memory as part of the same operation.
    ///
    /// The range is processed one interval at a time. If processing one fails,
    /// it is left as it was and the error is returned together with the start
    /// of the failed interval. Intervals before it keep their new state.
    pub fn update(
        &mut self,
        va: u64,
        pa: u64,
        size: u64,
        kind: MappingKind,
    ) -> Result<(), (u64, Error)> {
        let end = va + size;

        let mut map = self
            .mappings
            .covering(va)
            .expect("The partition should be fully tiled");

        loop {
            if map < va {
                map = self.mappings.split(map, va);
            }
            if self.mappings.end(map) > end {
                self.mappings.split(map, end);
            }

            let piece = self.mappings.range(map);
            let piece_size = piece.end - piece.start;

            let result = match kind {
                MappingKind::Private => {
                    self.map_private(piece.start, piece_size)
                }
                MappingKind::Unmapped => {
                    let (before, after) = self.unmapped_neighbors(map);
                    self.unmap_private(piece.start, piece_size, before, after)
                }
            };

            if result.is_ok() {
                *self.mappings.value_mut(map) = kind;
                self.track_edge_pages(&piece, va, pa, kind);
            }

            map = self.coalesce_mapping(map);

            if let Err(err) = result {
                return Err((piece.start, err));
            }

            if self.mappings.end(map) >= end {
                return Ok(());
            }

            map = self
                .mappings
                .successor(map)
                .expect("The partition should be fully tiled");
        }
    }

    /// Whether the neighbors of the interval at `map` leave the host pages it
    /// shares with them unused: a neighbor does if it is unmapped and covers
    /// the shared host page entirely. A missing neighbor counts as unmapped.
    fn unmapped_neighbors(&self, map: u64) -> (bool, bool) {
        let host_page_size = self.geometry.host_page_size;
        let range = self.mappings.range(map);

        let before = self.mappings.predecessor(map).map_or(true, |prev| {
            *self.mappings.value(prev) == MappingKind::Unmapped
                && prev <= align_down(range.start, host_page_size)
        });
        let after = self.mappings.successor(map).map_or(true, |next| {
            *self.mappings.value(next) == MappingKind::Unmapped
                && self.mappings.end(next)
                    >= align_up(range.end, host_page_size)
        });

        (before, after)
    }

    /// Keep the physical addresses of the first and last guest page up to
    /// date, as those are the pages that may take part in bridging.
    fn track_edge_pages(
        &mut self,
        piece: &Range<u64>,
        va: u64,
        pa: u64,
        kind: MappingKind,
    ) {
        let page_pa = |page: u64| match kind {
            MappingKind::Private => Some(pa + (page - va)),
            MappingKind::Unmapped => None,
        };

        let first_page = self.geometry.address;
        if piece.contains(&first_page) {
            self.first_page_pa = page_pa(first_page);
        }

        let last_page = self.geometry.last_guest_page();
        if piece.contains(&last_page) {
            self.last_page_pa = page_pa(last_page);
        }
    }

    fn coalesce_mapping(&mut self, mut map: u64) -> u64 {
        let kind = *self.mappings.value(map);

        if let Some(prev) = self.mappings.predecessor(map) {
            if *self.mappings.value(prev) == kind {
                self.mappings.merge(prev, map);
                map = prev;
            }
        }
        if let Some(next) = self.mappings.successor(map) {
            if *self.mappings.value(next) == kind {
                self.mappings.merge(map, next);
            }
        }

        map
    }
}
