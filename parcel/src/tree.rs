// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! An interval tree whose intervals tile a fixed address range.
//!
//! Nodes are owned by the tree and addressed by their start address, which
//! serves as a handle. Structural changes go through [`IntervalTree::split`]
//! and [`IntervalTree::merge`], so the tiling can never be broken from the
//! outside.

use std::collections::BTreeMap;
use std::ops::Range;

/// Values that can be split alongside the interval they label.
pub(crate) trait Split: Sized {
    /// Split off the part of the value past `offset` bytes into the interval,
    /// keeping the first part in `self`.
    fn split_off(&mut self, offset: u64) -> Self;
}

#[derive(Debug)]
struct Node<V> {
    end: u64,
    value: V,
}

#[derive(Debug)]
pub(crate) struct IntervalTree<V> {
    nodes: BTreeMap<u64, Node<V>>,
}

impl<V> IntervalTree<V> {
    /// A tree with a single interval covering `range`.
    pub fn new(range: Range<u64>, value: V) -> Self {
        assert!(range.start < range.end, "Tree range must not be empty");

        let mut nodes = BTreeMap::new();
        nodes.insert(
            range.start,
            Node {
                end: range.end,
                value,
            },
        );

        Self { nodes }
    }

    /// Handle of the interval containing `addr`.
    pub fn covering(&self, addr: u64) -> Option<u64> {
        self.nodes
            .range(..=addr)
            .next_back()
            .filter(|(_, node)| addr < node.end)
            .map(|(start, _)| *start)
    }

    pub fn end(&self, start: u64) -> u64 {
        self.node(start).end
    }

    pub fn range(&self, start: u64) -> Range<u64> {
        start..self.end(start)
    }

    pub fn value(&self, start: u64) -> &V {
        &self.node(start).value
    }

    pub fn value_mut(&mut self, start: u64) -> &mut V {
        &mut self
            .nodes
            .get_mut(&start)
            .expect("Handle should refer to an interval in the tree")
            .value
    }

    pub fn successor(&self, start: u64) -> Option<u64> {
        self.nodes
            .range(start + 1..)
            .next()
            .map(|(start, _)| *start)
    }

    pub fn predecessor(&self, start: u64) -> Option<u64> {
        self.nodes.range(..start).next_back().map(|(start, _)| *start)
    }

    /// Merge the interval at `right` into its predecessor at `left`, returning
    /// the value the right interval was labeled with.
    pub fn merge(&mut self, left: u64, right: u64) -> V {
        let removed = self
            .nodes
            .remove(&right)
            .expect("Handle should refer to an interval in the tree");

        let node = self
            .nodes
            .get_mut(&left)
            .expect("Handle should refer to an interval in the tree");
        assert_eq!(node.end, right, "Merged intervals must be adjacent");
        node.end = removed.end;

        removed.value
    }

    pub fn iter(&self) -> impl Iterator<Item = (Range<u64>, &V)> {
        self.nodes
            .iter()
            .map(|(start, node)| (*start..node.end, &node.value))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, start: u64) -> &Node<V> {
        self.nodes
            .get(&start)
            .expect("Handle should refer to an interval in the tree")
    }
}

impl<V: Split> IntervalTree<V> {
    /// Split the interval at `start` in two at address `at`, returning the
    /// handle of the right piece, which is `at`.
    pub fn split(&mut self, start: u64, at: u64) -> u64 {
        let node = self
            .nodes
            .get_mut(&start)
            .expect("Handle should refer to an interval in the tree");
        assert!(
            start < at && at < node.end,
            "Split point {at:#x} outside of interval {start:#x}..{:#x}",
            node.end
        );

        let value = node.value.split_off(at - start);
        let end = node.end;
        node.end = at;

        self.nodes.insert(at, Node { end, value });

        at
    }
}
