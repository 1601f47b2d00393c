// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Variable-size allocation over a chain of reduced pools.
//!
//! Build the tiers smallest-last (`root → medium → small`) and allocate
//! through the smallest one. A request walks up the chain until it reaches
//! a tier whose object size covers it:
//!
//! ```text
//!   request 4 B  ──► small (16 B)
//!   request 90 B ──► small ✗ ──► medium (128 B)
//!   request 200 B ─► small ✗ ──► medium ✗ ──► root (266 B)
//! ```

use crate::fatal;
use crate::handle::Block;
use crate::pool::PoolRef;
use crate::PoolError;
use std::sync::Arc;

impl PoolRef {
    /// The smallest tier at or above this pool whose object size is at
    /// least `size`. A request larger than the largest tier is fatal.
    ///
    /// Routing only climbs to a parent with strictly larger objects. A
    /// sub-pool of a tier has its parent's size, so requests through it
    /// stop at that tier even when the root could serve them.
    pub fn tier_for(&self, size: usize) -> PoolRef {
        let mut pool = self.pool();
        while pool.object_size < size {
            let parent = pool
                .parent
                .and_then(|id| self.registry.pool(id))
                .filter(|parent| parent.object_size > pool.object_size);
            match parent {
                Some(parent) => pool = parent,
                None => fatal!(
                    "var alloc: {size} bytes requested from '{}', whose largest tier '{}' holds {} bytes",
                    self.name(),
                    pool.name,
                    pool.object_size
                ),
            }
        }
        PoolRef::new(Arc::clone(&self.registry), pool.id)
    }

    /// Like [`try_alloc`](Self::try_alloc) on the tier serving `size`.
    pub fn try_var_alloc(&self, size: usize) -> Option<Block> {
        self.tier_for(size).try_alloc()
    }

    /// Like [`force_alloc`](Self::force_alloc) on the tier serving `size`.
    /// The tier borrows from its ancestors and finally grows the root.
    pub fn force_var_alloc(&self, size: usize) -> Result<Block, PoolError> {
        self.tier_for(size).force_alloc()
    }

    /// Like [`assert_alloc`](Self::assert_alloc) on the tier serving `size`.
    pub fn assert_var_alloc(&self, size: usize) -> Block {
        self.tier_for(size).assert_alloc()
    }
}
