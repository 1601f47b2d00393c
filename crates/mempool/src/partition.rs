// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Sub-pools and reduced pools.
//!
//! A child pool owns no storage of its own. It borrows blocks from its
//! parent's free list:
//!
//! ```text
//!   parent block (288 B)        sub-pool        reduced pool (2 per parent)
//!  ┌───────────────────┐      ┌──────────┐      ┌─────────┬─────────┐
//!  │ hdr │ data        │  ──► │ same     │  or  │ hdr│data│ hdr│data│
//!  └───────────────────┘      └──────────┘      └─────────┴─────────┘
//! ```
//!
//! Borrowed parent blocks count as *lent*: still part of the parent's
//! capacity, but neither free nor in use. Deleting the child gives them
//! back.
//!
//! Operations spanning several pools lock the whole ancestor chain, root
//! first, through [`Chain`].

use crate::block::{block_capacity, block_footprint, round_down, BlockHeader, BLOCK_ALIGN};
use crate::fatal;
use crate::pool::{Pool, PoolKind, PoolRef, PoolState};
use crate::registry::RegistryInner;
use std::ptr::NonNull;
use std::sync::{Arc, MutexGuard};
use tracing::debug;

/// Size class of a reduced pool carved out of a parent block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TierGeometry {
    /// Child block stride, header included.
    pub(crate) block_size: usize,
    /// Largest object that still fits `per_parent` blocks per parent block,
    /// capped at the parent's object size.
    pub(crate) object_size: usize,
    pub(crate) per_parent: usize,
}

/// Splits a parent block of `parent_block` bytes, holding objects of
/// `parent_object` bytes, for objects of at least `object_size` bytes.
///
/// When only one child block fits, the child keeps the parent's geometry:
/// a tier never advertises more than its parent does.
pub(crate) fn tier_geometry(
    parent_block: usize,
    parent_object: usize,
    object_size: usize,
) -> TierGeometry {
    let wanted = block_footprint(object_size);
    let divisor = (parent_block / wanted).max(1);
    let block_size = round_down(parent_block / divisor, BLOCK_ALIGN);
    TierGeometry {
        block_size,
        object_size: block_capacity(block_size).min(parent_object),
        per_parent: parent_block / block_size,
    }
}

/// A pool and all its ancestors, locked root first.
pub(crate) struct Chain<'a> {
    registry: &'a RegistryInner,
    pools: &'a [Arc<Pool>],
    states: Vec<MutexGuard<'a, PoolState>>,
}

impl RegistryInner {
    /// Locks the ancestor chain of `pool` and runs `f` over it.
    ///
    /// Touching a pool that was deleted while waiting for its lock is fatal.
    pub(crate) fn with_chain<R>(
        &self,
        pool: &Arc<Pool>,
        op: &str,
        f: impl FnOnce(&mut Chain<'_>) -> R,
    ) -> R {
        let pools = self.ancestry(pool, op);
        let states: Vec<_> = pools.iter().map(|p| p.lock()).collect();
        if let Some((p, _)) = pools.iter().zip(&states).find(|(_, s)| s.retired) {
            fatal!("{op}: pool '{}' has been deleted", p.name);
        }
        let mut chain = Chain {
            registry: self,
            pools: &pools,
            states,
        };
        f(&mut chain)
    }
}

impl Chain<'_> {
    /// Level of the pool the chain was built for.
    pub(crate) fn target(&self) -> usize {
        self.pools.len() - 1
    }

    pub(crate) fn pool(&self, level: usize) -> &Pool {
        &self.pools[level]
    }

    pub(crate) fn state(&mut self, level: usize) -> &mut PoolState {
        &mut self.states[level]
    }

    /// Adds at least `count` free blocks to the pool at `level`.
    ///
    /// Child levels borrow whole parent blocks, recursing upwards when the
    /// parent is short; the root grows a slab. Every level that had to be
    /// topped up on behalf of a descendant records an overflow. Returns
    /// `false` only when a static root runs out.
    pub(crate) fn supply(&mut self, level: usize, count: usize) -> bool {
        if count == 0 {
            return true;
        }
        if level == 0 {
            let root = &self.pools[0];
            if root.kind == PoolKind::Static {
                return false;
            }
            self.registry.grow(root, &mut self.states[0], count);
        } else {
            let per = self.pools[level - 1].block_size / self.pools[level].block_size;
            let needed = count.div_ceil(per);
            let available = self.states[level - 1].free.len();
            if available < needed && !self.supply(level - 1, needed - available) {
                return false;
            }
            self.transfer(level, needed);
        }
        if level != self.target() {
            self.states[level].counters.record_overflow();
        }
        true
    }

    /// Moves `parents` free blocks from `level - 1` into `level`, splitting
    /// each into `per` child blocks.
    fn transfer(&mut self, level: usize, parents: usize) {
        let child = &self.pools[level];
        let block = child.block_size;
        let per = self.pools[level - 1].block_size / block;

        let mut carved = Vec::with_capacity(parents * per);
        for _ in 0..parents {
            let Some(parent_block) = self.states[level - 1].free.pop() else {
                fatal!("transfer: parent of '{}' ran out of free blocks", child.name);
            };
            let base = parent_block.cast::<u8>();
            for j in 0..per {
                // SAFETY: per * block <= parent block size, so every child
                // block lies inside the parent block.
                unsafe {
                    let at = NonNull::new_unchecked(base.as_ptr().add(j * block));
                    let header = BlockHeader::format(at, child.id);
                    child.arm_guards(header);
                    carved.push(header);
                }
            }
        }
        carved.sort_unstable_by_key(|h| h.as_ptr() as usize);

        self.states[level - 1].lent += parents;
        let state = &mut self.states[level];
        // SAFETY: freshly formatted blocks on no list.
        unsafe { state.free.extend_sorted(&carved) };
        state.total += carved.len();
    }

    /// Gives every block of the pool at `level` back to its parent.
    ///
    /// The caller has checked that none of them are allocated.
    fn reclaim(&mut self, level: usize) {
        let child = &self.pools[level];
        let parent = &self.pools[level - 1];
        let per = parent.block_size / child.block_size;

        let blocks = self.states[level].free.drain_sorted();
        if blocks.len() % per != 0 {
            fatal!(
                "delete_sub_pool: '{}' holds {} blocks, not a multiple of {per}",
                child.name,
                blocks.len()
            );
        }

        let mut returned = Vec::with_capacity(blocks.len() / per);
        for group in blocks.chunks(per) {
            let first = group[0].as_ptr() as usize;
            for (j, header) in group.iter().enumerate() {
                if header.as_ptr() as usize != first + j * child.block_size {
                    fatal!(
                        "delete_sub_pool: blocks of '{}' at {first:#x} are not contiguous",
                        child.name
                    );
                }
            }
            for header in &group[1..] {
                // SAFETY: validated contiguous blocks inside one parent block.
                unsafe { header.as_ref() }.invalidate();
            }
            // SAFETY: the first child block starts the parent block.
            unsafe {
                let header = BlockHeader::format(group[0].cast(), parent.id);
                parent.arm_guards(header);
                returned.push(header);
            }
        }

        let state = &mut self.states[level];
        state.total = 0;
        let parent_state = &mut self.states[level - 1];
        parent_state.lent -= returned.len();
        parent_state.children -= 1;
        // SAFETY: reformatted parent blocks, on no list.
        unsafe { parent_state.free.extend_sorted(&returned) };
    }
}

impl PoolRef {
    /// Creates a sub-pool reserving `count` blocks of this pool.
    ///
    /// The parent grows first if it has fewer than `count` free blocks; if
    /// it cannot grow (static root), creation is fatal. The sub-pool
    /// inherits the parent's destructor.
    pub fn create_sub_pool(&self, name: &str, count: usize) -> PoolRef {
        self.registry.ensure_awake("create_sub_pool");
        let parent = self.pool();
        let child = self.registry.register(
            name,
            PoolKind::SubPool,
            Some(parent.id),
            parent.object_size,
            parent.block_size,
        );
        self.attach(&child, count, "create_sub_pool");
        debug!(pool = name, parent = %parent.name, count, "created sub-pool");
        PoolRef::new(Arc::clone(&self.registry), child.id)
    }

    /// Creates a pool of smaller objects that splits this pool's blocks.
    ///
    /// The advertised object size is the largest that still fits as many
    /// blocks per parent block as `object_size` does, so it is at least
    /// `object_size`, and never more than this pool's. If a parent block
    /// cannot be split for `object_size`, the new pool has this pool's
    /// geometry and acts as a named reservation. `reserved` blocks are set
    /// aside up front. An `object_size` larger than this pool's is fatal.
    pub fn create_reduced_pool(&self, name: &str, reserved: usize, object_size: usize) -> PoolRef {
        self.registry.ensure_awake("create_reduced_pool");
        let parent = self.pool();
        if object_size == 0 || object_size > parent.object_size {
            fatal!(
                "create_reduced_pool: object size {object_size} for '{name}' must be in 1..={} ('{}')",
                parent.object_size,
                parent.name
            );
        }
        let tier = tier_geometry(parent.block_size, parent.object_size, object_size);
        let child = self.registry.register(
            name,
            PoolKind::Reduced,
            Some(parent.id),
            tier.object_size,
            tier.block_size,
        );
        self.attach(&child, reserved, "create_reduced_pool");
        debug!(
            pool = name,
            parent = %parent.name,
            object_size = tier.object_size,
            per_parent = tier.per_parent,
            reserved,
            "created reduced pool"
        );
        PoolRef::new(Arc::clone(&self.registry), child.id)
    }

    fn attach(&self, child: &Arc<Pool>, reserve: usize, op: &str) {
        self.registry.with_chain(child, op, |chain| {
            let level = chain.target();
            let inherited = {
                let parent = chain.state(level - 1);
                parent.children += 1;
                parent.destructor.clone()
            };
            chain.state(level).destructor = inherited;
            if !chain.supply(level, reserve) {
                fatal!(
                    "{op}: cannot reserve {reserve} blocks for '{}'; static root '{}' is exhausted",
                    chain.pool(level).name,
                    chain.pool(0).name
                );
            }
        });
    }

    /// Deletes a sub-pool or reduced pool, returning its blocks to the
    /// parent.
    ///
    /// Fatal if the pool is a root, still has allocated objects, or has
    /// child pools of its own. Other handles to the pool become stale.
    pub fn delete_sub_pool(self) {
        self.registry.ensure_awake("delete_sub_pool");
        let pool = self.pool();
        if pool.parent.is_none() {
            fatal!("delete_sub_pool: '{}' is not a sub-pool", pool.name);
        }
        self.registry.with_chain(&pool, "delete_sub_pool", |chain| {
            let level = chain.target();
            let state = chain.state(level);
            if state.in_use != 0 || state.children != 0 || state.lent != 0 {
                fatal!(
                    "delete_sub_pool: '{}' still has {} objects in use and {} child pools",
                    pool.name,
                    state.in_use,
                    state.children
                );
            }
            chain.reclaim(level);
            chain.state(level).retired = true;
            self.registry.unregister(&pool);
        });
        debug!(pool = %pool.name, "deleted sub-pool");
    }
}
