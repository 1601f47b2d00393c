// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pools and the allocation engine.
//!
//! A pool hands out fixed-size [`Block`]s from its free list. When the
//! list is empty the three allocation policies differ:
//!
//! 1. [`PoolRef::try_alloc`] gives up and returns `None`.
//! 2. [`PoolRef::force_alloc`] grows the pool by its force count and
//!    records an overflow. Static pools cannot grow and report
//!    [`PoolError::Exhausted`] instead.
//! 3. [`PoolRef::assert_alloc`] treats exhaustion as fatal.
//!
//! # Thread Safety
//! Every pool has its own mutex guarding its free list, capacity and
//! counters. [`PoolRef`] is `Send + Sync` and cheap to clone.

use crate::block::{damaged_guard, fill_guards, BlockHeader, BlockState};
use crate::free_list::FreeList;
use crate::handle::Block;
use crate::registry::{PoolId, RegistryInner};
use crate::slab::Slab;
use crate::stats::{Counters, PoolInfo, PoolStats};
use crate::{fatal, PoolError, Registry};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Callback run on an object's data when its last reference is released.
pub(crate) type Destructor = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Where a pool's blocks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Root pool that grows with heap slabs.
    Dynamic,
    /// Root pool over fixed `'static` storage.
    Static,
    /// Reserves whole blocks of its parent.
    SubPool,
    /// Splits parent blocks into smaller ones.
    Reduced,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolKind::Dynamic => "dynamic",
            PoolKind::Static => "static",
            PoolKind::SubPool => "sub-pool",
            PoolKind::Reduced => "reduced",
        };
        f.write_str(s)
    }
}

pub(crate) struct Pool {
    pub(crate) id: PoolId,
    pub(crate) name: String,
    pub(crate) kind: PoolKind,
    pub(crate) parent: Option<PoolId>,
    /// Bytes usable by the caller.
    pub(crate) object_size: usize,
    /// Full block stride, header included.
    pub(crate) block_size: usize,
    state: Mutex<PoolState>,
}

/// Mutable pool state, guarded by the pool's mutex.
///
/// `total == free + in_use + lent` whenever the lock is not held, with
/// `free` counting `dormant` blocks while hibernating.
pub(crate) struct PoolState {
    pub(crate) free: FreeList,
    /// Blocks owned by this pool, including those lent to children.
    pub(crate) total: usize,
    pub(crate) in_use: usize,
    /// Blocks reserved by child pools.
    pub(crate) lent: usize,
    pub(crate) children: usize,
    /// Free blocks parked by hibernation.
    pub(crate) dormant: usize,
    pub(crate) force_count: usize,
    pub(crate) destructor: Option<Destructor>,
    pub(crate) counters: Counters,
    pub(crate) slabs: Vec<Slab>,
    pub(crate) retired: bool,
}

impl Pool {
    pub(crate) fn new(
        id: PoolId,
        name: &str,
        kind: PoolKind,
        parent: Option<PoolId>,
        object_size: usize,
        block_size: usize,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            kind,
            parent,
            object_size,
            block_size,
            state: Mutex::new(PoolState::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes fresh guard bands around a block just formatted for this pool.
    ///
    /// # Safety
    /// `header` must start a block of this pool that nobody else is using.
    pub(crate) unsafe fn arm_guards(&self, header: NonNull<BlockHeader>) {
        fill_guards(header, self.block_size, self.object_size);
    }

    /// Aborts if anything wrote over the guard bands of `header`.
    pub(crate) fn check_guards(&self, header: NonNull<BlockHeader>, op: &str) {
        // SAFETY: the caller owns the block, which lies in a live slab.
        if let Some(at) = unsafe { damaged_guard(header, self.block_size, self.object_size) } {
            fatal!(
                "{op}: guard band of object {:p} in pool '{}' overwritten at {at:p}",
                BlockHeader::data(header),
                self.name
            );
        }
    }

    pub(crate) fn info(&self, parent: Option<String>) -> PoolInfo {
        let state = self.lock();
        PoolInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            parent,
            object_size: self.object_size,
            block_size: self.block_size,
            object_count: state.total,
            force_count: state.force_count,
            stats: state.stats(),
        }
    }
}

impl PoolState {
    fn new() -> Self {
        Self {
            free: FreeList::new(),
            total: 0,
            in_use: 0,
            lent: 0,
            children: 0,
            dormant: 0,
            force_count: 1,
            destructor: None,
            counters: Counters::default(),
            slabs: Vec::new(),
            retired: false,
        }
    }

    /// Pops a free block and marks it allocated with one reference.
    pub(crate) fn take_block(&mut self) -> Option<NonNull<BlockHeader>> {
        let header = self.free.pop()?;
        // SAFETY: blocks on the free list are formatted and in live slabs.
        unsafe { header.as_ref() }.set_state(BlockState::Allocated(1));
        self.in_use += 1;
        self.counters.record_alloc(self.in_use);
        Some(header)
    }

    pub(crate) fn num_free(&self) -> usize {
        self.free.len() + self.dormant
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.num_free(), self.in_use, self.lent)
    }
}

/// Handle to a pool in a [`Registry`].
///
/// Handles are looked up on every use; using a handle after
/// [`delete_sub_pool`](PoolRef::delete_sub_pool) is fatal.
///
/// # Example
/// ```
/// use mempool::Registry;
///
/// let registry = Registry::new();
/// let pool = registry.create_pool("Ids", 4).expand(2);
///
/// let a = pool.try_alloc().unwrap();
/// let b = pool.try_alloc().unwrap();
/// assert!(pool.try_alloc().is_none());
///
/// drop(a);
/// assert!(pool.try_alloc().is_some());
/// # drop(b);
/// ```
#[derive(Clone)]
pub struct PoolRef {
    pub(crate) registry: Arc<RegistryInner>,
    pub(crate) id: PoolId,
}

impl PoolRef {
    pub(crate) fn new(registry: Arc<RegistryInner>, id: PoolId) -> Self {
        Self { registry, id }
    }

    /// Resolves the handle, aborting if the pool was deleted.
    pub(crate) fn pool(&self) -> Arc<Pool> {
        self.registry
            .pool(self.id)
            .unwrap_or_else(|| fatal!("stale handle: pool {} has been deleted", self.id))
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> String {
        self.pool().name.clone()
    }

    pub fn kind(&self) -> PoolKind {
        self.pool().kind
    }

    /// The pool this one borrows its blocks from, if any.
    pub fn parent(&self) -> Option<PoolRef> {
        self.pool()
            .parent
            .map(|id| PoolRef::new(Arc::clone(&self.registry), id))
    }

    /// True for sub-pools and reduced pools.
    pub fn is_sub_pool(&self) -> bool {
        self.pool().parent.is_some()
    }

    /// Bytes available to the caller in each object.
    pub fn object_size(&self) -> usize {
        self.pool().object_size
    }

    /// Bytes each object occupies in storage, header included.
    pub fn block_footprint(&self) -> usize {
        self.pool().block_size
    }

    /// Blocks owned by the pool, including any lent to child pools.
    pub fn object_count(&self) -> usize {
        self.pool().lock().total
    }

    pub fn force_count(&self) -> usize {
        self.pool().lock().force_count
    }

    /// Sets how many blocks [`force_alloc`](Self::force_alloc) adds when
    /// the pool is empty. Values below 1 are clamped to 1.
    pub fn set_force_count(&self, count: usize) {
        self.pool().lock().force_count = count.max(1);
    }

    /// Installs the callback run on an object's bytes when its last
    /// reference is released. Sub-pools created afterwards inherit it.
    pub fn set_destructor<F>(&self, destructor: F)
    where
        F: Fn(&mut [u8]) + Send + Sync + 'static,
    {
        self.pool().lock().destructor = Some(Arc::new(destructor));
    }

    /// Allocates from the free list without growing.
    pub fn try_alloc(&self) -> Option<Block> {
        self.registry.ensure_awake("try_alloc");
        let pool = self.pool();
        let header = pool.lock().take_block()?;
        pool.check_guards(header, "try_alloc");
        Some(Block::new(Arc::clone(&self.registry), header, pool.object_size))
    }

    /// Allocates, growing the pool by its force count whenever it is
    /// empty. Each growth step counts as one overflow.
    ///
    /// Sub-pools and reduced pools borrow the extra blocks from their
    /// parent chain. Only a chain rooted in a static pool can fail.
    pub fn force_alloc(&self) -> Result<Block, PoolError> {
        if let Some(block) = self.try_alloc() {
            return Ok(block);
        }
        let pool = self.pool();
        let header = self.registry.with_chain(&pool, "force_alloc", |chain| {
            let level = chain.target();
            loop {
                if let Some(header) = chain.state(level).take_block() {
                    return Ok(header);
                }
                let force = chain.state(level).force_count;
                if !chain.supply(level, force) {
                    return Err(PoolError::Exhausted {
                        pool: pool.name.clone(),
                        capacity: chain.state(level).total,
                    });
                }
                let state = chain.state(level);
                state.counters.record_overflow();
                warn!(
                    pool = %pool.name,
                    total = state.total,
                    "pool overflowed; expanded by {force} blocks"
                );
            }
        })?;
        pool.check_guards(header, "force_alloc");
        Ok(Block::new(Arc::clone(&self.registry), header, pool.object_size))
    }

    /// Allocates or aborts the process if the pool is empty.
    pub fn assert_alloc(&self) -> Block {
        self.try_alloc().unwrap_or_else(|| {
            fatal!(
                "assert_alloc: pool '{}' is exhausted ({} blocks)",
                self.name(),
                self.object_count()
            )
        })
    }

    /// Adds `count` blocks to the pool and returns the handle.
    ///
    /// Root pools get a new slab. Sub-pools and reduced pools borrow from
    /// their parent, which grows in turn if it has too few free blocks.
    /// Expanding a static pool, or a chain whose static root is out of
    /// blocks, is fatal.
    pub fn expand(&self, count: usize) -> PoolRef {
        self.registry.ensure_awake("expand");
        let pool = self.pool();
        if pool.kind == PoolKind::Static {
            fatal!("expand: pool '{}' is static and cannot grow", pool.name);
        }
        self.registry.with_chain(&pool, "expand", |chain| {
            let level = chain.target();
            if !chain.supply(level, count) {
                fatal!(
                    "expand: cannot add {count} blocks to '{}'; its static root is exhausted",
                    pool.name
                );
            }
            debug!(pool = %pool.name, added = count, total = chain.state(level).total, "expanded pool");
        });
        self.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool().lock().stats()
    }

    /// Clears the allocation and overflow counters.
    pub fn reset_stats(&self) {
        self.pool().lock().counters.reset();
    }

    /// Full description of the pool, as listed by [`Registry::pools`].
    pub fn info(&self) -> PoolInfo {
        let pool = self.pool();
        let parent = pool.parent.and_then(|id| self.registry.pool(id)).map(|p| p.name.clone());
        pool.info(parent)
    }

    /// The registry this pool belongs to.
    pub fn registry(&self) -> Registry {
        Registry {
            inner: Arc::clone(&self.registry),
        }
    }
}

impl PartialEq for PoolRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.registry, &other.registry)
    }
}

impl Eq for PoolRef {}

impl fmt::Debug for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.registry.pool(self.id) {
            Some(pool) => f
                .debug_struct("PoolRef")
                .field("id", &self.id)
                .field("name", &pool.name)
                .field("kind", &pool.kind)
                .field("object_size", &pool.object_size)
                .finish(),
            None => f.debug_struct("PoolRef").field("id", &self.id).field("deleted", &true).finish(),
        }
    }
}
