// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pool registry.
//!
//! The [`Registry`] owns every pool and every slab. Pools live in an arena
//! indexed by [`PoolId`]; ids are never reused, so a parent always has a
//! lower id than its children. The registry also keeps an address map of
//! all slabs, which is how a bare block pointer is recognised on release.
//!
//! # Locking
//! Each pool has its own mutex. The registry's `RwLock`s (pool table, slab
//! map) may be taken while pool locks are held, but are never held while
//! waiting for a pool lock. Multi-pool operations lock pools in ascending
//! id order.

use crate::block::{
    block_footprint, static_buffer_len, BlockHeader, BlockState, DATA_OFFSET, MIN_OBJECT_SIZE,
};
use crate::fatal;
use crate::hibernate::HibernationImage;
use crate::pool::{Pool, PoolKind, PoolRef, PoolState};
use crate::slab::Slab;
use crate::stats::PoolInfo;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Stable identifier of a pool within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct PoolId(pub(crate) u32);

impl PoolId {
    /// Position of the pool in creation order.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Default)]
struct PoolTable {
    arena: Vec<Option<Arc<Pool>>>,
    names: HashMap<String, PoolId>,
}

/// Shared registry state. Pool handles and blocks hold an `Arc` to it, so
/// slab memory outlives every handle that can reach it.
pub(crate) struct RegistryInner {
    table: RwLock<PoolTable>,
    /// Slab base address → slab length.
    slabs: RwLock<BTreeMap<usize, usize>>,
    change_count: AtomicUsize,
    hibernating: AtomicBool,
    pub(crate) image: Mutex<Option<HibernationImage>>,
}

/// A set of named pools.
///
/// Cloning a `Registry` is cheap and yields another handle to the same
/// pools. Most programs use the process-wide [`global()`] registry; tests
/// and embedders can create private ones.
///
/// ```
/// use mempool::Registry;
///
/// let registry = Registry::new();
/// let ids = registry.create_pool("Ids", 4).expand(100);
/// assert_eq!(ids.object_count(), 100);
/// assert!(registry.find_pool("Ids").is_some());
/// ```
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                table: RwLock::new(PoolTable::default()),
                slabs: RwLock::new(BTreeMap::new()),
                change_count: AtomicUsize::new(0),
                hibernating: AtomicBool::new(false),
                image: Mutex::new(None),
            }),
        }
    }

    /// Creates an empty dynamic pool for objects of `object_size` bytes.
    ///
    /// The pool owns no blocks until it is expanded or force-allocated
    /// from. A duplicate name or a zero object size is fatal.
    pub fn create_pool(&self, name: &str, object_size: usize) -> PoolRef {
        if object_size == 0 {
            fatal!("create_pool: pool '{name}' needs a non-zero object size");
        }
        self.inner.ensure_awake("create_pool");
        let pool = self.inner.register(
            name,
            PoolKind::Dynamic,
            None,
            object_size,
            block_footprint(object_size),
        );
        debug!(pool = name, object_size, "created dynamic pool");
        PoolRef::new(Arc::clone(&self.inner), pool.id)
    }

    /// Creates a fixed-capacity pool of `count` objects over `buffer`.
    ///
    /// `buffer` must hold at least
    /// [`static_buffer_len(count, object_size)`](crate::static_buffer_len)
    /// bytes; [`static_pool_buffer!`](crate::static_pool_buffer) declares
    /// one of the right size. A short buffer is fatal. The pool never grows.
    pub fn init_static_pool(
        &self,
        name: &str,
        buffer: &'static mut [u8],
        count: usize,
        object_size: usize,
    ) -> PoolRef {
        if object_size == 0 || count == 0 {
            fatal!("init_static_pool: pool '{name}' needs a non-zero object size and count");
        }
        self.inner.ensure_awake("init_static_pool");
        let block_size = block_footprint(object_size);
        let available = buffer.len();
        let Some(slab) = Slab::from_static(buffer, count, block_size) else {
            fatal!(
                "init_static_pool: buffer of {available} bytes for pool '{name}' cannot hold \
                 {count} blocks of {object_size} bytes ({} bytes needed)",
                static_buffer_len(count, object_size)
            );
        };
        let pool = self
            .inner
            .register(name, PoolKind::Static, None, object_size, block_size);
        {
            let mut state = pool.lock();
            self.inner.adopt_slab(&pool, &mut state, slab);
        }
        debug!(pool = name, object_size, count, "initialised static pool");
        PoolRef::new(Arc::clone(&self.inner), pool.id)
    }

    /// Looks a pool up by name. Safe to call from inside a destructor.
    pub fn find_pool(&self, name: &str) -> Option<PoolRef> {
        let id = *read(&self.inner.table).names.get(name)?;
        Some(PoolRef::new(Arc::clone(&self.inner), id))
    }

    /// Snapshot of every live pool, in creation order.
    pub fn pools(&self) -> Vec<PoolInfo> {
        let pools = self.inner.all_pools();
        pools
            .iter()
            .map(|pool| {
                let parent = pool
                    .parent
                    .and_then(|id| pools.iter().find(|p| p.id == id))
                    .map(|p| p.name.clone());
                pool.info(parent)
            })
            .collect()
    }

    /// Counter bumped every time a pool is created or deleted.
    ///
    /// Lets a caller walking [`pools()`](Self::pools) detect that the list
    /// changed underneath it.
    pub fn change_count(&self) -> usize {
        self.inner.change_count.load(Ordering::Acquire)
    }

    /// Whether [`hibernate`](Self::hibernate) is in effect.
    pub fn is_hibernating(&self) -> bool {
        self.inner.hibernating.load(Ordering::Acquire)
    }

    /// Increments the reference count of the block at `ptr`.
    ///
    /// Fatal if `ptr` is not a live block of this registry.
    ///
    /// # Safety
    /// `ptr` must be the data pointer of a block allocated from this
    /// registry (see [`Block::into_raw`](crate::Block::into_raw)). The checks
    /// above are diagnostics, not a guarantee for arbitrary pointers.
    pub unsafe fn add_ref(&self, ptr: NonNull<u8>) {
        self.inner.add_ref(ptr);
    }

    /// Drops one reference to the block at `ptr`, running the pool's
    /// destructor and freeing the block when the count reaches zero.
    ///
    /// Releasing a free block or a pointer this registry does not own is
    /// fatal.
    ///
    /// # Safety
    /// The caller gives up the reference it owned; `ptr` must not be used
    /// through that reference again.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        self.inner.release(ptr);
    }

    /// Usable size of the block at `ptr` (its pool's object size).
    ///
    /// # Safety
    /// As for [`add_ref`](Self::add_ref).
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        let (pool, _) = self.inner.locate(ptr, "block_size");
        pool.object_size
    }

    /// Current reference count of the block at `ptr`; zero once its last
    /// reference is being released.
    ///
    /// # Safety
    /// As for [`add_ref`](Self::add_ref).
    pub unsafe fn ref_count(&self, ptr: NonNull<u8>) -> usize {
        self.inner.ref_count(ptr)
    }

    /// Lifecycle state of the block at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be the data pointer of a block of this registry; unlike
    /// the other raw calls it may be free.
    pub unsafe fn block_state(&self, ptr: NonNull<u8>) -> BlockState {
        self.inner.block_state(ptr)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = read(&self.inner.table);
        f.debug_struct("Registry")
            .field("pools", &table.names.len())
            .field("slabs", &read(&self.inner.slabs).len())
            .field("hibernating", &self.is_hibernating())
            .finish()
    }
}

/// The process-wide registry, created on first use.
pub fn global() -> &'static Registry {
    static GLOBAL: OnceLock<Registry> = OnceLock::new();
    GLOBAL.get_or_init(Registry::new)
}

impl RegistryInner {
    /// Adds a pool to the arena. A duplicate name is fatal.
    pub(crate) fn register(
        &self,
        name: &str,
        kind: PoolKind,
        parent: Option<PoolId>,
        object_size: usize,
        block_size: usize,
    ) -> Arc<Pool> {
        let mut table = write(&self.table);
        if table.names.contains_key(name) {
            fatal!("pool name '{name}' is already in use");
        }
        let id = u32::try_from(table.arena.len())
            .map(PoolId)
            .unwrap_or_else(|_| fatal!("pool arena is full; cannot create '{name}'"));
        let pool = Arc::new(Pool::new(id, name, kind, parent, object_size, block_size));
        table.arena.push(Some(Arc::clone(&pool)));
        table.names.insert(name.to_owned(), id);
        self.change_count.fetch_add(1, Ordering::AcqRel);
        pool
    }

    /// Removes a pool from the arena; its id is never handed out again.
    pub(crate) fn unregister(&self, pool: &Pool) {
        let mut table = write(&self.table);
        if let Some(slot) = table.arena.get_mut(pool.id.0 as usize) {
            *slot = None;
        }
        table.names.remove(&pool.name);
        self.change_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pool(&self, id: PoolId) -> Option<Arc<Pool>> {
        read(&self.table)
            .arena
            .get(id.0 as usize)
            .and_then(|slot| slot.clone())
    }

    /// Every live pool in id order.
    pub(crate) fn all_pools(&self) -> Vec<Arc<Pool>> {
        read(&self.table).arena.iter().flatten().cloned().collect()
    }

    /// `pool` and its ancestors, root first.
    pub(crate) fn ancestry(&self, pool: &Arc<Pool>, op: &str) -> Vec<Arc<Pool>> {
        let table = read(&self.table);
        let mut chain = vec![Arc::clone(pool)];
        let mut parent = pool.parent;
        while let Some(id) = parent {
            let Some(p) = table.arena.get(id.0 as usize).and_then(|slot| slot.clone()) else {
                fatal!("{op}: parent {id} of pool '{}' no longer exists", pool.name);
            };
            parent = p.parent;
            chain.push(p);
        }
        chain.reverse();
        chain
    }

    pub(crate) fn ensure_awake(&self, op: &str) {
        if self.hibernating.load(Ordering::Acquire) {
            fatal!("{op} called while pools are hibernating");
        }
    }

    /// Flips the hibernation flag, returning the previous value.
    pub(crate) fn set_hibernating(&self, on: bool) -> bool {
        self.hibernating.swap(on, Ordering::AcqRel)
    }

    /// Grows a root dynamic pool by a fresh slab of `count` blocks.
    pub(crate) fn grow(&self, pool: &Pool, state: &mut PoolState, count: usize) {
        let slab = Slab::allocate(count, pool.block_size);
        self.adopt_slab(pool, state, slab);
        debug!(pool = %pool.name, added = count, total = state.total, "allocated slab");
    }

    /// Carves `slab` into free blocks of `pool` and records its address range.
    pub(crate) fn adopt_slab(&self, pool: &Pool, state: &mut PoolState, slab: Slab) {
        let headers = slab.carve(pool.block_size, pool.id);
        for &header in &headers {
            // SAFETY: freshly carved blocks of `pool`.
            unsafe { pool.arm_guards(header) };
        }
        write(&self.slabs).insert(slab.addr(), slab.len());
        // SAFETY: the headers were just formatted and belong to no list yet.
        unsafe { state.free.extend_sorted(&headers) };
        state.total += headers.len();
        state.slabs.push(slab);
    }

    /// Maps a data pointer back to its pool and header. Any pointer that
    /// is not the start of a formatted block inside a slab is fatal.
    pub(crate) fn locate(&self, data: NonNull<u8>, op: &str) -> (Arc<Pool>, NonNull<BlockHeader>) {
        let header = BlockHeader::header_addr(data)
            .filter(|&h| self.in_slab(h as usize))
            .and_then(NonNull::new)
            .unwrap_or_else(|| fatal!("{op}: {data:p} is not a block from this registry"));
        // SAFETY: in_slab checked the whole header lies in live slab memory.
        let h = unsafe { header.as_ref() };
        if !h.is_formatted() {
            fatal!("{op}: {data:p} does not point at the start of a block");
        }
        let id = h.pool();
        let pool = self
            .pool(id)
            .unwrap_or_else(|| fatal!("{op}: block {data:p} belongs to deleted pool {id}"));
        (pool, header)
    }

    fn in_slab(&self, addr: usize) -> bool {
        read(&self.slabs)
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, &len)| addr + DATA_OFFSET + MIN_OBJECT_SIZE <= base + len)
    }

    pub(crate) fn add_ref(&self, data: NonNull<u8>) {
        self.ensure_awake("add_ref");
        let (pool, header) = self.locate(data, "add_ref");
        // SAFETY: `locate` validated the header.
        let h = unsafe { header.as_ref() };
        let _state = pool.lock();
        match h.state() {
            BlockState::Allocated(n) => h.set_state(BlockState::Allocated(n + 1)),
            state => fatal!(
                "add_ref: block {data:p} of pool '{}' is not allocated ({state:?})",
                pool.name
            ),
        }
    }

    pub(crate) fn block_state(&self, data: NonNull<u8>) -> BlockState {
        let (_pool, header) = self.locate(data, "block_state");
        // SAFETY: `locate` validated the header.
        unsafe { header.as_ref() }.state()
    }

    pub(crate) fn ref_count(&self, data: NonNull<u8>) -> usize {
        match self.block_state(data) {
            BlockState::Allocated(n) => n,
            BlockState::Free | BlockState::Destructing => 0,
        }
    }

    /// Drops one reference. The destructor runs with no lock held so it
    /// may freely allocate, release or look pools up.
    pub(crate) fn release(&self, data: NonNull<u8>) {
        self.ensure_awake("release");
        let (pool, header) = self.locate(data, "release");
        // SAFETY: `locate` validated the header.
        let h = unsafe { header.as_ref() };

        let mut state = pool.lock();
        match h.state() {
            BlockState::Allocated(1) => {}
            BlockState::Allocated(n) => {
                h.set_state(BlockState::Allocated(n - 1));
                return;
            }
            BlockState::Free => fatal!(
                "release: block {data:p} of pool '{}' is already free",
                pool.name
            ),
            BlockState::Destructing => fatal!(
                "release: block {data:p} of pool '{}' released during its own destruction",
                pool.name
            ),
        }

        if let Some(destructor) = state.destructor.clone() {
            h.set_state(BlockState::Destructing);
            drop(state);
            // SAFETY: the block stays allocated until it is pushed below and
            // no other reference remains.
            let object = unsafe { std::slice::from_raw_parts_mut(data.as_ptr(), pool.object_size) };
            destructor(object);
            state = pool.lock();
        }

        pool.check_guards(header, "release");
        h.set_state(BlockState::Free);
        // SAFETY: the block left every list when it was allocated.
        unsafe { state.free.push(header) };
        state.in_use -= 1;
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
