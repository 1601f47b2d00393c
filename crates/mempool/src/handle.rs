// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Reference-counted block handle.
//!
//! [`Block`] owns one reference to a pool object. Cloning it adds a
//! reference; dropping it releases one. When the last reference goes, the
//! pool's destructor runs and the block returns to its free list.

use crate::block::BlockHeader;
use crate::pool::PoolRef;
use crate::registry::RegistryInner;
use crate::Registry;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;

/// One reference to an allocated pool object.
///
/// # Example
/// ```
/// use mempool::Registry;
///
/// let registry = Registry::new();
/// let pool = registry.create_pool("Colors", 12).expand(1);
///
/// let mut color = pool.try_alloc().unwrap();
/// color.get_mut().unwrap()[0] = 0xff;
///
/// let shared = color.clone();
/// assert_eq!(shared.ref_count(), 2);
/// assert!(color.get_mut().is_none()); // shared, so read-only
/// assert_eq!(shared.as_slice()[0], 0xff);
/// ```
pub struct Block {
    registry: Arc<RegistryInner>,
    data: NonNull<u8>,
    size: usize,
}

impl Block {
    pub(crate) fn new(registry: Arc<RegistryInner>, header: NonNull<BlockHeader>, size: usize) -> Self {
        Self {
            registry,
            data: BlockHeader::data(header),
            size,
        }
    }

    /// Usable size in bytes: the object size of the pool that served it.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pointer to the object's first byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the block stays allocated while this handle holds a
        // reference, and writes need a unique handle (`get_mut`).
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.size) }
    }

    /// Mutable access to the object, only while this is the sole reference.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        if self.ref_count() != 1 {
            return None;
        }
        // SAFETY: a count of one means no other handle can observe the bytes.
        Some(unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.size) })
    }

    pub fn ref_count(&self) -> usize {
        self.registry.ref_count(self.data)
    }

    /// The pool that owns this block.
    pub fn pool(&self) -> PoolRef {
        let (pool, _) = self.registry.locate(self.data, "Block::pool");
        PoolRef::new(Arc::clone(&self.registry), pool.id)
    }

    /// The registry the block was allocated from.
    pub fn registry(&self) -> Registry {
        Registry {
            inner: Arc::clone(&self.registry),
        }
    }

    /// Gives up the handle without releasing its reference.
    ///
    /// Pair with [`Block::from_raw`] or [`Registry::release`].
    pub fn into_raw(self) -> NonNull<u8> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never used or dropped again, so the Arc is
        // moved out exactly once.
        drop(unsafe { std::ptr::read(&this.registry) });
        this.data
    }

    /// Rebuilds a handle from a pointer returned by [`Block::into_raw`].
    ///
    /// A pointer that is not a live block of `registry` is fatal.
    ///
    /// # Safety
    /// The caller transfers one reference it owns to the new handle.
    pub unsafe fn from_raw(registry: &Registry, ptr: NonNull<u8>) -> Block {
        let (pool, _) = registry.inner.locate(ptr, "Block::from_raw");
        Block {
            registry: Arc::clone(&registry.inner),
            data: ptr,
            size: pool.object_size,
        }
    }
}

impl Clone for Block {
    fn clone(&self) -> Self {
        self.registry.add_ref(self.data);
        Self {
            registry: Arc::clone(&self.registry),
            data: self.data,
            size: self.size,
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.registry.release(self.data);
    }
}

// A Block is a counted reference to shared bytes, like `Arc<[u8]>`: the
// bytes are only mutated through `get_mut` on the sole reference.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("data", &self.data)
            .field("size", &self.size)
            .finish()
    }
}
