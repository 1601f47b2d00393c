// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Raw block storage.
//!
//! A [`Slab`] is one contiguous run of memory carved into equal blocks for
//! a root pool. Dynamic pools get a new zeroed slab per growth step; static
//! pools get exactly one slab over caller-provided `'static` storage.

use crate::block::{BlockHeader, BLOCK_ALIGN};
use crate::registry::PoolId;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// A contiguous run of block storage owned by a root pool.
pub(crate) struct Slab {
    base: NonNull<u8>,
    len: usize,
    /// `Some` when the slab was heap-allocated and must be freed on drop.
    layout: Option<Layout>,
}

// Slabs are plain memory; all access is serialised by the owning pool.
unsafe impl Send for Slab {}

impl Slab {
    /// Allocates a zeroed slab of `count` blocks of `block_size` bytes.
    pub(crate) fn allocate(count: usize, block_size: usize) -> Slab {
        let len = count
            .checked_mul(block_size)
            .unwrap_or_else(|| crate::fatal!("slab of {count} x {block_size} bytes overflows"));
        let layout = Layout::from_size_align(len, BLOCK_ALIGN)
            .unwrap_or_else(|_| crate::fatal!("invalid slab layout ({len} bytes)"));
        // SAFETY: callers never request zero blocks, so the layout is non-empty.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        Slab {
            base,
            len,
            layout: Some(layout),
        }
    }

    /// Wraps caller storage, skipping leading bytes up to `BLOCK_ALIGN`.
    ///
    /// Returns `None` when the aligned remainder is shorter than
    /// `count * block_size`.
    pub(crate) fn from_static(
        buffer: &'static mut [u8],
        count: usize,
        block_size: usize,
    ) -> Option<Slab> {
        let needed = count.checked_mul(block_size)?;
        let offset = buffer.as_ptr().align_offset(BLOCK_ALIGN);
        let usable = buffer.len().checked_sub(offset)?;
        if usable < needed || needed == 0 {
            return None;
        }
        let base = NonNull::new(buffer[offset..].as_mut_ptr())?;
        Some(Slab {
            base,
            len: needed,
            layout: None,
        })
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_static(&self) -> bool {
        self.layout.is_none()
    }

    /// Formats every block in the slab as free and owned by `pool`,
    /// returning the headers in address order.
    pub(crate) fn carve(&self, block_size: usize, pool: PoolId) -> Vec<NonNull<BlockHeader>> {
        (0..self.len / block_size)
            .map(|i| {
                // SAFETY: i * block_size + block_size <= len, and the base is
                // BLOCK_ALIGN-aligned while block_size is a multiple of it.
                unsafe {
                    let at = NonNull::new_unchecked(self.base.as_ptr().add(i * block_size));
                    BlockHeader::format(at, pool)
                }
            })
            .collect()
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `Slab::allocate` with this exact layout.
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("static", &self.is_static())
            .finish()
    }
}

/// Declares zeroed `'static` storage for a static pool of `$count` objects
/// of `$object_size` bytes and evaluates to a `&'static mut [u8]` over it.
///
/// Each expansion site owns one buffer. Evaluating the same site twice is
/// fatal, since the buffer can only back one pool.
///
/// ```
/// let registry = mempool::Registry::new();
/// let buffer = mempool::static_pool_buffer!(16, 24);
/// let pool = registry.init_static_pool("Sensors", buffer, 16, 24);
/// assert_eq!(pool.object_count(), 16);
/// ```
#[macro_export]
macro_rules! static_pool_buffer {
    ($count:expr, $object_size:expr) => {{
        const LEN: usize = $crate::static_buffer_len($count, $object_size);
        static mut BUFFER: [u8; LEN] = [0; LEN];
        static TAKEN: ::std::sync::atomic::AtomicBool = ::std::sync::atomic::AtomicBool::new(false);
        if TAKEN.swap(true, ::std::sync::atomic::Ordering::AcqRel) {
            $crate::fatal!(
                "static pool buffer declared at {}:{} taken twice",
                ::std::file!(),
                ::std::line!()
            );
        }
        // SAFETY: TAKEN hands out the only reference to BUFFER.
        let buffer: &'static mut [u8] = unsafe { &mut *::std::ptr::addr_of_mut!(BUFFER) };
        buffer
    }};
}
