// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Block layout.
//!
//! Every block is a [`BlockHeader`] followed by the user object:
//!
//! ```text
//!  ┌──────────────┬──────────────────────────────┐
//!  │ BlockHeader  │ user data (object size)      │
//!  │ pool|tag|st  │ free: next-link lives here   │
//!  └──────────────┴──────────────────────────────┘
//!  ▲ block start   ▲ pointer handed to callers
//! ```
//!
//! The header records the owning pool and the block's state. The tag is
//! derived from the header's own address, which lets the registry reject
//! pointers that do not point at the start of a formatted block.
//!
//! With the `guard-bands` feature every object is also fenced by
//! [`GUARD_SIZE`] bytes of a fixed pattern on both sides. The pattern is
//! checked whenever the block is allocated or released, and a damaged
//! band aborts with the owning pool's name:
//!
//! ```text
//!  ┌────────┬───────┬──────────────────┬───────────────────┐
//!  │ header │ guard │ user data        │ guard (to block   │
//!  │        │       │                  │ end, ≥ GUARD_SIZE)│
//!  └────────┴───────┴──────────────────┴───────────────────┘
//! ```

use crate::registry::PoolId;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Alignment of every block and every user object.
pub const BLOCK_ALIGN: usize = 2 * size_of::<usize>();

/// Bytes reserved in front of each user object.
pub const HEADER_SIZE: usize = round_up(size_of::<BlockHeader>(), BLOCK_ALIGN);

/// Bytes of guard pattern on each side of the user object.
#[cfg(feature = "guard-bands")]
pub const GUARD_SIZE: usize = BLOCK_ALIGN;
/// Bytes of guard pattern on each side of the user object.
#[cfg(not(feature = "guard-bands"))]
pub const GUARD_SIZE: usize = 0;

/// Offset of the user object from the start of its block.
pub(crate) const DATA_OFFSET: usize = HEADER_SIZE + GUARD_SIZE;

const GUARD_WORD: u32 = 0xDEAD_BEEF;

/// Free blocks keep their free-list link in the data region, so no object
/// can be smaller than a link.
pub(crate) const MIN_OBJECT_SIZE: usize = size_of::<Option<NonNull<BlockHeader>>>();

const TAG_SEED: u32 = 0x6d65_6d70;
const STATE_FREE: usize = 0;
const STATE_DESTRUCTING: usize = usize::MAX;

/// Rounds `n` up to a multiple of `align` (a power of two).
pub(crate) const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Rounds `n` down to a multiple of `align` (a power of two).
pub(crate) const fn round_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

/// Full size in bytes of a block holding an object of `object_size` bytes,
/// header included.
pub const fn block_footprint(object_size: usize) -> usize {
    let payload = if object_size < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        object_size
    };
    round_up(DATA_OFFSET + payload + GUARD_SIZE, BLOCK_ALIGN)
}

/// Largest object a block of `block_size` bytes can hold.
pub(crate) const fn block_capacity(block_size: usize) -> usize {
    block_size - DATA_OFFSET - GUARD_SIZE
}

/// Number of bytes a static buffer needs to back `count` blocks of
/// `object_size`, including slack for aligning the buffer start.
pub const fn static_buffer_len(count: usize, object_size: usize) -> usize {
    count * block_footprint(object_size) + BLOCK_ALIGN
}

/// Lifecycle of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// On its pool's free list.
    Free,
    /// Handed out with the given reference count (always ≥ 1).
    Allocated(usize),
    /// Count reached zero; the destructor is running outside the pool lock.
    Destructing,
}

impl BlockState {
    fn encode(self) -> usize {
        match self {
            BlockState::Free => STATE_FREE,
            BlockState::Allocated(n) => n,
            BlockState::Destructing => STATE_DESTRUCTING,
        }
    }

    fn decode(raw: usize) -> Self {
        match raw {
            STATE_FREE => BlockState::Free,
            STATE_DESTRUCTING => BlockState::Destructing,
            n => BlockState::Allocated(n),
        }
    }
}

/// In-band header preceding every user object.
///
/// Raw add-ref and release calls read the header before taking any lock,
/// so the fields are atomic. Writes happen under the owning pool's lock.
#[repr(C)]
pub(crate) struct BlockHeader {
    pool: AtomicU32,
    tag: AtomicU32,
    state: AtomicUsize,
}

impl BlockHeader {
    /// Writes a fresh `Free` header owned by `pool` at `at`.
    ///
    /// # Safety
    /// `at` must be `BLOCK_ALIGN`-aligned and valid for writes of
    /// `HEADER_SIZE` bytes.
    pub(crate) unsafe fn format(at: NonNull<u8>, pool: PoolId) -> NonNull<BlockHeader> {
        let header = at.cast::<BlockHeader>();
        header.as_ptr().write(BlockHeader {
            pool: AtomicU32::new(pool.0),
            tag: AtomicU32::new(tag_for(at.as_ptr() as usize)),
            state: AtomicUsize::new(STATE_FREE),
        });
        header
    }

    /// Returns the user data pointer of the block starting at `header`.
    pub(crate) fn data(header: NonNull<BlockHeader>) -> NonNull<u8> {
        // SAFETY: every block is at least DATA_OFFSET + MIN_OBJECT_SIZE bytes,
        // so the data pointer stays inside the same allocation.
        unsafe { NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(DATA_OFFSET)) }
    }

    /// Address the header of the block owning `data` would live at.
    ///
    /// The result must only be dereferenced after the registry has
    /// checked it lies inside a slab.
    pub(crate) fn header_addr(data: NonNull<u8>) -> Option<*mut BlockHeader> {
        let addr = data.as_ptr() as usize;
        if addr < DATA_OFFSET || addr % BLOCK_ALIGN != 0 {
            return None;
        }
        Some(data.as_ptr().wrapping_sub(DATA_OFFSET).cast())
    }

    pub(crate) fn pool(&self) -> PoolId {
        PoolId(self.pool.load(Ordering::Acquire))
    }

    pub(crate) fn state(&self) -> BlockState {
        BlockState::decode(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BlockState) {
        self.state.store(state.encode(), Ordering::Release);
    }

    /// True if this header was formatted at its current address.
    pub(crate) fn is_formatted(&self) -> bool {
        let addr = self as *const BlockHeader as usize;
        self.tag.load(Ordering::Acquire) == tag_for(addr)
    }

    /// Erases the tag so the address is no longer accepted as a block.
    pub(crate) fn invalidate(&self) {
        let addr = self as *const BlockHeader as usize;
        self.tag.store(!tag_for(addr), Ordering::Release);
    }
}

/// Offsets, from the block start, of the two guard bands of a block.
fn guard_bands(block_size: usize, object_size: usize) -> [std::ops::Range<usize>; 2] {
    let tail = DATA_OFFSET + object_size.max(MIN_OBJECT_SIZE);
    [HEADER_SIZE..DATA_OFFSET, tail..block_size]
}

fn guard_byte(offset: usize) -> u8 {
    GUARD_WORD.to_ne_bytes()[offset % size_of::<u32>()]
}

/// Writes the guard pattern around the object of the block at `header`.
/// Does nothing without the `guard-bands` feature.
///
/// # Safety
/// `header` must start a block of `block_size` bytes that nobody else is
/// accessing.
pub(crate) unsafe fn fill_guards(
    header: NonNull<BlockHeader>,
    block_size: usize,
    object_size: usize,
) {
    if GUARD_SIZE == 0 {
        return;
    }
    let base = header.as_ptr().cast::<u8>();
    for band in guard_bands(block_size, object_size) {
        for offset in band {
            base.add(offset).write(guard_byte(offset));
        }
    }
}

/// Address of the first damaged guard byte of the block at `header`.
///
/// # Safety
/// As for [`fill_guards`].
pub(crate) unsafe fn damaged_guard(
    header: NonNull<BlockHeader>,
    block_size: usize,
    object_size: usize,
) -> Option<*const u8> {
    if GUARD_SIZE == 0 {
        return None;
    }
    let base = header.as_ptr().cast::<u8>();
    guard_bands(block_size, object_size)
        .into_iter()
        .flatten()
        .find(|&offset| base.add(offset).read() != guard_byte(offset))
        .map(|offset| base.add(offset).cast_const())
}

fn tag_for(addr: usize) -> u32 {
    let addr = addr as u64;
    ((addr ^ (addr >> 32)) as u32) ^ TAG_SEED
}
