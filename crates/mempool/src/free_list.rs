// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Intrusive free list.
//!
//! A free block's data region is unused, so the list stores its `next`
//! link there. Push and pop are O(1) and never allocate.

use crate::block::BlockHeader;
use std::ptr::NonNull;

type Link = Option<NonNull<BlockHeader>>;

/// Singly-linked list of free blocks belonging to one pool.
pub(crate) struct FreeList {
    head: Link,
    len: usize,
}

// The list only ever holds pointers into slabs owned by the registry and
// is only touched under its pool's mutex.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Pushes a formatted free block.
    ///
    /// # Safety
    /// `header` must start a formatted block that is not already on any
    /// free list and whose data region holds at least one link.
    pub(crate) unsafe fn push(&mut self, header: NonNull<BlockHeader>) {
        let link = BlockHeader::data(header).cast::<Link>();
        link.as_ptr().write(self.head);
        self.head = Some(header);
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<BlockHeader>> {
        let header = self.head?;
        // SAFETY: every pushed block stores a valid link in its data region
        // for as long as it stays on the list.
        self.head = unsafe { BlockHeader::data(header).cast::<Link>().as_ptr().read() };
        self.len -= 1;
        Some(header)
    }

    /// Empties the list and returns its blocks in list order.
    pub(crate) fn drain(&mut self) -> Vec<NonNull<BlockHeader>> {
        let mut blocks = Vec::with_capacity(self.len);
        while let Some(header) = self.pop() {
            blocks.push(header);
        }
        blocks
    }

    /// Empties the list and returns its blocks sorted by address.
    pub(crate) fn drain_sorted(&mut self) -> Vec<NonNull<BlockHeader>> {
        let mut blocks = self.drain();
        blocks.sort_unstable_by_key(|h| h.as_ptr() as usize);
        blocks
    }

    /// Pushes `blocks` so that the lowest address is popped first.
    ///
    /// # Safety
    /// Same as [`FreeList::push`] for every element.
    pub(crate) unsafe fn extend_sorted(&mut self, blocks: &[NonNull<BlockHeader>]) {
        for &header in blocks.iter().rev() {
            self.push(header);
        }
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList").field("len", &self.len).finish()
    }
}
