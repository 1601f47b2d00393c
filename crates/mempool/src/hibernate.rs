// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Hibernation: squeezing free blocks out of every slab before a low-power
//! state, and putting everything back afterwards.
//!
//! ```text
//!   before   │ A │ f │ f │ B │ f │ C │
//!   after    │ A │ B │ C │ ░░░░░░░░░ │  ← reported free region
//! ```
//!
//! In-use memory is moved down over the free runs of each slab. Where the
//! free runs were is recorded outside the slabs, so the freed tail may be
//! powered down. [`Registry::resume`] moves the in-use memory back to its
//! original addresses and rebuilds the free lists.

use crate::block::BlockHeader;
use crate::pool::Pool;
use crate::registry::PoolId;
use crate::{fatal, Registry};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use tracing::info;

/// A byte range `[start, end)` whose contents are not needed until
/// [`Registry::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FreeRegion {
    pub start: usize,
    pub end: usize,
}

impl FreeRegion {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// What [`Registry::hibernate`] freed up: one region per slab that had
/// free blocks.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HibernationReport {
    pub regions: Vec<FreeRegion>,
}

impl HibernationReport {
    /// The single largest reclaimable range.
    pub fn largest(&self) -> Option<FreeRegion> {
        self.regions.iter().copied().max_by_key(FreeRegion::len)
    }

    pub fn reclaimable_bytes(&self) -> usize {
        self.regions.iter().map(FreeRegion::len).sum()
    }
}

/// Layout of every slab as it was before compaction.
#[derive(Debug)]
pub(crate) struct HibernationImage {
    slabs: Vec<SlabImage>,
}

#[derive(Debug)]
struct SlabImage {
    root: PoolId,
    /// Index into the root pool's slab list.
    slab: usize,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    /// Bytes that must survive: allocated blocks, lent blocks' remainders.
    Live { len: usize },
    /// `count` adjacent free blocks of one pool.
    Free {
        pool: PoolId,
        block_size: usize,
        count: usize,
    },
}

/// Splits `[base, base + len)` into live and free segments. `free` holds
/// (address, pool, block size) triples sorted by address, all in range.
fn segment(base: usize, len: usize, free: &[(usize, PoolId, usize)]) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut cursor = base;
    for &(addr, pool, block_size) in free {
        if addr > cursor {
            segments.push(Segment::Live { len: addr - cursor });
        }
        match segments.last_mut() {
            Some(Segment::Free {
                pool: p,
                block_size: b,
                count,
            }) if *p == pool && *b == block_size && addr == cursor => *count += 1,
            _ => segments.push(Segment::Free {
                pool,
                block_size,
                count: 1,
            }),
        }
        cursor = addr + block_size;
    }
    if cursor < base + len {
        segments.push(Segment::Live {
            len: base + len - cursor,
        });
    }
    segments
}

/// Moves live segments down to the start of the slab. Returns the number
/// of bytes they occupy afterwards.
///
/// # Safety
/// `base` must be valid for reads and writes over every segment.
unsafe fn compact(base: NonNull<u8>, segments: &[Segment]) -> usize {
    let (mut src, mut dst) = (0, 0);
    for segment in segments {
        match *segment {
            Segment::Live { len } => {
                if src != dst {
                    ptr::copy(base.as_ptr().add(src), base.as_ptr().add(dst), len);
                }
                src += len;
                dst += len;
            }
            Segment::Free {
                block_size, count, ..
            } => src += block_size * count,
        }
    }
    dst
}

/// Reverses [`compact`] and returns every free block header, reformatted,
/// with its pool.
///
/// # Safety
/// As for [`compact`], on the same segments.
unsafe fn decompact(base: NonNull<u8>, segments: &[Segment]) -> Vec<(PoolId, NonNull<BlockHeader>)> {
    // (original offset, compacted offset, len) of every live run.
    let mut moves = Vec::new();
    let mut free = Vec::new();
    let (mut orig, mut packed) = (0, 0);
    for segment in segments {
        match *segment {
            Segment::Live { len } => {
                moves.push((orig, packed, len));
                orig += len;
                packed += len;
            }
            Segment::Free {
                pool,
                block_size,
                count,
            } => {
                for i in 0..count {
                    free.push((pool, orig + i * block_size));
                }
                orig += block_size * count;
            }
        }
    }

    // Live runs only ever move up, so copy the highest first.
    for &(orig, packed, len) in moves.iter().rev() {
        if orig != packed {
            ptr::copy(base.as_ptr().add(packed), base.as_ptr().add(orig), len);
        }
    }

    free.into_iter()
        .map(|(pool, offset)| {
            let at = NonNull::new_unchecked(base.as_ptr().add(offset));
            (pool, BlockHeader::format(at, pool))
        })
        .collect()
}

impl Registry {
    /// Compacts every slab and reports the memory that is free until
    /// [`resume`](Self::resume).
    ///
    /// Until then any allocation, release or add-ref is fatal, and so is a
    /// second `hibernate`.
    ///
    /// # Safety
    /// No other thread may use the registry, and no pointer or slice into
    /// pool memory (including [`Block::as_slice`](crate::Block::as_slice))
    /// may be dereferenced until `resume` returns: in-use objects move.
    pub unsafe fn hibernate(&self) -> HibernationReport {
        if self.inner.set_hibernating(true) {
            fatal!("hibernate: pools are already hibernating");
        }
        let pools = self.inner.all_pools();
        let mut states: Vec<_> = pools.iter().map(|p| p.lock()).collect();

        let mut free = Vec::new();
        for (pool, state) in pools.iter().zip(states.iter_mut()) {
            let blocks = state.free.drain();
            state.dormant = blocks.len();
            free.extend(
                blocks
                    .into_iter()
                    .map(|h| (h.as_ptr() as usize, pool.id, pool.block_size)),
            );
        }
        free.sort_unstable_by_key(|&(addr, _, _)| addr);

        let mut image = HibernationImage { slabs: Vec::new() };
        let mut report = HibernationReport::default();
        for (pool, state) in pools.iter().zip(states.iter()) {
            for (index, slab) in state.slabs.iter().enumerate() {
                let (base, end) = (slab.addr(), slab.addr() + slab.len());
                let lo = free.partition_point(|&(addr, _, _)| addr < base);
                let hi = free.partition_point(|&(addr, _, _)| addr < end);
                if lo == hi {
                    continue;
                }
                let segments = segment(base, slab.len(), &free[lo..hi]);
                let used = compact(slab.base(), &segments);
                report.regions.push(FreeRegion {
                    start: base + used,
                    end,
                });
                image.slabs.push(SlabImage {
                    root: pool.id,
                    slab: index,
                    segments,
                });
            }
        }

        *self.inner.image.lock().unwrap_or_else(|e| e.into_inner()) = Some(image);
        info!(
            regions = report.regions.len(),
            reclaimable = report.reclaimable_bytes(),
            "pools hibernated"
        );
        report
    }

    /// Undoes [`hibernate`](Self::hibernate): in-use objects return to
    /// their original addresses and every free list is rebuilt.
    ///
    /// Calling it without a preceding `hibernate` is fatal.
    ///
    /// # Safety
    /// Same contract as [`hibernate`](Self::hibernate), up to the point
    /// this call returns.
    pub unsafe fn resume(&self) {
        let Some(image) = self.inner.image.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            fatal!("resume: pools are not hibernating");
        };
        let pools = self.inner.all_pools();
        let mut states: Vec<_> = pools.iter().map(|p| p.lock()).collect();
        let index_of = |id: PoolId| -> usize {
            pools
                .binary_search_by_key(&id, |p: &Arc<Pool>| p.id)
                .unwrap_or_else(|_| fatal!("resume: pool {id} vanished while hibernating"))
        };

        let mut freed: Vec<Vec<NonNull<BlockHeader>>> = vec![Vec::new(); pools.len()];
        for slab_image in &image.slabs {
            let root = index_of(slab_image.root);
            let Some(slab) = states[root].slabs.get(slab_image.slab) else {
                fatal!("resume: slab {} of pool {} is missing", slab_image.slab, slab_image.root);
            };
            for (pool, header) in decompact(slab.base(), &slab_image.segments) {
                freed[index_of(pool)].push(header);
            }
        }

        let mut restored = 0;
        for ((pool, state), mut blocks) in pools.iter().zip(states.iter_mut()).zip(freed) {
            for &header in &blocks {
                pool.arm_guards(header);
            }
            blocks.sort_unstable_by_key(|h| h.as_ptr() as usize);
            restored += blocks.len();
            state.free.extend_sorted(&blocks);
            state.dormant = 0;
        }
        drop(states);

        self.inner.set_hibernating(false);
        info!(restored, "pools resumed");
    }
}
