// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pool statistics for diagnostics and capacity tuning.
//!
//! [`PoolStats`] is a point-in-time snapshot of one pool: how often it was
//! allocated from, how often it had to grow, and how its blocks are split
//! between free, in-use and lent to child pools. A pool whose overflow
//! count keeps climbing was sized too small.

use crate::pool::PoolKind;
use crate::registry::PoolId;

/// Snapshot of a pool's usage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Successful allocations since creation or the last reset.
    pub num_allocs: u64,
    /// Growth events. A pool counts one each time
    /// [`force_alloc`](crate::PoolRef::force_alloc) finds it empty, and one
    /// each time it has to grow to fill a child pool's reservation or
    /// borrowing (including [`create_sub_pool`](crate::PoolRef::create_sub_pool)
    /// and [`expand`](crate::PoolRef::expand) on a child). Expanding the
    /// pool itself never counts.
    pub num_overflows: u64,
    /// Blocks on the free list. Blocks lent to child pools are not free.
    pub num_free: usize,
    /// Blocks currently allocated to callers.
    pub num_in_use: usize,
    /// High-water mark of `num_in_use`.
    pub max_in_use: usize,
    /// Blocks reserved by sub-pools and reduced pools.
    pub num_lent: usize,
}

impl PoolStats {
    /// Returns a one-line human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} allocs, {} overflows, {} free, {} in use (max {}), {} lent",
            self.num_allocs,
            self.num_overflows,
            self.num_free,
            self.num_in_use,
            self.max_in_use,
            self.num_lent,
        )
    }
}

/// Description of one pool, as listed by [`Registry::pools`](crate::Registry::pools).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolInfo {
    pub id: PoolId,
    pub name: String,
    pub kind: PoolKind,
    /// Name of the pool this one borrows from.
    pub parent: Option<String>,
    pub object_size: usize,
    /// Full block stride including the header.
    pub block_size: usize,
    pub object_count: usize,
    pub force_count: usize,
    pub stats: PoolStats,
}

/// Cumulative counters kept inside each pool.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    num_allocs: u64,
    num_overflows: u64,
    max_in_use: usize,
}

impl Counters {
    pub(crate) fn record_alloc(&mut self, in_use: usize) {
        self.num_allocs += 1;
        if in_use > self.max_in_use {
            self.max_in_use = in_use;
        }
    }

    pub(crate) fn record_overflow(&mut self) {
        self.num_overflows += 1;
    }

    /// Clears allocations and overflows; the high-water mark survives.
    pub(crate) fn reset(&mut self) {
        self.num_allocs = 0;
        self.num_overflows = 0;
    }

    pub(crate) fn snapshot(&self, num_free: usize, num_in_use: usize, num_lent: usize) -> PoolStats {
        PoolStats {
            num_allocs: self.num_allocs,
            num_overflows: self.num_overflows,
            num_free,
            num_in_use,
            max_in_use: self.max_in_use,
            num_lent,
        }
    }
}
