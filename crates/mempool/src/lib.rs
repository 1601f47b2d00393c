// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # mempool
//!
//! Deterministic fixed-block memory pools for resource-constrained and
//! real-time targets, used in place of a general-purpose heap.
//!
//! # Key Components
//!
//! - [`Registry`]: the set of named pools. [`global()`] is the
//!   process-wide one.
//! - [`PoolRef`]: a pool handle. Allocation comes in three policies (try,
//!   force, assert), plus sub-pools, reduced pools and variable-size
//!   allocation over tiers.
//! - [`Block`]: a reference-counted object. `Clone` adds a reference;
//!   dropping the last one runs the pool's destructor and frees the block.
//! - [`PoolStats`] / [`PoolInfo`]: per-pool counters and descriptions.
//! - [`PoolLayout`]: pools declared in TOML and built in one go.
//! - [`Registry::hibernate`] / [`Registry::resume`]: compaction of free
//!   memory around a low-power state.
//!
//! # Ownership Model
//!
//! ```text
//! Registry ──► pool arena ──► Pool (mutex) ──► free list ──► slab memory
//!    ▲                                                           │
//!    └──────────── Block holds Arc<registry> ◄── data pointer ───┘
//! ```
//!
//! Every block and pool handle keeps the registry alive, so slab memory
//! is only freed once nothing can reach it. Misuse that would corrupt a
//! pool (double release, unknown pointers, deleting a busy sub-pool) is
//! not an error value: it logs a diagnostic and aborts the process.
//!
//! # Features
//!
//! - `guard-bands`: surrounds every object with [`GUARD_SIZE`] bytes of
//!   a fixed pattern, checked on each allocation and release. An overrun
//!   aborts with the name of the pool it hit.
//!
//! # Example
//! ```
//! use mempool::Registry;
//!
//! let registry = Registry::new();
//! let ids = registry.create_pool("Ids", 4).expand(100);
//!
//! let id = ids.try_alloc().unwrap();
//! assert_eq!(ids.stats().num_free, 99);
//!
//! // Releasing is automatic.
//! drop(id);
//! assert_eq!(ids.stats().num_free, 100);
//! ```

mod block;
mod config;
mod error;
mod free_list;
mod handle;
mod hibernate;
mod partition;
mod pool;
mod registry;
mod size;
mod slab;
mod stats;
mod tiered;

pub use block::{
    block_footprint, static_buffer_len, BlockState, BLOCK_ALIGN, GUARD_SIZE, HEADER_SIZE,
};
pub use config::{PoolLayout, PoolSpec, Storage, SubPoolSpec, TierSpec};
#[doc(hidden)]
pub use error::fatal_abort;
pub use error::PoolError;
pub use handle::Block;
pub use hibernate::{FreeRegion, HibernationReport};
pub use pool::{PoolKind, PoolRef};
pub use registry::{global, PoolId, Registry};
pub use size::ByteSize;
pub use stats::{PoolInfo, PoolStats};
