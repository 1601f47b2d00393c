// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types and the fatal-abort path.
//!
//! Pool failures fall into two classes:
//!
//! - Expected conditions (a pool ran dry, a layout file is malformed) are
//!   reported through [`PoolError`] or an `Option`.
//! - Usage errors (double release, unknown pointers, deleting a busy
//!   sub-pool, ...) mean the caller has already corrupted the pool's
//!   bookkeeping. Those go through [`fatal!`](crate::fatal), which logs a
//!   diagnostic naming the pool and operation and aborts the process
//!   without unwinding.

/// Recoverable errors reported by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has no free block and cannot grow.
    #[error("pool '{pool}' is exhausted ({capacity} blocks, none free)")]
    Exhausted { pool: String, capacity: usize },

    /// An object size was zero or otherwise unusable.
    #[error("invalid object size {size} for pool '{pool}': {reason}")]
    InvalidSize {
        pool: String,
        size: usize,
        reason: &'static str,
    },

    /// A pool name was referenced that does not exist.
    #[error("unknown pool '{0}'")]
    UnknownPool(String),

    /// A pool layout could not be read, parsed or validated.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Logs `message` and aborts the process.
///
/// Called through [`fatal!`](crate::fatal); never unwinds.
#[doc(hidden)]
#[cold]
pub fn fatal_abort(message: &str) -> ! {
    tracing::error!(target: "mempool", "{message}");
    eprintln!("mempool: FATAL: {message}");
    std::process::abort()
}

/// Aborts the process with a formatted diagnostic.
///
/// Used for pool misuse that would otherwise corrupt allocator state.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = ::std::format!($($arg)*);
        $crate::fatal_abort(&message)
    }};
}
