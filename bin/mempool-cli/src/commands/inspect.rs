// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `mempool inspect` command: build a layout and describe its pools.
//!
//! Prints each pool's geometry (object size against block footprint),
//! capacity, and how its blocks are split between free, used and lent.

use mempool::{PoolKind, PoolLayout, Registry};

pub fn execute(layout: &PoolLayout, json: bool) -> anyhow::Result<()> {
    let registry = Registry::new();
    layout.build(&registry)?;
    let pools = registry.pools();

    if json {
        println!("{}", serde_json::to_string_pretty(&pools)?);
        return Ok(());
    }

    super::banner("Layout Inspector");
    super::print_pool_table(&pools);

    // ── Storage ────────────────────────────────────────────────
    let mut heap = 0;
    let mut fixed = 0;
    for info in pools.iter().filter(|p| p.parent.is_none()) {
        let bytes = info.object_count * info.block_size;
        match info.kind {
            PoolKind::Static => fixed += bytes,
            _ => heap += bytes,
        }
    }
    println!("  Storage");
    println!("   Heap slabs:     {}", kib(heap));
    println!("   Static buffers: {}", kib(fixed));
    println!();

    // ── Header Overhead ────────────────────────────────────────
    println!("  Overhead per block");
    for info in &pools {
        let overhead = info.block_size - info.object_size.min(info.block_size);
        println!(
            "   {:<24} {:>4} B  ({:.0}%)",
            info.name,
            overhead,
            overhead as f64 * 100.0 / info.block_size as f64,
        );
    }
    println!();
    Ok(())
}

fn kib(bytes: usize) -> String {
    format!("{:.1} KB", bytes as f64 / 1024.0)
}
