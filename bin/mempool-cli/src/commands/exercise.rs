// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `mempool exercise` command: run a workload against every pool.
//!
//! Each round force-allocates a little more than the pool's initial
//! capacity, shares every other object, then drops everything. Leaf tiers
//! additionally get a sweep of variable-size requests. The counters each
//! pool ends up with show how often it had to overflow.

use anyhow::bail;
use mempool::{Block, PoolKind, PoolLayout, PoolRef, PoolStats, Registry};
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct Outcome {
    pool: String,
    kind: PoolKind,
    failed: usize,
    elapsed: Duration,
    stats: PoolStats,
}

pub fn execute(
    layout: &PoolLayout,
    rounds: usize,
    only: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let registry = Registry::new();
    layout.build(&registry)?;

    let targets: Vec<PoolRef> = match only {
        Some(name) => match registry.find_pool(name) {
            Some(pool) => vec![pool],
            None => bail!(mempool::PoolError::UnknownPool(name.to_owned())),
        },
        None => registry
            .pools()
            .iter()
            .filter_map(|info| registry.find_pool(&info.name))
            .collect(),
    };

    let mut outcomes = Vec::with_capacity(targets.len());
    for pool in &targets {
        pool.reset_stats();
        let started = Instant::now();
        let mut failed = fill_and_release(pool, rounds);
        if is_leaf_tier(&registry, pool) {
            failed += variable_sweep(pool, rounds);
        }
        let elapsed = started.elapsed();
        info!(pool = %pool.name(), ?elapsed, failed, "exercised pool");
        outcomes.push(Outcome {
            pool: pool.name(),
            kind: pool.kind(),
            failed,
            elapsed,
            stats: pool.stats(),
        });
    }

    if json {
        let report: Vec<_> = outcomes
            .iter()
            .map(|o| {
                serde_json::json!({
                    "pool": o.pool,
                    "kind": o.kind,
                    "failed": o.failed,
                    "elapsed_us": o.elapsed.as_micros() as u64,
                    "stats": o.stats,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    super::banner("Pool Exercise");
    println!("  Rounds per pool: {rounds}");
    println!();
    println!(
        "  {:<24} {:<9} {:>8} {:>9} {:>6} {:>8} {:>9}",
        "Pool", "Kind", "Allocs", "Overflows", "Failed", "Max used", "ns/alloc",
    );
    println!("  {}", "-".repeat(80));
    for o in &outcomes {
        let per_alloc = if o.stats.num_allocs == 0 {
            0
        } else {
            o.elapsed.as_nanos() as u64 / o.stats.num_allocs
        };
        println!(
            "  {:<24} {:<9} {:>8} {:>9} {:>6} {:>8} {:>9}",
            o.pool,
            o.kind.to_string(),
            o.stats.num_allocs,
            o.stats.num_overflows,
            o.failed,
            o.stats.max_in_use,
            per_alloc,
        );
    }
    println!();

    println!("  Final layout");
    super::print_pool_table(&registry.pools());
    Ok(())
}

/// Runs the burst workload, returning how many allocations failed.
fn fill_and_release(pool: &PoolRef, rounds: usize) -> usize {
    let burst = pool.object_count().max(4) + 2;
    let mut failed = 0;
    let mut held: Vec<Block> = Vec::with_capacity(burst);
    for round in 0..rounds {
        for _ in 0..burst {
            match pool.force_alloc() {
                Ok(mut block) => {
                    if let Some(bytes) = block.get_mut() {
                        bytes.fill(round as u8);
                    }
                    held.push(block);
                }
                Err(e) => {
                    debug!(error = %e, "allocation failed");
                    failed += 1;
                    break;
                }
            }
        }
        let shared: Vec<Block> = held.iter().step_by(2).cloned().collect();
        held.clear();
        drop(shared);
    }
    failed
}

/// Variable-size requests from 1 byte up to the root's object size.
fn variable_sweep(pool: &PoolRef, rounds: usize) -> usize {
    let largest = root_of(pool).object_size();
    let step = (largest / 16).max(1);
    let mut failed = 0;
    for _ in 0..rounds {
        let held: Vec<Block> = (1..=largest)
            .step_by(step)
            .filter_map(|size| match pool.force_var_alloc(size) {
                Ok(block) => Some(block),
                Err(e) => {
                    debug!(size, error = %e, "variable allocation failed");
                    failed += 1;
                    None
                }
            })
            .collect();
        drop(held);
    }
    failed
}

fn root_of(pool: &PoolRef) -> PoolRef {
    let mut root = pool.clone();
    while let Some(parent) = root.parent() {
        root = parent;
    }
    root
}

/// A reduced pool nothing else is carved from.
fn is_leaf_tier(registry: &Registry, pool: &PoolRef) -> bool {
    let name = pool.name();
    pool.kind() == PoolKind::Reduced
        && !registry
            .pools()
            .iter()
            .any(|info| info.parent.as_deref() == Some(name.as_str()))
}
