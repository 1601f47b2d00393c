// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `mempool hibernate` command: fragment, hibernate, resume, verify.
//!
//! Allocates `fill`% of every pool, tags each object with a byte pattern,
//! releases every other one, and then runs a hibernate/resume cycle. The
//! reclaimable ranges are printed, and every surviving object is checked
//! against its pattern afterwards.

use anyhow::ensure;
use mempool::{Block, HibernationReport, PoolLayout, Registry};
use tracing::info;

pub fn execute(layout: &PoolLayout, fill: u8, json: bool) -> anyhow::Result<()> {
    let registry = Registry::new();
    layout.build(&registry)?;

    let live = fragment(&registry, fill);
    // SAFETY: this thread is the only user of `registry`, and no object is
    // touched until `resume` returns.
    let report = unsafe { registry.hibernate() };
    unsafe { registry.resume() };
    let verified = verify(&live)?;
    info!(verified, regions = report.regions.len(), "hibernate cycle complete");

    if json {
        let doc = serde_json::json!({
            "report": report,
            "largest": report.largest(),
            "reclaimable_bytes": report.reclaimable_bytes(),
            "verified_objects": verified,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    super::banner("Hibernation");
    println!("  Fill:             {fill}% then every other object released");
    println!("  Objects verified: {verified}");
    println!();
    print_report(&report);
    Ok(())
}

/// Allocates `fill`% of each pool's blocks and keeps every other one,
/// each tagged with a byte pattern.
fn fragment(registry: &Registry, fill: u8) -> Vec<(Block, u8)> {
    let mut live = Vec::new();
    for (index, info) in registry.pools().iter().enumerate() {
        let Some(pool) = registry.find_pool(&info.name) else {
            continue;
        };
        let wanted = info.stats.num_free * usize::from(fill) / 100;
        for i in 0..wanted {
            let Some(mut block) = pool.try_alloc() else {
                break;
            };
            let tag = (index * 31 + i) as u8 | 1;
            if let Some(bytes) = block.get_mut() {
                bytes.fill(tag);
            }
            if i % 2 == 0 {
                live.push((block, tag));
            }
        }
    }
    live
}

fn verify(live: &[(Block, u8)]) -> anyhow::Result<usize> {
    for (block, tag) in live {
        ensure!(
            block.as_slice().iter().all(|b| b == tag),
            "object at {:p} in pool '{}' changed across hibernation",
            block.as_ptr(),
            block.pool().name()
        );
    }
    Ok(live.len())
}

fn print_report(report: &HibernationReport) {
    println!("  Reclaimable regions");
    println!("  {:<20} {:<20} {:>10}", "Start", "End", "Bytes");
    println!("  {}", "-".repeat(52));
    for region in &report.regions {
        println!(
            "  {:<20} {:<20} {:>10}",
            format!("{:#x}", region.start),
            format!("{:#x}", region.end),
            region.len()
        );
    }
    println!();
    println!("  Total reclaimable: {} bytes", report.reclaimable_bytes());
    if let Some(largest) = report.largest() {
        println!(
            "  Largest range:     {:#x}..{:#x} ({} bytes)",
            largest.start,
            largest.end,
            largest.len()
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_preserves_fragmented_objects() {
        let registry = Registry::new();
        super::super::load_layout(None)
            .unwrap()
            .build(&registry)
            .unwrap();

        let live = fragment(&registry, 60);
        assert!(!live.is_empty());
        let report = unsafe { registry.hibernate() };
        unsafe { registry.resume() };

        assert!(report.reclaimable_bytes() > 0);
        assert_eq!(verify(&live).unwrap(), live.len());
    }
}
