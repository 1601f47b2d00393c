// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: pool scenarios end to end.
//!
//! Each test builds its own [`Registry`] so the scenarios are independent
//! of the process-wide one and of each other.

use mempool::{Block, PoolLayout, PoolRef, Registry, HEADER_SIZE};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Helpers ────────────────────────────────────────────────────

/// Checks that every block of `pool` is free, in use or lent.
fn assert_accounted(pool: &PoolRef) {
    let stats = pool.stats();
    assert_eq!(
        stats.num_free + stats.num_in_use + stats.num_lent,
        pool.object_count(),
        "pool '{}' lost track of a block: {}",
        pool.name(),
        stats.summary()
    );
}

/// The strings tiers: 266-byte root, ~90-byte medium, ~4-byte small.
fn strings(registry: &Registry) -> (PoolRef, PoolRef, PoolRef) {
    let root = registry.create_pool("Strings", 266).expand(11);
    let med = root.create_reduced_pool("Strings-medium", 0, 90);
    let small = med.create_reduced_pool("Strings-small", 8, 4);
    (root, med, small)
}

fn data_ptr(block: &Block) -> NonNull<u8> {
    NonNull::new(block.as_ptr() as *mut u8).unwrap()
}

// ── End-to-End Scenarios ───────────────────────────────────────

#[test]
fn test_ids_pool_exhausts_and_reuses() {
    let registry = Registry::new();
    let ids = registry.create_pool("Ids", 4).expand(100);

    let mut held: Vec<Block> = (0..100).map(|_| ids.try_alloc().unwrap()).collect();
    assert!(ids.try_alloc().is_none());

    let released = held.pop().unwrap();
    let slot = released.as_ptr();
    drop(released);

    let again = ids.try_alloc().unwrap();
    assert_eq!(again.as_ptr(), slot);
    assert_eq!(ids.stats().num_in_use, 100);
    assert_eq!(ids.stats().num_overflows, 0);
}

#[test]
fn test_colors_sub_pool_reservation() {
    let registry = Registry::new();
    let colors = registry.create_pool("Colors", 12).expand(51);
    let sub = colors.create_sub_pool("Sub", 10);

    assert_eq!(colors.object_count(), 51);
    assert_eq!(colors.stats().num_free, 41);
    assert_eq!(sub.object_count(), 10);
    assert_eq!(sub.stats().num_free, 10);
    assert_accounted(&colors);
    assert_accounted(&sub);
}

#[test]
fn test_sub_pool_delete_restores_parent() {
    let registry = Registry::new();
    let colors = registry.create_pool("Colors", 12).expand(51);
    let before = registry.change_count();

    let sub = colors.create_sub_pool("Sub", 10);
    {
        let a = sub.try_alloc().unwrap();
        let _b = a.clone();
        let _c = sub.try_alloc().unwrap();
    }
    sub.delete_sub_pool();

    assert_eq!(colors.stats().num_free, 51);
    assert_eq!(colors.stats().num_lent, 0);
    assert!(registry.find_pool("Sub").is_none());
    assert_eq!(registry.change_count(), before + 2);

    // The name is free again.
    let again = colors.create_sub_pool("Sub", 51);
    assert_eq!(again.object_count(), 51);
    assert_eq!(colors.stats().num_free, 0);
}

#[test]
fn test_force_overflow_steps() {
    let registry = Registry::new();
    let pool = registry.create_pool("Events", 24).expand(5);
    pool.set_force_count(4);

    let held: Vec<Block> = (0..15).map(|_| pool.force_alloc().unwrap()).collect();

    // 10 blocks past the initial 5, in steps of 4 → 3 growth events.
    let stats = pool.stats();
    assert_eq!(stats.num_overflows, 3);
    assert_eq!(pool.object_count(), 5 + 3 * 4);
    assert_eq!(stats.num_free, 2);
    assert_eq!(stats.num_allocs, 15);
    assert_eq!(stats.max_in_use, 15);
    drop(held);
    assert_eq!(pool.stats().num_free, 17);
}

#[test]
fn test_static_pool_from_macro() {
    let registry = Registry::new();
    let buffer = mempool::static_pool_buffer!(8, 40);
    let sensors = registry.init_static_pool("Sensors", buffer, 8, 40);

    assert_eq!(sensors.object_count(), 8);
    let held: Vec<Block> = (0..8).map(|_| sensors.assert_alloc()).collect();
    assert!(held.iter().all(|b| b.size() == 40));
    assert!(sensors.try_alloc().is_none());
    assert!(sensors.force_alloc().is_err());
    drop(held);
    assert_eq!(sensors.stats().num_free, 8);
}

#[test]
fn test_static_pool_hosts_sub_pool() {
    let registry = Registry::new();
    let buffer = mempool::static_pool_buffer!(6, 16);
    let root = registry.init_static_pool("Frames", buffer, 6, 16);
    let sub = root.create_sub_pool("Frames-isr", 2);

    let _a = sub.force_alloc().unwrap();
    let _b = sub.force_alloc().unwrap();
    // The sub-pool borrows the rest of the static root, then runs dry.
    let rest: Vec<Block> = (0..4).map(|_| sub.force_alloc().unwrap()).collect();
    assert!(sub.force_alloc().is_err());
    assert_eq!(root.stats().num_lent, 6);
    drop(rest);
}

// ── Reference Counting and Destructors ─────────────────────────

#[test]
fn test_destructor_runs_once_per_object() {
    let registry = Registry::new();
    let pool = registry.create_pool("Handles", 16).expand(4);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    pool.set_destructor(move |bytes| {
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 7);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let mut block = pool.try_alloc().unwrap();
    block.get_mut().unwrap()[0] = 7;
    let copies: Vec<Block> = (0..3).map(|_| block.clone()).collect();
    assert_eq!(block.ref_count(), 4);

    drop(copies);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(block.ref_count(), 1);
    drop(block);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().num_free, 4);
}

#[test]
fn test_raw_add_ref_needs_two_releases() {
    let registry = Registry::new();
    let pool = registry.create_pool("Raw", 8).expand(1);

    let ptr = pool.try_alloc().unwrap().into_raw();
    unsafe {
        registry.add_ref(ptr);
        registry.release(ptr);
    }
    assert_eq!(pool.stats().num_in_use, 1);

    let block = unsafe { Block::from_raw(&registry, ptr) };
    assert_eq!(block.ref_count(), 1);
    assert_eq!(block.pool(), pool);
    drop(block);
    assert_eq!(pool.stats().num_in_use, 0);
}

#[test]
fn test_destructor_may_reenter_registry() {
    let registry = Registry::new();
    let nodes = registry.create_pool("Nodes", 32).expand(4);
    let names = registry.create_pool("Names", 16).expand(4);

    // Each node owns a name; destroying the node releases the name and
    // allocates a log entry from the node pool itself.
    let owned: Arc<Mutex<Vec<Block>>> = Arc::new(Mutex::new(Vec::new()));
    let logged: Arc<Mutex<Vec<Block>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let registry = registry.clone();
        let owned = Arc::clone(&owned);
        let logged = Arc::clone(&logged);
        nodes.set_destructor(move |_| {
            let names = registry.find_pool("Names").unwrap();
            drop(owned.lock().unwrap().pop());
            assert_eq!(names.stats().num_in_use, 0);
            let nodes = registry.find_pool("Nodes").unwrap();
            if let Some(entry) = nodes.try_alloc() {
                logged.lock().unwrap().push(entry);
            }
        });
    }

    let node = nodes.try_alloc().unwrap();
    owned.lock().unwrap().push(names.try_alloc().unwrap());
    drop(node);

    assert_eq!(names.stats().num_free, 4);
    assert_eq!(logged.lock().unwrap().len(), 1);
    assert_eq!(nodes.stats().num_in_use, 1);
}

// ── Tiered Allocation ──────────────────────────────────────────

#[test]
fn test_var_alloc_grants_tier_sizes() {
    let registry = Registry::new();
    let (root, med, small) = strings(&registry);

    assert!(small.object_size() >= 4 && small.object_size() < 90);
    assert!(med.object_size() >= 90 && med.object_size() < 266);
    assert_eq!(root.object_size(), 266);

    let tiny = small.force_var_alloc(4).unwrap();
    let edge = small.force_var_alloc(small.object_size()).unwrap();
    let mid = small.force_var_alloc(small.object_size() + 1).unwrap();
    let big = small.force_var_alloc(200).unwrap();
    let full = small.force_var_alloc(266).unwrap();

    assert_eq!(tiny.size(), small.object_size());
    assert_eq!(edge.size(), small.object_size());
    assert_eq!(mid.size(), med.object_size());
    assert_eq!(big.size(), 266);
    assert_eq!(full.size(), 266);
    assert_eq!(tiny.pool(), small);
    assert_eq!(mid.pool(), med);
    assert_eq!(big.pool(), root);

    unsafe {
        assert_eq!(registry.block_size(data_ptr(&mid)), med.object_size());
    }
}

#[test]
fn test_var_alloc_borrows_through_every_tier() {
    let registry = Registry::new();
    let (root, med, small) = strings(&registry);
    let per_small = med.block_footprint() / small.block_footprint();

    // Drain the small tier's reservation, then force one more.
    let mut held: Vec<Block> = (0..small.object_count())
        .map(|_| small.try_var_alloc(4).unwrap())
        .collect();
    let lent_before = root.stats().num_lent;
    let med_overflows = med.stats().num_overflows;
    held.push(small.force_var_alloc(4).unwrap());

    assert_eq!(small.stats().num_overflows, 1);
    assert_eq!(small.object_count() % per_small, 0);
    // The medium tier had nothing free, so it borrowed from the root too.
    assert_eq!(med.stats().num_overflows, med_overflows + 1);
    assert_eq!(root.stats().num_lent, lent_before + 1);
    for pool in [&root, &med, &small] {
        assert_accounted(pool);
    }
}

#[test]
fn test_try_var_alloc_does_not_promote_on_exhaustion() {
    let registry = Registry::new();
    let (_root, med, small) = strings(&registry);
    let held: Vec<Block> = (0..small.object_count())
        .map(|_| small.try_var_alloc(4).unwrap())
        .collect();

    assert!(small.try_var_alloc(4).is_none());
    assert!(med.try_alloc().is_none());
    drop(held);
    assert!(small.try_var_alloc(4).is_some());
}

// ── Layouts ────────────────────────────────────────────────────

const LAYOUT: &str = r#"
[[pool]]
name = "Strings"
object_size = 266
blocks = 11
force_count = 3

[[pool.sub_pool]]
name = "Strings-reserved"
blocks = 2

[[pool.tier]]
name = "Strings-medium"
object_size = 90

[[pool.tier.tier]]
name = "Strings-small"
object_size = 4
reserved = 8

[[pool]]
name = "Sensors"
object_size = "1K"
blocks = 4
storage = "static"
"#;

#[test]
fn test_layout_builds_pools() {
    let registry = Registry::new();
    let layout = PoolLayout::from_toml(LAYOUT).unwrap();
    let pools = layout.build(&registry).unwrap();

    assert_eq!(pools.len(), 5);
    let strings = &pools["Strings"];
    assert_eq!(strings.force_count(), 3);
    assert_eq!(strings.object_count(), 11);
    assert_eq!(pools["Strings-reserved"].object_count(), 2);
    assert_eq!(pools["Sensors"].object_size(), 1024);
    assert_eq!(pools["Sensors"].kind(), mempool::PoolKind::Static);

    let small = &pools["Strings-small"];
    let block = small.force_var_alloc(200).unwrap();
    assert_eq!(block.size(), 266);
    assert!(small.block_footprint() >= 4 + HEADER_SIZE);

    // Building twice into the same registry is refused, not fatal.
    assert!(layout.build(&registry).is_err());
}

// ── Property: Accounting Never Drifts ──────────────────────────

#[test]
fn test_accounting_invariant_under_churn() {
    let registry = Registry::new();
    let (root, med, small) = strings(&registry);
    let sub = root.create_sub_pool("Strings-sub", 3);
    let pools = [root.clone(), med.clone(), small.clone(), sub.clone()];

    // Small deterministic LCG so the sequence is reproducible.
    let mut seed: u64 = 0x5eed;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as usize
    };

    let mut held: Vec<Block> = Vec::new();
    for _ in 0..2000 {
        let pick = next();
        if held.is_empty() || pick % 3 != 0 {
            let pool = &pools[pick % pools.len()];
            let block = match pick % 5 {
                0 => pool.try_alloc(),
                _ => pool.force_alloc().ok(),
            };
            held.extend(block);
        } else {
            let victim = pick % held.len();
            held.swap_remove(victim);
        }
        if held.len() > 64 {
            held.truncate(16);
        }
        for pool in &pools {
            assert_accounted(pool);
        }
    }
    drop(held);
    for pool in &pools {
        assert_eq!(pool.stats().num_in_use, 0);
        assert_accounted(pool);
    }
}

#[test]
fn test_pool_listing_serializes() {
    let registry = Registry::new();
    let (_root, _med, _small) = strings(&registry);
    let infos = registry.pools();
    assert_eq!(infos.len(), 3);

    let json = serde_json::to_value(&infos).unwrap();
    assert_eq!(json[0]["name"], "Strings");
    assert_eq!(json[1]["kind"], "reduced");
    assert_eq!(json[2]["parent"], "Strings-medium");
    assert_eq!(json[2]["stats"]["num_free"], infos[2].stats.num_free);
}
