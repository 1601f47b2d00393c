// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: misuse aborts the process.
//!
//! Pool misuse is fatal rather than an error value, so each case runs in a
//! child copy of this test binary. The parent re-executes itself filtered
//! to the one test, with `MEMPOOL_FATAL_CHILD` set, and checks that the
//! child died with a diagnostic on stderr.

use mempool::{PoolRef, Registry};
use std::process::Command;

const CHILD_ENV: &str = "MEMPOOL_FATAL_CHILD";

// ── Helpers ────────────────────────────────────────────────────

/// Runs `misuse` in a child process and asserts it aborted with a
/// message containing `expected`.
fn assert_fatal(test_name: &str, expected: &str, misuse: impl FnOnce()) {
    if std::env::var_os(CHILD_ENV).is_some() {
        misuse();
        // Only reached if the misuse went unnoticed; the parent sees a
        // successful exit and fails.
        return;
    }

    let exe = std::env::current_exe().expect("test binary path");
    let output = Command::new(exe)
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("spawn child test");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "'{test_name}' should have aborted; stderr:\n{stderr}"
    );
    assert!(
        stderr.contains("mempool: FATAL") && stderr.contains(expected),
        "'{test_name}' aborted without mentioning '{expected}'; stderr:\n{stderr}"
    );
}

fn ids(registry: &Registry) -> PoolRef {
    registry.create_pool("Ids", 4).expand(4)
}

// ── Reference Counting ─────────────────────────────────────────

#[test]
fn test_double_release_is_fatal() {
    assert_fatal("test_double_release_is_fatal", "already free", || {
        let registry = Registry::new();
        let ptr = ids(&registry).try_alloc().unwrap().into_raw();
        unsafe {
            registry.release(ptr);
            registry.release(ptr);
        }
    });
}

#[test]
fn test_add_ref_on_free_block_is_fatal() {
    assert_fatal("test_add_ref_on_free_block_is_fatal", "not allocated", || {
        let registry = Registry::new();
        let ptr = ids(&registry).try_alloc().unwrap().into_raw();
        unsafe {
            registry.release(ptr);
            registry.add_ref(ptr);
        }
    });
}

#[test]
fn test_release_of_foreign_pointer_is_fatal() {
    assert_fatal(
        "test_release_of_foreign_pointer_is_fatal",
        "not a block from this registry",
        || {
            let registry = Registry::new();
            let _pool = ids(&registry);
            let mut local = [0u128; 4];
            let ptr = std::ptr::NonNull::new(local.as_mut_ptr().cast::<u8>()).unwrap();
            unsafe { registry.release(ptr) };
        },
    );
}

#[test]
fn test_release_into_wrong_registry_is_fatal() {
    assert_fatal(
        "test_release_into_wrong_registry_is_fatal",
        "not a block from this registry",
        || {
            let a = Registry::new();
            let b = Registry::new();
            let ptr = ids(&a).try_alloc().unwrap().into_raw();
            unsafe { b.release(ptr) };
        },
    );
}

// ── Pool Lifecycle ─────────────────────────────────────────────

#[test]
fn test_duplicate_pool_name_is_fatal() {
    assert_fatal("test_duplicate_pool_name_is_fatal", "already in use", || {
        let registry = Registry::new();
        registry.create_pool("Ids", 4);
        registry.create_pool("Ids", 8);
    });
}

#[test]
fn test_zero_object_size_is_fatal() {
    assert_fatal("test_zero_object_size_is_fatal", "non-zero object size", || {
        Registry::new().create_pool("Empty", 0);
    });
}

#[test]
fn test_expand_static_pool_is_fatal() {
    assert_fatal("test_expand_static_pool_is_fatal", "static and cannot grow", || {
        let registry = Registry::new();
        let buffer = mempool::static_pool_buffer!(2, 8);
        registry.init_static_pool("Fixed", buffer, 2, 8).expand(1);
    });
}

#[test]
fn test_short_static_buffer_is_fatal() {
    assert_fatal("test_short_static_buffer_is_fatal", "cannot hold", || {
        let registry = Registry::new();
        let buffer = mempool::static_pool_buffer!(2, 8);
        registry.init_static_pool("Fixed", buffer, 64, 8);
    });
}

#[test]
fn test_static_buffer_taken_twice_is_fatal() {
    fn buffer() -> &'static mut [u8] {
        mempool::static_pool_buffer!(2, 8)
    }
    assert_fatal("test_static_buffer_taken_twice_is_fatal", "taken twice", || {
        let registry = Registry::new();
        registry.init_static_pool("First", buffer(), 2, 8);
        registry.init_static_pool("Second", buffer(), 2, 8);
    });
}

#[test]
fn test_assert_alloc_exhaustion_is_fatal() {
    assert_fatal("test_assert_alloc_exhaustion_is_fatal", "is exhausted", || {
        let registry = Registry::new();
        let pool = ids(&registry);
        let _held: Vec<_> = (0..5).map(|_| pool.assert_alloc()).collect();
    });
}

// ── Sub-Pools and Tiers ────────────────────────────────────────

#[test]
fn test_delete_busy_sub_pool_is_fatal() {
    assert_fatal("test_delete_busy_sub_pool_is_fatal", "objects in use", || {
        let registry = Registry::new();
        let sub = ids(&registry).create_sub_pool("Ids-sub", 2);
        let _held = sub.try_alloc().unwrap();
        sub.delete_sub_pool();
    });
}

#[test]
fn test_delete_sub_pool_with_children_is_fatal() {
    assert_fatal(
        "test_delete_sub_pool_with_children_is_fatal",
        "child pools",
        || {
            let registry = Registry::new();
            let sub = ids(&registry).create_sub_pool("Ids-sub", 2);
            let _grandchild = sub.create_sub_pool("Ids-sub-sub", 1);
            sub.delete_sub_pool();
        },
    );
}

#[test]
fn test_delete_root_pool_is_fatal() {
    assert_fatal("test_delete_root_pool_is_fatal", "is not a sub-pool", || {
        let registry = Registry::new();
        ids(&registry).delete_sub_pool();
    });
}

#[test]
fn test_stale_handle_is_fatal() {
    assert_fatal("test_stale_handle_is_fatal", "stale handle", || {
        let registry = Registry::new();
        let sub = ids(&registry).create_sub_pool("Ids-sub", 1);
        let other = sub.clone();
        sub.delete_sub_pool();
        other.try_alloc();
    });
}

#[test]
fn test_oversized_reduced_pool_is_fatal() {
    assert_fatal("test_oversized_reduced_pool_is_fatal", "must be in 1..=", || {
        let registry = Registry::new();
        ids(&registry).create_reduced_pool("Ids-big", 0, 64);
    });
}

#[test]
fn test_oversized_var_alloc_is_fatal() {
    assert_fatal("test_oversized_var_alloc_is_fatal", "largest tier", || {
        let registry = Registry::new();
        let root = registry.create_pool("Strings", 266).expand(2);
        let small = root.create_reduced_pool("Strings-small", 0, 4);
        let _ = small.force_var_alloc(1000);
    });
}

#[test]
fn test_var_alloc_beyond_unsplit_tier_is_fatal() {
    assert_fatal("test_var_alloc_beyond_unsplit_tier_is_fatal", "largest tier", || {
        let registry = Registry::new();
        let root = registry.create_pool("Strings", 266).expand(2);
        // Too large to split a root block, so the tier keeps the root's size.
        let wide = root.create_reduced_pool("Strings-wide", 1, 200);
        let _ = wide.force_var_alloc(root.object_size() + 1);
    });
}

#[test]
fn test_var_alloc_through_sub_pool_of_tier_is_fatal() {
    assert_fatal(
        "test_var_alloc_through_sub_pool_of_tier_is_fatal",
        "largest tier",
        || {
            let registry = Registry::new();
            let root = registry.create_pool("Strings", 266).expand(2);
            let med = root.create_reduced_pool("Strings-medium", 0, 90);
            let reserved = med.create_sub_pool("Strings-medium-reserved", 1);
            let _ = reserved.force_var_alloc(med.object_size() + 1);
        },
    );
}

// ── Guard Bands ────────────────────────────────────────────────

#[cfg(feature = "guard-bands")]
#[test]
fn test_write_past_object_is_fatal_on_release() {
    assert_fatal(
        "test_write_past_object_is_fatal_on_release",
        "release: guard band of object",
        || {
            let registry = Registry::new();
            let frames = registry.create_pool("Frames", 20).expand(2);
            let block = frames.try_alloc().unwrap();
            let size = block.size();
            let ptr = block.into_raw();
            unsafe {
                ptr.as_ptr().add(size).write(0);
                registry.release(ptr);
            }
        },
    );
}

#[cfg(feature = "guard-bands")]
#[test]
fn test_write_before_object_is_fatal_on_release() {
    assert_fatal(
        "test_write_before_object_is_fatal_on_release",
        "in pool 'Frames' overwritten",
        || {
            let registry = Registry::new();
            let frames = registry.create_pool("Frames", 20).expand(2);
            let ptr = frames.try_alloc().unwrap().into_raw();
            unsafe {
                ptr.as_ptr().sub(1).write(0);
                registry.release(ptr);
            }
        },
    );
}

#[cfg(feature = "guard-bands")]
#[test]
fn test_write_after_release_is_fatal_on_alloc() {
    assert_fatal(
        "test_write_after_release_is_fatal_on_alloc",
        "try_alloc: guard band of object",
        || {
            let registry = Registry::new();
            let frames = registry.create_pool("Frames", 20).expand(1);
            let block = frames.try_alloc().unwrap();
            let size = block.size();
            let ptr = block.into_raw();
            unsafe {
                registry.release(ptr);
                ptr.as_ptr().add(size).write(0);
            }
            let _ = frames.try_alloc();
        },
    );
}

// ── Hibernation ────────────────────────────────────────────────

#[test]
fn test_resume_without_hibernate_is_fatal() {
    assert_fatal("test_resume_without_hibernate_is_fatal", "not hibernating", || {
        let registry = Registry::new();
        ids(&registry);
        unsafe { registry.resume() };
    });
}

#[test]
fn test_hibernate_twice_is_fatal() {
    assert_fatal("test_hibernate_twice_is_fatal", "already hibernating", || {
        let registry = Registry::new();
        ids(&registry);
        unsafe {
            registry.hibernate();
            registry.hibernate();
        }
    });
}

#[test]
fn test_alloc_while_hibernating_is_fatal() {
    assert_fatal("test_alloc_while_hibernating_is_fatal", "while pools are hibernating", || {
        let registry = Registry::new();
        let pool = ids(&registry);
        unsafe { registry.hibernate() };
        pool.try_alloc();
    });
}
