// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Benchmarks for the allocation policies against the system allocator.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mempool::Registry;

fn bench_alloc_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_release");
    for size in [16usize, 266, 4096] {
        let registry = Registry::new();
        let pool = registry.create_pool(&format!("bench-{size}"), size).expand(64);

        group.bench_with_input(BenchmarkId::new("try_alloc", size), &size, |b, _| {
            b.iter(|| black_box(pool.try_alloc()))
        });
        group.bench_with_input(BenchmarkId::new("force_alloc", size), &size, |b, _| {
            b.iter(|| black_box(pool.force_alloc().ok()))
        });
        group.bench_with_input(BenchmarkId::new("box", size), &size, |b, &size| {
            b.iter(|| black_box(vec![0u8; size].into_boxed_slice()))
        });
    }
    group.finish();
}

fn bench_clone_release(c: &mut Criterion) {
    let registry = Registry::new();
    let pool = registry.create_pool("bench-clone", 64).expand(1);
    let block = pool.try_alloc().unwrap();
    c.bench_function("clone_release", |b| b.iter(|| black_box(block.clone())));
}

fn bench_var_alloc(c: &mut Criterion) {
    let registry = Registry::new();
    let root = registry.create_pool("bench-strings", 266).expand(64);
    let medium = root.create_reduced_pool("bench-strings-medium", 16, 90);
    let small = medium.create_reduced_pool("bench-strings-small", 16, 4);

    let mut group = c.benchmark_group("var_alloc");
    for request in [4usize, 90, 200] {
        group.bench_with_input(BenchmarkId::from_parameter(request), &request, |b, &request| {
            b.iter(|| black_box(small.force_var_alloc(request).ok()))
        });
    }
    group.finish();
}

fn bench_sub_pool_lifecycle(c: &mut Criterion) {
    let registry = Registry::new();
    let root = registry.create_pool("bench-root", 64).expand(256);
    c.bench_function("sub_pool_create_delete", |b| {
        b.iter(|| root.create_sub_pool("bench-sub", 32).delete_sub_pool())
    });
}

criterion_group!(
    benches,
    bench_alloc_release,
    bench_clone_release,
    bench_var_alloc,
    bench_sub_pool_lifecycle
);
criterion_main!(benches);
