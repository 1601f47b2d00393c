// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Subcommands and the pieces they share.

pub mod exercise;
pub mod hibernate;
pub mod inspect;

use anyhow::Context;
use mempool::{PoolInfo, PoolLayout};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Layout used when no `--config` is given.
pub const DEFAULT_LAYOUT: &str = r#"
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
name = "Ids"
object_size = 4
blocks = 100

[[pool]]
name = "Sensors"
object_size = "1K"
blocks = 4
storage = "static"
"#;

/// Installs a stderr `fmt` subscriber. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose > 2)
        .with_writer(std::io::stderr)
        .init();
}

pub fn load_layout(path: Option<&Path>) -> anyhow::Result<PoolLayout> {
    let layout = match path {
        Some(path) => PoolLayout::from_file(path)
            .with_context(|| format!("failed to load layout from '{}'", path.display()))?,
        None => PoolLayout::from_toml(DEFAULT_LAYOUT).context("built-in layout is invalid")?,
    };
    layout.validate()?;
    Ok(layout)
}

pub fn banner(title: &str) {
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║{:^54}║", format!("mempool · {title}"));
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints pools as a table, children indented under their parents.
pub fn print_pool_table(pools: &[PoolInfo]) {
    println!(
        "  {:<3} {:<24} {:<9} {:>7} {:>7} {:>6} {:>6} {:>6} {:>6}",
        "Id", "Name", "Kind", "Object", "Block", "Count", "Free", "Used", "Lent",
    );
    println!("  {}", "-".repeat(84));
    for info in pools {
        let depth = depth(pools, info);
        let name = format!("{}{}", "  ".repeat(depth), info.name);
        println!(
            "  {:<3} {:<24} {:<9} {:>7} {:>7} {:>6} {:>6} {:>6} {:>6}",
            info.id.index(),
            truncate(&name, 24),
            info.kind.to_string(),
            info.object_size,
            info.block_size,
            info.object_count,
            info.stats.num_free,
            info.stats.num_in_use,
            info.stats.num_lent,
        );
    }
    println!();
}

fn depth(pools: &[PoolInfo], info: &PoolInfo) -> usize {
    let mut depth = 0;
    let mut parent = info.parent.as_deref();
    while let Some(name) = parent {
        depth += 1;
        parent = pools
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.parent.as_deref());
    }
    depth
}

/// Truncates a string to `max_len` with ellipsis if needed.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}
