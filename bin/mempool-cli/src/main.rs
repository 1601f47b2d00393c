// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # mempool
//!
//! Command-line interface for building and exercising pool layouts.
//!
//! ## Usage
//! ```bash
//! # Print the pools a layout creates
//! mempool inspect --config ./pools.toml
//!
//! # Run an alloc/release workload and print the counters
//! mempool exercise --rounds 500 --json
//!
//! # Fragment the pools, hibernate, and report reclaimable memory
//! mempool hibernate --fill 75
//! ```
//!
//! Without `--config` a built-in layout (strings tiers plus a static
//! pool) is used.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "mempool",
    about = "Fixed-block memory pool inspector and exerciser",
    version,
    author
)]
struct Cli {
    /// Path to a TOML pool layout (defaults to a built-in layout).
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the layout and print every pool it creates.
    Inspect,

    /// Drive a fill/release/force workload through every pool.
    Exercise {
        /// Workload rounds per pool.
        #[arg(short, long, default_value_t = 100)]
        rounds: usize,

        /// Only exercise this pool.
        #[arg(short, long)]
        pool: Option<String>,
    },

    /// Fragment the pools, hibernate, resume and verify the contents.
    Hibernate {
        /// Percentage of each pool's blocks to allocate before
        /// releasing every other one.
        #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(1..=100))]
        fill: u8,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    commands::init_tracing(cli.verbose);
    let layout = commands::load_layout(cli.config.as_deref())?;

    match cli.command {
        Commands::Inspect => commands::inspect::execute(&layout, cli.json),
        Commands::Exercise { rounds, pool } => {
            commands::exercise::execute(&layout, rounds, pool.as_deref(), cli.json)
        }
        Commands::Hibernate { fill } => commands::hibernate::execute(&layout, fill, cli.json),
    }
}
