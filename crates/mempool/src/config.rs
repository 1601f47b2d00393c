// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pool layouts loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! [[pool]]
//! name = "Strings"
//! object_size = 266
//! blocks = 11
//! force_count = 3
//!
//! [[pool.sub_pool]]
//! name = "Strings-reserved"
//! blocks = 2
//!
//! [[pool.tier]]
//! name = "Strings-medium"
//! object_size = 90
//!
//! [[pool.tier.tier]]
//! name = "Strings-small"
//! object_size = 4
//! reserved = 8
//!
//! [[pool]]
//! name = "Sensors"
//! object_size = "1K"
//! blocks = 4
//! storage = "static"
//! ```

use crate::block::{block_footprint, static_buffer_len};
use crate::partition::tier_geometry;
use crate::{ByteSize, PoolError, PoolRef, Registry};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::info;

/// Where a root pool's blocks live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Storage {
    /// Heap slabs, grown on demand.
    #[default]
    Dynamic,
    /// One fixed buffer allocated when the layout is built. Never grows.
    Static,
}

/// A set of pools to create together.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolLayout {
    #[serde(default, rename = "pool")]
    pub pools: Vec<PoolSpec>,
}

/// A root pool and the pools carved out of it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub object_size: ByteSize,
    /// Blocks to create up front.
    #[serde(default)]
    pub blocks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_count: Option<usize>,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default, rename = "sub_pool", skip_serializing_if = "Vec::is_empty")]
    pub sub_pools: Vec<SubPoolSpec>,
    #[serde(default, rename = "tier", skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<TierSpec>,
}

/// A sub-pool reserving `blocks` of its parent.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SubPoolSpec {
    pub name: String,
    pub blocks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_count: Option<usize>,
}

/// A reduced pool, possibly with smaller tiers of its own.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TierSpec {
    pub name: String,
    pub object_size: ByteSize,
    #[serde(default)]
    pub reserved: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_count: Option<usize>,
    #[serde(default, rename = "tier", skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<TierSpec>,
}

impl PoolLayout {
    /// Loads a layout from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, PoolError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Config(format!("cannot read layout '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses a layout from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, PoolError> {
        toml::from_str(toml_str).map_err(|e| PoolError::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises the layout to TOML.
    pub fn to_toml(&self) -> Result<String, PoolError> {
        toml::to_string_pretty(self)
            .map_err(|e| PoolError::Config(format!("TOML serialise error: {e}")))
    }

    /// Checks everything that would otherwise be fatal at build time:
    /// duplicate names, tiers larger than their parent, and static pools
    /// too small for what is carved out of them.
    pub fn validate(&self) -> Result<(), PoolError> {
        let mut names = HashSet::new();
        let mut claim = |name: &str| {
            if name.is_empty() {
                return Err(PoolError::Config("pool names must not be empty".into()));
            }
            if !names.insert(name.to_owned()) {
                return Err(PoolError::Config(format!("pool '{name}' is declared twice")));
            }
            Ok(())
        };

        for pool in &self.pools {
            claim(&pool.name)?;
            for sub in &pool.sub_pools {
                claim(&sub.name)?;
            }
            let mut stack: Vec<&TierSpec> = pool.tiers.iter().collect();
            while let Some(tier) = stack.pop() {
                claim(&tier.name)?;
                stack.extend(&tier.tiers);
            }

            let root_block = block_footprint(pool.object_size.as_bytes());
            let mut needed: usize = pool.sub_pools.iter().map(|s| s.blocks).sum();
            for tier in &pool.tiers {
                needed += tier.parent_blocks(pool.object_size.as_bytes(), root_block)?;
            }
            if pool.storage == Storage::Static {
                if pool.blocks == 0 {
                    return Err(PoolError::Config(format!(
                        "static pool '{}' needs at least one block",
                        pool.name
                    )));
                }
                if needed > pool.blocks {
                    return Err(PoolError::Config(format!(
                        "static pool '{}' has {} blocks but its sub-pools and tiers reserve {needed}",
                        pool.name, pool.blocks
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validates the layout and creates its pools in `registry`.
    ///
    /// Returns every created pool by name. Static pools get a leaked,
    /// zeroed buffer of the right size.
    pub fn build(&self, registry: &Registry) -> Result<BTreeMap<String, PoolRef>, PoolError> {
        self.validate()?;
        if let Some(taken) = self
            .names()
            .into_iter()
            .find(|name| registry.find_pool(name).is_some())
        {
            return Err(PoolError::Config(format!("pool '{taken}' already exists")));
        }

        let mut built = BTreeMap::new();
        for spec in &self.pools {
            let size = spec.object_size.as_bytes();
            let pool = match spec.storage {
                Storage::Dynamic => registry.create_pool(&spec.name, size).expand(spec.blocks),
                Storage::Static => {
                    let len = static_buffer_len(spec.blocks, size);
                    let buffer: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
                    registry.init_static_pool(&spec.name, buffer, spec.blocks, size)
                }
            };
            if let Some(n) = spec.force_count {
                pool.set_force_count(n);
            }
            for sub in &spec.sub_pools {
                let child = pool.create_sub_pool(&sub.name, sub.blocks);
                if let Some(n) = sub.force_count {
                    child.set_force_count(n);
                }
                built.insert(sub.name.clone(), child);
            }
            for tier in &spec.tiers {
                tier.build(&pool, &mut built);
            }
            built.insert(spec.name.clone(), pool);
        }
        info!(pools = built.len(), "built pool layout");
        Ok(built)
    }

    /// Every pool name in declaration order.
    pub fn names(&self) -> Vec<String> {
        fn walk(tiers: &[TierSpec], out: &mut Vec<String>) {
            for tier in tiers {
                out.push(tier.name.clone());
                walk(&tier.tiers, out);
            }
        }
        let mut out = Vec::new();
        for pool in &self.pools {
            out.push(pool.name.clone());
            out.extend(pool.sub_pools.iter().map(|s| s.name.clone()));
            walk(&pool.tiers, &mut out);
        }
        out
    }
}

impl TierSpec {
    /// Parent blocks this tier and its own tiers will borrow, given a
    /// parent with `parent_size`-byte objects in `parent_block`-byte blocks.
    fn parent_blocks(&self, parent_size: usize, parent_block: usize) -> Result<usize, PoolError> {
        let size = self.object_size.as_bytes();
        if size > parent_size {
            return Err(PoolError::InvalidSize {
                pool: self.name.clone(),
                size,
                reason: "tier objects must not exceed the parent pool's object size",
            });
        }
        let geometry = tier_geometry(parent_block, parent_size, size);
        let per = geometry.per_parent;

        let mut borrowed = self.reserved.div_ceil(per);
        let mut free = borrowed * per;
        for child in &self.tiers {
            let wanted = child.parent_blocks(geometry.object_size, geometry.block_size)?;
            if wanted > free {
                let extra = (wanted - free).div_ceil(per);
                borrowed += extra;
                free += extra * per;
            }
            free -= wanted;
        }
        Ok(borrowed)
    }

    fn build(&self, parent: &PoolRef, built: &mut BTreeMap<String, PoolRef>) {
        let pool = parent.create_reduced_pool(&self.name, self.reserved, self.object_size.as_bytes());
        if let Some(n) = self.force_count {
            pool.set_force_count(n);
        }
        for tier in &self.tiers {
            tier.build(&pool, built);
        }
        built.insert(self.name.clone(), pool);
    }
}
