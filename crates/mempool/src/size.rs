// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Human-readable object sizes for pool layouts.

use crate::PoolError;
use std::fmt;

/// A byte count that parses from `"266"`, `"4K"`, `"4KB"` or `"1M"`.
///
/// In TOML it may be written either as an integer or as a string:
///
/// ```
/// use mempool::ByteSize;
///
/// assert_eq!(ByteSize::parse("4K").unwrap().as_bytes(), 4096);
/// assert_eq!(ByteSize::parse("266").unwrap().as_bytes(), 266);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "SizeRepr", into = "SizeRepr")]
pub struct ByteSize {
    bytes: usize,
}

impl ByteSize {
    pub const fn from_bytes(bytes: usize) -> Self {
        Self { bytes }
    }

    pub const fn as_bytes(&self) -> usize {
        self.bytes
    }

    /// Parses a size string. Suffixes `K`/`KB` and `M`/`MB` are binary
    /// multiples and case-insensitive; a bare number is bytes. Zero is
    /// rejected.
    pub fn parse(s: &str) -> Result<Self, PoolError> {
        let s = s.trim();
        let upper = s.to_uppercase();

        let (digits, multiplier) = if let Some(n) = upper.strip_suffix("MB").or_else(|| upper.strip_suffix('M')) {
            (n, 1024 * 1024)
        } else if let Some(n) = upper.strip_suffix("KB").or_else(|| upper.strip_suffix('K')) {
            (n, 1024)
        } else if let Some(n) = upper.strip_suffix('B') {
            (n, 1)
        } else {
            (upper.as_str(), 1)
        };

        let value: usize = digits.trim().parse().map_err(|_| {
            PoolError::Config(format!(
                "invalid size '{s}': expected a number with an optional K or M suffix"
            ))
        })?;
        let bytes = value
            .checked_mul(multiplier)
            .ok_or_else(|| PoolError::Config(format!("size '{s}' overflows")))?;
        if bytes == 0 {
            return Err(PoolError::Config(format!("size '{s}' must be non-zero")));
        }
        Ok(Self { bytes })
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes >= 1024 * 1024 && self.bytes % (1024 * 1024) == 0 {
            write!(f, "{}M", self.bytes / (1024 * 1024))
        } else if self.bytes >= 1024 && self.bytes % 1024 == 0 {
            write!(f, "{}K", self.bytes / 1024)
        } else {
            write!(f, "{}", self.bytes)
        }
    }
}

impl std::str::FromStr for ByteSize {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Bytes(usize),
    Text(String),
}

impl TryFrom<SizeRepr> for ByteSize {
    type Error = PoolError;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        match repr {
            SizeRepr::Bytes(0) => Err(PoolError::Config("size must be non-zero".into())),
            SizeRepr::Bytes(bytes) => Ok(Self { bytes }),
            SizeRepr::Text(text) => Self::parse(&text),
        }
    }
}

impl From<ByteSize> for SizeRepr {
    fn from(size: ByteSize) -> Self {
        if size.bytes % 1024 == 0 {
            SizeRepr::Text(size.to_string())
        } else {
            SizeRepr::Bytes(size.bytes)
        }
    }
}
