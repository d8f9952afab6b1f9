//! Tree configuration: dimensionality, tier boundaries and tuning knobs.
//!
//! The whole configuration is persisted in the metadata document so a reload
//! rebuilds the same partition.

use serde::{Deserialize, Serialize};

use crate::address;
use crate::branch::TierKind;
use crate::constants::{
    DEFAULT_BASE_DEPTH, DEFAULT_CACHE_CHUNKS, DEFAULT_CHUNK_POINTS, DEFAULT_DISK_DEPTH,
    DEFAULT_FLAT_DEPTH, MAX_FLAT_SLOTS, MAX_RESIDENT_SLOTS,
};
use crate::errors::{StrataError, StrataResult};
use crate::geometry::Dimensions;

/// The three depth boundaries splitting the tree into storage tiers.
///
/// Depths `[0, r)` are resident with `r = max(base, 1)`, so the root level is
/// always held in memory. Depths `[r, max(flat, r))` are flat-mapped and the
/// rest up to `disk` is paged. `disk` is the maximum depth of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDepths {
    #[serde(rename = "baseDepth")]
    pub base: u32,
    #[serde(rename = "flatDepth")]
    pub flat: u32,
    #[serde(rename = "diskDepth")]
    pub disk: u32,
}

impl TierDepths {
    pub fn new(base: u32, flat: u32, disk: u32) -> TierDepths {
        TierDepths { base, flat, disk }
    }

    pub fn max_depth(&self) -> u32 {
        self.disk
    }

    pub fn validate(&self, dims: Dimensions) -> StrataResult<()> {
        if self.disk == 0 {
            return Err(StrataError::InvalidConfig(
                "disk depth must be at least 1".into(),
            ));
        }
        if self.base > self.flat || self.flat > self.disk {
            return Err(StrataError::InvalidConfig(format!(
                "tier depths must satisfy base <= flat <= disk, got ({}, {}, {})",
                self.base, self.flat, self.disk
            )));
        }
        let max = address::max_depth(dims.count());
        if self.disk > max {
            return Err(StrataError::AddressOverflow {
                depth: self.disk,
                dimensions: dims.count(),
                max,
            });
        }
        for (kind, begin, end) in self.ranges() {
            let limit = match kind {
                TierKind::Resident => MAX_RESIDENT_SLOTS,
                TierKind::Flat => MAX_FLAT_SLOTS,
                TierKind::Paged => continue,
            };
            let slots = address::depth_offset(end, dims)? - address::depth_offset(begin, dims)?;
            if slots > limit {
                return Err(StrataError::InvalidConfig(format!(
                    "{} tier over depths [{}, {}) needs {} slots, at most {} allowed",
                    kind, begin, end, slots, limit
                )));
            }
        }
        Ok(())
    }

    /// Non-empty `(tier, depth_begin, depth_end)` ranges, shallowest first.
    pub fn ranges(&self) -> Vec<(TierKind, u32, u32)> {
        let resident_end = self.base.max(1).min(self.disk);
        let flat_end = self.flat.max(resident_end);

        [
            (TierKind::Resident, 0, resident_end),
            (TierKind::Flat, resident_end, flat_end),
            (TierKind::Paged, flat_end, self.disk),
        ]
        .into_iter()
        .filter(|(_, begin, end)| begin < end)
        .collect()
    }
}

impl Default for TierDepths {
    fn default() -> Self {
        TierDepths::new(DEFAULT_BASE_DEPTH, DEFAULT_FLAT_DEPTH, DEFAULT_DISK_DEPTH)
    }
}

/// What happens to a point whose displacement chain runs past the maximum
/// depth. Either way the rest of the batch keeps ingesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Drop the point and count it.
    #[default]
    Drop,
    /// Drop the point, count it and log a warning.
    Warn,
}

fn default_flush_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
        .min(8)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeConfig {
    pub dimensions: Dimensions,
    #[serde(flatten)]
    pub depths: TierDepths,
    /// Node slots per paged-tier chunk, also the lock granularity of the
    /// flat tier.
    pub chunk_points: u64,
    /// Paged-tier chunks kept in memory before the least recently used one
    /// is flushed and dropped.
    pub cache_chunks: usize,
    /// Threads used to flush paged-tier chunks on save.
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
}

impl TreeConfig {
    pub fn new(dimensions: Dimensions, depths: TierDepths) -> TreeConfig {
        TreeConfig {
            dimensions,
            depths,
            ..TreeConfig::default()
        }
    }

    pub fn validate(&self) -> StrataResult<()> {
        self.depths.validate(self.dimensions)?;
        if self.chunk_points == 0 {
            return Err(StrataError::InvalidConfig(
                "chunk_points must be positive".into(),
            ));
        }
        if self.cache_chunks == 0 {
            return Err(StrataError::InvalidConfig(
                "cache_chunks must be positive".into(),
            ));
        }
        if self.flush_workers == 0 {
            return Err(StrataError::InvalidConfig(
                "flush_workers must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            dimensions: Dimensions::Three,
            depths: TierDepths::default(),
            chunk_points: DEFAULT_CHUNK_POINTS,
            cache_chunks: DEFAULT_CACHE_CHUNKS,
            flush_workers: default_flush_workers(),
            exhaustion_policy: ExhaustionPolicy::default(),
        }
    }
}
