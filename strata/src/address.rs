//! Mapping from tree depth to the flat node-index space.
//!
//! Level `d` occupies indices `[offset(d), offset(d + 1))`, where
//! `offset(0) = 0` and `offset(i + 1) = offset(i) * 2^D + 1`. A node at index
//! `n` has its children at `n * 2^D + 1 + slot`.

use crate::errors::{StrataError, StrataResult};
use crate::geometry::Dimensions;

fn step(offset: u64, dimensions: u32) -> Option<u64> {
    offset
        .checked_mul(1u64.checked_shl(dimensions)?)?
        .checked_add(1)
}

/// Number of node indices consumed by levels `0..depth`.
///
/// Fails with [`StrataError::AddressOverflow`] when the result does not fit
/// in a `u64`.
pub fn offset(depth: u32, dimensions: u32) -> StrataResult<u64> {
    let mut offset = 0u64;
    for _ in 0..depth {
        offset = step(offset, dimensions).ok_or(StrataError::AddressOverflow {
            depth,
            dimensions,
            max: max_depth(dimensions),
        })?;
    }
    Ok(offset)
}

/// Largest depth whose offset is representable.
///
/// Trees may be configured with a maximum depth up to this value; node
/// indices of every level above it then fit. For 2D this is 32, for 3D 22.
pub fn max_depth(dimensions: u32) -> u32 {
    if dimensions == 0 {
        // offset(d) == d, which never outgrows u64 for a u32 depth
        return u32::MAX;
    }
    let mut depth = 0;
    let mut offset = 0u64;
    while let Some(next) = step(offset, dimensions) {
        offset = next;
        depth += 1;
    }
    depth
}

/// Convenience over [`offset`] for the supported tree dimensionalities.
pub fn depth_offset(depth: u32, dims: Dimensions) -> StrataResult<u64> {
    offset(depth, dims.count())
}
