use serde::{Deserialize, Serialize};

use crate::geometry::Point;

/// Identifier of the ingestion source or batch a point came from.
pub type Origin = u64;

/// A placed point: its coordinates, its origin and its raw sample bytes.
///
/// A `PointInfo` lives in exactly one node slot. Displacement moves it to a
/// deeper slot; it is never duplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointInfo {
    pub point: Point,
    pub origin: Origin,
    pub data: Vec<u8>,
}

impl PointInfo {
    pub fn new(point: Point, origin: Origin, data: Vec<u8>) -> PointInfo {
        PointInfo {
            point,
            origin,
            data,
        }
    }
}
