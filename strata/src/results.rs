//! Query results, partitioned by the branch that stored them.

use crate::branch::TierKind;
use crate::point_info::PointInfo;

/// Points returned from one branch, in coarse-to-fine order.
#[derive(Debug, Clone, PartialEq)]
pub struct TierResult {
    pub kind: TierKind,
    pub depth_begin: u32,
    pub depth_end: u32,
    pub points: Vec<PointInfo>,
}

impl TierResult {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Result of a depth range or region query.
///
/// One entry per branch overlapping the queried depth range, shallowest
/// first, so callers can consume coarse levels before fine ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResults {
    tiers: Vec<TierResult>,
}

impl QueryResults {
    pub(crate) fn new(tiers: Vec<TierResult>) -> QueryResults {
        QueryResults { tiers }
    }

    pub fn tiers(&self) -> &[TierResult] {
        &self.tiers
    }

    /// Total number of points across tiers.
    pub fn len(&self) -> usize {
        self.tiers.iter().map(TierResult::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(TierResult::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PointInfo> {
        self.tiers.iter().flat_map(|tier| tier.points.iter())
    }

    pub fn into_points(self) -> Vec<PointInfo> {
        self.tiers.into_iter().flat_map(|tier| tier.points).collect()
    }
}

impl IntoIterator for QueryResults {
    type Item = PointInfo;
    type IntoIter = std::vec::IntoIter<PointInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_points().into_iter()
    }
}
