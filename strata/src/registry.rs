//! The ordered set of branches covering the tree, and the placement and
//! query protocols that run across them.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::branch::{Branch, BranchContext, BranchMeta, ChunkStats};
use crate::config::TreeConfig;
use crate::errors::{StrataError, StrataResult};
use crate::geometry::{BBox, Dimensions};
use crate::point_info::PointInfo;
use crate::results::{QueryResults, TierResult};
use crate::roller::Roller;
use crate::schema::Schema;

/// Persisted branch records, shallowest first, and the generation their
/// data was saved as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMeta {
    #[serde(default)]
    pub generation: u64,
    pub branches: Vec<BranchMeta>,
}

/// Outcome of [`Registry::put`].
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// The displacement chain ended with a point stored at `index`.
    Placed { index: u64, depth: u32 },
    /// The chain reached the maximum depth; the returned point has no slot.
    Exhausted(PointInfo),
}

/// Gapless, ordered list of branches from depth 0 to the maximum depth.
///
/// `branches[i].depth_end() == branches[i + 1].depth_begin()` always holds,
/// so every node index below `offset(max_depth)` has exactly one owner.
///
/// Saved data is versioned by generation. [`Registry::save`] writes the next
/// generation next to the committed one and [`Registry::commit`] adopts it,
/// so a save that fails halfway leaves the committed data intact.
pub struct Registry {
    branches: Vec<Branch>,
    dimensions: Dimensions,
    max_depth: u32,
    generation: AtomicU64,
}

impl Registry {
    /// Builds empty branches for every tier range of `config`.
    pub fn create(dir: &Path, schema: &Arc<Schema>, config: &TreeConfig) -> StrataResult<Registry> {
        config.validate()?;
        let ctx = BranchContext {
            dir,
            schema,
            config,
        };
        let branches = config
            .depths
            .ranges()
            .into_iter()
            .map(|(kind, begin, end)| Branch::create(&ctx, kind, begin, end))
            .collect::<StrataResult<Vec<_>>>()?;

        Ok(Registry {
            branches,
            dimensions: config.dimensions,
            max_depth: config.depths.max_depth(),
            generation: AtomicU64::new(0),
        })
    }

    /// Reconstructs the branches listed in `meta`, in order.
    pub fn load(
        dir: &Path,
        schema: &Arc<Schema>,
        config: &TreeConfig,
        meta: &RegistryMeta,
    ) -> StrataResult<Registry> {
        config.validate()?;
        Self::check_chain(&meta.branches, config.depths.max_depth())?;

        let ctx = BranchContext {
            dir,
            schema,
            config,
        };
        let branches = meta
            .branches
            .iter()
            .map(|branch| Branch::load(&ctx, branch, meta.generation))
            .collect::<StrataResult<Vec<_>>>()?;

        Ok(Registry {
            branches,
            dimensions: config.dimensions,
            max_depth: config.depths.max_depth(),
            generation: AtomicU64::new(meta.generation),
        })
    }

    fn check_chain(branches: &[BranchMeta], max_depth: u32) -> StrataResult<()> {
        let mut expected = 0;
        for branch in branches {
            if branch.depth_begin != expected || branch.depth_end <= branch.depth_begin {
                return Err(StrataError::Corrupted(format!(
                    "branch [{}, {}) does not continue the chain at depth {}",
                    branch.depth_begin, branch.depth_end, expected
                )));
            }
            expected = branch.depth_end;
        }
        if expected != max_depth {
            return Err(StrataError::Corrupted(format!(
                "branches cover depths [0, {}), expected [0, {})",
                expected, max_depth
            )));
        }
        Ok(())
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// The branch whose index range holds `index`.
    pub fn branch_for(&self, index: u64) -> StrataResult<&Branch> {
        self.locate(index).map(|(_, branch)| branch)
    }

    fn locate(&self, index: u64) -> StrataResult<(usize, &Branch)> {
        let pos = self.branches.partition_point(|b| b.index_end() <= index);
        match self.branches.get(pos) {
            Some(branch) if branch.accepts(index) => Ok((pos, branch)),
            _ => Err(StrataError::NoOwningBranch(index)),
        }
    }

    /// Places `info` starting at the cell `roller` points to.
    ///
    /// At each cell the occupant and the candidate are compared under the
    /// cell's lock: the one closer to the cell center stays, ties keep the
    /// occupant. The other moves one level down following its own
    /// coordinates. The loop is bounded by the maximum depth.
    pub fn put(&self, mut info: PointInfo, mut roller: Roller) -> StrataResult<Placement> {
        let dims = self.dimensions;
        loop {
            let index = roller.index();
            let center = roller.bbox().mid();
            let branch = self.branch_for(index)?;

            let loser = branch.update(index, |slot| match slot {
                Some(occupant) => {
                    let incoming = info.point.distance_squared(&center, dims);
                    let current = occupant.point.distance_squared(&center, dims);
                    if incoming < current {
                        Some(std::mem::replace(occupant, info))
                    } else {
                        Some(info)
                    }
                }
                empty => {
                    *empty = Some(info);
                    None
                }
            })?;

            match loser {
                None => {
                    return Ok(Placement::Placed {
                        index,
                        depth: roller.depth(),
                    })
                }
                Some(displaced) => info = displaced,
            }

            if roller.depth() + 1 >= self.max_depth {
                return Ok(Placement::Exhausted(info));
            }
            roller.advance(&info.point);
        }
    }

    /// Collects occupants at depths `[depth_begin, depth_end)`, optionally
    /// restricted to `region`.
    ///
    /// Cells are visited breadth first from `root`. A cell whose bounds miss
    /// the region is pruned, and so is the subtree below an empty cell since
    /// points only descend past occupied cells. With a region, only points
    /// lying inside it are returned.
    pub fn get_points(
        &self,
        root: Roller,
        depth_begin: u32,
        depth_end: u32,
        region: Option<&BBox>,
    ) -> StrataResult<QueryResults> {
        let depth_end = depth_end.min(self.max_depth);
        let mut tiers: Vec<TierResult> = self
            .branches
            .iter()
            .map(|b| TierResult {
                kind: b.kind(),
                depth_begin: b.depth_begin(),
                depth_end: b.depth_end(),
                points: Vec::new(),
            })
            .collect();

        if depth_begin < depth_end {
            let mut queue = VecDeque::from([root]);
            while let Some(cell) = queue.pop_front() {
                if region.is_some_and(|r| !cell.bbox().intersects(r)) {
                    continue;
                }

                let (pos, branch) = self.locate(cell.index())?;
                let Some(occupant) = branch.get(cell.index())? else {
                    continue;
                };

                if cell.depth() >= depth_begin
                    && region.map_or(true, |r| r.contains(&occupant.point))
                {
                    tiers[pos].points.push(occupant);
                }
                if cell.depth() + 1 < depth_end {
                    queue.extend(cell.children());
                }
            }
        }

        tiers.retain(|t| t.depth_begin < depth_end && t.depth_end > depth_begin);
        Ok(QueryResults::new(tiers))
    }

    /// Last committed generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Saves every branch as the next generation, shallowest first. Nothing
    /// committed is touched; pass the result to [`Registry::commit`] once it
    /// is durably recorded. No point may be placed in between.
    pub fn save(&self) -> StrataResult<RegistryMeta> {
        let generation = self.generation() + 1;
        let branches = self
            .branches
            .iter()
            .map(|branch| branch.save(generation))
            .collect::<StrataResult<Vec<_>>>()?;
        Ok(RegistryMeta {
            generation,
            branches,
        })
    }

    /// Adopts the generation written by [`Registry::save`] and drops the data
    /// of the one it replaces.
    pub fn commit(&self, meta: &RegistryMeta) -> StrataResult<()> {
        for branch in &self.branches {
            branch.commit(meta.generation)?;
        }
        self.generation.store(meta.generation, Ordering::Release);
        log::debug!("Committed generation {}", meta.generation);
        Ok(())
    }

    /// Top-level entries of the tree directory the branches own.
    pub(crate) fn artifacts(&self) -> Vec<PathBuf> {
        self.branches.iter().map(Branch::artifact).collect()
    }

    /// Chunk cache counters summed over paged branches.
    pub fn chunk_stats(&self) -> ChunkStats {
        self.branches
            .iter()
            .filter_map(Branch::chunk_stats)
            .fold(ChunkStats::default(), |acc, s| acc.merge(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address;
    use crate::branch::TierKind;
    use crate::config::TierDepths;
    use crate::geometry::Point;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn config(b: u32, f: u32, k: u32) -> TreeConfig {
        let mut config = TreeConfig::new(Dimensions::Two, TierDepths::new(b, f, k));
        config.chunk_points = 16;
        config.cache_chunks = 4;
        config.flush_workers = 2;
        config
    }

    fn root() -> Roller {
        Roller::new(BBox::new_2d(0.0, 0.0, 100.0, 100.0))
    }

    fn info(x: f64, y: f64, origin: u64) -> PointInfo {
        PointInfo::new(Point::new(x, y), origin, vec![0; 4])
    }

    fn occupants(registry: &Registry) -> Vec<(u64, PointInfo)> {
        let end = address::depth_offset(registry.max_depth(), Dimensions::Two).unwrap();
        (0..end)
            .filter_map(|i| {
                let branch = registry.branch_for(i).unwrap();
                branch.get(i).unwrap().map(|p| (i, p))
            })
            .collect()
    }

    #[test]
    fn test_partition_property() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let registry = Registry::create(dir.path(), &schema, &config(0, 2, 4)).unwrap();

        let ranges: Vec<(TierKind, u64, u64)> = registry
            .branches()
            .iter()
            .map(|b| (b.kind(), b.index_begin(), b.index_end()))
            .collect();
        assert_eq!(
            ranges,
            vec![
                (TierKind::Resident, 0, 1),
                (TierKind::Flat, 1, 5),
                (TierKind::Paged, 5, 85),
            ]
        );

        for index in 0..85u64 {
            let owners = registry
                .branches()
                .iter()
                .filter(|b| b.accepts(index))
                .count();
            assert_eq!(owners, 1, "index {}", index);
            assert!(registry.branch_for(index).unwrap().accepts(index));
        }
        assert!(matches!(
            registry.branch_for(85),
            Err(StrataError::NoOwningBranch(85))
        ));
    }

    #[test]
    fn test_closer_point_displaces_farther() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let registry = Registry::create(dir.path(), &schema, &config(0, 2, 4)).unwrap();

        let center = registry.put(info(50.0, 50.0, 0), root()).unwrap();
        assert_eq!(center, Placement::Placed { index: 0, depth: 0 });

        let far = registry.put(info(10.0, 10.0, 2), root()).unwrap();
        assert_eq!(far, Placement::Placed { index: 1, depth: 1 });

        // Exactly at the first quadrant's center: takes index 1, pushes the
        // far point down to slot 0 of the quadrant
        let near = registry.put(info(25.0, 25.0, 1), root()).unwrap();
        assert_eq!(near, Placement::Placed { index: 5, depth: 2 });

        let at = |i: u64| registry.branch_for(i).unwrap().get(i).unwrap();
        assert_eq!(at(0).unwrap().origin, 0);
        assert_eq!(at(1).unwrap().origin, 1);
        assert_eq!(at(5).unwrap().origin, 2);
    }

    #[test]
    fn test_tie_keeps_incumbent() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let registry = Registry::create(dir.path(), &schema, &config(1, 2, 4)).unwrap();

        // Both 10 units from the root center
        registry.put(info(40.0, 50.0, 1), root()).unwrap();
        registry.put(info(60.0, 50.0, 2), root()).unwrap();

        let root_occupant = registry.branch_for(0).unwrap().get(0).unwrap().unwrap();
        assert_eq!(root_occupant.origin, 1);
    }

    #[test]
    fn test_exhaustion_returns_point() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let registry = Registry::create(dir.path(), &schema, &config(1, 1, 2)).unwrap();

        assert!(matches!(
            registry.put(info(30.0, 30.0, 1), root()).unwrap(),
            Placement::Placed { depth: 0, .. }
        ));
        assert!(matches!(
            registry.put(info(30.0, 30.0, 2), root()).unwrap(),
            Placement::Placed { depth: 1, .. }
        ));
        match registry.put(info(30.0, 30.0, 3), root()).unwrap() {
            Placement::Exhausted(point) => assert_eq!(point.origin, 3),
            other => panic!("Expected exhaustion, got {:?}", other),
        }
        assert_eq!(occupants(&registry).len(), 2);
    }

    #[test]
    fn test_query_depth_range_and_region() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let registry = Registry::create(dir.path(), &schema, &config(0, 2, 4)).unwrap();

        registry.put(info(50.0, 50.0, 0), root()).unwrap();
        registry.put(info(10.0, 10.0, 2), root()).unwrap();
        registry.put(info(25.0, 25.0, 1), root()).unwrap();
        registry.put(info(90.0, 90.0, 3), root()).unwrap();

        let all = registry.get_points(root(), 0, 4, None).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all.tiers().len(), 3);
        assert_eq!(all.tiers()[0].len(), 1);
        assert_eq!(all.tiers()[1].len(), 2);
        assert_eq!(all.tiers()[2].len(), 1);

        let coarse = registry.get_points(root(), 0, 1, None).unwrap();
        assert_eq!(coarse.tiers().len(), 1);
        assert_eq!(coarse.len(), 1);

        let deep = registry.get_points(root(), 2, 4, None).unwrap();
        assert_eq!(deep.tiers().len(), 1);
        assert_eq!(deep.iter().next().unwrap().origin, 2);

        let region = BBox::new_2d(0.0, 0.0, 30.0, 30.0);
        let mut origins: Vec<u64> = registry
            .get_points(root(), 0, 4, Some(&region))
            .unwrap()
            .iter()
            .map(|p| p.origin)
            .collect();
        origins.sort();
        assert_eq!(origins, vec![1, 2]);

        assert!(registry.get_points(root(), 3, 3, None).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_puts_single_occupancy() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let registry = Registry::create(dir.path(), &schema, &config(1, 3, 6)).unwrap();

        let placed: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4u64)
                .map(|t| {
                    let registry = &registry;
                    s.spawn(move || {
                        let mut rng = rand::rngs::StdRng::seed_from_u64(t);
                        let mut placed = 0;
                        for i in 0..300u64 {
                            let x = rng.gen_range(0.0..100.0);
                            let y = rng.gen_range(0.0..100.0);
                            let point = info(x, y, t * 1000 + i);
                            if let Placement::Placed { .. } = registry.put(point, root()).unwrap() {
                                placed += 1;
                            }
                        }
                        placed
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        let stored = occupants(&registry);
        assert_eq!(stored.len(), placed);

        let mut origins: Vec<u64> = stored.iter().map(|(_, p)| p.origin).collect();
        origins.sort();
        origins.dedup();
        assert_eq!(origins.len(), stored.len());
    }

    #[test]
    fn test_save_load_preserves_partition() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let config = config(0, 2, 4);
        let registry = Registry::create(dir.path(), &schema, &config).unwrap();
        for i in 0..40u64 {
            let v = (i * 37 % 100) as f64;
            registry.put(info(v, 100.0 - v, i), root()).unwrap();
        }
        let meta = registry.save().unwrap();
        registry.commit(&meta).unwrap();
        assert_eq!(meta.generation, 1);
        assert_eq!(registry.generation(), 1);
        let before = registry.get_points(root(), 0, 4, None).unwrap();

        let loaded = Registry::load(dir.path(), &schema, &config, &meta).unwrap();
        let bounds: Vec<(u32, u32)> = loaded
            .branches()
            .iter()
            .map(|b| (b.depth_begin(), b.depth_end()))
            .collect();
        assert_eq!(bounds, vec![(0, 1), (1, 2), (2, 4)]);
        assert_eq!(loaded.generation(), 1);
        assert_eq!(loaded.get_points(root(), 0, 4, None).unwrap(), before);
    }

    #[test]
    fn test_uncommitted_save_keeps_committed_generation() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let config = config(0, 2, 4);
        let registry = Registry::create(dir.path(), &schema, &config).unwrap();
        registry.put(info(10.0, 10.0, 1), root()).unwrap();
        let committed = registry.save().unwrap();
        registry.commit(&committed).unwrap();
        let expected = registry.get_points(root(), 0, 4, None).unwrap();

        for i in 2..30u64 {
            let v = (i * 13 % 100) as f64;
            registry.put(info(v, v, i), root()).unwrap();
        }
        let pending = registry.save().unwrap();
        assert_eq!(pending.generation, 2);
        assert_eq!(registry.generation(), 1);
        drop(registry);

        let loaded = Registry::load(dir.path(), &schema, &config, &committed).unwrap();
        assert_eq!(loaded.get_points(root(), 0, 4, None).unwrap(), expected);
    }

    #[test]
    fn test_load_rejects_gaps() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let config = config(0, 2, 4);
        let registry = Registry::create(dir.path(), &schema, &config).unwrap();
        let mut meta = registry.save().unwrap();
        meta.branches.remove(1);

        assert!(matches!(
            Registry::load(dir.path(), &schema, &config, &meta),
            Err(StrataError::Corrupted(_))
        ));
    }
}
