//! Branches: owners of contiguous depth ranges and their storage tiers.
//!
//! A branch covers depths `[depth_begin, depth_end)` and therefore node
//! indices `[offset(depth_begin), offset(depth_end))`. Only the depth bounds
//! are persisted; index bounds are always re-derived. The physical slots live
//! in one of three tiers:
//! - resident: one lock per slot, whole range in memory
//! - flat: a contiguous slot array locked per chunk, mapped from disk on load
//! - paged: sparse chunks cached in memory and spilled to per-chunk files

pub(crate) mod checksum;
pub(crate) mod chunk_cache;
pub(crate) mod flat;
pub(crate) mod paged;
pub(crate) mod resident;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address;
use crate::config::TreeConfig;
use crate::errors::{StrataError, StrataResult};
use crate::persist;
use crate::point_info::PointInfo;
use crate::schema::Schema;

use flat::FlatTier;
use paged::PagedTier;
use resident::ResidentTier;

pub use chunk_cache::ChunkStats;

/// Physical storage strategy of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Resident,
    Flat,
    Paged,
}

impl TierKind {
    pub fn name(self) -> &'static str {
        match self {
            TierKind::Resident => "resident",
            TierKind::Flat => "flat",
            TierKind::Paged => "paged",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tier-specific fields of a persisted branch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "lowercase")]
pub enum TierMeta {
    Resident {
        points: u64,
    },
    Flat {
        #[serde(rename = "recordSize")]
        record_size: u64,
    },
    Paged {
        #[serde(rename = "chunkPoints")]
        chunk_points: u64,
        chunks: u64,
    },
}

impl TierMeta {
    pub fn kind(&self) -> TierKind {
        match self {
            TierMeta::Resident { .. } => TierKind::Resident,
            TierMeta::Flat { .. } => TierKind::Flat,
            TierMeta::Paged { .. } => TierKind::Paged,
        }
    }
}

/// Persisted record of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchMeta {
    pub depth_begin: u32,
    pub depth_end: u32,
    #[serde(flatten)]
    pub tier: TierMeta,
}

/// Shared, read-only inputs every tier is built from.
pub(crate) struct BranchContext<'a> {
    pub dir: &'a Path,
    pub schema: &'a Arc<Schema>,
    pub config: &'a TreeConfig,
}

/// The capability set every tier provides.
pub(crate) trait NodeStore {
    /// Occupant of `index`, if any.
    fn get(&self, index: u64) -> StrataResult<Option<PointInfo>>;

    /// Runs `f` on the slot at `index` while holding that slot's lock.
    fn update<R, F>(&self, index: u64, f: F) -> StrataResult<R>
    where
        F: FnOnce(&mut Option<PointInfo>) -> R;

    /// Persists the tier at `path` and returns its metadata fields.
    fn save_impl(&self, path: &Path) -> StrataResult<TierMeta>;
}

pub(crate) enum Tier {
    Resident(ResidentTier),
    Flat(FlatTier),
    Paged(PagedTier),
}

impl Tier {
    fn kind(&self) -> TierKind {
        match self {
            Tier::Resident(_) => TierKind::Resident,
            Tier::Flat(_) => TierKind::Flat,
            Tier::Paged(_) => TierKind::Paged,
        }
    }
}

impl NodeStore for Tier {
    fn get(&self, index: u64) -> StrataResult<Option<PointInfo>> {
        match self {
            Tier::Resident(t) => t.get(index),
            Tier::Flat(t) => t.get(index),
            Tier::Paged(t) => t.get(index),
        }
    }

    fn update<R, F>(&self, index: u64, f: F) -> StrataResult<R>
    where
        F: FnOnce(&mut Option<PointInfo>) -> R,
    {
        match self {
            Tier::Resident(t) => t.update(index, f),
            Tier::Flat(t) => t.update(index, f),
            Tier::Paged(t) => t.update(index, f),
        }
    }

    fn save_impl(&self, path: &Path) -> StrataResult<TierMeta> {
        match self {
            Tier::Resident(t) => t.save_impl(path),
            Tier::Flat(t) => t.save_impl(path),
            Tier::Paged(t) => t.save_impl(path),
        }
    }
}

pub struct Branch {
    depth_begin: u32,
    depth_end: u32,
    index_begin: u64,
    index_end: u64,
    dir: PathBuf,
    generation: AtomicU64,
    tier: Tier,
}

/// Name shared by every file of a branch: `<kind>-<begin>-<end>`.
fn branch_stem(kind: TierKind, depth_begin: u32, depth_end: u32) -> String {
    format!("{}-{}-{}", kind, depth_begin, depth_end)
}

/// True for names produced by [`branch_stem`], including generation suffixes.
pub(crate) fn is_branch_artifact(name: &str) -> bool {
    [TierKind::Resident, TierKind::Flat, TierKind::Paged]
        .iter()
        .any(|kind| name.starts_with(&format!("{}-", kind)))
}

/// Location of the data a branch saved as `generation`. Paged branches keep
/// every generation as a directory under one root.
fn data_path(
    dir: &Path,
    kind: TierKind,
    depth_begin: u32,
    depth_end: u32,
    generation: u64,
) -> PathBuf {
    let stem = branch_stem(kind, depth_begin, depth_end);
    match kind {
        TierKind::Paged => dir.join(stem).join(generation.to_string()),
        _ => dir.join(format!("{}.{}.bin", stem, generation)),
    }
}

impl Branch {
    /// Creates an empty branch over `[depth_begin, depth_end)`.
    pub(crate) fn create(
        ctx: &BranchContext<'_>,
        kind: TierKind,
        depth_begin: u32,
        depth_end: u32,
    ) -> StrataResult<Branch> {
        let (index_begin, index_end) = Self::index_range(ctx, depth_begin, depth_end)?;
        let size = index_end - index_begin;

        log::debug!(
            "Creating {} branch for depths [{}, {}) covering indices [{}, {})",
            kind,
            depth_begin,
            depth_end,
            index_begin,
            index_end
        );

        let tier = match kind {
            TierKind::Resident => Tier::Resident(ResidentTier::new(index_begin, size)?),
            TierKind::Flat => Tier::Flat(FlatTier::new(
                index_begin,
                size,
                ctx.config.chunk_points,
                ctx.schema.point_size(),
            )?),
            TierKind::Paged => Tier::Paged(PagedTier::create(
                &ctx.dir.join(branch_stem(kind, depth_begin, depth_end)),
                index_begin,
                size,
                ctx.config,
            )?),
        };

        Ok(Branch {
            depth_begin,
            depth_end,
            index_begin,
            index_end,
            dir: ctx.dir.to_path_buf(),
            generation: AtomicU64::new(0),
            tier,
        })
    }

    /// Reconstructs a branch from its persisted record and the data saved
    /// as `generation`.
    pub(crate) fn load(
        ctx: &BranchContext<'_>,
        meta: &BranchMeta,
        generation: u64,
    ) -> StrataResult<Branch> {
        let (depth_begin, depth_end) = (meta.depth_begin, meta.depth_end);
        let (index_begin, index_end) = Self::index_range(ctx, depth_begin, depth_end)?;
        let kind = meta.tier.kind();
        let path = data_path(ctx.dir, kind, depth_begin, depth_end, generation);
        let size = index_end - index_begin;

        log::debug!(
            "Loading {} branch for depths [{}, {}) from {:?}",
            kind,
            depth_begin,
            depth_end,
            path
        );

        let tier = match &meta.tier {
            TierMeta::Resident { .. } => Tier::Resident(ResidentTier::load(&path, index_begin, size)?),
            TierMeta::Flat { record_size } => Tier::Flat(FlatTier::load(
                &path,
                index_begin,
                size,
                ctx.config.chunk_points,
                ctx.schema.point_size(),
                *record_size,
            )?),
            TierMeta::Paged { chunk_points, .. } => Tier::Paged(PagedTier::load(
                &ctx.dir.join(branch_stem(kind, depth_begin, depth_end)),
                &path,
                index_begin,
                size,
                *chunk_points,
                ctx.config,
            )?),
        };

        Ok(Branch {
            depth_begin,
            depth_end,
            index_begin,
            index_end,
            dir: ctx.dir.to_path_buf(),
            generation: AtomicU64::new(generation),
            tier,
        })
    }

    fn index_range(
        ctx: &BranchContext<'_>,
        depth_begin: u32,
        depth_end: u32,
    ) -> StrataResult<(u64, u64)> {
        if depth_begin >= depth_end {
            return Err(StrataError::InvalidConfig(format!(
                "empty branch depth range [{}, {})",
                depth_begin, depth_end
            )));
        }
        let dims = ctx.config.dimensions;
        Ok((
            address::depth_offset(depth_begin, dims)?,
            address::depth_offset(depth_end, dims)?,
        ))
    }

    pub fn accepts(&self, index: u64) -> bool {
        index >= self.index_begin && index < self.index_end
    }

    pub fn size(&self) -> u64 {
        self.index_end - self.index_begin
    }

    pub fn depth_begin(&self) -> u32 {
        self.depth_begin
    }

    pub fn depth_end(&self) -> u32 {
        self.depth_end
    }

    pub fn index_begin(&self) -> u64 {
        self.index_begin
    }

    pub fn index_end(&self) -> u64 {
        self.index_end
    }

    pub fn kind(&self) -> TierKind {
        self.tier.kind()
    }

    /// Last committed generation, 0 until the first save.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn path_for(&self, generation: u64) -> PathBuf {
        data_path(&self.dir, self.kind(), self.depth_begin, self.depth_end, generation)
    }

    /// File, or directory for paged branches, holding the committed data.
    pub fn data_path(&self) -> PathBuf {
        self.path_for(self.generation())
    }

    /// Top-level entry of the tree directory owned by this branch.
    pub(crate) fn artifact(&self) -> PathBuf {
        match self.kind() {
            TierKind::Paged => self
                .dir
                .join(branch_stem(self.kind(), self.depth_begin, self.depth_end)),
            _ => self.data_path(),
        }
    }

    /// Chunk cache counters, for paged branches.
    pub fn chunk_stats(&self) -> Option<ChunkStats> {
        match &self.tier {
            Tier::Paged(t) => Some(t.stats()),
            _ => None,
        }
    }

    pub fn get(&self, index: u64) -> StrataResult<Option<PointInfo>> {
        debug_assert!(self.accepts(index));
        self.tier.get(index)
    }

    pub(crate) fn update<R, F>(&self, index: u64, f: F) -> StrataResult<R>
    where
        F: FnOnce(&mut Option<PointInfo>) -> R,
    {
        debug_assert!(self.accepts(index));
        self.tier.update(index, f)
    }

    /// Unconditionally stores `info` at `index`, returning the previous occupant.
    #[cfg(test)]
    pub(crate) fn put(&self, index: u64, info: PointInfo) -> StrataResult<Option<PointInfo>> {
        self.update(index, |slot| slot.replace(info))
    }

    /// Writes the tier data as `generation`, then returns the record holding
    /// the depth bounds and tier fields. The committed data is left alone
    /// until [`Branch::commit`].
    pub(crate) fn save(&self, generation: u64) -> StrataResult<BranchMeta> {
        let tier = self.tier.save_impl(&self.path_for(generation))?;
        Ok(BranchMeta {
            depth_begin: self.depth_begin,
            depth_end: self.depth_end,
            tier,
        })
    }

    /// Adopts `generation` as the committed data and removes the data it
    /// replaces.
    pub(crate) fn commit(&self, generation: u64) -> StrataResult<()> {
        let previous = self.generation.swap(generation, Ordering::AcqRel);
        match &self.tier {
            Tier::Paged(t) => t.commit(&self.path_for(generation))?,
            _ if previous != generation => persist::remove_stale(&self.path_for(previous)),
            _ => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("kind", &self.kind())
            .field("depth_begin", &self.depth_begin)
            .field("depth_end", &self.depth_end)
            .field("index_begin", &self.index_begin)
            .field("index_end", &self.index_end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Dimensions, Point};
    use crate::config::TierDepths;
    use tempfile::tempdir;

    fn config() -> TreeConfig {
        let mut config = TreeConfig::new(Dimensions::Two, TierDepths::new(0, 2, 4));
        config.chunk_points = 8;
        config.cache_chunks = 2;
        config.flush_workers = 2;
        config
    }

    fn info(x: f64, origin: u64) -> PointInfo {
        PointInfo::new(Point::new(x, x), origin, vec![1, 2, 3])
    }

    #[test]
    fn test_index_bounds_derive_from_depths() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let config = config();
        let ctx = BranchContext {
            dir: dir.path(),
            schema: &schema,
            config: &config,
        };

        let upper = Branch::create(&ctx, TierKind::Resident, 0, 2).unwrap();
        let lower = Branch::create(&ctx, TierKind::Paged, 2, 4).unwrap();

        assert_eq!((upper.index_begin(), upper.index_end()), (0, 5));
        assert_eq!((lower.index_begin(), lower.index_end()), (5, 85));
        assert_eq!(upper.index_end(), lower.index_begin());
        assert_eq!(lower.size(), 80);
        assert!(upper.accepts(4));
        assert!(!upper.accepts(5));
        assert!(lower.accepts(5));
        assert!(!lower.accepts(85));
    }

    #[test]
    fn test_rejects_empty_range() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::xyz());
        let config = config();
        let ctx = BranchContext {
            dir: dir.path(),
            schema: &schema,
            config: &config,
        };
        assert!(Branch::create(&ctx, TierKind::Flat, 2, 2).is_err());
    }

    #[test]
    fn test_save_and_load_every_tier() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![
            crate::schema::DimInfo::new("X", crate::schema::DimType::U8),
            crate::schema::DimInfo::new("Y", crate::schema::DimType::U8),
            crate::schema::DimInfo::new("Z", crate::schema::DimType::U8),
        ]).unwrap());
        let config = config();
        let ctx = BranchContext {
            dir: dir.path(),
            schema: &schema,
            config: &config,
        };

        let specs = [
            (TierKind::Resident, 0, 2),
            (TierKind::Flat, 2, 3),
            (TierKind::Paged, 3, 4),
        ];
        let mut metas = Vec::new();
        for (kind, begin, end) in specs {
            let branch = Branch::create(&ctx, kind, begin, end).unwrap();
            let first = branch.index_begin();
            let last = branch.index_end() - 1;
            assert!(branch.put(first, info(1.0, 10)).unwrap().is_none());
            assert!(branch.put(last, info(2.0, 20)).unwrap().is_none());
            let previous = branch.put(first, info(3.0, 30)).unwrap();
            assert_eq!(previous, Some(info(1.0, 10)));

            let meta = branch.save(1).unwrap();
            branch.commit(1).unwrap();
            assert_eq!(branch.generation(), 1);
            assert!(branch.data_path().exists());
            assert_eq!(meta.depth_begin, begin);
            assert_eq!(meta.depth_end, end);
            assert_eq!(meta.tier.kind(), kind);
            metas.push(meta);
        }

        for meta in &metas {
            let branch = Branch::load(&ctx, meta, 1).unwrap();
            assert_eq!(branch.kind(), meta.tier.kind());
            let first = branch.index_begin();
            let last = branch.index_end() - 1;
            assert_eq!(branch.get(first).unwrap(), Some(info(3.0, 30)));
            assert_eq!(branch.get(last).unwrap(), Some(info(2.0, 20)));
        }
    }

    #[test]
    fn test_branch_meta_json() {
        let meta = BranchMeta {
            depth_begin: 2,
            depth_end: 4,
            tier: TierMeta::Paged {
                chunk_points: 8,
                chunks: 3,
            },
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["depthBegin"], 2);
        assert_eq!(json["depthEnd"], 4);
        assert_eq!(json["tier"], "paged");
        assert_eq!(json["chunkPoints"], 8);

        let back: BranchMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_commit_replaces_previous_generation() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![
            crate::schema::DimInfo::new("X", crate::schema::DimType::U8),
            crate::schema::DimInfo::new("Y", crate::schema::DimType::U8),
            crate::schema::DimInfo::new("Z", crate::schema::DimType::U8),
        ]).unwrap());
        let config = config();
        let ctx = BranchContext {
            dir: dir.path(),
            schema: &schema,
            config: &config,
        };

        for (kind, begin, end) in [(TierKind::Resident, 0, 2), (TierKind::Flat, 2, 3)] {
            let branch = Branch::create(&ctx, kind, begin, end).unwrap();
            let index = branch.index_begin();
            branch.put(index, info(1.0, 1)).unwrap();
            let first = branch.save(1).unwrap();
            branch.commit(1).unwrap();
            let committed = branch.data_path();

            // A save that is never committed leaves the committed data usable
            branch.put(index, info(2.0, 2)).unwrap();
            let second = branch.save(2).unwrap();
            assert!(committed.exists());
            let reloaded = Branch::load(&ctx, &first, 1).unwrap();
            assert_eq!(reloaded.get(index).unwrap(), Some(info(1.0, 1)));

            branch.commit(2).unwrap();
            assert!(!committed.exists());
            let reloaded = Branch::load(&ctx, &second, 2).unwrap();
            assert_eq!(reloaded.get(index).unwrap(), Some(info(2.0, 2)));
        }
    }

    #[test]
    fn test_artifact_names() {
        assert!(is_branch_artifact("resident-0-1.3.bin"));
        assert!(is_branch_artifact("flat-1-4.bin"));
        assert!(is_branch_artifact("paged-4-8"));
        assert!(!is_branch_artifact("meta"));
        assert!(!is_branch_artifact("residents"));
    }
}
