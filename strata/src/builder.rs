use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ExhaustionPolicy, TierDepths, TreeConfig};
use crate::errors::{StrataError, StrataResult};
use crate::geometry::BBox;
use crate::schema::Schema;
use crate::tree::Tree;

/// Fluent configuration of a new [`Tree`].
///
/// The dimensionality follows the root bounds, so a 2D box builds a quadtree
/// and a 3D box an octree.
///
/// # Examples
///
/// ```rust,ignore
/// let tree = Tree::builder()
///     .dir("/data/cloud")
///     .bounds(BBox::new_3d(0.0, 0.0, 0.0, 1024.0, 1024.0, 256.0))
///     .schema(Schema::xyz())
///     .depths(4, 8, 14)
///     .create()?;
/// ```
///
/// # Configuration Presets
///
/// - `low_memory_preset()` - small chunks, a small chunk cache, one flush worker
/// - `high_throughput_preset()` - large chunk cache, every CPU flushing
pub struct TreeBuilder {
    dir: Option<PathBuf>,
    bounds: Option<BBox>,
    schema: Schema,
    config: TreeConfig,
}

impl TreeBuilder {
    pub fn new() -> TreeBuilder {
        TreeBuilder {
            dir: None,
            bounds: None,
            schema: Schema::xyz(),
            config: TreeConfig::default(),
        }
    }

    /// Keeps few chunks in memory and flushes from a single thread.
    pub fn low_memory_preset(self) -> Self {
        self.chunk_points(1024).cache_chunks(32).flush_workers(1)
    }

    /// Large chunk cache, flushing on every available CPU.
    pub fn high_throughput_preset(self) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);

        self.chunk_points(16 * 1024)
            .cache_chunks(1024)
            .flush_workers(cpus)
    }

    /// Directory holding the metadata document and tier data.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn bounds(mut self, bounds: BBox) -> Self {
        self.config.dimensions = bounds.dimensions();
        self.bounds = Some(bounds);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Resident, flat and disk depth boundaries.
    pub fn depths(mut self, base: u32, flat: u32, disk: u32) -> Self {
        self.config.depths = TierDepths::new(base, flat, disk);
        self
    }

    pub fn chunk_points(mut self, chunk_points: u64) -> Self {
        self.config.chunk_points = chunk_points;
        self
    }

    pub fn cache_chunks(mut self, cache_chunks: usize) -> Self {
        self.config.cache_chunks = cache_chunks;
        self
    }

    pub fn flush_workers(mut self, flush_workers: usize) -> Self {
        self.config.flush_workers = flush_workers;
        self
    }

    pub fn exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.config.exhaustion_policy = policy;
        self
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Creates an empty tree, replacing any tree previously stored in `dir`.
    pub fn create(self) -> StrataResult<Tree> {
        let dir = self
            .dir
            .ok_or_else(|| StrataError::InvalidConfig("tree directory not set".into()))?;
        let bounds = self
            .bounds
            .ok_or_else(|| StrataError::InvalidConfig("root bounds not set".into()))?;
        Tree::create(dir, bounds, Arc::new(self.schema), self.config)
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        TreeBuilder::new()
    }
}
