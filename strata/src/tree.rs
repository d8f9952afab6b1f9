//! The tree facade: root bounds, schema, counters and the registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::branch::{is_branch_artifact, ChunkStats};
use crate::buffer::PointBuffer;
use crate::builder::TreeBuilder;
use crate::config::{ExhaustionPolicy, TreeConfig};
use crate::constants::{FORMAT_VERSION, META_FILE};
use crate::errors::{IoContext, StrataError, StrataResult};
use crate::geometry::BBox;
use crate::persist;
use crate::point_info::{Origin, PointInfo};
use crate::registry::{Placement, Registry, RegistryMeta};
use crate::results::QueryResults;
use crate::roller::Roller;
use crate::schema::{AxisField, Schema};

/// The metadata document stored at `<dir>/meta`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaDocument {
    version: u32,
    bbox: BBox,
    schema: Schema,
    tree: TreeConfig,
    num_points: u64,
    num_placed: u64,
    registry: RegistryMeta,
}

/// Per-call outcome of [`Tree::insert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    /// Samples inside the root bounds.
    pub accepted: u64,
    /// Accepted samples that found a slot.
    pub placed: u64,
    /// Samples outside the root bounds, skipped.
    pub out_of_bounds: u64,
    /// Accepted samples dropped at the maximum depth.
    pub exhausted: u64,
}

/// Counters of a tree since it was created or loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeStats {
    pub num_points: u64,
    pub num_placed: u64,
    pub out_of_bounds: u64,
    pub exhausted: u64,
    pub chunks: ChunkStats,
}

struct TreeCounters {
    num_points: AtomicU64,
    num_placed: AtomicU64,
    out_of_bounds: AtomicU64,
    exhausted: AtomicU64,
}

impl TreeCounters {
    fn new(num_points: u64, num_placed: u64) -> Self {
        Self {
            num_points: AtomicU64::new(num_points),
            num_placed: AtomicU64::new(num_placed),
            out_of_bounds: AtomicU64::new(0),
            exhausted: AtomicU64::new(num_points.saturating_sub(num_placed)),
        }
    }
}

/// An out-of-core, depth-tiered point index.
///
/// Cloning is cheap and every clone refers to the same tree, so ingestion
/// threads can each hold one. Inserts run concurrently with each other and
/// with queries. [`Tree::save`] requires ingestion to have quiesced and
/// fails with [`StrataError::IngestionActive`] otherwise.
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

struct TreeInner {
    dir: PathBuf,
    bbox: BBox,
    schema: Arc<Schema>,
    axis_fields: Vec<AxisField>,
    config: TreeConfig,
    registry: Registry,
    counters: TreeCounters,
    /// Held shared by inserts and exclusively by save.
    ingest_gate: RwLock<()>,
}

/// Removes branch files and directories in `dir` other than `keep`.
fn remove_stale_branches(dir: &Path, keep: &[PathBuf]) -> StrataResult<()> {
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        let is_branch = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(is_branch_artifact);
        if is_branch && !keep.contains(&path) {
            persist::remove_stale(&path);
        }
    }
    Ok(())
}

fn check_layout(bbox: &BBox, schema: &Schema, config: &TreeConfig) -> StrataResult<Vec<AxisField>> {
    config.validate()?;
    if bbox.dimensions() != config.dimensions {
        return Err(StrataError::InvalidConfig(format!(
            "bounds have {} dimensions, tree is configured for {}",
            bbox.dimensions().count(),
            config.dimensions.count()
        )));
    }
    if !bbox.is_valid() {
        return Err(StrataError::InvalidConfig(format!("invalid bounds {}", bbox)));
    }
    schema.axis_fields(config.dimensions)
}

impl Tree {
    pub fn builder() -> TreeBuilder {
        TreeBuilder::new()
    }

    /// Creates an empty tree in `dir`. A tree previously saved there is
    /// discarded.
    pub fn create(
        dir: impl Into<PathBuf>,
        bbox: BBox,
        schema: Arc<Schema>,
        config: TreeConfig,
    ) -> StrataResult<Tree> {
        let dir = dir.into();
        let axis_fields = check_layout(&bbox, &schema, &config)?;

        fs::create_dir_all(&dir).at(&dir)?;
        let meta_path = dir.join(META_FILE);
        if meta_path.exists() {
            fs::remove_file(&meta_path).at(&meta_path)?;
        }
        remove_stale_branches(&dir, &[])?;
        let registry = Registry::create(&dir, &schema, &config)?;

        log::info!(
            "Created tree at {:?}: bounds {}, depths ({}, {}, {}), {} branches",
            dir,
            bbox,
            config.depths.base,
            config.depths.flat,
            config.depths.disk,
            registry.branches().len()
        );

        Ok(Tree {
            inner: Arc::new(TreeInner {
                dir,
                bbox,
                schema,
                axis_fields,
                config,
                registry,
                counters: TreeCounters::new(0, 0),
                ingest_gate: RwLock::new(()),
            }),
        })
    }

    /// Opens the tree saved in `dir`.
    ///
    /// Only the metadata document is read up front; flat tiers are mapped
    /// and paged chunks are read on first access.
    pub fn load(dir: impl Into<PathBuf>) -> StrataResult<Tree> {
        let dir = dir.into();
        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            return Err(StrataError::MissingMetadata(meta_path));
        }

        let bytes = persist::read_all(&meta_path)?;
        let doc: MetaDocument = serde_json::from_slice(&bytes).map_err(|e| {
            StrataError::Corrupted(format!("metadata {:?}: {}", meta_path, e))
        })?;
        if doc.version != FORMAT_VERSION {
            return Err(StrataError::Corrupted(format!(
                "metadata {:?} has unsupported format version {}",
                meta_path, doc.version
            )));
        }

        let schema = Arc::new(doc.schema);
        let axis_fields = check_layout(&doc.bbox, &schema, &doc.tree)?;
        let registry = Registry::load(&dir, &schema, &doc.tree, &doc.registry)?;
        // Leftovers of a save that never reached the metadata
        remove_stale_branches(&dir, &registry.artifacts())?;

        log::info!(
            "Loaded tree at {:?}: {} points ({} placed), {} branches, generation {}",
            dir,
            doc.num_points,
            doc.num_placed,
            registry.branches().len(),
            registry.generation()
        );

        Ok(Tree {
            inner: Arc::new(TreeInner {
                dir,
                bbox: doc.bbox,
                schema,
                axis_fields,
                config: doc.tree,
                registry,
                counters: TreeCounters::new(doc.num_points, doc.num_placed),
                ingest_gate: RwLock::new(()),
            }),
        })
    }

    /// Places every sample of `buffer` that lies inside the root bounds.
    ///
    /// Samples outside the bounds are skipped. A sample whose displacement
    /// chain runs past the maximum depth is dropped according to the
    /// exhaustion policy; the rest of the batch is still inserted.
    pub fn insert(&self, buffer: &PointBuffer, origin: Origin) -> StrataResult<InsertSummary> {
        let inner = &self.inner;
        let _gate = inner.ingest_gate.read();

        if **buffer.schema() != *inner.schema {
            return Err(StrataError::InvalidConfig(
                "buffer schema does not match the tree schema".into(),
            ));
        }

        let mut summary = InsertSummary::default();
        for i in 0..buffer.num_points() {
            let point = buffer.point_with(&inner.axis_fields, i);
            if !inner.bbox.contains(&point) {
                summary.out_of_bounds += 1;
                inner.counters.out_of_bounds.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            summary.accepted += 1;
            inner.counters.num_points.fetch_add(1, Ordering::Relaxed);

            let info = PointInfo::new(point, origin, buffer.sample(i).to_vec());
            match inner.registry.put(info, Roller::new(inner.bbox))? {
                Placement::Placed { .. } => {
                    summary.placed += 1;
                    inner.counters.num_placed.fetch_add(1, Ordering::Relaxed);
                }
                Placement::Exhausted(dropped) => {
                    summary.exhausted += 1;
                    inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    if inner.config.exhaustion_policy == ExhaustionPolicy::Warn {
                        log::warn!(
                            "Dropped point {} from origin {}: no free slot above depth {}",
                            dropped.point,
                            dropped.origin,
                            inner.registry.max_depth()
                        );
                    }
                }
            }
        }

        log::debug!(
            "Inserted batch from origin {}: {} accepted, {} placed, {} out of bounds",
            origin,
            summary.accepted,
            summary.placed,
            summary.out_of_bounds
        );
        Ok(summary)
    }

    /// Persists every branch as a new generation, then the metadata document
    /// naming it. The previous generation is dropped only once the document
    /// is in place, so an interrupted save leaves the last saved tree intact.
    ///
    /// Fails with [`StrataError::IngestionActive`] while any insert is in
    /// flight.
    pub fn save(&self) -> StrataResult<()> {
        let inner = &self.inner;
        let _gate = inner
            .ingest_gate
            .try_write()
            .ok_or(StrataError::IngestionActive)?;

        let registry = inner.registry.save()?;
        let doc = MetaDocument {
            version: FORMAT_VERSION,
            bbox: inner.bbox,
            schema: (*inner.schema).clone(),
            tree: inner.config.clone(),
            num_points: self.num_points(),
            num_placed: self.num_placed(),
            registry,
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        persist::write_atomic(&inner.dir.join(META_FILE), &bytes)?;
        inner.registry.commit(&doc.registry)?;

        log::info!(
            "Saved tree at {:?}: {} points ({} placed), generation {}",
            inner.dir,
            doc.num_points,
            doc.num_placed,
            doc.registry.generation
        );
        Ok(())
    }

    /// Points stored at depths `[depth_begin, depth_end)`.
    pub fn get_points(&self, depth_begin: u32, depth_end: u32) -> StrataResult<QueryResults> {
        self.inner
            .registry
            .get_points(Roller::new(self.inner.bbox), depth_begin, depth_end, None)
    }

    /// Points inside `region` stored at depths `[depth_begin, depth_end)`.
    pub fn get_points_in(
        &self,
        region: &BBox,
        depth_begin: u32,
        depth_end: u32,
    ) -> StrataResult<QueryResults> {
        if region.dimensions() != self.inner.bbox.dimensions() {
            return Err(StrataError::InvalidConfig(format!(
                "query region has {} dimensions, tree has {}",
                region.dimensions().count(),
                self.inner.bbox.dimensions().count()
            )));
        }
        self.inner.registry.get_points(
            Roller::new(self.inner.bbox),
            depth_begin,
            depth_end,
            Some(region),
        )
    }

    pub fn bounds(&self) -> &BBox {
        &self.inner.bbox
    }

    /// Number of inserted samples that fell inside the root bounds.
    pub fn num_points(&self) -> u64 {
        self.inner.counters.num_points.load(Ordering::Relaxed)
    }

    /// Number of accepted samples that were stored in a node.
    pub fn num_placed(&self) -> u64 {
        self.inner.counters.num_placed.load(Ordering::Relaxed)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn config(&self) -> &TreeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn stats(&self) -> TreeStats {
        let counters = &self.inner.counters;
        TreeStats {
            num_points: counters.num_points.load(Ordering::Relaxed),
            num_placed: counters.num_placed.load(Ordering::Relaxed),
            out_of_bounds: counters.out_of_bounds.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            chunks: self.inner.registry.chunk_stats(),
        }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("dir", &self.inner.dir)
            .field("bbox", &self.inner.bbox)
            .field("num_points", &self.num_points())
            .finish()
    }
}
