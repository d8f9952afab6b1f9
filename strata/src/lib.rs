//! # Strata - Depth-Tiered Spatial Index for Point Clouds
//!
//! This crate indexes point clouds far larger than memory in an implicit
//! quadtree or octree. Every node holds at most one point, so shallow levels
//! form a coarse sample of the cloud and deeper levels refine it.
//!
//! ## Features
//!
//! - **Implicit Addressing**: node indices follow from depth and child slot, no pointers
//! - **Tiered Storage**: shallow depths in memory, middle depths in a flat memory-mapped array, deep depths in lazily paged chunks
//! - **Level of Detail**: a point closer to a cell center displaces the occupant one level down
//! - **Concurrent Ingestion**: per-slot and per-chunk locking, no global insert lock
//! - **Atomic Persistence**: every file is written to a temp file and renamed
//! - **Checksummed Pages**: corrupted snapshots and chunks are detected on load
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata::{BBox, PointBuffer, Schema, Tree};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = Tree::builder()
//!     .dir("/tmp/cloud")
//!     .bounds(BBox::new_3d(0.0, 0.0, 0.0, 100.0, 100.0, 100.0))
//!     .schema(Schema::xyz())
//!     .depths(4, 8, 12)
//!     .create()?;
//!
//! let mut buffer = PointBuffer::new(Arc::clone(tree.schema()));
//! buffer.push(&[12.0, 40.5, 3.25])?;
//! tree.insert(&buffer, 0)?;
//! tree.save()?;
//!
//! let tree = Tree::load("/tmp/cloud")?;
//! let coarse = tree.get_points(0, 4)?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod branch;
pub mod buffer;
pub mod builder;
pub mod config;
pub mod constants;
pub mod errors;
pub mod geometry;
pub mod point_info;
pub mod registry;
pub mod results;
pub mod roller;
pub mod schema;
pub mod tree;

mod persist;

pub use branch::{Branch, BranchMeta, ChunkStats, TierKind, TierMeta};
pub use buffer::PointBuffer;
pub use builder::TreeBuilder;
pub use config::{ExhaustionPolicy, TierDepths, TreeConfig};
pub use errors::{StrataError, StrataResult};
pub use geometry::{BBox, Dimensions, Point};
pub use point_info::{Origin, PointInfo};
pub use registry::{Placement, Registry, RegistryMeta};
pub use results::{QueryResults, TierResult};
pub use roller::Roller;
pub use schema::{DimInfo, DimType, Schema};
pub use tree::{InsertSummary, Tree, TreeStats};
