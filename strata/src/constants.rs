//! Constants for the on-disk layout and tuning defaults.

/// Name of the metadata document inside a tree directory
pub const META_FILE: &str = "meta";

/// Metadata document format version
pub const FORMAT_VERSION: u32 = 2;

/// Default number of node slots per paged-tier chunk
pub const DEFAULT_CHUNK_POINTS: u64 = 4096;

/// Default number of paged-tier chunks kept in memory
pub const DEFAULT_CACHE_CHUNKS: usize = 256;

/// Default tier boundaries (resident, flat, paged)
pub const DEFAULT_BASE_DEPTH: u32 = 4;
pub const DEFAULT_FLAT_DEPTH: u32 = 8;
pub const DEFAULT_DISK_DEPTH: u32 = 12;

/// Magic number written in front of checksummed payloads
pub const MAGIC: u32 = 0x5354_5241; // "STRA"

/// File extension of paged-tier chunk files
pub const CHUNK_EXTENSION: &str = "chunk";

/// Largest resident tier, in node slots. Every slot is allocated up front.
pub const MAX_RESIDENT_SLOTS: u64 = 1 << 22;

/// Largest flat tier, in node slots. Saving writes one record per slot.
pub const MAX_FLAT_SLOTS: u64 = 1 << 28;

/// Name of the paged-tier directory holding chunks written since the last save
pub const SPILL_DIR: &str = "spill";
