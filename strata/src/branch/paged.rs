//! Paged tier: sparse chunks of node slots spilled to per-chunk files.
//!
//! The branch range is cut into chunks of `chunk_points` consecutive slots.
//! A chunk is loaded on first access and stays in memory until the chunk
//! cache picks it for eviction, at which point it is written back if dirty.
//! Chunks that were never written have no file and cost nothing.
//!
//! On disk the tier root holds one directory per saved generation plus a
//! `spill` directory:
//!
//! ```text
//! paged-<b>-<e>/
//!   <generation>/<id>.chunk   committed snapshot, never written in place
//!   spill/<id>.chunk          chunks evicted or flushed since that snapshot
//! ```
//!
//! Evictions only ever touch `spill`, so the committed snapshot stays exactly
//! as the last save left it. Saving links the spilled and unchanged chunks
//! into a fresh generation directory; [`PagedTier::commit`] switches to it
//! once the metadata naming it is durable. Loading discards everything but
//! the committed generation.
//!
//! A chunk gets a handle on first write, or on first read of a chunk that
//! has a file. Handles are never removed. Loading, flushing and dropping
//! chunk data all happen under that handle's lock, so a slot is never
//! observed half-evicted.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::checksum;
use super::chunk_cache::{ChunkCache, ChunkStats};
use super::{NodeStore, TierMeta};
use crate::config::TreeConfig;
use crate::constants::{CHUNK_EXTENSION, SPILL_DIR};
use crate::errors::{IoContext, StrataError, StrataResult};
use crate::persist;
use crate::point_info::PointInfo;

/// Occupied slots of one chunk, keyed by node index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Chunk {
    slots: BTreeMap<u64, PointInfo>,
}

#[derive(Default)]
struct ChunkSlot {
    chunk: Option<Chunk>,
    dirty: bool,
}

type ChunkHandle = Arc<Mutex<ChunkSlot>>;

/// Which chunks have a file, and where.
#[derive(Default)]
struct ChunkFiles {
    snapshot: Option<PathBuf>,
    committed: HashSet<u64>,
    spilled: DashSet<u64>,
}

fn chunk_file(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}.{}", id, CHUNK_EXTENSION))
}

/// Ids of the chunk files in `dir`.
fn chunk_ids(dir: &Path) -> StrataResult<HashSet<u64>> {
    let mut ids = HashSet::new();
    for entry in fs::read_dir(dir).at(dir)? {
        let path = entry.at(dir)?.path();
        if !path.extension().is_some_and(|ext| ext == CHUNK_EXTENSION) {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse().ok())
            .ok_or_else(|| StrataError::Corrupted(format!("unexpected chunk file {:?}", path)))?;
        ids.insert(id);
    }
    Ok(ids)
}

/// Places `src` in a snapshot at `dst`, sharing the file where the
/// filesystem allows it.
fn link_into(src: &Path, dst: &Path) -> StrataResult<()> {
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst).at(dst)?;
    }
    Ok(())
}

pub(crate) struct PagedTier {
    root: PathBuf,
    spill: PathBuf,
    begin: u64,
    size: u64,
    chunk_points: u64,
    flush_workers: usize,
    handles: DashMap<u64, ChunkHandle>,
    files: RwLock<ChunkFiles>,
    cache: ChunkCache,
}

impl PagedTier {
    /// Creates an empty tier, discarding anything left under `root`.
    pub(crate) fn create(
        root: &Path,
        begin: u64,
        size: u64,
        config: &TreeConfig,
    ) -> StrataResult<PagedTier> {
        if root.exists() {
            fs::remove_dir_all(root).at(root)?;
        }
        let tier = PagedTier::new(root, begin, size, config.chunk_points, config)?;
        fs::create_dir_all(&tier.spill).at(&tier.spill)?;
        Ok(tier)
    }

    /// Opens the committed `snapshot` under `root`. Chunks are read lazily.
    ///
    /// Spilled chunks and other generations left by an earlier session are
    /// removed: they belong to state that was never committed.
    pub(crate) fn load(
        root: &Path,
        snapshot: &Path,
        begin: u64,
        size: u64,
        chunk_points: u64,
        config: &TreeConfig,
    ) -> StrataResult<PagedTier> {
        if !snapshot.is_dir() {
            return Err(StrataError::Corrupted(format!(
                "paged tier snapshot {:?} is missing",
                snapshot
            )));
        }
        let tier = PagedTier::new(root, begin, size, chunk_points, config)?;
        let committed = chunk_ids(snapshot)?;

        for entry in fs::read_dir(root).at(root)? {
            let path = entry.at(root)?.path();
            if path != snapshot {
                persist::remove_stale(&path);
            }
        }
        fs::create_dir_all(&tier.spill).at(&tier.spill)?;

        log::debug!(
            "Opened paged tier {:?} with {} committed chunks",
            snapshot,
            committed.len()
        );
        *tier.files.write() = ChunkFiles {
            snapshot: Some(snapshot.to_path_buf()),
            committed,
            spilled: DashSet::new(),
        };
        Ok(tier)
    }

    fn new(
        root: &Path,
        begin: u64,
        size: u64,
        chunk_points: u64,
        config: &TreeConfig,
    ) -> StrataResult<PagedTier> {
        if chunk_points == 0 {
            return Err(StrataError::InvalidConfig(
                "chunk_points must be positive".into(),
            ));
        }
        Ok(PagedTier {
            root: root.to_path_buf(),
            spill: root.join(SPILL_DIR),
            begin,
            size,
            chunk_points,
            flush_workers: config.flush_workers.max(1),
            handles: DashMap::new(),
            files: RwLock::new(ChunkFiles::default()),
            cache: ChunkCache::new(config.cache_chunks),
        })
    }

    pub(crate) fn stats(&self) -> ChunkStats {
        self.cache.stats()
    }

    fn locate(&self, index: u64) -> StrataResult<u64> {
        index
            .checked_sub(self.begin)
            .filter(|rel| *rel < self.size)
            .map(|rel| rel / self.chunk_points)
            .ok_or(StrataError::NoOwningBranch(index))
    }

    fn handle(&self, id: u64) -> ChunkHandle {
        if let Some(handle) = self.handles.get(&id) {
            return Arc::clone(&handle);
        }
        Arc::clone(&self.handles.entry(id).or_default())
    }

    fn has_file(&self, id: u64) -> bool {
        let files = self.files.read();
        files.spilled.contains(&id) || files.committed.contains(&id)
    }

    /// Reads chunk `id` from its newest file, if it has one.
    fn read_chunk(&self, id: u64) -> StrataResult<Option<Chunk>> {
        let files = self.files.read();
        let path = if files.spilled.contains(&id) {
            chunk_file(&self.spill, id)
        } else {
            match &files.snapshot {
                Some(dir) if files.committed.contains(&id) => chunk_file(dir, id),
                _ => return Ok(None),
            }
        };
        let bytes = persist::read_all(&path)?;
        let chunk = checksum::open(&bytes, &format!("chunk {:?}", path))?;
        self.cache.record_read();
        log::debug!("Loaded chunk {} from {:?}", id, path);
        Ok(Some(chunk))
    }

    fn write_chunk(&self, id: u64, chunk: &Chunk) -> StrataResult<()> {
        let files = self.files.read();
        persist::write_atomic(&chunk_file(&self.spill, id), &checksum::seal(chunk)?)?;
        files.spilled.insert(id);
        self.cache.record_write();
        Ok(())
    }

    /// Makes sure the chunk behind `slot` is in memory. Returns false when
    /// the chunk has never been written and `create` is not set.
    fn ensure_loaded(&self, id: u64, slot: &mut ChunkSlot, create: bool) -> StrataResult<bool> {
        if slot.chunk.is_some() {
            self.cache.record_hit();
            return Ok(true);
        }
        self.cache.record_miss();
        match self.read_chunk(id)? {
            Some(chunk) => slot.chunk = Some(chunk),
            None if create => slot.chunk = Some(Chunk::default()),
            None => return Ok(false),
        }
        Ok(true)
    }

    /// Registers an access to chunk `id` and evicts whatever falls out of the
    /// cache. Must be called without holding any chunk lock.
    fn after_access(&self, id: u64) -> StrataResult<()> {
        match self.cache.touch(id) {
            Some(victim) => self.evict(victim),
            None => Ok(()),
        }
    }

    fn evict(&self, id: u64) -> StrataResult<()> {
        let Some(handle) = self.handles.get(&id).map(|h| Arc::clone(&h)) else {
            return Ok(());
        };
        let mut slot = handle.lock();
        if slot.dirty {
            if let Some(chunk) = &slot.chunk {
                self.write_chunk(id, chunk)?;
            }
            slot.dirty = false;
        }
        if slot.chunk.take().is_some() {
            log::debug!("Evicted chunk {} of {:?}", id, self.root);
        }
        Ok(())
    }

    fn flush(&self, id: u64, handle: &ChunkHandle) -> StrataResult<()> {
        let mut slot = handle.lock();
        if !slot.dirty {
            return Ok(());
        }
        if let Some(chunk) = &slot.chunk {
            self.write_chunk(id, chunk)?;
        }
        slot.dirty = false;
        Ok(())
    }

    /// Writes every dirty chunk to the spill directory using the flush
    /// worker pool.
    fn flush_all(&self) -> StrataResult<()> {
        let (sender, receiver) = crossbeam_channel::unbounded::<(u64, ChunkHandle)>();
        for entry in self.handles.iter() {
            // Receiver outlives the loop
            let _ = sender.send((*entry.key(), Arc::clone(entry.value())));
        }
        drop(sender);

        let workers = self.flush_workers.min(receiver.len().max(1));
        let results: Vec<StrataResult<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let receiver = receiver.clone();
                    s.spawn(move || -> StrataResult<()> {
                        for (id, handle) in receiver.iter() {
                            self.flush(id, &handle)?;
                        }
                        Ok(())
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });
        results.into_iter().collect()
    }

    /// Makes `snapshot`, previously written by `save_impl`, the committed
    /// generation and drops the one it replaces.
    ///
    /// No chunk may be written between the save and this call.
    pub(crate) fn commit(&self, snapshot: &Path) -> StrataResult<()> {
        let mut guard = self.files.write();
        let files = &mut *guard;
        let previous = files.snapshot.replace(snapshot.to_path_buf());
        files.committed.extend(files.spilled.iter().map(|id| *id));
        files.spilled.clear();

        if let Some(previous) = previous.filter(|p| p != snapshot) {
            persist::remove_stale(&previous);
        }
        persist::remove_stale(&self.spill);
        fs::create_dir_all(&self.spill).at(&self.spill)?;
        log::debug!(
            "Committed paged tier {:?} with {} chunks",
            snapshot,
            files.committed.len()
        );
        Ok(())
    }
}

impl NodeStore for PagedTier {
    fn get(&self, index: u64) -> StrataResult<Option<PointInfo>> {
        let id = self.locate(index)?;
        let existing = self.handles.get(&id).map(|h| Arc::clone(&h));
        let handle = match existing {
            Some(handle) => handle,
            None if self.has_file(id) => self.handle(id),
            None => return Ok(None),
        };
        let value = {
            let mut slot = handle.lock();
            if !self.ensure_loaded(id, &mut slot, false)? {
                return Ok(None);
            }
            slot.chunk
                .as_ref()
                .and_then(|chunk| chunk.slots.get(&index).cloned())
        };
        self.after_access(id)?;
        Ok(value)
    }

    fn update<R, F>(&self, index: u64, f: F) -> StrataResult<R>
    where
        F: FnOnce(&mut Option<PointInfo>) -> R,
    {
        let id = self.locate(index)?;
        let handle = self.handle(id);
        let result = {
            let mut guard = handle.lock();
            let slot = &mut *guard;
            self.ensure_loaded(id, slot, true)?;
            let chunk = slot.chunk.get_or_insert_with(Chunk::default);

            let mut entry = chunk.slots.remove(&index);
            let result = f(&mut entry);
            if let Some(info) = entry {
                chunk.slots.insert(index, info);
            }
            slot.dirty = true;
            result
        };
        self.after_access(id)?;
        Ok(result)
    }

    /// Writes a new generation into `path`: spilled chunks and the committed
    /// chunks they do not replace. The tier keeps reading its committed
    /// generation until [`PagedTier::commit`].
    fn save_impl(&self, path: &Path) -> StrataResult<TierMeta> {
        self.flush_all()?;

        if path.exists() {
            fs::remove_dir_all(path).at(path)?;
        }
        fs::create_dir_all(path).at(path)?;

        let files = self.files.read();
        let mut chunks = 0;
        for id in files.spilled.iter() {
            link_into(&chunk_file(&self.spill, *id), &chunk_file(path, *id))?;
            chunks += 1;
        }
        if let Some(snapshot) = &files.snapshot {
            for id in files.committed.iter().filter(|id| !files.spilled.contains(id)) {
                link_into(&chunk_file(snapshot, *id), &chunk_file(path, *id))?;
                chunks += 1;
            }
        }

        log::debug!("Wrote paged tier snapshot {:?} ({} chunk files)", path, chunks);
        Ok(TierMeta::Paged {
            chunk_points: self.chunk_points,
            chunks,
        })
    }
}
