//! Flat tier: a contiguous array of fixed-size node records.
//!
//! In memory the array is split into chunks of `chunk_points` slots, each
//! behind its own lock and materialized on first write. After a reload the
//! saved file is memory-mapped and untouched chunks are read straight from
//! the mapping. Record `i` of the file is the slot at index `begin + i`; an
//! all-zero record decodes as an empty slot.

use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use parking_lot::RwLock;

use super::{NodeStore, TierMeta};
use crate::errors::{IoContext, StrataError, StrataResult};
use crate::geometry::Point;
use crate::persist;
use crate::point_info::PointInfo;

type Records = Vec<Option<PointInfo>>;

/// Encoded size of one occupied slot for samples of `point_size` bytes.
pub(crate) fn record_size(point_size: usize) -> StrataResult<usize> {
    let prototype = Some(PointInfo::new(Point::default(), 0, vec![0; point_size]));
    Ok(bincode::serde::encode_to_vec(&prototype, bincode::config::legacy())?.len())
}

pub(crate) struct FlatTier {
    begin: u64,
    size: u64,
    chunk_points: u64,
    record_size: usize,
    chunks: Vec<RwLock<Option<Records>>>,
    backing: Option<Mmap>,
}

impl FlatTier {
    pub(crate) fn new(
        begin: u64,
        size: u64,
        chunk_points: u64,
        point_size: usize,
    ) -> StrataResult<FlatTier> {
        if chunk_points == 0 {
            return Err(StrataError::InvalidConfig(
                "chunk_points must be positive".into(),
            ));
        }
        let num_chunks = usize::try_from(size.div_ceil(chunk_points)).map_err(|_| {
            StrataError::InvalidConfig(format!("flat tier of {} slots is too large", size))
        })?;
        let mut chunks = Vec::new();
        chunks.try_reserve_exact(num_chunks).map_err(|e| {
            StrataError::InvalidConfig(format!("flat tier of {} slots: {}", size, e))
        })?;
        chunks.resize_with(num_chunks, || RwLock::new(None));

        Ok(FlatTier {
            begin,
            size,
            chunk_points,
            record_size: record_size(point_size)?,
            chunks,
            backing: None,
        })
    }

    /// Maps the file written by `save_impl`.
    pub(crate) fn load(
        path: &Path,
        begin: u64,
        size: u64,
        chunk_points: u64,
        point_size: usize,
        saved_record_size: u64,
    ) -> StrataResult<FlatTier> {
        let mut tier = FlatTier::new(begin, size, chunk_points, point_size)?;
        if saved_record_size != tier.record_size as u64 {
            return Err(StrataError::Corrupted(format!(
                "flat tier {:?} was written with {}-byte records, schema needs {}",
                path, saved_record_size, tier.record_size
            )));
        }

        let file = File::open(path).at(path)?;
        let len = file.metadata().at(path)?.len();
        let expected = size * tier.record_size as u64;
        if len != expected {
            return Err(StrataError::Corrupted(format!(
                "flat tier {:?} is {} bytes, expected {}",
                path, len, expected
            )));
        }

        // SAFETY: the tree only ever replaces this file through an atomic
        // rename, which leaves the mapped inode intact.
        let map = unsafe { Mmap::map(&file) }.at(path)?;
        tier.backing = Some(map);
        Ok(tier)
    }

    fn locate(&self, index: u64) -> StrataResult<(usize, usize)> {
        let rel = index
            .checked_sub(self.begin)
            .filter(|rel| *rel < self.size)
            .ok_or(StrataError::NoOwningBranch(index))?;
        Ok((
            (rel / self.chunk_points) as usize,
            (rel % self.chunk_points) as usize,
        ))
    }

    /// Relative slot range covered by `chunk`.
    fn chunk_range(&self, chunk: usize) -> Range<u64> {
        let start = chunk as u64 * self.chunk_points;
        start..(start + self.chunk_points).min(self.size)
    }

    fn byte_range(&self, slots: Range<u64>) -> Range<usize> {
        let record = self.record_size;
        slots.start as usize * record..slots.end as usize * record
    }

    fn decode_record(&self, map: &Mmap, rel: u64) -> StrataResult<Option<PointInfo>> {
        let bytes = &map[self.byte_range(rel..rel + 1)];
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map_err(|e| {
                StrataError::Corrupted(format!(
                    "flat record at index {}: {}",
                    self.begin + rel,
                    e
                ))
            })?;
        Ok(record)
    }

    fn materialize(&self, chunk: usize) -> StrataResult<Records> {
        let range = self.chunk_range(chunk);
        match &self.backing {
            Some(map) => range.map(|rel| self.decode_record(map, rel)).collect(),
            None => Ok(vec![None; (range.end - range.start) as usize]),
        }
    }
}

impl NodeStore for FlatTier {
    fn get(&self, index: u64) -> StrataResult<Option<PointInfo>> {
        let (chunk, offset) = self.locate(index)?;
        let guard = self.chunks[chunk].read();
        match (&*guard, &self.backing) {
            (Some(records), _) => Ok(records[offset].clone()),
            (None, Some(map)) => self.decode_record(map, index - self.begin),
            (None, None) => Ok(None),
        }
    }

    fn update<R, F>(&self, index: u64, f: F) -> StrataResult<R>
    where
        F: FnOnce(&mut Option<PointInfo>) -> R,
    {
        let (chunk, offset) = self.locate(index)?;
        let mut guard = self.chunks[chunk].write();
        let records = match guard.take() {
            Some(records) => guard.insert(records),
            None => guard.insert(self.materialize(chunk)?),
        };
        Ok(f(&mut records[offset]))
    }

    fn save_impl(&self, path: &Path) -> StrataResult<TierMeta> {
        let record_size = self.record_size;
        persist::write_atomic_with(path, |w| {
            let zeros = vec![0u8; record_size];
            for (chunk, lock) in self.chunks.iter().enumerate() {
                let guard = lock.read();
                let range = self.chunk_range(chunk);
                match (&*guard, &self.backing) {
                    (Some(records), _) => {
                        for (rel, record) in range.zip(records) {
                            let mut bytes =
                                bincode::serde::encode_to_vec(record, bincode::config::legacy())?;
                            if bytes.len() > record_size {
                                return Err(StrataError::InvalidConfig(format!(
                                    "sample at index {} does not match the schema point size",
                                    self.begin + rel
                                )));
                            }
                            bytes.resize(record_size, 0);
                            w.write_all(&bytes).at(path)?;
                        }
                    }
                    (None, Some(map)) => {
                        w.write_all(&map[self.byte_range(range)]).at(path)?;
                    }
                    (None, None) => {
                        for _ in range {
                            w.write_all(&zeros).at(path)?;
                        }
                    }
                }
            }
            Ok(())
        })?;

        Ok(TierMeta::Flat {
            record_size: record_size as u64,
        })
    }
}
