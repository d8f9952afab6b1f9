//! Fully in-memory tier with one lock per node slot.

use std::path::Path;

use parking_lot::Mutex;

use super::checksum;
use super::{NodeStore, TierMeta};
use crate::errors::{StrataError, StrataResult};
use crate::persist;
use crate::point_info::PointInfo;

pub(crate) struct ResidentTier {
    begin: u64,
    slots: Vec<Mutex<Option<PointInfo>>>,
}

impl ResidentTier {
    pub(crate) fn new(begin: u64, size: u64) -> StrataResult<ResidentTier> {
        let len = usize::try_from(size).map_err(|_| {
            StrataError::InvalidConfig(format!("resident tier of {} slots does not fit in memory", size))
        })?;
        let mut slots = Vec::new();
        slots.try_reserve_exact(len).map_err(|e| {
            StrataError::InvalidConfig(format!("resident tier of {} slots: {}", size, e))
        })?;
        slots.resize_with(len, || Mutex::new(None));
        Ok(ResidentTier { begin, slots })
    }

    /// Rebuilds the tier from the sparse snapshot written by `save_impl`.
    pub(crate) fn load(path: &Path, begin: u64, size: u64) -> StrataResult<ResidentTier> {
        let tier = ResidentTier::new(begin, size)?;
        let bytes = persist::read_all(path)?;
        let entries: Vec<(u64, PointInfo)> =
            checksum::open(&bytes, &format!("resident snapshot {:?}", path))?;

        for (index, info) in entries {
            let slot = tier.slot(index).map_err(|_| {
                StrataError::Corrupted(format!(
                    "resident snapshot {:?} holds index {} outside [{}, {})",
                    path,
                    index,
                    begin,
                    begin + size
                ))
            })?;
            *slot.lock() = Some(info);
        }
        Ok(tier)
    }

    fn slot(&self, index: u64) -> StrataResult<&Mutex<Option<PointInfo>>> {
        index
            .checked_sub(self.begin)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| self.slots.get(i))
            .ok_or(StrataError::NoOwningBranch(index))
    }
}

impl NodeStore for ResidentTier {
    fn get(&self, index: u64) -> StrataResult<Option<PointInfo>> {
        Ok(self.slot(index)?.lock().clone())
    }

    fn update<R, F>(&self, index: u64, f: F) -> StrataResult<R>
    where
        F: FnOnce(&mut Option<PointInfo>) -> R,
    {
        let mut guard = self.slot(index)?.lock();
        Ok(f(&mut guard))
    }

    fn save_impl(&self, path: &Path) -> StrataResult<TierMeta> {
        let entries: Vec<(u64, PointInfo)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.lock()
                    .as_ref()
                    .map(|info| (self.begin + i as u64, info.clone()))
            })
            .collect();

        let points = entries.len() as u64;
        persist::write_atomic(path, &checksum::seal(&entries)?)?;
        Ok(TierMeta::Resident { points })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use tempfile::tempdir;

    fn info(origin: u64) -> PointInfo {
        PointInfo::new(Point::new(origin as f64, 0.0), origin, vec![origin as u8; 4])
    }

    #[test]
    fn test_get_update() {
        let tier = ResidentTier::new(1, 4).unwrap();
        assert_eq!(tier.get(1).unwrap(), None);

        let previous = tier.update(2, |slot| slot.replace(info(7))).unwrap();
        assert!(previous.is_none());
        assert_eq!(tier.get(2).unwrap(), Some(info(7)));

        // Closure sees the current occupant
        let seen = tier.update(2, |slot| slot.as_ref().map(|i| i.origin)).unwrap();
        assert_eq!(seen, Some(7));
    }

    #[test]
    fn test_out_of_range_index() {
        let tier = ResidentTier::new(1, 4).unwrap();
        assert!(matches!(tier.get(0), Err(StrataError::NoOwningBranch(0))));
        assert!(matches!(tier.get(5), Err(StrataError::NoOwningBranch(5))));
    }

    #[test]
    fn test_oversized_tier_is_an_error() {
        let result = ResidentTier::new(0, u64::MAX / 4);
        assert!(matches!(result, Err(StrataError::InvalidConfig(_))));
    }

    #[test]
    fn test_save_load_sparse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resident-0-2.bin");

        let tier = ResidentTier::new(0, 5).unwrap();
        tier.update(0, |s| *s = Some(info(1))).unwrap();
        tier.update(4, |s| *s = Some(info(2))).unwrap();

        let meta = tier.save_impl(&path).unwrap();
        assert_eq!(meta, TierMeta::Resident { points: 2 });

        let loaded = ResidentTier::load(&path, 0, 5).unwrap();
        assert_eq!(loaded.get(0).unwrap(), Some(info(1)));
        assert_eq!(loaded.get(4).unwrap(), Some(info(2)));
        for index in 1..4 {
            assert_eq!(loaded.get(index).unwrap(), None);
        }
    }

    #[test]
    fn test_load_rejects_foreign_indices() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resident.bin");

        let tier = ResidentTier::new(0, 5).unwrap();
        tier.update(4, |s| *s = Some(info(2))).unwrap();
        tier.save_impl(&path).unwrap();

        let result = ResidentTier::load(&path, 0, 3);
        assert!(matches!(result, Err(StrataError::Corrupted(_))));
    }
}
