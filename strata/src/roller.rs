//! Traversal cursor over the implicit tree.

use crate::geometry::{BBox, Point};

/// Current cell of a descent: its bounds, depth and node index.
///
/// Starting from the root (depth 0, index 0), [`Roller::advance`] moves one
/// level down into the child cell holding a point. The choice depends only on
/// the cell bounds and the point, so the same point always reaches the same
/// index.
#[derive(Debug, Clone)]
pub struct Roller {
    bbox: BBox,
    depth: u32,
    index: u64,
}

impl Roller {
    pub fn new(root: BBox) -> Roller {
        Roller {
            bbox: root,
            depth: 0,
            index: 0,
        }
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Descends into the child containing `point`.
    ///
    /// The caller bounds the depth; the child index of a cell at the
    /// tree's maximum depth is not guaranteed to fit.
    pub fn advance(&mut self, point: &Point) {
        let slot = self.bbox.slot_for(point);
        *self = self.child(slot);
    }

    /// Cursor for the child at `slot`, leaving `self` untouched.
    pub fn child(&self, slot: u64) -> Roller {
        let factor = self.bbox.dimensions().branching_factor();
        debug_assert!(slot < factor);
        Roller {
            bbox: self.bbox.child(slot),
            depth: self.depth + 1,
            index: self.index * factor + 1 + slot,
        }
    }

    /// Cursors for every child, in slot order.
    pub fn children(&self) -> impl Iterator<Item = Roller> + '_ {
        (0..self.bbox.dimensions().branching_factor()).map(move |slot| self.child(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address;
    use crate::geometry::Dimensions;

    #[test]
    fn test_root_state() {
        let roller = Roller::new(BBox::new_2d(0.0, 0.0, 100.0, 100.0));
        assert_eq!(roller.depth(), 0);
        assert_eq!(roller.index(), 0);
    }

    #[test]
    fn test_advance_indices() {
        let mut roller = Roller::new(BBox::new_2d(0.0, 0.0, 100.0, 100.0));
        let point = Point::new(10.0, 60.0);

        roller.advance(&point);
        assert_eq!(roller.depth(), 1);
        assert_eq!(roller.index(), 3); // slot 2
        assert_eq!(roller.bbox(), &BBox::new_2d(0.0, 50.0, 50.0, 100.0));

        roller.advance(&point);
        assert_eq!(roller.depth(), 2);
        assert_eq!(roller.index(), 3 * 4 + 1); // slot 0
    }

    #[test]
    fn test_descent_is_deterministic() {
        let root = BBox::new_3d(-10.0, -10.0, -10.0, 10.0, 10.0, 10.0);
        let point = Point::new_3d(1.25, -7.5, 3.3);

        let descend = || {
            let mut roller = Roller::new(root);
            for _ in 0..12 {
                roller.advance(&point);
            }
            roller.index()
        };

        let first = descend();
        for _ in 0..5 {
            assert_eq!(descend(), first);
        }
    }

    #[test]
    fn test_index_stays_within_level() {
        let root = BBox::new_3d(0.0, 0.0, 0.0, 1.0, 1.0, 1.0);
        let mut roller = Roller::new(root);
        let point = Point::new_3d(0.99, 0.01, 0.73);
        for depth in 1..10u32 {
            roller.advance(&point);
            let begin = address::depth_offset(depth, Dimensions::Three).unwrap();
            let end = address::depth_offset(depth + 1, Dimensions::Three).unwrap();
            assert!(roller.index() >= begin && roller.index() < end);
            assert!(roller.bbox().contains(&point));
        }
    }

    #[test]
    fn test_children_cover_all_slots() {
        let roller = Roller::new(BBox::new_2d(0.0, 0.0, 4.0, 4.0));
        let indices: Vec<u64> = roller.children().map(|c| c.index()).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }
}
