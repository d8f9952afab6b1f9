//! Points, bounding boxes and the midpoint split used to derive child cells.

use serde::{Deserialize, Serialize};

/// Number of axes subdivided at every level of the tree.
///
/// Two dimensions build a quadtree, three an octree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Dimensions {
    Two,
    Three,
}

impl Dimensions {
    /// Number of subdivided axes.
    pub fn count(self) -> u32 {
        match self {
            Dimensions::Two => 2,
            Dimensions::Three => 3,
        }
    }

    /// Children per cell, `2^D`.
    pub fn branching_factor(self) -> u64 {
        1u64 << self.count()
    }
}

impl From<Dimensions> for u32 {
    fn from(dims: Dimensions) -> Self {
        dims.count()
    }
}

impl TryFrom<u32> for Dimensions {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Dimensions::Two),
            3 => Ok(Dimensions::Three),
            other => Err(format!("unsupported dimensionality {}", other)),
        }
    }
}

/// A coordinate tuple. In two dimensions `z` is carried but never read.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Point {
        Point { x, y, z: 0.0 }
    }

    pub fn new_3d(x: f64, y: f64, z: f64) -> Point {
        Point { x, y, z }
    }

    /// Coordinate on axis 0, 1 or 2.
    pub fn axis(&self, axis: usize) -> f64 {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    fn set_axis(&mut self, axis: usize, value: f64) {
        match axis {
            0 => self.x = value,
            1 => self.y = value,
            _ => self.z = value,
        }
    }

    /// Squared euclidean distance over the first `dims` axes.
    pub fn distance_squared(&self, other: &Point, dims: Dimensions) -> f64 {
        (0..dims.count() as usize)
            .map(|axis| {
                let d = self.axis(axis) - other.axis(axis);
                d * d
            })
            .sum()
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// An axis-aligned bounding box over two or three axes.
///
/// Containment is closed on both ends. Splitting at the midpoint assigns a
/// coordinate equal to the midpoint to the upper child.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    min: Point,
    max: Point,
    dimensions: Dimensions,
}

impl BBox {
    pub fn new(min: Point, max: Point, dimensions: Dimensions) -> BBox {
        BBox {
            min,
            max,
            dimensions,
        }
    }

    pub fn new_2d(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> BBox {
        BBox::new(
            Point::new(min_x, min_y),
            Point::new(max_x, max_y),
            Dimensions::Two,
        )
    }

    pub fn new_3d(
        min_x: f64,
        min_y: f64,
        min_z: f64,
        max_x: f64,
        max_y: f64,
        max_z: f64,
    ) -> BBox {
        BBox::new(
            Point::new_3d(min_x, min_y, min_z),
            Point::new_3d(max_x, max_y, max_z),
            Dimensions::Three,
        )
    }

    pub fn min(&self) -> &Point {
        &self.min
    }

    pub fn max(&self) -> &Point {
        &self.max
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn axes(&self) -> std::ops::Range<usize> {
        0..self.dimensions.count() as usize
    }

    /// True when every axis has `min <= max` and finite bounds.
    pub fn is_valid(&self) -> bool {
        self.axes().all(|a| {
            let (lo, hi) = (self.min.axis(a), self.max.axis(a));
            lo.is_finite() && hi.is_finite() && lo <= hi
        })
    }

    pub fn mid(&self) -> Point {
        let mut mid = Point::default();
        for a in self.axes() {
            mid.set_axis(a, self.min.axis(a) + (self.max.axis(a) - self.min.axis(a)) / 2.0);
        }
        mid
    }

    pub fn contains(&self, point: &Point) -> bool {
        self.axes()
            .all(|a| point.axis(a) >= self.min.axis(a) && point.axis(a) <= self.max.axis(a))
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.axes()
            .all(|a| self.min.axis(a) <= other.max.axis(a) && self.max.axis(a) >= other.min.axis(a))
    }

    /// Child slot in `[0, 2^D)` holding `point`: bit `a` is set when the
    /// point lies in the upper half of axis `a`.
    pub fn slot_for(&self, point: &Point) -> u64 {
        let mid = self.mid();
        self.axes().fold(0u64, |slot, a| {
            if point.axis(a) >= mid.axis(a) {
                slot | (1 << a)
            } else {
                slot
            }
        })
    }

    /// Bounding box of the child cell at `slot`.
    pub fn child(&self, slot: u64) -> BBox {
        let mid = self.mid();
        let mut min = self.min;
        let mut max = self.max;
        for a in self.axes() {
            if slot & (1 << a) != 0 {
                min.set_axis(a, mid.axis(a));
            } else {
                max.set_axis(a, mid.axis(a));
            }
        }
        BBox::new(min, max, self.dimensions)
    }
}

impl std::fmt::Display for BBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BBox[{} - {}]", self.min, self.max)
    }
}
