//! Packed sample buffers handed to the tree for ingestion.

use std::sync::Arc;

use crate::errors::{StrataError, StrataResult};
use crate::geometry::{Dimensions, Point};
use crate::schema::{AxisField, Schema};

/// A batch of samples packed according to a [`Schema`].
#[derive(Debug, Clone)]
pub struct PointBuffer {
    schema: Arc<Schema>,
    data: Vec<u8>,
}

impl PointBuffer {
    pub fn new(schema: Arc<Schema>) -> PointBuffer {
        PointBuffer {
            schema,
            data: Vec::new(),
        }
    }

    /// Wraps already-packed bytes. The length must be a whole number of samples.
    pub fn from_bytes(schema: Arc<Schema>, data: Vec<u8>) -> StrataResult<PointBuffer> {
        let point_size = schema.point_size();
        if data.len() % point_size != 0 {
            return Err(StrataError::InvalidConfig(format!(
                "buffer of {} bytes is not a multiple of the {} byte point size",
                data.len(),
                point_size
            )));
        }
        Ok(PointBuffer { schema, data })
    }

    /// Appends one sample given one value per schema dimension.
    pub fn push(&mut self, values: &[f64]) -> StrataResult<()> {
        let dims = self.schema.dims();
        if values.len() != dims.len() {
            return Err(StrataError::InvalidConfig(format!(
                "expected {} values per sample, got {}",
                dims.len(),
                values.len()
            )));
        }
        let start = self.data.len();
        self.data.resize(start + self.schema.point_size(), 0);
        let mut offset = start;
        for (dim, value) in dims.iter().zip(values) {
            dim.kind.write_f64(*value, &mut self.data[offset..]);
            offset += dim.kind.size();
        }
        Ok(())
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn num_points(&self) -> usize {
        self.data.len() / self.schema.point_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes of sample `index`.
    pub fn sample(&self, index: usize) -> &[u8] {
        let size = self.schema.point_size();
        &self.data[index * size..(index + 1) * size]
    }

    /// Named field of sample `index` widened to f64.
    pub fn get_f64(&self, name: &str, index: usize) -> Option<f64> {
        let (offset, kind) = self.schema.find(name)?;
        Some(kind.read_f64(&self.sample(index)[offset..]))
    }

    pub(crate) fn point_with(&self, fields: &[AxisField], index: usize) -> Point {
        let sample = self.sample(index);
        let mut coords = [0.0f64; 3];
        for (axis, field) in fields.iter().enumerate() {
            coords[axis] = field.kind.read_f64(&sample[field.offset..]);
        }
        Point::new_3d(coords[0], coords[1], coords[2])
    }

    /// Coordinates of sample `index` over `dims` axes.
    pub fn point(&self, index: usize, dims: Dimensions) -> StrataResult<Point> {
        let fields = self.schema.axis_fields(dims)?;
        Ok(self.point_with(&fields, index))
    }
}
