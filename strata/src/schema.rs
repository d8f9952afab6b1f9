//! Point attribute layout.
//!
//! A schema is an ordered list of named, fixed-width dimensions. Samples are
//! packed little-endian in schema order with no padding. The index only ever
//! interprets the `X`, `Y` and (in three dimensions) `Z` fields; every other
//! attribute travels as opaque bytes.

use serde::{Deserialize, Serialize};

use crate::errors::{StrataError, StrataResult};
use crate::geometry::Dimensions;

/// Storage type of a single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl DimType {
    /// Width in bytes.
    pub fn size(self) -> usize {
        match self {
            DimType::I8 | DimType::U8 => 1,
            DimType::I16 | DimType::U16 => 2,
            DimType::I32 | DimType::U32 | DimType::F32 => 4,
            DimType::I64 | DimType::U64 | DimType::F64 => 8,
        }
    }

    /// Reads a value of this type from the front of `bytes`, widened to f64.
    pub(crate) fn read_f64(self, bytes: &[u8]) -> f64 {
        fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(&bytes[..N]);
            out
        }
        match self {
            DimType::I8 => bytes[0] as i8 as f64,
            DimType::U8 => bytes[0] as f64,
            DimType::I16 => i16::from_le_bytes(arr(bytes)) as f64,
            DimType::U16 => u16::from_le_bytes(arr(bytes)) as f64,
            DimType::I32 => i32::from_le_bytes(arr(bytes)) as f64,
            DimType::U32 => u32::from_le_bytes(arr(bytes)) as f64,
            DimType::I64 => i64::from_le_bytes(arr(bytes)) as f64,
            DimType::U64 => u64::from_le_bytes(arr(bytes)) as f64,
            DimType::F32 => f32::from_le_bytes(arr(bytes)) as f64,
            DimType::F64 => f64::from_le_bytes(arr(bytes)),
        }
    }

    /// Writes `value` narrowed to this type into the front of `out`.
    pub(crate) fn write_f64(self, value: f64, out: &mut [u8]) {
        match self {
            DimType::I8 => out[..1].copy_from_slice(&(value as i8).to_le_bytes()),
            DimType::U8 => out[..1].copy_from_slice(&(value as u8).to_le_bytes()),
            DimType::I16 => out[..2].copy_from_slice(&(value as i16).to_le_bytes()),
            DimType::U16 => out[..2].copy_from_slice(&(value as u16).to_le_bytes()),
            DimType::I32 => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
            DimType::U32 => out[..4].copy_from_slice(&(value as u32).to_le_bytes()),
            DimType::I64 => out[..8].copy_from_slice(&(value as i64).to_le_bytes()),
            DimType::U64 => out[..8].copy_from_slice(&(value as u64).to_le_bytes()),
            DimType::F32 => out[..4].copy_from_slice(&(value as f32).to_le_bytes()),
            DimType::F64 => out[..8].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

/// A named dimension of the point layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DimType,
}

impl DimInfo {
    pub fn new(name: &str, kind: DimType) -> DimInfo {
        DimInfo {
            name: name.to_string(),
            kind,
        }
    }
}

/// Location of one coordinate inside a packed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AxisField {
    pub offset: usize,
    pub kind: DimType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    dims: Vec<DimInfo>,
}

impl Schema {
    /// Builds a schema, rejecting empty layouts and duplicate names.
    pub fn new(dims: Vec<DimInfo>) -> StrataResult<Schema> {
        if dims.is_empty() {
            return Err(StrataError::InvalidConfig("schema has no dimensions".into()));
        }
        for (i, dim) in dims.iter().enumerate() {
            if dims[..i].iter().any(|d| d.name == dim.name) {
                return Err(StrataError::InvalidConfig(format!(
                    "duplicate schema dimension '{}'",
                    dim.name
                )));
            }
        }
        Ok(Schema { dims })
    }

    /// Double-precision `X`, `Y`, `Z`.
    pub fn xyz() -> Schema {
        Schema {
            dims: vec![
                DimInfo::new("X", DimType::F64),
                DimInfo::new("Y", DimType::F64),
                DimInfo::new("Z", DimType::F64),
            ],
        }
    }

    pub fn dims(&self) -> &[DimInfo] {
        &self.dims
    }

    /// Bytes per packed sample.
    pub fn point_size(&self) -> usize {
        self.dims.iter().map(|d| d.kind.size()).sum()
    }

    /// Byte offset and type of the named dimension.
    pub fn find(&self, name: &str) -> Option<(usize, DimType)> {
        let mut offset = 0;
        for dim in &self.dims {
            if dim.name == name {
                return Some((offset, dim.kind));
            }
            offset += dim.kind.size();
        }
        None
    }

    /// Coordinate fields for `dims` axes, in axis order.
    pub(crate) fn axis_fields(&self, dims: Dimensions) -> StrataResult<Vec<AxisField>> {
        ["X", "Y", "Z"][..dims.count() as usize]
            .iter()
            .map(|name| {
                self.find(name)
                    .map(|(offset, kind)| AxisField { offset, kind })
                    .ok_or_else(|| {
                        StrataError::InvalidConfig(format!(
                            "schema lacks coordinate dimension '{}'",
                            name
                        ))
                    })
            })
            .collect()
    }
}
