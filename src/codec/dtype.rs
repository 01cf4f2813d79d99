//! Element types and casts
//!
//! Maps canonical element-type names to byte widths and converts typed
//! little-endian buffers between numeric representations. Unknown names
//! resolve to [`DType::DEFAULT`] with `fallback` set, so callers can tell a
//! real `float32` apart from a name that was not recognised.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float16,
    Float32,
    Float64,
    Int32,
    Int64,
}

/// Outcome of resolving a dtype name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub dtype: DType,
    /// The name was not recognised and `dtype` is the default
    pub fallback: bool,
}

impl DType {
    /// Element type used when a name is not recognised
    pub const DEFAULT: DType = DType::Float32;

    pub const ALL: [DType; 5] = [
        DType::Float16,
        DType::Float32,
        DType::Float64,
        DType::Int32,
        DType::Int64,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
        }
    }

    /// Width of one element in bytes
    pub fn width(&self) -> usize {
        match self {
            DType::Float16 => 2,
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::Float64)
    }

    /// Exact lookup by canonical name
    pub fn from_name(name: &str) -> Option<DType> {
        Self::ALL.into_iter().find(|d| d.name() == name)
    }

    /// Lookup with fallback to [`DType::DEFAULT`]
    pub fn resolve(name: &str) -> Resolved {
        match Self::from_name(name) {
            Some(dtype) => Resolved {
                dtype,
                fallback: false,
            },
            None => {
                tracing::debug!(name, "Unknown dtype, falling back to {}", Self::DEFAULT);
                Resolved {
                    dtype: Self::DEFAULT,
                    fallback: true,
                }
            }
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
enum Scalar {
    Float(f64),
    Int(i64),
}

fn read(dtype: DType, chunk: &[u8]) -> Scalar {
    match dtype {
        DType::Float16 => Scalar::Float(half::f16::from_le_bytes([chunk[0], chunk[1]]).to_f64()),
        DType::Float32 => {
            Scalar::Float(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64)
        }
        DType::Float64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&chunk[..8]);
            Scalar::Float(f64::from_le_bytes(b))
        }
        DType::Int32 => {
            Scalar::Int(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64)
        }
        DType::Int64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&chunk[..8]);
            Scalar::Int(i64::from_le_bytes(b))
        }
    }
}

fn write(dtype: DType, value: Scalar, out: &mut Vec<u8>) {
    // Float to int truncates toward zero and saturates; NaN becomes 0.
    match (dtype, value) {
        (DType::Float16, Scalar::Float(v)) => out.extend_from_slice(&half::f16::from_f64(v).to_le_bytes()),
        (DType::Float16, Scalar::Int(v)) => {
            out.extend_from_slice(&half::f16::from_f64(v as f64).to_le_bytes())
        }
        (DType::Float32, Scalar::Float(v)) => out.extend_from_slice(&(v as f32).to_le_bytes()),
        (DType::Float32, Scalar::Int(v)) => out.extend_from_slice(&(v as f32).to_le_bytes()),
        (DType::Float64, Scalar::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (DType::Float64, Scalar::Int(v)) => out.extend_from_slice(&(v as f64).to_le_bytes()),
        (DType::Int32, Scalar::Float(v)) => out.extend_from_slice(&(v as i32).to_le_bytes()),
        (DType::Int32, Scalar::Int(v)) => out.extend_from_slice(&(v as i32).to_le_bytes()),
        (DType::Int64, Scalar::Float(v)) => out.extend_from_slice(&(v as i64).to_le_bytes()),
        (DType::Int64, Scalar::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
    }
}

/// Cast a little-endian buffer of `from` elements to `to` elements.
///
/// Trailing bytes that do not form a whole element are ignored.
pub fn cast_bytes(data: &[u8], from: DType, to: DType) -> Vec<u8> {
    if from == to {
        return data.to_vec();
    }
    let count = data.len() / from.width();
    let mut out = Vec::with_capacity(count * to.width());
    for chunk in data.chunks_exact(from.width()) {
        write(to, read(from, chunk), &mut out);
    }
    out
}

/// Read element `index` of a typed buffer as `f64`.
///
/// Returns `None` when the index is past the end of the buffer.
pub fn element_at(data: &[u8], dtype: DType, index: usize) -> Option<f64> {
    let start = index.checked_mul(dtype.width())?;
    let chunk = data.get(start..start + dtype.width())?;
    Some(match read(dtype, chunk) {
        Scalar::Float(v) => v,
        Scalar::Int(v) => v as f64,
    })
}

/// Encode `f32` values as a little-endian `float32` buffer
pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a typed buffer into `f64` values
pub fn decode_f64(data: &[u8], dtype: DType) -> Vec<f64> {
    data.chunks_exact(dtype.width())
        .map(|chunk| match read(dtype, chunk) {
            Scalar::Float(v) => v,
            Scalar::Int(v) => v as f64,
        })
        .collect()
}
