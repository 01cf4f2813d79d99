//! Artifact data types
//!
//! A stored artifact is one of three payload shapes: UTF-8 text, a typed
//! numeric array with explicit dtype and shape, or opaque bytes. The tag is
//! carried explicitly through compression, placement and versioning, so no
//! layer ever has to guess what a buffer contains.

use crate::codec::dtype::{self, DType};
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Free-form metadata attached to an artifact
pub type Metadata = HashMap<String, serde_json::Value>;

/// A dense numeric array stored as a little-endian byte buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Bytes,
}

impl Tensor {
    /// Wrap a typed buffer, checking its length against `dtype` and `shape`
    pub fn new(dtype: DType, shape: Vec<usize>, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = expected_len(dtype, &shape)?;
        if data.len() != expected {
            return Err(Error::InvalidTensor(format!(
                "{} bytes supplied for {} {:?} (expected {})",
                data.len(),
                dtype,
                shape,
                expected
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build a `float32` tensor from values
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::new(DType::Float32, shape, dtype::encode_f32(values))
    }

    /// A 1-D `float32` tensor
    pub fn vector(values: &[f32]) -> Self {
        Self {
            dtype: DType::Float32,
            shape: vec![values.len()],
            data: Bytes::from(dtype::encode_f32(values)),
        }
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Result<Self> {
        let len = expected_len(dtype, &shape)?;
        Self::new(dtype, shape, vec![0u8; len])
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the raw buffer in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Element-wise cast to another dtype
    pub fn cast(&self, to: DType) -> Tensor {
        Tensor {
            dtype: to,
            shape: self.shape.clone(),
            data: Bytes::from(dtype::cast_bytes(&self.data, self.dtype, to)),
        }
    }

    /// All elements widened to `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        dtype::decode_f64(&self.data, self.dtype)
    }
}

fn expected_len(dtype: DType, shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(dtype.width(), |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(|| Error::InvalidTensor(format!("shape {:?} overflows", shape)))
}

/// Tagged payload threaded through compression and storage
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Numeric(Tensor),
    Opaque(Bytes),
}

impl Payload {
    /// Raw bytes to be compressed; shape information stays in the record
    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Numeric(tensor) => tensor.data(),
            Payload::Opaque(bytes) => bytes,
        }
    }

    /// Layout needed to rebuild this payload from raw bytes
    pub fn layout(&self) -> Layout {
        match self {
            Payload::Text(_) => Layout::Text,
            Payload::Numeric(tensor) => Layout::Numeric {
                dtype: tensor.dtype(),
                shape: tensor.shape().to_vec(),
            },
            Payload::Opaque(_) => Layout::Opaque,
        }
    }
}

/// How to reinterpret a decompressed buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum Layout {
    Text,
    Numeric { dtype: DType, shape: Vec<usize> },
    Opaque,
}

impl Layout {
    /// Rebuild a payload from decompressed bytes
    pub fn decode(&self, raw: Bytes) -> Result<Payload> {
        match self {
            Layout::Text => String::from_utf8(raw.to_vec())
                .map(Payload::Text)
                .map_err(|e| Error::Codec(format!("stored text is not UTF-8: {}", e))),
            Layout::Numeric { dtype, shape } => {
                Tensor::new(*dtype, shape.clone(), raw).map(Payload::Numeric)
            }
            Layout::Opaque => Ok(Payload::Opaque(raw)),
        }
    }
}

/// The kind of artifact stored under a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Vector,
    Tensor,
    Blob,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Text => "text",
            ArtifactKind::Vector => "vector",
            ArtifactKind::Tensor => "tensor",
            ArtifactKind::Blob => "blob",
        };
        f.write_str(name)
    }
}

/// Host tier holding the live copy of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Bounded cache (and partition slots for tensors)
    Memory,
    /// Memory-mapped spill file
    Spill,
}

/// One record per live key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub key: String,
    pub kind: ArtifactKind,
    pub layout: Layout,
    /// Id of the most recent snapshot
    pub version: u64,
    pub placement: Placement,
    /// Uncompressed payload size
    pub size_bytes: usize,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn dtype(&self) -> Option<DType> {
        match &self.layout {
            Layout::Numeric { dtype, .. } => Some(*dtype),
            _ => None,
        }
    }

    pub fn shape(&self) -> Option<&[usize]> {
        match &self.layout {
            Layout::Numeric { shape, .. } => Some(shape),
            _ => None,
        }
    }
}
