//! Disk-backed spill tier
//!
//! Tensors too large for the cache are written to one memory-mapped file per
//! key. The data file holds the raw typed buffer and nothing else, so reading
//! it back requires the dtype and shape. A JSON sidecar next to each data
//! file records both, along with the byte length and a SHA-256 of the
//! buffer, and every retrieve checks the caller's description against it.
//!
//! Directory layout:
//! ```text
//! <spill dir>/
//! ├── <key>.mmap        raw little-endian elements
//! └── <key>.meta.json   SpillDescriptor
//! ```
//!
//! Writes go to a temporary file that is renamed over the target, so an
//! update replaces the whole file and a mapping held by a reader keeps
//! seeing the previous contents.

use super::artifact::Tensor;
use crate::codec::dtype::{self, DType};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const DATA_EXT: &str = "mmap";
const SIDECAR_SUFFIX: &str = ".meta.json";

/// Sidecar description of a spill file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillDescriptor {
    pub key: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub len: usize,
    /// SHA-256 of the data file, hex encoded
    pub checksum: String,
    pub written_at: DateTime<Utc>,
}

/// Read-only typed view over a mapped spill file
pub struct SpillView {
    descriptor: SpillDescriptor,
    map: Option<Mmap>,
}

impl SpillView {
    pub fn descriptor(&self) -> &SpillDescriptor {
        &self.descriptor
    }

    pub fn dtype(&self) -> DType {
        self.descriptor.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.descriptor.shape
    }

    /// The mapped bytes; pages are faulted in on access
    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.descriptor.len
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.len == 0
    }

    /// Read a single element without touching the rest of the file
    pub fn element(&self, index: usize) -> Option<f64> {
        dtype::element_at(self.as_bytes(), self.descriptor.dtype, index)
    }

    /// Copy the mapped buffer into an owned tensor
    pub fn to_tensor(&self) -> Result<Tensor> {
        Tensor::new(
            self.descriptor.dtype,
            self.descriptor.shape.clone(),
            self.as_bytes().to_vec(),
        )
    }
}

/// Manages spill files in one directory
pub struct SpillManager {
    directory: PathBuf,
    verify_checksum: bool,
}

impl SpillManager {
    /// Open (and create if needed) a spill directory
    pub fn new(directory: impl Into<PathBuf>, verify_checksum: bool) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            verify_checksum,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", file_stem(key), DATA_EXT))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{}{}", file_stem(key), SIDECAR_SUFFIX))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!(".{}.{}.tmp", file_stem(key), uuid::Uuid::new_v4().simple()))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.data_path(key).exists()
    }

    /// Persist a tensor's raw buffer under `key`
    pub fn store(&self, key: &str, tensor: &Tensor) -> Result<SpillDescriptor> {
        let data = tensor.data();
        let descriptor = SpillDescriptor {
            key: key.to_string(),
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            len: data.len(),
            checksum: checksum(data),
            written_at: Utc::now(),
        };

        let data_tmp = self.temp_path(key);
        let sidecar_tmp = self.temp_path(key);
        let written = write_mapped(&data_tmp, data)
            .map_err(Error::from)
            .and_then(|()| {
                let sidecar = serde_json::to_vec_pretty(&descriptor)?;
                std::fs::write(&sidecar_tmp, sidecar)?;
                Ok(())
            })
            .and_then(|()| self.install(key, &data_tmp, &sidecar_tmp));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&data_tmp);
            let _ = std::fs::remove_file(&sidecar_tmp);
            return Err(e);
        }

        tracing::debug!(key, bytes = descriptor.len, "Spilled tensor to disk");
        Ok(descriptor)
    }

    /// Rename both written temp files into place. If the sidecar cannot be
    /// installed the new data file is removed along with the old sidecar,
    /// so the key reads as missing rather than mismatched.
    fn install(&self, key: &str, data_tmp: &Path, sidecar_tmp: &Path) -> Result<()> {
        let data_path = self.data_path(key);
        std::fs::rename(data_tmp, &data_path)?;
        if let Err(e) = std::fs::rename(sidecar_tmp, self.sidecar_path(key)) {
            tracing::warn!(key, "Failed to install spill sidecar: {}", e);
            let _ = std::fs::remove_file(&data_path);
            let _ = std::fs::remove_file(self.sidecar_path(key));
            return Err(e.into());
        }
        Ok(())
    }

    /// Replace an existing spill file wholesale
    pub fn update(&self, key: &str, tensor: &Tensor) -> Result<SpillDescriptor> {
        if !self.exists(key) {
            return Err(Error::KeyNotFound(key.to_string()));
        }
        self.store(key, tensor)
    }

    /// Read the sidecar for a key, if there is one
    pub fn describe(&self, key: &str) -> Result<Option<SpillDescriptor>> {
        match std::fs::read(self.sidecar_path(key)) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Map a spill file, checking the caller's dtype and shape
    pub fn retrieve(&self, key: &str, dtype: DType, shape: &[usize]) -> Result<SpillView> {
        let descriptor = match self.describe(key)? {
            Some(d) => d,
            None if self.exists(key) => {
                tracing::warn!(key, "Spill file has no sidecar; trusting caller layout");
                let len = shape.iter().product::<usize>() * dtype.width();
                SpillDescriptor {
                    key: key.to_string(),
                    dtype,
                    shape: shape.to_vec(),
                    len,
                    checksum: String::new(),
                    written_at: Utc::now(),
                }
            }
            None => return Err(Error::KeyNotFound(key.to_string())),
        };

        if descriptor.dtype != dtype || descriptor.shape != shape {
            return Err(Error::SpillMismatch {
                key: key.to_string(),
                reason: format!(
                    "stored as {} {:?}, requested {} {:?}",
                    descriptor.dtype, descriptor.shape, dtype, shape
                ),
            });
        }

        self.map(key, descriptor)
    }

    /// Map a spill file using the layout recorded in its sidecar
    pub fn retrieve_described(&self, key: &str) -> Result<SpillView> {
        let descriptor = self
            .describe(key)?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        self.map(key, descriptor)
    }

    fn map(&self, key: &str, descriptor: SpillDescriptor) -> Result<SpillView> {
        let file = match File::open(self.data_path(key)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::KeyNotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = file.metadata()?.len() as usize;
        if actual != descriptor.len {
            return Err(Error::SpillMismatch {
                key: key.to_string(),
                reason: format!("file is {} bytes, expected {}", actual, descriptor.len),
            });
        }

        let map = if actual == 0 {
            None
        } else {
            // SAFETY: spill files are only ever replaced by rename, never
            // truncated or written in place, so the mapped inode stays intact.
            Some(unsafe { Mmap::map(&file)? })
        };

        let view = SpillView { descriptor, map };
        if self.verify_checksum && !view.descriptor.checksum.is_empty() {
            let actual = checksum(view.as_bytes());
            if actual != view.descriptor.checksum {
                return Err(Error::SpillMismatch {
                    key: key.to_string(),
                    reason: "checksum mismatch".to_string(),
                });
            }
        }
        Ok(view)
    }

    /// All spill files that carry a readable sidecar
    pub fn list(&self) -> Result<Vec<SpillDescriptor>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.directory)?.flatten() {
            let path = entry.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(SIDECAR_SUFFIX) && !n.starts_with('.'))
                .unwrap_or(false);
            if !is_sidecar {
                continue;
            }
            match std::fs::read(&path)
                .map_err(Error::from)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(Error::from))
            {
                Ok(descriptor) => out.push(descriptor),
                Err(e) => tracing::warn!("Failed to read sidecar {}: {}", path.display(), e),
            }
        }
        out.sort_by(|a: &SpillDescriptor, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

fn write_mapped(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(data.len() as u64)?;
    if data.is_empty() {
        return Ok(());
    }
    // SAFETY: the temp file name is unique to this call and not yet visible
    // under the key's name, so nothing else maps it concurrently.
    let mut map = unsafe { MmapMut::map_mut(&file)? };
    map.copy_from_slice(data);
    map.flush()
}

fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Filesystem-safe file stem for a key; bytes outside `[A-Za-z0-9_.-]` and a
/// leading dot are percent-encoded. The empty key maps to a bare `%`, which
/// no encoded key can produce.
pub(crate) fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let safe = byte.is_ascii_alphanumeric()
            || byte == b'_'
            || byte == b'-'
            || (byte == b'.' && i > 0);
        if safe {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}
