//! Time-bounded leases in a coordination backend
//!
//! A lease names a lock (`lock:<key>`), the holder that owns it and when it
//! expires. An expired lease counts as free, so a holder that crashed
//! without releasing blocks others for at most the lease timeout. Release
//! only removes a lease still owned by the releasing holder.
//!
//! Two backends are provided: [`MemoryLeaseBackend`] for a single process
//! and [`FileLeaseBackend`], which keeps one JSON lease file per name in a
//! directory shared by every participating process.

use super::local::{LocalGuard, LocalLocks};
use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::memory::spill::file_stem;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(name: &str, holder: &str, ttl: Duration) -> Self {
        let acquired_at = Utc::now();
        Self {
            name: name.to_string(),
            holder: holder.to_string(),
            acquired_at,
            expires_at: acquired_at + chrono::Duration::milliseconds(ttl.as_millis() as i64),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// External coordination service holding leases
pub trait LeaseBackend: Send + Sync {
    /// Grant `name` to `holder` if it is free or expired; `None` if a live
    /// lease is held by someone else.
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Remove the lease if `holder` still owns it. Returns `false` when the
    /// lease had already expired and been taken, or was gone.
    fn release(&self, name: &str, holder: &str) -> Result<bool>;

    /// The live lease on `name`, if any
    fn current(&self, name: &str) -> Result<Option<Lease>>;
}

/// Leases kept in process memory
#[derive(Default)]
pub struct MemoryLeaseBackend {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseBackend for MemoryLeaseBackend {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>> {
        let mut leases = self.leases.lock();
        if let Some(existing) = leases.get(name) {
            if !existing.is_expired() {
                return Ok(None);
            }
            tracing::debug!(name, holder = %existing.holder, "Taking over expired lease");
        }
        let lease = Lease::new(name, holder, ttl);
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get(name) {
            Some(lease) if lease.holder == holder => {
                leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn current(&self, name: &str) -> Result<Option<Lease>> {
        Ok(self
            .leases
            .lock()
            .get(name)
            .filter(|l| !l.is_expired())
            .cloned())
    }
}

enum LeaseFile {
    Missing,
    Live(Lease),
    /// Expired, or unreadable
    Stale(Option<Lease>),
}

/// A break marker older than this is taken to belong to a crashed process
const MARKER_ABANDONED_AFTER: Duration = Duration::from_secs(10);
const MARKER_ATTEMPTS: usize = 200;
const MARKER_RETRY: Duration = Duration::from_millis(1);

/// Leases as files in a shared directory.
///
/// A lease file is first written under a unique temporary name and then
/// hard-linked into place; linking fails if the name already exists, which
/// makes acquisition atomic across processes.
///
/// Lease files are only ever removed by a process holding the name's break
/// marker (`<name>.break`, created exclusively). Under the marker the file
/// is re-read and removed only if it still holds exactly the lease the
/// caller meant to remove. A new lease can only be linked over a missing
/// name, so nothing can replace the file between that read and the removal.
pub struct FileLeaseBackend {
    directory: PathBuf,
}

impl FileLeaseBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.lease", file_stem(name)))
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.break", file_stem(name)))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!(
            ".{}.{}.tmp",
            file_stem(name),
            uuid::Uuid::new_v4().simple()
        ))
    }

    fn read(path: &Path) -> Result<LeaseFile> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LeaseFile::Missing),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Lease>(&raw) {
            Ok(lease) if lease.is_expired() => Ok(LeaseFile::Stale(Some(lease))),
            Ok(lease) => Ok(LeaseFile::Live(lease)),
            Err(e) => {
                tracing::warn!("Unreadable lease file {}: {}", path.display(), e);
                Ok(LeaseFile::Stale(None))
            }
        }
    }

    /// Remove the lease file if `matches` accepts its current contents.
    /// `None` when another process holds the break marker.
    fn remove_if(
        &self,
        name: &str,
        matches: impl FnOnce(&LeaseFile) -> bool,
    ) -> Result<Option<bool>> {
        let marker = self.marker_path(name);
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Self::clear_abandoned_marker(&marker);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let removed = self.remove_marked(name, matches);
        if let Err(e) = std::fs::remove_file(&marker) {
            tracing::warn!("Failed to remove lease marker {}: {}", marker.display(), e);
        }
        removed.map(Some)
    }

    /// Caller holds the break marker
    fn remove_marked(&self, name: &str, matches: impl FnOnce(&LeaseFile) -> bool) -> Result<bool> {
        let path = self.path(name);
        if !matches(&Self::read(&path)?) {
            return Ok(false);
        }
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_abandoned_marker(marker: &Path) {
        let age = std::fs::metadata(marker)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        if age.is_some_and(|age| age > MARKER_ABANDONED_AFTER) {
            tracing::warn!("Removing abandoned lease marker {}", marker.display());
            let _ = std::fs::remove_file(marker);
        }
    }

    fn link_new(&self, lease: &Lease) -> Result<bool> {
        let tmp = self.temp_path(&lease.name);
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(lease)?)?;
            file.sync_all()?;
        }
        let linked = match std::fs::hard_link(&tmp, self.path(&lease.name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::from(e)),
        };
        let _ = std::fs::remove_file(&tmp);
        linked
    }
}

impl LeaseBackend for FileLeaseBackend {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<Lease>> {
        // A round that breaks an expired lease is followed by another link
        for _ in 0..3 {
            let lease = Lease::new(name, holder, ttl);
            if self.link_new(&lease)? {
                return Ok(Some(lease));
            }
            match Self::read(&self.path(name))? {
                LeaseFile::Live(_) => return Ok(None),
                LeaseFile::Missing => continue,
                LeaseFile::Stale(previous) => {
                    let previous_holder = previous.as_ref().map(|l| l.holder.clone());
                    let broken = self.remove_if(name, |now| match now {
                        LeaseFile::Stale(now) => *now == previous,
                        _ => false,
                    })?;
                    match broken {
                        Some(true) => tracing::debug!(
                            name,
                            holder = previous_holder.as_deref().unwrap_or_default(),
                            "Broke expired lease file"
                        ),
                        Some(false) => {}
                        // Another process is breaking it
                        None => return Ok(None),
                    }
                }
            }
        }
        Ok(None)
    }

    fn release(&self, name: &str, holder: &str) -> Result<bool> {
        for _ in 0..MARKER_ATTEMPTS {
            let removed = self.remove_if(name, |taken| match taken {
                LeaseFile::Live(lease) | LeaseFile::Stale(Some(lease)) => lease.holder == holder,
                _ => false,
            })?;
            if let Some(removed) = removed {
                return Ok(removed);
            }
            std::thread::sleep(MARKER_RETRY);
        }
        Err(Error::Internal(format!(
            "break marker for lease '{}' stayed busy",
            name
        )))
    }

    fn current(&self, name: &str) -> Result<Option<Lease>> {
        match Self::read(&self.path(name))? {
            LeaseFile::Live(lease) => Ok(Some(lease)),
            _ => Ok(None),
        }
    }
}

/// Per-key lock made of a local mutex plus a lease in a shared backend.
///
/// The local mutex keeps tasks of this process from polling the backend
/// against each other; the lease excludes other processes.
pub struct LeaseLocker {
    local: LocalLocks,
    backend: Arc<dyn LeaseBackend>,
    holder_prefix: String,
    lease_ttl: Duration,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

/// Held lease; released on drop
pub struct LeaseGuard {
    name: String,
    holder: String,
    backend: Arc<dyn LeaseBackend>,
    _local: LocalGuard,
}

impl LeaseLocker {
    pub fn new(backend: Arc<dyn LeaseBackend>, holder_prefix: &str, config: &LockConfig) -> Self {
        Self {
            local: LocalLocks::new(config.sweep_threshold),
            backend,
            holder_prefix: holder_prefix.to_string(),
            lease_ttl: config.lease_timeout(),
            acquire_timeout: config.acquire_timeout(),
            retry_interval: config.retry_interval(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn LeaseBackend> {
        &self.backend
    }

    fn lease_name(key: &str) -> String {
        format!("lock:{}", key)
    }

    /// Take the key's lease, retrying until the acquire timeout
    pub async fn acquire(&self, key: &str) -> Result<LeaseGuard> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let timed_out = || Error::LockTimeout {
            key: key.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        };

        let local = tokio::time::timeout_at(deadline, self.local.acquire(key))
            .await
            .map_err(|_| timed_out())?;

        let name = Self::lease_name(key);
        let holder = format!("{}:{}", self.holder_prefix, uuid::Uuid::new_v4());
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self
                .backend
                .try_acquire(&name, &holder, self.lease_ttl)?
                .is_some()
            {
                tracing::debug!(key, holder = %holder, attempts, "Lease acquired");
                return Ok(LeaseGuard {
                    name,
                    holder,
                    backend: self.backend.clone(),
                    _local: local,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(key, attempts, "Gave up waiting for lease");
                return Err(timed_out());
            }
            let pause = {
                let max_jitter = (self.retry_interval.as_millis() as u64) / 2;
                let jitter = rand::thread_rng().gen_range(0..=max_jitter);
                self.retry_interval + Duration::from_millis(jitter)
            };
            tokio::time::sleep(pause.min(deadline - now)).await;
        }
    }

    /// Diagnostic only
    pub fn is_locked(&self, key: &str) -> bool {
        if self.local.is_locked(key) {
            return true;
        }
        match self.backend.current(&Self::lease_name(key)) {
            Ok(lease) => lease.is_some(),
            Err(e) => {
                tracing::warn!(key, "Failed to query lease: {}", e);
                false
            }
        }
    }
}

impl LeaseGuard {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        match self.backend.release(&self.name, &self.holder) {
            Ok(true) => tracing::debug!(name = %self.name, "Lease released"),
            Ok(false) => tracing::warn!(
                name = %self.name,
                holder = %self.holder,
                "Lease expired before release"
            ),
            Err(e) => tracing::warn!(name = %self.name, "Failed to release lease: {}", e),
        }
    }
}
