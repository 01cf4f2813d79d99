//! Storage tiers and the store façade
//!
//! - [`cache`]: byte-bounded LRU cache (hot tier)
//! - [`partition`]: fixed partition slots for small tensors
//! - [`spill`]: memory-mapped spill files for tensors larger than the cache
//! - [`device`]: per-accelerator residency maps
//! - [`ledger`]: append-only version history
//! - [`access`]: permissions and byte quotas
//! - [`store`]: [`SharedArtifactStore`], which composes all of the above

pub mod access;
pub mod artifact;
pub mod cache;
pub mod device;
pub mod ledger;
pub mod partition;
pub mod spill;
pub mod store;

pub use access::{Permission, PermissionMap, QuotaTracker};
pub use artifact::{ArtifactKind, ArtifactRecord, Layout, Metadata, Payload, Placement, Tensor};
pub use cache::{BoundedCache, CachePut};
pub use device::DeviceMemory;
pub use ledger::{Snapshot, VersionLedger};
pub use partition::PartitionStore;
pub use spill::{SpillDescriptor, SpillManager, SpillView};
pub use store::SharedArtifactStore;
