//! Synapse - tiered shared artifact store
//!
//! Synapse lets many concurrent callers (request handlers, pipeline stages)
//! store and retrieve named artifacts (text, embedding vectors and large
//! tensors) through one interface that picks a storage tier per call,
//! keeps every version, and guarantees at most one mutator per key.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     SharedArtifactStore                          │
//! │   per-key lock ─► permission check ─► compress ─► place ─► ledger│
//! └───────┬──────────────┬───────────────┬──────────────┬───────────┘
//!         │              │               │              │
//!  ┌──────▼─────┐ ┌──────▼──────┐ ┌──────▼──────┐ ┌─────▼──────┐
//!  │ BoundedCache│ │ Partitions  │ │ Spill files │ │ Devices    │
//!  │ (LRU bytes) │ │ (N slots)   │ │ (mmap)      │ │ (per GPU)  │
//!  └─────────────┘ └─────────────┘ └─────────────┘ └────────────┘
//! ```
//!
//! Tensors no larger than the cache capacity are compressed, split over the
//! partition slots and cached; larger ones are written to a spill file and
//! read back through a memory map. Retrieval cascades cache → partitions →
//! spill → `KeyNotFound`.
//!
//! ## Modules
//!
//! - [`memory`]: tiers, version ledger, permissions and the store façade
//! - [`sync`]: local and lease-based per-key locks
//! - [`codec`]: compression and dtype handling
//! - [`bus`]: "data ready" notifications between pipeline stages
//! - [`config`]: configuration management

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::SynapseConfig;
pub use error::{Error, Result};
pub use memory::{ArtifactKind, Metadata, Permission, SharedArtifactStore, Tensor};
