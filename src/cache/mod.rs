//! Client/server cache model for JPIP data bins.
//!
//! Three tiers, from coarse to fine:
//!
//! - [`model`] - The basic bin cache shared by client and server sessions:
//!   `(bin_class, bin_id)` to bytes, LRU eviction, invalidation.
//! - [`precinct`] - Finer-grained layered precinct cache with
//!   merge-on-append semantics.
//! - [`manager`] - The resolution-aware client cache manager: per-image,
//!   per-resolution partitions, pinning, content-hash deduplication,
//!   compression of inactive entries, optional persistent tier.
//!
//! All in-memory operations are non-suspending; only the persistent tier
//! in [`manager`] awaits I/O.

pub mod manager;
pub mod model;
pub mod precinct;
pub mod store;

pub use manager::{
    fnv1a64, CacheManagerConfig, ImageCachePolicy, ResolutionCacheManager, UsageReport,
};
pub use model::{CacheConfig, CacheEntry, CacheModel, CacheStats};
pub use precinct::{PrecinctCache, PrecinctCacheConfig, PrecinctEntry};
pub use store::{FsStore, MemoryStore, PersistentStore};
