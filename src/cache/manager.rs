//! Resolution-aware client cache manager.
//!
//! Builds on the basic bin cache with a two-level partition index
//! `partitions[image_id][resolution_level]`, per-image policies with pinned
//! resolution levels, content-hash deduplication accounting, zlib
//! compression of inactive entries, and an optional persistent tier.
//!
//! # Eviction
//!
//! The victim is the non-pinned entry with the lowest score
//! `resolution_weight * recency * frequency`, where lower resolution levels
//! weigh more (`1 / (r + 1)` unless overridden), `recency = 1 / (1 + age)`
//! and `frequency = access_count + 1`. Pinned entries are never chosen.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codestream::{BinClass, DataBin};
use crate::error::StoreError;

use super::store::PersistentStore;

/// Default memory budget: 256MB.
pub const DEFAULT_MANAGER_MAX_MEMORY: usize = 256 * 1024 * 1024;

/// Default entry limit.
pub const DEFAULT_MANAGER_MAX_ENTRIES: usize = 100_000;

/// Default inactivity threshold before an entry is eligible for compression.
pub const DEFAULT_COMPRESSION_INACTIVITY: Duration = Duration::from_secs(60);

/// 64-bit FNV-1a over a byte slice.
///
/// Used for content deduplication and transcode-cache tagging; the hash is
/// stable across process restarts, which persistence relies on.
pub fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Content hash over `(bin_class, bytes)`.
fn content_hash(class: BinClass, bytes: &[u8]) -> u64 {
    let mut hash = fnv1a64(&[class.as_u8()]);
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Global limits and knobs for the manager.
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    /// Maximum total in-memory payload bytes
    pub max_memory: usize,

    /// Maximum number of entries
    pub max_entries: usize,

    /// Per-level eviction weight overrides; absent levels use `1 / (r + 1)`
    pub resolution_weights: HashMap<u32, f64>,

    /// Whether to maintain the content-hash index
    pub enable_deduplication: bool,

    /// Default inactivity threshold for [`ResolutionCacheManager::compress_inactive_entries`]
    pub compression_inactivity_threshold: Duration,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            max_memory: DEFAULT_MANAGER_MAX_MEMORY,
            max_entries: DEFAULT_MANAGER_MAX_ENTRIES,
            resolution_weights: HashMap::new(),
            enable_deduplication: true,
            compression_inactivity_threshold: DEFAULT_COMPRESSION_INACTIVITY,
        }
    }
}

/// Per-image cache policy.
#[derive(Debug, Clone, Default)]
pub struct ImageCachePolicy {
    /// In-memory budget for this image's entries, if bounded
    pub max_memory: Option<usize>,

    /// Persistent-tier budget for this image, if bounded
    pub max_disk: Option<usize>,

    /// Resolution levels whose entries are never evicted or compressed
    pub pinned_resolutions: HashSet<u32>,

    /// Whether this image participates in compression sweeps
    pub compress_inactive: bool,

    /// Per-image override of the inactivity threshold
    pub compression_inactivity_threshold: Option<Duration>,
}

/// One managed entry.
#[derive(Debug, Clone)]
struct ManagedEntry {
    bin: DataBin,
    image_id: String,
    resolution_level: u32,
    timestamp: Instant,
    last_access: Instant,
    access_count: u64,
    original_size: usize,
    current_size: usize,
    compressed: Option<Bytes>,
    content_hash: u64,
    pinned: bool,
}

/// One `(image_id, resolution_level)` partition.
#[derive(Debug, Default)]
struct Partition {
    entries: HashMap<String, ManagedEntry>,
    total_size: usize,
}

/// Per-image aggregates in a [`UsageReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUsage {
    pub image_id: String,
    pub memory_bytes: usize,
    pub entry_count: usize,
    pub resolution_levels: usize,
}

/// Per-resolution aggregates in a [`UsageReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionUsage {
    pub resolution_level: u32,
    pub memory_bytes: usize,
    pub entry_count: usize,
    pub image_count: usize,
}

/// Aggregated diagnostics over the whole manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub total_size: usize,
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dedup_saved_bytes: u64,
    pub compression_saved_bytes: u64,
    pub pinned_entry_count: usize,
    pub images: Vec<ImageUsage>,
    pub resolutions: Vec<ResolutionUsage>,
}

/// Serialized form of an entry in the persistent tier.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    class: BinClass,
    id: u32,
    image_id: String,
    resolution_level: u32,
    is_complete: bool,
    quality_layer: Option<u32>,
    tile_index: Option<u32>,
    data: Vec<u8>,
}

/// Resolution-aware client-side cache manager.
pub struct ResolutionCacheManager {
    partitions: HashMap<String, HashMap<u32, Partition>>,
    /// Cache key to `(image_id, resolution_level)`, for O(1) partition lookup
    index: HashMap<String, (String, u32)>,
    /// Content hash to cache key, for deduplication accounting
    hash_index: HashMap<u64, String>,
    policies: HashMap<String, ImageCachePolicy>,
    config: CacheManagerConfig,
    store: Option<Arc<dyn PersistentStore>>,
    total_size: usize,
    entry_count: usize,
    pinned_entry_count: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    dedup_saved_bytes: u64,
    compression_saved_bytes: u64,
    persistent_load_failures: u64,
    persistent_save_failures: u64,
}

impl ResolutionCacheManager {
    pub fn new() -> Self {
        Self::with_config(CacheManagerConfig::default())
    }

    pub fn with_config(config: CacheManagerConfig) -> Self {
        Self {
            partitions: HashMap::new(),
            index: HashMap::new(),
            hash_index: HashMap::new(),
            policies: HashMap::new(),
            config,
            store: None,
            total_size: 0,
            entry_count: 0,
            pinned_entry_count: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            dedup_saved_bytes: 0,
            compression_saved_bytes: 0,
            persistent_load_failures: 0,
            persistent_save_failures: 0,
        }
    }

    /// Attach a persistent tier.
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn entry_key(image_id: &str, class: BinClass, id: u32) -> String {
        format!("{image_id}/{}", DataBin::key_for(class, id))
    }

    /// Insert a bin into the `(image_id, resolution_level)` partition.
    pub fn add_bin(&mut self, bin: DataBin, image_id: &str, resolution_level: u32) {
        let key = Self::entry_key(image_id, bin.class, bin.id);
        let size = bin.len();

        // Deduplication accounting: a different key already holding these
        // bytes means this insertion pays no new unique content.
        let hash = content_hash(bin.class, &bin.bytes);
        if self.config.enable_deduplication {
            if let Some(existing_key) = self.hash_index.get(&hash) {
                if existing_key != &key {
                    self.dedup_saved_bytes += size as u64;
                }
            }
        }

        if self.index.contains_key(&key) {
            self.remove_entry(&key);
        }

        // The mapping goes in after any same-key removal, which would
        // otherwise clear it again and lose the hash for later lookups.
        if self.config.enable_deduplication {
            self.hash_index.insert(hash, key.clone());
        }

        // Global limits first, then the per-image budget.
        while self.entry_count > 0
            && (self.total_size + size > self.config.max_memory
                || self.entry_count >= self.config.max_entries)
        {
            if !self.evict_lowest_score(None) {
                break;
            }
        }
        if let Some(image_budget) = self.policies.get(image_id).and_then(|p| p.max_memory) {
            while self.image_size(image_id) + size > image_budget {
                if !self.evict_lowest_score(Some(image_id)) {
                    break;
                }
            }
        }

        let pinned = self
            .policies
            .get(image_id)
            .is_some_and(|p| p.pinned_resolutions.contains(&resolution_level));

        let now = Instant::now();
        let entry = ManagedEntry {
            bin,
            image_id: image_id.to_string(),
            resolution_level,
            timestamp: now,
            last_access: now,
            access_count: 0,
            original_size: size,
            current_size: size,
            compressed: None,
            content_hash: hash,
            pinned,
        };

        let partition = self
            .partitions
            .entry(image_id.to_string())
            .or_default()
            .entry(resolution_level)
            .or_default();
        partition.total_size += size;
        partition.entries.insert(key.clone(), entry);

        self.index
            .insert(key, (image_id.to_string(), resolution_level));
        self.total_size += size;
        self.entry_count += 1;
        if pinned {
            self.pinned_entry_count += 1;
        }
    }

    /// Insert a batch of bins into one partition.
    pub fn pre_populate(&mut self, bins: Vec<DataBin>, image_id: &str, resolution_level: u32) {
        for bin in bins {
            self.add_bin(bin, image_id, resolution_level);
        }
    }

    /// Look up a bin, counting a hit or miss.
    ///
    /// A compressed entry is transparently inflated back to its original
    /// bytes; an access ends its inactivity.
    pub fn get_bin(&mut self, class: BinClass, id: u32, image_id: &str) -> Option<DataBin> {
        let key = Self::entry_key(image_id, class, id);
        let Some((image, resolution)) = self.index.get(&key).cloned() else {
            self.misses += 1;
            return None;
        };

        let mut inflate_failed = false;
        let mut found = None;
        if let Some(partition) = self
            .partitions
            .get_mut(&image)
            .and_then(|levels| levels.get_mut(&resolution))
        {
            if let Some(entry) = partition.entries.get_mut(&key) {
                if let Some(compressed) = entry.compressed.take() {
                    match inflate(&compressed) {
                        Ok(original) => {
                            let delta = original.len() - entry.current_size;
                            entry.bin.bytes = original;
                            entry.current_size = entry.original_size;
                            partition.total_size += delta;
                            self.total_size += delta;
                        }
                        Err(e) => {
                            // Treat an unreadable entry as absent rather
                            // than fail.
                            warn!(key = %key, error = %e, "dropping undecodable compressed cache entry");
                            inflate_failed = true;
                        }
                    }
                }
                if !inflate_failed {
                    entry.access_count += 1;
                    entry.last_access = Instant::now();
                    found = Some(entry.bin.clone());
                }
            }
        }

        if inflate_failed {
            // Full removal, so the hash index forgets the entry's content
            // along with the rest of the bookkeeping.
            self.remove_entry(&key);
        }
        match found {
            Some(bin) => {
                self.hits += 1;
                Some(bin)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Check presence without touching counters.
    pub fn has_bin(&self, class: BinClass, id: u32, image_id: &str) -> bool {
        self.index
            .contains_key(&Self::entry_key(image_id, class, id))
    }

    /// Install or replace the policy for an image.
    ///
    /// Pinned flags of existing entries are updated together with the
    /// pinned-entry counter.
    pub fn set_image_policy(&mut self, image_id: &str, policy: ImageCachePolicy) {
        if let Some(levels) = self.partitions.get_mut(image_id) {
            for (resolution, partition) in levels.iter_mut() {
                let pin = policy.pinned_resolutions.contains(resolution);
                for entry in partition.entries.values_mut() {
                    if entry.pinned != pin {
                        entry.pinned = pin;
                        if pin {
                            self.pinned_entry_count += 1;
                        } else {
                            self.pinned_entry_count -= 1;
                        }
                    }
                }
            }
        }
        self.policies.insert(image_id.to_string(), policy);
    }

    /// Drop every entry of an image. Returns the number removed.
    pub fn evict_image(&mut self, image_id: &str) -> usize {
        let Some(levels) = self.partitions.remove(image_id) else {
            return 0;
        };
        let mut removed = 0;
        for partition in levels.values() {
            for (key, entry) in &partition.entries {
                self.index.remove(key);
                if self.hash_index.get(&entry.content_hash) == Some(key) {
                    self.hash_index.remove(&entry.content_hash);
                }
                self.total_size -= entry.current_size;
                self.entry_count -= 1;
                if entry.pinned {
                    self.pinned_entry_count -= 1;
                }
                removed += 1;
            }
        }
        removed
    }

    /// Drop every entry at a resolution level, across all images.
    pub fn evict_resolution(&mut self, resolution_level: u32) -> usize {
        let mut removed = 0;
        let images: Vec<String> = self.partitions.keys().cloned().collect();
        for image in images {
            let Some(levels) = self.partitions.get_mut(&image) else {
                continue;
            };
            if let Some(partition) = levels.remove(&resolution_level) {
                for (key, entry) in &partition.entries {
                    self.index.remove(key);
                    if self.hash_index.get(&entry.content_hash) == Some(key) {
                        self.hash_index.remove(&entry.content_hash);
                    }
                    self.total_size -= entry.current_size;
                    self.entry_count -= 1;
                    if entry.pinned {
                        self.pinned_entry_count -= 1;
                    }
                    removed += 1;
                }
            }
            if levels.is_empty() {
                self.partitions.remove(&image);
            }
        }
        removed
    }

    /// Drop entries older than `age`. Pinned entries are kept.
    pub fn evict_older_than(&mut self, age: Duration) -> usize {
        let now = Instant::now();
        let victims: Vec<String> = self
            .iter_entries()
            .filter(|(_, e)| !e.pinned && now.duration_since(e.timestamp) > age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &victims {
            self.remove_entry(key);
        }
        victims.len()
    }

    /// Compress entries that have been inactive past their threshold.
    ///
    /// An entry is eligible when it is not pinned, not already compressed,
    /// its image's policy does not opt out, and its last access is at least
    /// the effective threshold ago. The compressed form is kept only when
    /// it is smaller. Returns the number of entries compressed.
    pub fn compress_inactive_entries(&mut self) -> usize {
        let now = Instant::now();
        let mut compressed_count = 0;

        for (image_id, levels) in self.partitions.iter_mut() {
            let policy = self.policies.get(image_id);
            if policy.is_some_and(|p| !p.compress_inactive) {
                continue;
            }
            let threshold = policy
                .and_then(|p| p.compression_inactivity_threshold)
                .unwrap_or(self.config.compression_inactivity_threshold);

            for partition in levels.values_mut() {
                for entry in partition.entries.values_mut() {
                    if entry.pinned
                        || entry.compressed.is_some()
                        || now.duration_since(entry.last_access) < threshold
                    {
                        continue;
                    }
                    let Ok(deflated) = deflate(&entry.bin.bytes) else {
                        continue;
                    };
                    if deflated.len() >= entry.current_size {
                        continue;
                    }
                    let delta = entry.current_size - deflated.len();
                    entry.current_size = deflated.len();
                    entry.compressed = Some(deflated);
                    partition.total_size -= delta;
                    self.total_size -= delta;
                    self.compression_saved_bytes += delta as u64;
                    compressed_count += 1;
                }
            }
        }

        if compressed_count > 0 {
            debug!(count = compressed_count, "compressed inactive cache entries");
        }
        compressed_count
    }

    /// Write every entry to the persistent tier.
    ///
    /// Per-entry failures are counted and skipped; the first error is
    /// returned after the sweep so callers can surface it.
    pub async fn save_to_persistent(&mut self) -> Result<usize, StoreError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };

        let mut saved = 0;
        let mut first_error = None;
        let snapshot: Vec<(String, PersistedEntry)> = self
            .iter_entries()
            .map(|(key, e)| {
                (
                    key.clone(),
                    PersistedEntry {
                        class: e.bin.class,
                        id: e.bin.id,
                        image_id: e.image_id.clone(),
                        resolution_level: e.resolution_level,
                        is_complete: e.bin.is_complete,
                        quality_layer: e.bin.quality_layer,
                        tile_index: e.bin.tile_index,
                        data: e.bin.bytes.to_vec(),
                    },
                )
            })
            .collect();

        for (key, persisted) in snapshot {
            let encoded = match serde_json::to_vec(&persisted) {
                Ok(encoded) => encoded,
                Err(e) => {
                    self.persistent_save_failures += 1;
                    first_error.get_or_insert(StoreError::from(e));
                    continue;
                }
            };
            match store.save(&key, Bytes::from(encoded)).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    self.persistent_save_failures += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if saved == 0 => Err(e),
            _ => Ok(saved),
        }
    }

    /// Load entries from the persistent tier until the memory budget is
    /// reached. Per-entry failures are tolerated and counted.
    pub async fn warm_up_from_persistent(&mut self) -> usize {
        let Some(store) = self.store.clone() else {
            return 0;
        };

        let keys = match store.list_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "persistent warm-up listing failed");
                return 0;
            }
        };

        let mut restored = 0;
        for key in keys {
            if self.total_size >= self.config.max_memory
                || self.entry_count >= self.config.max_entries
            {
                break;
            }
            let raw = match store.load(&key).await {
                Ok(raw) => raw,
                Err(_) => {
                    self.persistent_load_failures += 1;
                    continue;
                }
            };
            let persisted: PersistedEntry = match serde_json::from_slice(&raw) {
                Ok(persisted) => persisted,
                Err(_) => {
                    self.persistent_load_failures += 1;
                    continue;
                }
            };

            let mut bin = DataBin::new(persisted.class, persisted.id, persisted.data);
            bin.is_complete = persisted.is_complete;
            bin.quality_layer = persisted.quality_layer;
            bin.tile_index = persisted.tile_index;
            let image_id = persisted.image_id.clone();
            self.add_bin(bin, &image_id, persisted.resolution_level);
            restored += 1;
        }

        debug!(restored, "persistent warm-up complete");
        restored
    }

    /// Aggregate diagnostics per image and per resolution level.
    pub fn generate_usage_report(&self) -> UsageReport {
        let mut images: Vec<ImageUsage> = self
            .partitions
            .iter()
            .map(|(image_id, levels)| ImageUsage {
                image_id: image_id.clone(),
                memory_bytes: levels.values().map(|p| p.total_size).sum(),
                entry_count: levels.values().map(|p| p.entries.len()).sum(),
                resolution_levels: levels.len(),
            })
            .collect();
        images.sort_by(|a, b| a.image_id.cmp(&b.image_id));

        let mut per_resolution: HashMap<u32, (usize, usize, usize)> = HashMap::new();
        for levels in self.partitions.values() {
            for (resolution, partition) in levels {
                let slot = per_resolution.entry(*resolution).or_default();
                slot.0 += partition.total_size;
                slot.1 += partition.entries.len();
                slot.2 += 1;
            }
        }
        let mut resolutions: Vec<ResolutionUsage> = per_resolution
            .into_iter()
            .map(|(level, (memory, entries, image_count))| ResolutionUsage {
                resolution_level: level,
                memory_bytes: memory,
                entry_count: entries,
                image_count,
            })
            .collect();
        resolutions.sort_by_key(|r| r.resolution_level);

        UsageReport {
            total_size: self.total_size,
            entry_count: self.entry_count,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            dedup_saved_bytes: self.dedup_saved_bytes,
            compression_saved_bytes: self.compression_saved_bytes,
            pinned_entry_count: self.pinned_entry_count,
            images,
            resolutions,
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn dedup_saved_bytes(&self) -> u64 {
        self.dedup_saved_bytes
    }

    pub fn compression_saved_bytes(&self) -> u64 {
        self.compression_saved_bytes
    }

    pub fn pinned_entry_count(&self) -> usize {
        self.pinned_entry_count
    }

    /// Bytes held for one image across all of its resolution levels.
    pub fn image_size(&self, image_id: &str) -> usize {
        self.partitions
            .get(image_id)
            .map(|levels| levels.values().map(|p| p.total_size).sum())
            .unwrap_or(0)
    }

    fn iter_entries(&self) -> impl Iterator<Item = (&String, &ManagedEntry)> {
        self.partitions
            .values()
            .flat_map(|levels| levels.values())
            .flat_map(|p| p.entries.iter())
    }

    fn resolution_weight(&self, resolution: u32) -> f64 {
        self.config
            .resolution_weights
            .get(&resolution)
            .copied()
            .unwrap_or(1.0 / f64::from(resolution + 1))
    }

    fn score(&self, entry: &ManagedEntry, now: Instant) -> f64 {
        let age = now.duration_since(entry.last_access).as_secs_f64();
        let recency = 1.0 / (1.0 + age);
        let frequency = (entry.access_count + 1) as f64;
        self.resolution_weight(entry.resolution_level) * recency * frequency
    }

    /// Evict the lowest-scoring non-pinned entry, optionally restricted to
    /// one image. Returns false when nothing is evictable.
    fn evict_lowest_score(&mut self, image: Option<&str>) -> bool {
        let now = Instant::now();
        let victim = self
            .iter_entries()
            .filter(|(_, e)| !e.pinned)
            .filter(|(_, e)| image.map_or(true, |i| e.image_id == i))
            .min_by(|(_, a), (_, b)| {
                self.score(a, now)
                    .partial_cmp(&self.score(b, now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(k, _)| k.clone());

        match victim {
            Some(key) => {
                self.remove_entry(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn remove_entry(&mut self, key: &str) {
        let Some((image, resolution)) = self.index.remove(key) else {
            return;
        };
        let Some(levels) = self.partitions.get_mut(&image) else {
            return;
        };
        let Some(partition) = levels.get_mut(&resolution) else {
            return;
        };
        if let Some(entry) = partition.entries.remove(key) {
            partition.total_size -= entry.current_size;
            self.total_size -= entry.current_size;
            self.entry_count -= 1;
            if entry.pinned {
                self.pinned_entry_count -= 1;
            }
            if let Some(mapped) = self.hash_index.get(&entry.content_hash) {
                if mapped == key {
                    self.hash_index.remove(&entry.content_hash);
                }
            }
        }
        // Empty partitions and images fall out of their parent maps.
        if partition.entries.is_empty() {
            levels.remove(&resolution);
        }
        if levels.is_empty() {
            self.partitions.remove(&image);
        }
    }
}

impl Default for ResolutionCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

fn deflate(bytes: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes)?;
    Ok(Bytes::from(encoder.finish()?))
}

fn inflate(bytes: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(bytes)?;
    Ok(Bytes::from(decoder.finish()?))
}
