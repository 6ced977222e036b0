//! Basic bin cache shared by client and server sessions.
//!
//! Entries are keyed by `"<bin_class>:<bin_id>"`. The cache tracks total
//! payload size and entry count, evicting one least-recently-used victim at
//! a time while over either limit. Hit and miss counters are monotonic.
//!
//! Operations never suspend; sessions own their cache exclusively and guard
//! it with their own lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::codestream::{BinClass, DataBin};

/// Default maximum cached payload bytes: 64MB.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Default maximum number of entries.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 50_000;

/// Size and entry limits for a [`CacheModel`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total payload bytes
    pub max_size: usize,

    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_CACHE_SIZE,
            max_entries: DEFAULT_MAX_CACHE_ENTRIES,
        }
    }
}

/// One cached bin with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached bin
    pub bin: DataBin,

    /// Insertion time, refreshed when the key is replaced
    pub timestamp: Instant,

    /// Number of `get` hits against this entry
    pub access_count: u64,

    /// Payload length at insertion
    pub byte_count: usize,

    /// Recency mark for LRU eviction
    last_access: Instant,
}

/// Monotonic counters and current totals of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bin cache keyed by `"<bin_class>:<bin_id>"`.
#[derive(Debug)]
pub struct CacheModel {
    entries: HashMap<String, CacheEntry>,
    config: CacheConfig,
    total_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheModel {
    /// Create a cache with default limits.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with the given limits.
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
            total_size: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Insert a bin, evicting least-recently-used entries while over limits.
    ///
    /// Replacing an existing key preserves its `access_count` and refreshes
    /// its `timestamp`; the size delta is applied to the total.
    pub fn add(&mut self, bin: DataBin) {
        let key = bin.key();
        let new_size = bin.len();
        let now = Instant::now();

        let preserved_accesses = match self.entries.remove(&key) {
            Some(existing) => {
                self.total_size -= existing.byte_count;
                existing.access_count
            }
            None => 0,
        };

        // Make room: one LRU victim at a time.
        while !self.entries.is_empty()
            && (self.total_size + new_size > self.config.max_size
                || self.entries.len() >= self.config.max_entries)
        {
            self.evict_lru();
        }

        self.total_size += new_size;
        self.entries.insert(
            key,
            CacheEntry {
                bin,
                timestamp: now,
                access_count: preserved_accesses,
                byte_count: new_size,
                last_access: now,
            },
        );
    }

    /// Look up a bin, counting a hit or miss and marking recency.
    pub fn get(&mut self, class: BinClass, id: u32) -> Option<&DataBin> {
        let key = DataBin::key_for(class, id);
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.access_count += 1;
                entry.last_access = Instant::now();
                self.hits += 1;
                Some(&entry.bin)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Check presence without touching counters or recency.
    pub fn has(&self, class: BinClass, id: u32) -> bool {
        self.entries.contains_key(&DataBin::key_for(class, id))
    }

    /// Access the raw entry for a key, without counting.
    pub fn entry(&self, class: BinClass, id: u32) -> Option<&CacheEntry> {
        self.entries.get(&DataBin::key_for(class, id))
    }

    /// Drop every entry of the given class. Returns the number removed.
    pub fn invalidate_class(&mut self, class: BinClass) -> usize {
        let prefix = format!("{class}:");
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = self.entries.remove(key) {
                self.total_size -= entry.byte_count;
            }
        }
        keys.len()
    }

    /// Drop entries older than the given age. Returns the number removed.
    pub fn invalidate_older_than(&mut self, age: Duration) -> usize {
        let now = Instant::now();
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.timestamp) > age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            if let Some(entry) = self.entries.remove(key) {
                self.total_size -= entry.byte_count;
            }
        }
        keys.len()
    }

    /// Remove everything, keeping the monotonic counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0;
    }

    /// Current totals and counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entries.len(),
            total_size: self.total_size,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    /// Iterate over cached entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            if let Some(entry) = self.entries.remove(&key) {
                self.total_size -= entry.byte_count;
                self.evictions += 1;
            }
        }
    }
}

impl Default for CacheModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::BinClass;

    fn make_bin(class: BinClass, id: u32, size: usize) -> DataBin {
        DataBin::new(class, id, vec![0u8; size])
    }

    #[test]
    fn test_add_get_has() {
        let mut cache = CacheModel::new();
        let bin = make_bin(BinClass::Precinct, 7, 100);

        assert!(cache.get(BinClass::Precinct, 7).is_none());
        cache.add(bin.clone());

        assert!(cache.has(BinClass::Precinct, 7));
        assert_eq!(cache.get(BinClass::Precinct, 7), Some(&bin));

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size, 100);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_invariant_totals_match_entries() {
        let mut cache = CacheModel::new();
        cache.add(make_bin(BinClass::Tile, 1, 100));
        cache.add(make_bin(BinClass::Tile, 2, 200));
        cache.add(make_bin(BinClass::Precinct, 1, 50));

        let stats = cache.stats();
        assert_eq!(stats.entry_count, cache.len());
        assert_eq!(stats.total_size, 350);
    }

    #[test]
    fn test_replace_preserves_access_count() {
        let mut cache = CacheModel::new();
        cache.add(make_bin(BinClass::Tile, 1, 100));
        cache.get(BinClass::Tile, 1);
        cache.get(BinClass::Tile, 1);

        cache.add(make_bin(BinClass::Tile, 1, 40));

        let entry = cache.entry(BinClass::Tile, 1).unwrap();
        assert_eq!(entry.access_count, 2);
        assert_eq!(cache.stats().total_size, 40);
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn test_add_twice_is_idempotent_in_size() {
        let mut cache = CacheModel::new();
        let bin = make_bin(BinClass::Precinct, 3, 128);
        cache.add(bin.clone());
        let first = cache.stats();
        cache.add(bin);
        let second = cache.stats();
        assert_eq!(first.entry_count, second.entry_count);
        assert_eq!(first.total_size, second.total_size);
    }

    #[test]
    fn test_size_eviction_is_lru() {
        let mut cache = CacheModel::with_config(CacheConfig {
            max_size: 300,
            max_entries: 100,
        });
        cache.add(make_bin(BinClass::Tile, 1, 100));
        cache.add(make_bin(BinClass::Tile, 2, 100));
        cache.add(make_bin(BinClass::Tile, 3, 100));

        // Touch 1 so 2 becomes the LRU victim.
        cache.get(BinClass::Tile, 1);
        cache.add(make_bin(BinClass::Tile, 4, 100));

        assert!(cache.has(BinClass::Tile, 1));
        assert!(!cache.has(BinClass::Tile, 2));
        assert!(cache.has(BinClass::Tile, 3));
        assert!(cache.has(BinClass::Tile, 4));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_entry_limit_eviction() {
        let mut cache = CacheModel::with_config(CacheConfig {
            max_size: 1_000_000,
            max_entries: 2,
        });
        cache.add(make_bin(BinClass::Tile, 1, 10));
        cache.add(make_bin(BinClass::Tile, 2, 10));
        cache.add(make_bin(BinClass::Tile, 3, 10));

        assert_eq!(cache.len(), 2);
        assert!(!cache.has(BinClass::Tile, 1));
    }

    #[test]
    fn test_invalidate_class() {
        let mut cache = CacheModel::new();
        cache.add(make_bin(BinClass::Precinct, 1, 10));
        cache.add(make_bin(BinClass::Precinct, 2, 10));
        cache.add(make_bin(BinClass::Tile, 1, 10));

        let removed = cache.invalidate_class(BinClass::Precinct);
        assert_eq!(removed, 2);
        assert!(!cache.has(BinClass::Precinct, 1));
        assert!(cache.has(BinClass::Tile, 1));
        assert_eq!(cache.stats().total_size, 10);
    }

    #[test]
    fn test_invalidate_older_than() {
        let mut cache = CacheModel::new();
        cache.add(make_bin(BinClass::Tile, 1, 10));

        // Nothing is older than an hour.
        assert_eq!(cache.invalidate_older_than(Duration::from_secs(3600)), 0);
        // Everything is older than zero.
        assert_eq!(cache.invalidate_older_than(Duration::ZERO), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_keeps_counters() {
        let mut cache = CacheModel::new();
        cache.add(make_bin(BinClass::Tile, 1, 10));
        cache.get(BinClass::Tile, 1);
        cache.get(BinClass::Tile, 2);
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
