//! Layered precinct cache with merge-on-append semantics.
//!
//! Precincts arrive incrementally: each delivery appends bytes for one or
//! more quality layers. Merging an existing entry appends the new bytes,
//! unions the received layer set, and keeps the entry complete once any
//! merge says so. Eviction drops the oldest entry while over limits.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::codestream::PrecinctId;

/// Default maximum cached precinct bytes: 32MB.
pub const DEFAULT_MAX_PRECINCT_BYTES: usize = 32 * 1024 * 1024;

/// Default maximum number of precinct entries.
pub const DEFAULT_MAX_PRECINCT_ENTRIES: usize = 20_000;

/// Limits for a [`PrecinctCache`].
#[derive(Debug, Clone)]
pub struct PrecinctCacheConfig {
    pub max_size: usize,
    pub max_entries: usize,
}

impl Default for PrecinctCacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_PRECINCT_BYTES,
            max_entries: DEFAULT_MAX_PRECINCT_ENTRIES,
        }
    }
}

/// One precinct's accumulated payload and layer bookkeeping.
#[derive(Debug, Clone)]
pub struct PrecinctEntry {
    /// Append-only payload
    pub bytes: Bytes,

    /// Quality layers received so far
    pub received_layers: HashSet<u32>,

    /// Whether the full precinct has been received
    pub is_complete: bool,

    /// Insertion time, used for oldest-first eviction
    pub timestamp: Instant,
}

/// Cache keyed by `(tile, component, resolution, precinct_x, precinct_y)`.
#[derive(Debug)]
pub struct PrecinctCache {
    entries: HashMap<PrecinctId, PrecinctEntry>,
    config: PrecinctCacheConfig,
    total_size: usize,
    evictions: u64,
}

impl PrecinctCache {
    pub fn new() -> Self {
        Self::with_config(PrecinctCacheConfig::default())
    }

    pub fn with_config(config: PrecinctCacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
            total_size: 0,
            evictions: 0,
        }
    }

    /// Insert a precinct, replacing any existing entry for the id.
    pub fn add(
        &mut self,
        id: PrecinctId,
        bytes: impl Into<Bytes>,
        layers: impl IntoIterator<Item = u32>,
        is_complete: bool,
    ) {
        let bytes = bytes.into();
        if let Some(existing) = self.entries.remove(&id) {
            self.total_size -= existing.bytes.len();
        }
        self.make_room(bytes.len());
        self.total_size += bytes.len();
        self.entries.insert(
            id,
            PrecinctEntry {
                bytes,
                received_layers: layers.into_iter().collect(),
                is_complete,
                timestamp: Instant::now(),
            },
        );
    }

    /// Append bytes and layers to an existing entry, or insert when absent.
    ///
    /// Appending preserves the original timestamp: a precinct that keeps
    /// growing is not thereby protected from eviction.
    pub fn merge(
        &mut self,
        id: PrecinctId,
        bytes: impl Into<Bytes>,
        new_layers: impl IntoIterator<Item = u32>,
        is_complete: bool,
    ) {
        let bytes = bytes.into();
        match self.entries.get_mut(&id) {
            Some(entry) => {
                let mut merged = BytesMut::with_capacity(entry.bytes.len() + bytes.len());
                merged.extend_from_slice(&entry.bytes);
                merged.extend_from_slice(&bytes);
                self.total_size += bytes.len();
                entry.bytes = merged.freeze();
                entry.received_layers.extend(new_layers);
                entry.is_complete = entry.is_complete || is_complete;
            }
            None => self.add(id, bytes, new_layers, is_complete),
        }
        self.enforce_limits();
    }

    pub fn get(&self, id: &PrecinctId) -> Option<&PrecinctEntry> {
        self.entries.get(id)
    }

    pub fn has(&self, id: &PrecinctId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_complete(&self, id: &PrecinctId) -> bool {
        self.entries.get(id).is_some_and(|e| e.is_complete)
    }

    /// Drop all precincts of the given tile. Returns the number removed.
    pub fn invalidate_tile(&mut self, tile: u32) -> usize {
        self.invalidate_where(|id| id.tile == tile)
    }

    /// Drop all precincts at the given resolution level.
    pub fn invalidate_resolution(&mut self, resolution: u32) -> usize {
        self.invalidate_where(|id| id.resolution == resolution)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0;
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

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Iterate over cached precincts in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&PrecinctId, &PrecinctEntry)> {
        self.entries.iter()
    }

    fn invalidate_where(&mut self, pred: impl Fn(&PrecinctId) -> bool) -> usize {
        let victims: Vec<PrecinctId> = self.entries.keys().filter(|id| pred(id)).copied().collect();
        for id in &victims {
            if let Some(entry) = self.entries.remove(id) {
                self.total_size -= entry.bytes.len();
            }
        }
        victims.len()
    }

    fn make_room(&mut self, incoming: usize) {
        while !self.entries.is_empty()
            && (self.total_size + incoming > self.config.max_size
                || self.entries.len() >= self.config.max_entries)
        {
            self.evict_oldest();
        }
    }

    fn enforce_limits(&mut self) {
        while self.entries.len() > 1
            && (self.total_size > self.config.max_size
                || self.entries.len() > self.config.max_entries)
        {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.timestamp)
            .map(|(id, _)| *id);
        if let Some(id) = victim {
            if let Some(entry) = self.entries.remove(&id) {
                self.total_size -= entry.bytes.len();
                self.evictions += 1;
            }
        }
    }
}

impl Default for PrecinctCache {
    fn default() -> Self {
        Self::new()
    }
}
