//! Client-side session.
//!
//! Created by `createSession`, mutated by every request sent and bin
//! received, destroyed by `close()`. Closing is terminal: the caches are
//! cleared, the channel binding and target are dropped, and further
//! mutation fails with a session error.

use std::time::Instant;

use uuid::Uuid;

use crate::cache::{CacheModel, CacheStats, PrecinctCache};
use crate::codestream::{BinClass, DataBin, PrecinctId};
use crate::error::SessionError;
use crate::request::{RequestTemplates, ViewWindowRequest};

/// Counters a client session accumulates over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientSessionStats {
    pub requests_sent: u64,
    pub bins_received: u64,
    pub bytes_received: u64,
    pub precincts_merged: u64,
}

/// One client session and the caches it owns.
#[derive(Debug)]
pub struct ClientSession {
    session_id: String,
    channel_id: Option<String>,
    target: Option<String>,
    active: bool,
    cache: CacheModel,
    precincts: PrecinctCache,
    templates: RequestTemplates,
    stats: ClientSessionStats,
    created_at: Instant,
    last_activity: Instant,
}

impl ClientSession {
    /// Create an active session with a fresh id and empty caches.
    pub fn create() -> Self {
        let now = Instant::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            channel_id: None,
            target: None,
            active: true,
            cache: CacheModel::new(),
            precincts: PrecinctCache::new(),
            templates: RequestTemplates::new(),
            stats: ClientSessionStats::default(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Rebuild a session under a known id, e.g. during recovery.
    pub fn with_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::create()
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn stats(&self) -> ClientSessionStats {
        self.stats
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Bind the channel id the server minted for this session.
    pub fn bind_channel(
        &mut self,
        channel_id: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.channel_id = Some(channel_id.into());
        self.target = Some(target.into());
        self.touch();
        Ok(())
    }

    /// Account for a request about to be sent.
    pub fn record_request(&mut self, request: &ViewWindowRequest) -> Result<(), SessionError> {
        self.ensure_active()?;
        if let Some(target) = &request.target {
            self.target = Some(target.clone());
        }
        self.stats.requests_sent += 1;
        self.touch();
        Ok(())
    }

    /// Ingest a received data bin into the session cache.
    pub fn ingest_bin(&mut self, bin: DataBin) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.stats.bins_received += 1;
        self.stats.bytes_received += bin.len() as u64;
        self.cache.add(bin);
        self.touch();
        Ok(())
    }

    /// Merge a received precinct fragment.
    pub fn ingest_precinct(
        &mut self,
        id: PrecinctId,
        bytes: impl Into<bytes::Bytes>,
        layers: impl IntoIterator<Item = u32>,
        is_complete: bool,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.precincts.merge(id, bytes, layers, is_complete);
        self.stats.precincts_merged += 1;
        self.touch();
        Ok(())
    }

    /// Look up a cached bin, counting hit or miss.
    pub fn cached_bin(&mut self, class: BinClass, id: u32) -> Option<&DataBin> {
        self.cache.get(class, id)
    }

    pub fn has_bin(&self, class: BinClass, id: u32) -> bool {
        self.cache.has(class, id)
    }

    pub fn precinct_cache(&self) -> &PrecinctCache {
        &self.precincts
    }

    pub fn cache(&self) -> &CacheModel {
        &self.cache
    }

    /// Named request templates owned by this session.
    pub fn templates(&mut self) -> &mut RequestTemplates {
        &mut self.templates
    }

    /// Terminal close: deactivate, clear caches, drop identifiers.
    ///
    /// Idempotent.
    pub fn close(&mut self) {
        self.active = false;
        self.cache.clear();
        self.precincts.clear();
        self.channel_id = None;
        self.target = None;
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.active {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
