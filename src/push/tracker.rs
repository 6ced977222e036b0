//! Server-side model of each client's cache.
//!
//! For every session the tracker holds the set of bin keys the client has
//! confirmed received and the set currently pending delivery. Delta
//! delivery filters candidate bins against both sets, counting the bytes
//! of transmission saved.

use std::collections::{HashMap, HashSet};

use crate::codestream::DataBin;

/// Per-session received/pending key sets.
#[derive(Debug, Default)]
struct SessionView {
    received: HashSet<String>,
    pending: HashSet<String>,
}

/// Tracks what each client already holds.
#[derive(Debug, Default)]
pub struct ClientCacheTracker {
    sessions: HashMap<String, SessionView>,
    delta_saved_bins: u64,
    delta_saved_bytes: u64,
}

impl ClientCacheTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop bins the session already has or is about to get.
    ///
    /// Filtered bins bump the delta-savings counters.
    pub fn filter_missing(&mut self, session_id: &str, bins: Vec<DataBin>) -> Vec<DataBin> {
        let Some(view) = self.sessions.get(session_id) else {
            return bins;
        };
        let mut missing = Vec::with_capacity(bins.len());
        for bin in bins {
            let key = bin.key();
            if view.received.contains(&key) || view.pending.contains(&key) {
                self.delta_saved_bins += 1;
                self.delta_saved_bytes += bin.len() as u64;
            } else {
                missing.push(bin);
            }
        }
        missing
    }

    /// Mark a bin as queued for push.
    pub fn mark_pending(&mut self, session_id: &str, key: impl Into<String>) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .pending
            .insert(key.into());
    }

    /// Move a bin from pending to received on confirmed delivery.
    pub fn confirm_delivered(&mut self, session_id: &str, key: &str) {
        if let Some(view) = self.sessions.get_mut(session_id) {
            view.pending.remove(key);
            view.received.insert(key.to_string());
        }
    }

    /// Mark a bin as received outright, e.g. from a demand response.
    pub fn mark_received(&mut self, session_id: &str, key: impl Into<String>) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .received
            .insert(key.into());
    }

    pub fn is_received(&self, session_id: &str, key: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|view| view.received.contains(key))
    }

    pub fn is_pending(&self, session_id: &str, key: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|view| view.pending.contains(key))
    }

    /// Remove keys from both sets for every session, e.g. when a target's
    /// bins are invalidated.
    pub fn invalidate(&mut self, keys: &[String]) {
        for view in self.sessions.values_mut() {
            for key in keys {
                view.received.remove(key);
                view.pending.remove(key);
            }
        }
    }

    /// Forget a departed session.
    pub fn forget_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn delta_saved_bins(&self) -> u64 {
        self.delta_saved_bins
    }

    pub fn delta_saved_bytes(&self) -> u64 {
        self.delta_saved_bytes
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }
}
