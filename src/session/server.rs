//! Server-side session state and registry.
//!
//! The server session's sent-bin record is the authoritative source for
//! avoiding redundant transmission within a session: `has_data_bin` answers
//! whether a bin was already delivered, and the dispatch path filters
//! against it before appending response bytes.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::codestream::{BinClass, DataBin};
use crate::error::SessionError;

/// One server-side session bound to a channel.
#[derive(Debug)]
pub struct ServerSession {
    session_id: String,
    channel_id: String,
    target: String,
    active: bool,
    created_at: Instant,
    last_activity: Instant,
    /// Keys of bins already sent: the server's view of the client cache
    sent_bins: HashSet<String>,
    metadata: HashMap<String, String>,
    bytes_sent: u64,
    requests_handled: u64,
}

impl ServerSession {
    pub fn new(
        session_id: impl Into<String>,
        channel_id: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.into(),
            channel_id: channel_id.into(),
            target: target.into(),
            active: true,
            created_at: now,
            last_activity: now,
            sent_bins: HashSet::new(),
            metadata: HashMap::new(),
            bytes_sent: 0,
            requests_handled: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Whether a bin was already sent to this client.
    pub fn has_data_bin(&self, class: BinClass, id: u32) -> bool {
        self.sent_bins.contains(&DataBin::key_for(class, id))
    }

    /// Record a bin as delivered.
    pub fn record_sent_data_bin(&mut self, bin: &DataBin) {
        self.sent_bins.insert(bin.key());
        self.bytes_sent += bin.len() as u64;
    }

    /// Keys of every bin this session has been sent.
    pub fn sent_bin_keys(&self) -> impl Iterator<Item = &String> {
        self.sent_bins.iter()
    }

    pub fn record_request(&mut self) {
        self.requests_handled += 1;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle_for(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Terminal close: deactivate and forget the sent-bin record.
    pub fn close(&mut self) {
        self.active = false;
        self.sent_bins.clear();
    }
}

/// Owns all server sessions, indexed by channel id.
#[derive(Debug, Default)]
pub struct ServerSessionRegistry {
    by_channel: HashMap<String, ServerSession>,
    /// session id to channel id
    by_session: HashMap<String, String>,
    sessions_created: u64,
    sessions_expired: u64,
}

impl ServerSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new session for a target. The channel id is derived from the
    /// session id with the `cid-` prefix.
    pub fn create(&mut self, target: impl Into<String>) -> &ServerSession {
        let session_id = Uuid::new_v4().to_string();
        let channel_id = format!("cid-{session_id}");
        let session = ServerSession::new(&session_id, &channel_id, target);

        info!(session_id = %session_id, channel_id = %channel_id, "session created");
        self.by_session.insert(session_id, channel_id.clone());
        self.sessions_created += 1;
        self.by_channel.entry(channel_id).or_insert(session)
    }

    pub fn get(&self, channel_id: &str) -> Option<&ServerSession> {
        self.by_channel.get(channel_id)
    }

    pub fn get_mut(&mut self, channel_id: &str) -> Option<&mut ServerSession> {
        self.by_channel.get_mut(channel_id)
    }

    /// Resolve an existing channel or fail.
    pub fn resolve(&mut self, channel_id: &str) -> Result<&mut ServerSession, SessionError> {
        self.by_channel
            .get_mut(channel_id)
            .ok_or_else(|| SessionError::UnknownChannel(channel_id.to_string()))
    }

    /// Close and remove one session by channel id.
    pub fn remove(&mut self, channel_id: &str) -> Option<ServerSession> {
        let mut session = self.by_channel.remove(channel_id)?;
        self.by_session.remove(session.session_id());
        session.close();
        debug!(channel_id = %channel_id, "session removed");
        Some(session)
    }

    /// Close and remove every session idle past the timeout. Returns the
    /// number of sessions expired.
    pub fn expire_idle(&mut self, timeout: Duration) -> usize {
        let victims: Vec<String> = self
            .by_channel
            .iter()
            .filter(|(_, s)| s.is_idle_for(timeout))
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in &victims {
            self.remove(channel);
            self.sessions_expired += 1;
        }
        if !victims.is_empty() {
            info!(expired = victims.len(), "idle sessions expired");
        }
        victims.len()
    }

    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created
    }

    pub fn sessions_expired(&self) -> u64 {
        self.sessions_expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerSession> {
        self.by_channel.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerSession> {
        self.by_channel.values_mut()
    }
}
