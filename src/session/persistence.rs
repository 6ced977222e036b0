//! Session snapshots and recovery.
//!
//! Snapshots are versioned, self-describing JSON written atomically through
//! the persistent store. Recovery refuses snapshots that are missing, stale
//! or from another format version; bounded restoration reports partial
//! recovery when any cap truncated the input. Recovery never corrupts
//! in-memory state: it builds a fresh session or returns a failure status.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::PersistentStore;
use crate::codestream::{BinClass, DataBin, PrecinctId};
use crate::error::StoreError;

use super::client::ClientSession;
use super::server::ServerSession;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One persisted data bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBin {
    pub class: BinClass,
    pub id: u32,
    pub data: Vec<u8>,
    pub is_complete: bool,
    pub quality_layer: Option<u32>,
    pub tile_index: Option<u32>,
}

impl From<&DataBin> for SnapshotBin {
    fn from(bin: &DataBin) -> Self {
        Self {
            class: bin.class,
            id: bin.id,
            data: bin.bytes.to_vec(),
            is_complete: bin.is_complete,
            quality_layer: bin.quality_layer,
            tile_index: bin.tile_index,
        }
    }
}

impl SnapshotBin {
    fn to_bin(&self) -> DataBin {
        let mut bin = DataBin::new(self.class, self.id, self.data.clone());
        bin.is_complete = self.is_complete;
        bin.quality_layer = self.quality_layer;
        bin.tile_index = self.tile_index;
        bin
    }
}

/// One persisted precinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPrecinct {
    pub id: PrecinctId,
    pub data: Vec<u8>,
    pub received_layers: Vec<u32>,
    pub is_complete: bool,
}

/// A versioned session snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub session_id: String,
    pub channel_id: Option<String>,
    pub target: Option<String>,
    pub was_active: bool,
    /// Wall-clock creation time, seconds since the Unix epoch
    pub created_at: u64,
    pub data_bins: Vec<SnapshotBin>,
    pub precincts: Vec<SnapshotPrecinct>,
    pub metadata: HashMap<String, String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl SessionSnapshot {
    /// Capture a client session.
    pub fn of_client(session: &ClientSession) -> Self {
        let cache_stats = session.cache_stats();
        Self {
            version: SNAPSHOT_VERSION,
            session_id: session.session_id().to_string(),
            channel_id: session.channel_id().map(str::to_string),
            target: session.target().map(str::to_string),
            was_active: session.is_active(),
            created_at: unix_now(),
            data_bins: session
                .cache()
                .iter()
                .map(|(_, entry)| SnapshotBin::from(&entry.bin))
                .collect(),
            precincts: session
                .precinct_cache()
                .iter()
                .map(|(id, entry)| SnapshotPrecinct {
                    id: *id,
                    data: entry.bytes.to_vec(),
                    received_layers: entry.received_layers.iter().copied().collect(),
                    is_complete: entry.is_complete,
                })
                .collect(),
            metadata: HashMap::new(),
            cache_hits: cache_stats.hits,
            cache_misses: cache_stats.misses,
        }
    }

    /// Capture a server session. The sent-bin record persists as bin keys
    /// in the metadata map, since the payloads live with the target.
    pub fn of_server(session: &ServerSession) -> Self {
        let mut metadata = session.metadata().clone();
        let sent: Vec<String> = session.sent_bin_keys().cloned().collect();
        metadata.insert("sent_bins".to_string(), sent.join(","));
        Self {
            version: SNAPSHOT_VERSION,
            session_id: session.session_id().to_string(),
            channel_id: Some(session.channel_id().to_string()),
            target: Some(session.target().to_string()),
            was_active: session.is_active(),
            created_at: unix_now(),
            data_bins: Vec::new(),
            precincts: Vec::new(),
            metadata,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    /// Store key for a client session snapshot.
    pub fn client_key(session_id: &str) -> String {
        format!("client_{session_id}.jpipsession")
    }

    /// Store key for a server session snapshot.
    pub fn server_key(session_id: &str) -> String {
        format!("server_{session_id}.jpipsession")
    }

    pub fn age(&self, now_unix: u64) -> Duration {
        Duration::from_secs(now_unix.saturating_sub(self.created_at))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Bounds on what recovery will restore.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Snapshots older than this are refused
    pub max_snapshot_age: Duration,

    /// Most data bins restored into the rebuilt session
    pub max_data_bins_to_restore: usize,

    /// Whether precincts are restored at all
    pub restore_precinct_cache: bool,

    /// Most precincts restored when enabled
    pub max_precincts_to_restore: usize,

    /// Recovery attempts allowed per session
    pub max_retry_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_snapshot_age: Duration::from_secs(24 * 3600),
            max_data_bins_to_restore: 10_000,
            restore_precinct_cache: true,
            max_precincts_to_restore: 10_000,
            max_retry_attempts: 3,
        }
    }
}

/// What a recovery attempt produced.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Everything in the snapshot was restored
    Full(ClientSession),

    /// A restoration bound truncated the input
    Partial(ClientSession, String),

    /// Nothing was restored
    Failed(String),
}

impl RecoveryOutcome {
    pub fn session(self) -> Option<ClientSession> {
        match self {
            RecoveryOutcome::Full(session) | RecoveryOutcome::Partial(session, _) => Some(session),
            RecoveryOutcome::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RecoveryOutcome::Failed(_))
    }
}

/// Save a client session snapshot. Write atomicity comes from the store.
pub async fn save_client_session(
    store: &dyn PersistentStore,
    session: &ClientSession,
) -> Result<(), StoreError> {
    let snapshot = SessionSnapshot::of_client(session);
    let encoded = serde_json::to_vec(&snapshot)?;
    store
        .save(
            &SessionSnapshot::client_key(session.session_id()),
            Bytes::from(encoded),
        )
        .await
}

/// Save a server session snapshot.
pub async fn save_server_session(
    store: &dyn PersistentStore,
    session: &ServerSession,
) -> Result<(), StoreError> {
    let snapshot = SessionSnapshot::of_server(session);
    let encoded = serde_json::to_vec(&snapshot)?;
    store
        .save(
            &SessionSnapshot::server_key(session.session_id()),
            Bytes::from(encoded),
        )
        .await
}

/// Recover a client session from its snapshot.
pub async fn recover_client_session(
    store: &dyn PersistentStore,
    session_id: &str,
    config: &RecoveryConfig,
) -> RecoveryOutcome {
    let raw = match store.load(&SessionSnapshot::client_key(session_id)).await {
        Ok(raw) => raw,
        Err(StoreError::NotFound(_)) => return RecoveryOutcome::Failed("no state".to_string()),
        Err(e) => return RecoveryOutcome::Failed(format!("load failed: {e}")),
    };
    let snapshot: SessionSnapshot = match serde_json::from_slice(&raw) {
        Ok(snapshot) => snapshot,
        Err(e) => return RecoveryOutcome::Failed(format!("undecodable snapshot: {e}")),
    };

    if snapshot.age(unix_now()) > config.max_snapshot_age {
        return RecoveryOutcome::Failed("stale".to_string());
    }
    if snapshot.version != SNAPSHOT_VERSION {
        return RecoveryOutcome::Failed(format!(
            "incompatible version {} (expected {SNAPSHOT_VERSION})",
            snapshot.version
        ));
    }

    let mut session = ClientSession::with_id(&snapshot.session_id);
    if let (Some(channel), Some(target)) = (&snapshot.channel_id, &snapshot.target) {
        if session.bind_channel(channel, target).is_err() {
            return RecoveryOutcome::Failed("rebuilt session rejected binding".to_string());
        }
    }

    let mut truncated = Vec::new();

    let bin_count = snapshot.data_bins.len();
    for persisted in snapshot.data_bins.iter().take(config.max_data_bins_to_restore) {
        if session.ingest_bin(persisted.to_bin()).is_err() {
            break;
        }
    }
    if bin_count > config.max_data_bins_to_restore {
        truncated.push(format!(
            "data bins truncated to {}",
            config.max_data_bins_to_restore
        ));
    }

    if config.restore_precinct_cache {
        let precinct_count = snapshot.precincts.len();
        for persisted in snapshot
            .precincts
            .iter()
            .take(config.max_precincts_to_restore)
        {
            let _ = session.ingest_precinct(
                persisted.id,
                persisted.data.clone(),
                persisted.received_layers.iter().copied(),
                persisted.is_complete,
            );
        }
        if precinct_count > config.max_precincts_to_restore {
            truncated.push(format!(
                "precincts truncated to {}",
                config.max_precincts_to_restore
            ));
        }
    } else if !snapshot.precincts.is_empty() {
        truncated.push("precinct cache not restored".to_string());
    }

    debug!(session_id = %session_id, truncated = truncated.len(), "session recovered");
    if truncated.is_empty() {
        RecoveryOutcome::Full(session)
    } else {
        RecoveryOutcome::Partial(session, truncated.join("; "))
    }
}

/// Wraps recovery with bounded per-session retry accounting.
pub struct RecoveryManager {
    config: RecoveryConfig,
    attempts: HashMap<String, u32>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            attempts: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Attempt recovery, refusing once the retry budget is spent. A
    /// successful recovery clears the counter.
    pub async fn recover(
        &mut self,
        store: &dyn PersistentStore,
        session_id: &str,
    ) -> RecoveryOutcome {
        let attempts = self.attempts.entry(session_id.to_string()).or_insert(0);
        if *attempts >= self.config.max_retry_attempts {
            warn!(session_id = %session_id, "recovery retry budget exhausted");
            return RecoveryOutcome::Failed("max retry attempts reached".to_string());
        }
        *attempts += 1;

        let outcome = recover_client_session(store, session_id, &self.config).await;
        if !outcome.is_failed() {
            self.attempts.remove(session_id);
        }
        outcome
    }

    pub fn attempts_for(&self, session_id: &str) -> u32 {
        self.attempts.get(session_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn populated_session() -> ClientSession {
        let mut session = ClientSession::create();
        session.bind_channel("cid-1", "img.jp2").unwrap();
        for id in 0..5 {
            session
                .ingest_bin(DataBin::new(BinClass::Precinct, id, vec![id as u8; 16]))
                .unwrap();
        }
        session
            .ingest_precinct(PrecinctId::new(0, 0, 1, 0, 0), vec![9, 9], [0, 1], true)
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_equality() {
        let session = populated_session();
        let snapshot = SessionSnapshot::of_client(&session);

        let encoded = serde_json::to_vec(&snapshot).unwrap();
        let decoded: SessionSnapshot = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[tokio::test]
    async fn test_full_recovery() {
        let store = MemoryStore::new();
        let session = populated_session();
        let session_id = session.session_id().to_string();
        save_client_session(&store, &session).await.unwrap();

        let outcome =
            recover_client_session(&store, &session_id, &RecoveryConfig::default()).await;
        let recovered = match outcome {
            RecoveryOutcome::Full(s) => s,
            other => panic!("expected full recovery, got {other:?}"),
        };

        assert_eq!(recovered.session_id(), session_id);
        assert_eq!(recovered.channel_id(), Some("cid-1"));
        assert_eq!(recovered.target(), Some("img.jp2"));
        for id in 0..5 {
            assert!(recovered.has_bin(BinClass::Precinct, id));
        }
        assert!(recovered
            .precinct_cache()
            .is_complete(&PrecinctId::new(0, 0, 1, 0, 0)));
    }

    #[tokio::test]
    async fn test_recovery_missing_state() {
        let store = MemoryStore::new();
        let outcome =
            recover_client_session(&store, "ghost", &RecoveryConfig::default()).await;
        match outcome {
            RecoveryOutcome::Failed(reason) => assert_eq!(reason, "no state"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovery_stale_snapshot() {
        let store = MemoryStore::new();
        let session = populated_session();
        let session_id = session.session_id().to_string();

        let mut snapshot = SessionSnapshot::of_client(&session);
        snapshot.created_at = snapshot.created_at.saturating_sub(48 * 3600);
        store
            .save(
                &SessionSnapshot::client_key(&session_id),
                Bytes::from(serde_json::to_vec(&snapshot).unwrap()),
            )
            .await
            .unwrap();

        let outcome =
            recover_client_session(&store, &session_id, &RecoveryConfig::default()).await;
        match outcome {
            RecoveryOutcome::Failed(reason) => assert_eq!(reason, "stale"),
            other => panic!("expected stale failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovery_version_mismatch() {
        let store = MemoryStore::new();
        let session = populated_session();
        let session_id = session.session_id().to_string();

        let mut snapshot = SessionSnapshot::of_client(&session);
        snapshot.version = 99;
        store
            .save(
                &SessionSnapshot::client_key(&session_id),
                Bytes::from(serde_json::to_vec(&snapshot).unwrap()),
            )
            .await
            .unwrap();

        let outcome =
            recover_client_session(&store, &session_id, &RecoveryConfig::default()).await;
        match outcome {
            RecoveryOutcome::Failed(reason) => assert!(reason.contains("incompatible")),
            other => panic!("expected version failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_recovery_on_truncation() {
        let store = MemoryStore::new();
        let session = populated_session();
        let session_id = session.session_id().to_string();
        save_client_session(&store, &session).await.unwrap();

        let config = RecoveryConfig {
            max_data_bins_to_restore: 2,
            ..Default::default()
        };
        let outcome = recover_client_session(&store, &session_id, &config).await;
        match outcome {
            RecoveryOutcome::Partial(recovered, reason) => {
                assert!(reason.contains("truncated"));
                assert_eq!(recovered.cache_stats().entry_count, 2);
            }
            other => panic!("expected partial recovery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovery_without_precincts_is_partial() {
        let store = MemoryStore::new();
        let session = populated_session();
        let session_id = session.session_id().to_string();
        save_client_session(&store, &session).await.unwrap();

        let config = RecoveryConfig {
            restore_precinct_cache: false,
            ..Default::default()
        };
        let outcome = recover_client_session(&store, &session_id, &config).await;
        match outcome {
            RecoveryOutcome::Partial(recovered, _) => {
                assert!(recovered.precinct_cache().is_empty());
            }
            other => panic!("expected partial recovery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovery_manager_bounds_retries() {
        let store = MemoryStore::new();
        let mut manager = RecoveryManager::new(RecoveryConfig {
            max_retry_attempts: 2,
            ..Default::default()
        });

        // Two failing attempts consume the budget.
        assert!(manager.recover(&store, "ghost").await.is_failed());
        assert!(manager.recover(&store, "ghost").await.is_failed());
        assert_eq!(manager.attempts_for("ghost"), 2);

        // The third is refused outright.
        match manager.recover(&store, "ghost").await {
            RecoveryOutcome::Failed(reason) => assert!(reason.contains("max retry")),
            other => panic!("expected retry exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovery_manager_success_resets_counter() {
        let store = MemoryStore::new();
        let session = populated_session();
        let session_id = session.session_id().to_string();

        let mut manager = RecoveryManager::new(RecoveryConfig::default());
        assert!(manager.recover(&store, &session_id).await.is_failed());
        assert_eq!(manager.attempts_for(&session_id), 1);

        save_client_session(&store, &session).await.unwrap();
        assert!(!manager.recover(&store, &session_id).await.is_failed());
        assert_eq!(manager.attempts_for(&session_id), 0);
    }

    #[tokio::test]
    async fn test_server_snapshot_carries_sent_bins() {
        let mut session = ServerSession::new("s1", "cid-s1", "img.jp2");
        session.record_sent_data_bin(&DataBin::new(BinClass::Tile, 3, vec![1, 2]));

        let store = MemoryStore::new();
        save_server_session(&store, &session).await.unwrap();

        let raw = store
            .load(&SessionSnapshot::server_key("s1"))
            .await
            .unwrap();
        let snapshot: SessionSnapshot = serde_json::from_slice(&raw).unwrap();
        assert_eq!(snapshot.metadata.get("sent_bins").unwrap(), "tile:3");
    }
}
