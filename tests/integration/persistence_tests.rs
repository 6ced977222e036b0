//! Session persistence and recovery across simulated restarts.

use std::sync::Arc;

use jpip_streamer::cache::{FsStore, MemoryStore, PersistentStore, ResolutionCacheManager};
use jpip_streamer::codestream::{BinClass, DataBin, PrecinctId};
use jpip_streamer::session::persistence::{
    recover_client_session, save_client_session, RecoveryConfig, RecoveryOutcome,
};
use jpip_streamer::session::ClientSession;

fn populated_session() -> ClientSession {
    let mut session = ClientSession::create();
    session.bind_channel("cid-42", "brain.jp2").unwrap();
    for id in 0..20 {
        session
            .ingest_bin(DataBin::new(BinClass::Precinct, id, vec![id as u8; 64]))
            .unwrap();
    }
    session
        .ingest_precinct(PrecinctId::new(0, 0, 2, 1, 1), vec![7; 32], [0, 1, 2], true)
        .unwrap();
    session
}

#[tokio::test]
async fn test_session_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let session = populated_session();
    let session_id = session.session_id().to_string();

    // First process: save and drop.
    {
        let store = FsStore::new(dir.path());
        save_client_session(&store, &session).await.unwrap();
    }

    // Second process: recover from the same directory.
    let store = FsStore::new(dir.path());
    let outcome =
        recover_client_session(&store, &session_id, &RecoveryConfig::default()).await;
    let recovered = match outcome {
        RecoveryOutcome::Full(s) => s,
        other => panic!("expected full recovery, got {other:?}"),
    };

    assert_eq!(recovered.session_id(), session_id);
    assert_eq!(recovered.channel_id(), Some("cid-42"));
    assert_eq!(recovered.cache_stats().entry_count, 20);
    assert!(recovered
        .precinct_cache()
        .is_complete(&PrecinctId::new(0, 0, 2, 1, 1)));
}

#[tokio::test]
async fn test_snapshot_file_naming() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path());
    let session = populated_session();
    save_client_session(&store, &session).await.unwrap();

    let keys = store.list_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("client_"));
    assert!(keys[0].ends_with(".jpipsession"));
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_cleanly() {
    let store = MemoryStore::new();
    let session = populated_session();
    let session_id = session.session_id().to_string();
    save_client_session(&store, &session).await.unwrap();

    // Corrupt the stored snapshot.
    let key = format!("client_{session_id}.jpipsession");
    store
        .save(&key, bytes::Bytes::from_static(b"{ not json"))
        .await
        .unwrap();

    let outcome =
        recover_client_session(&store, &session_id, &RecoveryConfig::default()).await;
    assert!(outcome.is_failed());
}

#[tokio::test]
async fn test_cache_manager_persistent_tier_roundtrip() {
    let dir = tempfile::tempdir().unwrap();

    // First run: populate and save.
    {
        let store: Arc<dyn PersistentStore> = Arc::new(FsStore::new(dir.path()));
        let mut manager = ResolutionCacheManager::new().with_store(store);
        for id in 0..8 {
            manager.add_bin(
                DataBin::new(BinClass::Precinct, id, vec![id as u8; 128]),
                "brain.jp2",
                (id % 3) as u32,
            );
        }
        assert_eq!(manager.save_to_persistent().await.unwrap(), 8);
    }

    // Second run: warm up from disk.
    let store: Arc<dyn PersistentStore> = Arc::new(FsStore::new(dir.path()));
    let mut manager = ResolutionCacheManager::new().with_store(store);
    assert_eq!(manager.warm_up_from_persistent().await, 8);

    for id in 0..8 {
        assert!(manager.has_bin(BinClass::Precinct, id, "brain.jp2"));
    }
    let report = manager.generate_usage_report();
    assert_eq!(report.entry_count, 8);
    assert_eq!(report.images.len(), 1);
    assert_eq!(report.images[0].resolution_levels, 3);
}
