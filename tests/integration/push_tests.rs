//! Predictive push end to end: viewport history in, delta-filtered
//! prioritized pushes out.

use jpip_streamer::codestream::{BinClass, DataBin};
use jpip_streamer::geometry::Viewport;
use jpip_streamer::push::{
    Aggressiveness, PrefetchConfig, PushAcceptance, PushManager, PushManagerConfig,
};
use jpip_streamer::stream::{TileManager, TileManagerConfig};
use jpip_streamer::transport::{Frame, FrameType};

fn tile_manager() -> TileManager {
    TileManager::new(TileManagerConfig {
        image_width: 4096,
        image_height: 4096,
        base_tile_width: 512,
        base_tile_height: 512,
        resolution_levels: 4,
        ..Default::default()
    })
}

fn push_manager() -> PushManager {
    PushManager::new(PushManagerConfig {
        prefetch: PrefetchConfig {
            confidence_threshold: 0.0,
            max_prefetch_depth: 32,
            aggressiveness: Aggressiveness::Conservative,
            ..Default::default()
        },
        ..Default::default()
    })
}

/// One bin per level-0 tile.
fn available_bins() -> Vec<DataBin> {
    (0..64u32)
        .map(|idx| {
            let mut bin = DataBin::new(BinClass::Tile, idx, vec![idx as u8; 48]);
            bin.tile_index = Some(idx);
            bin
        })
        .collect()
}

#[tokio::test]
async fn test_pan_produces_prioritized_push_frames() {
    let mut manager = push_manager();
    let tiles = tile_manager();
    let bins = available_bins();

    // A client panning right across the image.
    for i in 0..3u32 {
        manager.on_viewport_update(
            "session-1",
            Viewport::new(512 + i * 512, 1024, 512, 512, 0),
            &tiles,
            &bins,
        );
    }
    assert!(manager.queued() > 0);

    let items = manager.dequeue_push_items(8);
    assert!(!items.is_empty());

    // Each item frames up as a push frame that round-trips.
    for item in &items {
        let frame = Frame::push(&item.bin);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Push);
        let bin = decoded.decode_data_bin().unwrap();
        assert_eq!(bin.key(), item.bin.key());
    }

    // Priorities never increase across the batch.
    let priorities: Vec<u8> = items.iter().map(|i| i.priority).collect();
    assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn test_delta_delivery_never_repeats_a_bin() {
    let mut manager = push_manager();
    let tiles = tile_manager();
    let bins = available_bins();

    manager.on_viewport_update("s", Viewport::new(1024, 1024, 512, 512, 0), &tiles, &bins);
    manager.on_viewport_update("s", Viewport::new(1536, 1024, 512, 512, 0), &tiles, &bins);

    let first: Vec<String> = manager
        .dequeue_push_items(100)
        .iter()
        .map(|i| i.bin.key())
        .collect();
    assert!(!first.is_empty());

    // The same navigation again: delivered bins are filtered out.
    manager.on_viewport_update("s", Viewport::new(1536, 1024, 512, 512, 0), &tiles, &bins);
    let second: Vec<String> = manager
        .dequeue_push_items(100)
        .iter()
        .map(|i| i.bin.key())
        .collect();
    for key in &second {
        assert!(!first.contains(key), "bin pushed twice: {key}");
    }
    assert!(manager.delta_saved_bins() > 0);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let mut manager = push_manager();
    let tiles = tile_manager();
    let bins = available_bins();

    manager.on_viewport_update("a", Viewport::new(1024, 1024, 512, 512, 0), &tiles, &bins);
    manager.on_viewport_update("b", Viewport::new(2048, 2048, 512, 512, 0), &tiles, &bins);

    let items = manager.dequeue_push_items(100);
    let sessions: std::collections::HashSet<&str> =
        items.iter().map(|i| i.session_id.as_str()).collect();
    assert!(sessions.contains("a"));
    assert!(sessions.contains("b"));

    // Dropping one session leaves the other untouched.
    manager.forget_session("a");
    manager.on_viewport_update("b", Viewport::new(2048, 2048, 512, 512, 0), &tiles, &bins);
    assert!(manager
        .dequeue_push_items(100)
        .iter()
        .all(|i| i.session_id == "b"));
}

#[tokio::test]
async fn test_acceptance_lifecycle() {
    let mut manager = push_manager();
    let tiles = tile_manager();
    let bins = available_bins();

    manager.on_viewport_update("s", Viewport::new(1024, 1024, 512, 512, 0), &tiles, &bins);
    assert!(manager.queued() > 0);

    // Throttle: one per cycle.
    manager.set_acceptance("s", PushAcceptance::Throttle);
    assert_eq!(manager.dequeue_push_items(10).len(), 1);

    // Stop: flush the rest.
    manager.set_acceptance("s", PushAcceptance::Stop);
    assert_eq!(manager.queued(), 0);

    // Back to accept: new predictions flow again.
    manager.set_acceptance("s", PushAcceptance::Accept);
    manager.on_viewport_update("s", Viewport::new(512, 512, 512, 512, 0), &tiles, &bins);
    assert!(!manager.dequeue_push_items(10).is_empty());
}
