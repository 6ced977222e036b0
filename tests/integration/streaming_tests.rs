//! Adaptive streaming pipeline integration.
//!
//! Drives the bandwidth estimator, quality engine, tile manager and
//! progressive pipeline together the way a streaming client would.

use std::time::Duration;

use jpip_streamer::request::ViewWindowRequest;
use jpip_streamer::stream::{
    BandwidthConfig, BandwidthEstimator, PipelineConfig, ProgressionMode, ProgressivePipeline,
    QualityConfig, TileManager, TileManagerConfig,
};

fn pipeline(mode: ProgressionMode) -> ProgressivePipeline {
    ProgressivePipeline::new(
        PipelineConfig::default(),
        TileManager::new(TileManagerConfig {
            image_width: 4096,
            image_height: 4096,
            base_tile_width: 512,
            base_tile_height: 512,
            resolution_levels: 5,
            ..Default::default()
        }),
        QualityConfig {
            max_quality_layers: 10,
            max_resolution_levels: 5,
            ..Default::default()
        },
        mode,
    )
}

fn estimator() -> BandwidthEstimator {
    BandwidthEstimator::with_config(BandwidthConfig {
        measurement_interval: Duration::from_millis(100),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_fast_link_streams_high_quality() {
    let mut estimator = estimator();
    // A consistently fast link: 20 MB/s.
    for _ in 0..5 {
        estimator.record_transfer(2_000_000, 0.1, 15.0);
    }
    let estimate = estimator.estimate();
    assert!(estimate.bandwidth_bps > 10_000_000);

    let mut pipeline = pipeline(ProgressionMode::QualityFirst);
    let request = ViewWindowRequest::for_target("img").with_region((1024, 1024), (1024, 1024));
    let batch = pipeline.process_request(&request, &estimate).unwrap();

    assert!(!batch.is_empty());
    // Fast link: high layer targets appear in the plan.
    assert!(batch.iter().any(|u| u.quality_layers >= 5));
}

#[tokio::test]
async fn test_slow_link_degrades_gracefully() {
    let mut estimator = estimator();
    // 200 KB/s with inflated RTT.
    estimator.record_transfer(20_000, 0.1, 20.0);
    for _ in 0..4 {
        estimator.record_transfer(20_000, 0.1, 300.0);
    }
    let estimate = estimator.estimate();
    assert!(estimate.congestion_detected);

    let mut pipeline = pipeline(ProgressionMode::ResolutionFirst);
    let request = ViewWindowRequest::for_target("img").with_region((0, 0), (2048, 2048));
    let batch = pipeline.process_request(&request, &estimate).unwrap();

    // Delivery still makes progress at minimal quality.
    assert!(!batch.is_empty());
    assert!(batch.iter().all(|u| u.quality_layers == 1));
}

#[tokio::test]
async fn test_progressive_refinement_across_requests() {
    let mut estimator = estimator();
    for _ in 0..5 {
        estimator.record_transfer(500_000, 0.1, 20.0);
    }
    let estimate = estimator.estimate();

    let mut pipeline = pipeline(ProgressionMode::Hybrid);
    let request = ViewWindowRequest::for_target("img").with_region((1024, 1024), (1024, 1024));

    let first = pipeline.process_request(&request, &estimate).unwrap();
    assert!(!first.is_empty());

    // Acknowledge the first batch; a repeat request does not resend it.
    let keys: Vec<String> = first.iter().map(|u| u.key()).collect();
    for key in keys.clone() {
        pipeline.scheduler_mut().acknowledge(key);
    }
    let second = pipeline.process_request(&request, &estimate).unwrap();
    for unit in &second {
        assert!(!keys.contains(&unit.key()), "unit resent: {unit:?}");
    }
}

#[tokio::test]
async fn test_cancellation_stops_emission_for_good() {
    let mut estimator = estimator();
    estimator.record_transfer(1_000_000, 0.2, 20.0);
    let estimate = estimator.estimate();

    let mut pipeline = pipeline(ProgressionMode::ResolutionFirst);
    let request = ViewWindowRequest::for_target("img").with_region((0, 0), (1024, 1024));
    let batch = pipeline.process_request(&request, &estimate).unwrap();
    assert!(!batch.is_empty());

    pipeline.cancel();
    let after = pipeline.process_request(&request, &estimate).unwrap();
    assert!(after.is_empty());
    assert_eq!(pipeline.scheduler().pending_count(), 0);
}

#[tokio::test]
async fn test_qoe_marks_accumulate() {
    let mut estimator = estimator();
    for _ in 0..10 {
        estimator.record_transfer(5_000_000, 0.1, 10.0);
    }
    let estimate = estimator.estimate();

    let mut pipeline = pipeline(ProgressionMode::ResolutionFirst);
    let request = ViewWindowRequest::for_target("img").with_region((0, 0), (4096, 4096));
    let batch = pipeline.process_request(&request, &estimate).unwrap();

    assert!(!batch.is_empty());
    assert!(pipeline.qoe().time_to_first_byte.is_some());
}
