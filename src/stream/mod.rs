//! Adaptive streaming pipeline.
//!
//! Four cooperating pieces drive what gets delivered and when:
//!
//! - [`bandwidth`] - Windowed throughput measurement, congestion detection
//!   and short-horizon prediction.
//! - [`quality`] - Maps bandwidth and latency to target quality layers and
//!   resolution level, with smoothing and QoE bookkeeping.
//! - [`tiles`] - Image-to-tile decomposition per resolution level and
//!   viewport-driven tile prioritization.
//! - [`progressive`] - Progression modes and the delivery scheduler that
//!   releases bins in batches under the bandwidth budget.

pub mod bandwidth;
pub mod progressive;
pub mod quality;
pub mod tiles;

pub use bandwidth::{BandwidthConfig, BandwidthEstimate, BandwidthEstimator, BandwidthSample};
pub use progressive::{
    DeliveryScheduler, DeliveryUnit, PipelineConfig, ProgressionMode, ProgressivePipeline,
};
pub use quality::{AdaptiveQualityEngine, QoeMetrics, QualityConfig, QualityDecision};
pub use tiles::{TileId, TileManager, TileManagerConfig, TilePriority, TileState};
