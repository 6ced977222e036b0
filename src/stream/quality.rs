//! Adaptive quality decisions and QoE bookkeeping.
//!
//! The engine maps a bandwidth estimate and observed latency onto a target
//! quality-layer count and resolution level. Both outputs are smoothed
//! against the previous decision so the stream does not oscillate between
//! quality tiers on transient measurements.

use std::time::Duration;

use super::bandwidth::BandwidthEstimate;

/// Bandwidth thresholds for the layer and resolution tables, bytes/second.
const BW_TIER_1: u64 = 10_000_000;
const BW_TIER_2: u64 = 5_000_000;
const BW_TIER_3: u64 = 2_000_000;
const BW_TIER_4: u64 = 1_000_000;
const BW_TIER_5: u64 = 500_000;

/// Below this bandwidth the pipeline prefers progressive delivery.
const PROGRESSIVE_MODE_THRESHOLD: u64 = 1_000_000;

/// EMA weight for latency once bootstrapped.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Fixed smoothing coefficients for the resolution output.
const RESOLUTION_SMOOTHING_PREV: f64 = 0.6;
const RESOLUTION_SMOOTHING_TARGET: f64 = 0.4;

/// Tuning knobs for the quality engine.
#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Most layers the codestream offers
    pub max_quality_layers: u32,

    /// Number of resolution levels the codestream offers
    pub max_resolution_levels: u32,

    /// Latency budget the host wants to stay under
    pub target_latency: Duration,

    /// Weight kept on the previous layer decision
    pub smoothing: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_quality_layers: 12,
            max_resolution_levels: 6,
            target_latency: Duration::from_millis(100),
            smoothing: 0.5,
        }
    }
}

/// One quality decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityDecision {
    pub target_quality_layers: u32,
    pub target_resolution_level: u32,
    pub use_progressive_mode: bool,
    pub estimated_size_bytes: u64,
}

/// Maps link conditions to delivery targets.
#[derive(Debug)]
pub struct AdaptiveQualityEngine {
    config: QualityConfig,
    previous: Option<QualityDecision>,
}

impl AdaptiveQualityEngine {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    /// Decide targets for the current link estimate.
    pub fn decide(&mut self, estimate: &BandwidthEstimate) -> QualityDecision {
        let bandwidth = estimate.bandwidth_bps;
        let rtt_ms = estimate.avg_rtt_ms;
        let max_layers = self.config.max_quality_layers.max(1);
        let max_levels = self.config.max_resolution_levels.max(1);

        let mut layers = match bandwidth {
            bw if bw >= BW_TIER_1 => max_layers,
            bw if bw >= BW_TIER_2 => max_layers * 3 / 4,
            bw if bw >= BW_TIER_3 => max_layers / 2,
            bw if bw >= BW_TIER_4 => max_layers / 3,
            bw if bw >= BW_TIER_5 => max_layers / 4,
            _ => 1,
        };
        let target_latency_ms = self.config.target_latency.as_secs_f64() * 1000.0;
        if rtt_ms > 1.5 * target_latency_ms {
            layers = layers.saturating_sub(2);
        } else if rtt_ms > target_latency_ms {
            layers = layers.saturating_sub(1);
        }
        let layers = layers.clamp(1, max_layers);

        let mut resolution = match bandwidth {
            bw if bw >= BW_TIER_1 => max_levels - 1,
            bw if bw >= BW_TIER_2 => max_levels.saturating_sub(2),
            bw if bw >= BW_TIER_3 => max_levels / 2,
            bw if bw >= BW_TIER_4 => max_levels / 3,
            _ => 0,
        };
        if estimate.congestion_detected {
            resolution = resolution.saturating_sub(1);
        }
        let resolution = resolution.min(max_levels - 1);

        // Smooth against the previous decision.
        let (layers, resolution) = match self.previous {
            Some(prev) => {
                let s = self.config.smoothing;
                let smoothed_layers = (s * f64::from(prev.target_quality_layers)
                    + (1.0 - s) * f64::from(layers))
                .floor() as u32;
                let smoothed_resolution = (RESOLUTION_SMOOTHING_PREV
                    * f64::from(prev.target_resolution_level)
                    + RESOLUTION_SMOOTHING_TARGET * f64::from(resolution))
                .floor() as u32;
                (
                    smoothed_layers.clamp(1, max_layers),
                    smoothed_resolution.min(max_levels - 1),
                )
            }
            None => (layers, resolution),
        };

        let decision = QualityDecision {
            target_quality_layers: layers,
            target_resolution_level: resolution,
            use_progressive_mode: bandwidth < PROGRESSIVE_MODE_THRESHOLD,
            estimated_size_bytes: estimate_response_size(resolution, layers),
        };
        self.previous = Some(decision);
        decision
    }

    /// Forget the previous decision, e.g. when the target changes.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }
}

/// Rough response-size model: `100_000 * 2^r * (1 + 0.15 * layers)`.
pub fn estimate_response_size(resolution_level: u32, layers: u32) -> u64 {
    let base = 100_000u64 << resolution_level.min(24);
    (base as f64 * (1.0 + 0.15 * f64::from(layers))) as u64
}

/// Quality-of-experience counters for one streaming session.
#[derive(Debug, Default, Clone)]
pub struct QoeMetrics {
    /// Delay until the first payload byte arrived
    pub time_to_first_byte: Option<Duration>,

    /// Delay until enough tiles for interaction arrived
    pub time_to_interactive: Option<Duration>,

    /// Times delivery stalled waiting for data
    pub rebuffering_count: u64,

    /// Smoothed observed latency, milliseconds
    pub latency_ema_ms: Option<f64>,

    quality_samples: u64,
    quality_mean: f64,
    quality_m2: f64,
}

impl QoeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first-byte mark once; later calls are ignored.
    pub fn mark_first_byte(&mut self, elapsed: Duration) {
        self.time_to_first_byte.get_or_insert(elapsed);
    }

    /// Record the interactive mark once; later calls are ignored.
    pub fn mark_interactive(&mut self, elapsed: Duration) {
        self.time_to_interactive.get_or_insert(elapsed);
    }

    pub fn record_rebuffering(&mut self) {
        self.rebuffering_count += 1;
    }

    /// Fold one latency observation into the EMA.
    pub fn record_latency(&mut self, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        self.latency_ema_ms = Some(match self.latency_ema_ms {
            Some(ema) => LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * ema,
            None => latency_ms,
        });
    }

    /// Record a delivered quality as a fraction of maximum, in `[0, 1]`.
    pub fn record_quality(&mut self, normalized: f64) {
        let value = normalized.clamp(0.0, 1.0);
        self.quality_samples += 1;
        let delta = value - self.quality_mean;
        self.quality_mean += delta / self.quality_samples as f64;
        self.quality_m2 += delta * (value - self.quality_mean);
    }

    /// Running average of normalized delivered quality.
    pub fn average_quality(&self) -> f64 {
        if self.quality_samples == 0 {
            0.0
        } else {
            self.quality_mean
        }
    }

    /// Standard deviation of normalized delivered quality.
    pub fn quality_std_dev(&self) -> f64 {
        if self.quality_samples < 2 {
            0.0
        } else {
            (self.quality_m2 / self.quality_samples as f64).sqrt()
        }
    }
}
