//! Bandwidth estimation from observed transfers.
//!
//! Transfers are accumulated until a measurement interval's worth of
//! transfer time has elapsed, then collapsed into one sample. The running
//! estimate is an exponential moving average over samples; congestion is
//! inferred from RTT inflation against the baseline (the running minimum
//! RTT); trend and confidence come from the last few samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How many recent samples feed trend, confidence and average RTT.
const RECENT_SAMPLE_WINDOW: usize = 10;

/// Samples retained for inspection.
const MAX_SAMPLES: usize = 100;

/// Predictions never drop below this floor (bytes/second).
pub const MIN_PREDICTED_BANDWIDTH: u64 = 100_000;

/// Trend gain for a rising estimate.
const TREND_GAIN_UP: f64 = 0.2;

/// Trend gain for a falling estimate.
const TREND_GAIN_DOWN: f64 = 0.3;

/// Prediction penalty applied under congestion.
const CONGESTION_PENALTY: f64 = 0.7;

/// Tuning knobs for the estimator.
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// Transfer time accumulated before a sample is emitted
    pub measurement_interval: Duration,

    /// EMA smoothing: the weight kept on the previous estimate
    pub smoothing_factor: f64,

    /// RTT inflation ratio beyond which congestion is flagged
    pub congestion_threshold: f64,

    /// Samples needed before confidence is based on variation
    pub min_samples: usize,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            measurement_interval: Duration::from_secs(1),
            smoothing_factor: 0.7,
            congestion_threshold: 1.5,
            min_samples: 5,
        }
    }
}

/// One emitted measurement.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthSample {
    pub timestamp: Instant,
    pub throughput_bps: f64,
    pub rtt_ms: f64,
    pub bytes: u64,
    pub duration_s: f64,
}

/// The estimator's current view of the link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthEstimate {
    /// Smoothed estimate in bytes/second
    pub bandwidth_bps: u64,

    /// Direction of recent change, clamped to `[-1, 1]`
    pub trend: f64,

    /// How much to trust the estimate, in `[0, 1]`
    pub confidence: f64,

    /// Whether RTT inflation indicates congestion
    pub congestion_detected: bool,

    /// Average RTT over the recent sample window, in milliseconds
    pub avg_rtt_ms: f64,

    /// Trend- and congestion-adjusted prediction, bytes/second
    pub predicted_bandwidth_bps: u64,
}

/// Windowed bandwidth estimator.
#[derive(Debug)]
pub struct BandwidthEstimator {
    config: BandwidthConfig,
    samples: VecDeque<BandwidthSample>,
    ema_bps: Option<f64>,
    accumulated_bytes: u64,
    accumulated_duration_s: f64,
    current_rtt_ms: Option<f64>,
    baseline_rtt_ms: Option<f64>,
    total_bytes: u64,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self::with_config(BandwidthConfig::default())
    }

    pub fn with_config(config: BandwidthConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            ema_bps: None,
            accumulated_bytes: 0,
            accumulated_duration_s: 0.0,
            current_rtt_ms: None,
            baseline_rtt_ms: None,
            total_bytes: 0,
        }
    }

    /// Record one observed transfer.
    ///
    /// `duration_s` is the transfer's own elapsed time; accumulation is
    /// driven by these durations, not by wall-clock gaps between calls.
    pub fn record_transfer(&mut self, bytes: u64, duration_s: f64, rtt_ms: f64) {
        if rtt_ms.is_finite() && rtt_ms > 0.0 {
            self.current_rtt_ms = Some(rtt_ms);
            self.baseline_rtt_ms = Some(match self.baseline_rtt_ms {
                Some(baseline) => baseline.min(rtt_ms),
                None => rtt_ms,
            });
        }

        if duration_s.is_finite() && duration_s > 0.0 {
            self.accumulated_bytes += bytes;
            self.accumulated_duration_s += duration_s;
            self.total_bytes += bytes;
        }

        if self.accumulated_duration_s >= self.config.measurement_interval.as_secs_f64() {
            self.emit_sample();
        }
    }

    fn emit_sample(&mut self) {
        let throughput = self.accumulated_bytes as f64 / self.accumulated_duration_s;
        let sample = BandwidthSample {
            timestamp: Instant::now(),
            throughput_bps: throughput,
            rtt_ms: self.current_rtt_ms.unwrap_or(0.0),
            bytes: self.accumulated_bytes,
            duration_s: self.accumulated_duration_s,
        };

        let alpha = 1.0 - self.config.smoothing_factor;
        self.ema_bps = Some(match self.ema_bps {
            Some(ema) => alpha * throughput + self.config.smoothing_factor * ema,
            None => throughput,
        });

        self.samples.push_back(sample);
        if self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.accumulated_bytes = 0;
        self.accumulated_duration_s = 0.0;
    }

    /// Current smoothed estimate in bytes/second.
    pub fn bandwidth_bps(&self) -> u64 {
        self.ema_bps.map_or(0, |ema| ema.max(0.0) as u64)
    }

    /// Whether the RTT inflation ratio exceeds the congestion threshold.
    pub fn congestion_detected(&self) -> bool {
        match (self.current_rtt_ms, self.baseline_rtt_ms) {
            (Some(current), Some(baseline))
                if current.is_finite() && baseline.is_finite() && baseline > 0.0 && current > 0.0 =>
            {
                current / baseline > self.config.congestion_threshold
            }
            _ => false,
        }
    }

    fn recent(&self) -> impl Iterator<Item = &BandwidthSample> {
        let skip = self.samples.len().saturating_sub(RECENT_SAMPLE_WINDOW);
        self.samples.iter().skip(skip)
    }

    /// Relative change between the first and last recent samples.
    pub fn trend(&self) -> f64 {
        let recent: Vec<f64> = self.recent().map(|s| s.throughput_bps).collect();
        if recent.len() < 2 {
            return 0.0;
        }
        let first = recent[0];
        let last = recent[recent.len() - 1];
        if first <= 0.0 {
            return 0.0;
        }
        ((last - first) / first).clamp(-1.0, 1.0)
    }

    /// Confidence ramps with sample count, then tracks stability.
    pub fn confidence(&self) -> f64 {
        let count = self.samples.len();
        if count < self.config.min_samples {
            return count as f64 / self.config.min_samples as f64;
        }

        let recent: Vec<f64> = self.recent().map(|s| s.throughput_bps).collect();
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance =
            recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / recent.len() as f64;
        let cv = variance.sqrt() / mean;
        (1.0 - cv).clamp(0.0, 1.0)
    }

    /// Full estimate snapshot.
    pub fn estimate(&self) -> BandwidthEstimate {
        let bandwidth = self.bandwidth_bps();
        let trend = self.trend();
        let congestion = self.congestion_detected();

        let gain = if trend >= 0.0 {
            TREND_GAIN_UP
        } else {
            TREND_GAIN_DOWN
        };
        let mut predicted = bandwidth as f64 * (1.0 + trend * gain);
        if congestion {
            predicted *= CONGESTION_PENALTY;
        }
        let predicted = (predicted.max(0.0) as u64).max(MIN_PREDICTED_BANDWIDTH);

        let recent_rtt: Vec<f64> = self
            .recent()
            .map(|s| s.rtt_ms)
            .filter(|rtt| rtt.is_finite() && *rtt > 0.0)
            .collect();
        let avg_rtt_ms = if recent_rtt.is_empty() {
            self.current_rtt_ms.unwrap_or(0.0)
        } else {
            recent_rtt.iter().sum::<f64>() / recent_rtt.len() as f64
        };

        BandwidthEstimate {
            bandwidth_bps: bandwidth,
            trend,
            confidence: self.confidence(),
            congestion_detected: congestion,
            avg_rtt_ms,
            predicted_bandwidth_bps: predicted,
        }
    }

    /// Emitted samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &BandwidthSample> {
        self.samples.iter()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}
