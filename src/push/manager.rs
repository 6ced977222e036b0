//! The push manager.
//!
//! On every viewport update: record the viewport, predict, intersect the
//! predictions with the bins available for the target, delta-filter
//! against the client cache model, and enqueue the survivors. Dequeuing
//! honors each session's push acceptance and the bandwidth throttle:
//! `throttle` yields one item per dequeue call, `stop` flushes the
//! session's queue, `reject` refuses items at enqueue time.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::codestream::DataBin;
use crate::geometry::Viewport;
use crate::server::throttle::{BandwidthThrottle, ThrottleConfig};
use crate::stream::tiles::{TileId, TileManager};

use super::predictor::{PrefetchConfig, PrefetchEngine};
use super::scheduler::{PushItem, PushScheduler};
use super::tracker::ClientCacheTracker;

/// How a session treats server-initiated pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushAcceptance {
    /// Deliver pushes freely
    #[default]
    Accept,

    /// Refuse pushes at enqueue time
    Reject,

    /// Deliver at most one push per dequeue cycle
    Throttle,

    /// Flush queued pushes and deliver nothing
    Stop,
}

/// Push manager configuration.
#[derive(Debug, Clone)]
pub struct PushManagerConfig {
    pub queue_capacity: usize,
    pub prefetch: PrefetchConfig,
    pub throttle: ThrottleConfig,
}

impl Default for PushManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            prefetch: PrefetchConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// Composes predictor, scheduler, tracker and throttle.
#[derive(Debug)]
pub struct PushManager {
    predictor: PrefetchEngine,
    scheduler: PushScheduler,
    tracker: ClientCacheTracker,
    throttle: BandwidthThrottle,
    acceptance: HashMap<String, PushAcceptance>,
    pushes_enqueued: u64,
    pushes_delivered: u64,
}

impl PushManager {
    pub fn new(config: PushManagerConfig) -> Self {
        Self {
            predictor: PrefetchEngine::new(config.prefetch),
            scheduler: PushScheduler::new(config.queue_capacity),
            tracker: ClientCacheTracker::new(),
            throttle: BandwidthThrottle::new(config.throttle),
            acceptance: HashMap::new(),
            pushes_enqueued: 0,
            pushes_delivered: 0,
        }
    }

    /// Set a session's push acceptance. `Stop` flushes its queued items.
    pub fn set_acceptance(&mut self, session_id: &str, acceptance: PushAcceptance) {
        if acceptance == PushAcceptance::Stop {
            self.scheduler.remove_session(session_id);
        }
        self.acceptance.insert(session_id.to_string(), acceptance);
    }

    pub fn acceptance(&self, session_id: &str) -> PushAcceptance {
        self.acceptance.get(session_id).copied().unwrap_or_default()
    }

    /// Record a demand-delivered bin so pushes never repeat it.
    pub fn note_bin_delivered(&mut self, session_id: &str, key: impl Into<String>) {
        self.tracker.mark_received(session_id, key);
    }

    /// Feed a viewport update and enqueue predicted pushes. Returns the
    /// number of items enqueued.
    pub fn on_viewport_update(
        &mut self,
        session_id: &str,
        viewport: Viewport,
        tiles: &TileManager,
        available: &[DataBin],
    ) -> usize {
        self.predictor.record_viewport(session_id, viewport);
        match self.acceptance(session_id) {
            PushAcceptance::Reject | PushAcceptance::Stop => return 0,
            PushAcceptance::Accept | PushAcceptance::Throttle => {}
        }

        let predictions = self.predictor.predict(session_id, tiles);
        if predictions.is_empty() {
            return 0;
        }

        // Intersect predictions with the bins the target actually has,
        // first prediction wins per bin key.
        let mut candidates: Vec<DataBin> = Vec::new();
        let mut ranking: HashMap<String, (u8, f64)> = HashMap::new();
        for prediction in &predictions {
            let linear = tile_linear_index(tiles, &prediction.tile);
            for bin in available.iter().filter(|b| b.tile_index == Some(linear)) {
                let key = bin.key();
                if ranking.contains_key(&key) {
                    continue;
                }
                ranking.insert(key, (prediction.priority.rank(), prediction.confidence));
                candidates.push(bin.clone());
            }
        }

        let missing = self.tracker.filter_missing(session_id, candidates);
        let mut enqueued = 0;
        for bin in missing {
            let key = bin.key();
            let (priority, confidence) = ranking.get(&key).copied().unwrap_or((1, 0.1));
            let accepted = self.scheduler.enqueue(PushItem {
                session_id: session_id.to_string(),
                bin,
                priority,
                confidence,
            });
            if accepted {
                self.tracker.mark_pending(session_id, key);
                self.pushes_enqueued += 1;
                enqueued += 1;
            }
        }
        debug!(session_id = %session_id, enqueued, "viewport update processed");
        enqueued
    }

    /// Pop up to `max` deliverable push items.
    ///
    /// Items blocked by the bandwidth throttle stay queued. A session in
    /// `throttle` acceptance yields one item; the allowance resets on the
    /// next call.
    pub fn dequeue_push_items(&mut self, max: usize) -> Vec<PushItem> {
        let mut delivered = Vec::new();
        let mut requeue = Vec::new();
        let mut throttled_served: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let budget = self.scheduler.len();

        for _ in 0..budget {
            if delivered.len() >= max {
                break;
            }
            let Some(item) = self.scheduler.dequeue() else {
                break;
            };
            let session = item.session_id.clone();

            match self.acceptance(&session) {
                PushAcceptance::Stop | PushAcceptance::Reject => {
                    self.scheduler.remove_session(&session);
                    continue;
                }
                PushAcceptance::Throttle if throttled_served.contains(&session) => {
                    requeue.push(item);
                    continue;
                }
                _ => {}
            }
            if blocked.contains(&session) {
                requeue.push(item);
                continue;
            }
            if !self.throttle.can_send(&session, item.bin.len() as u64) {
                blocked.insert(session);
                requeue.push(item);
                continue;
            }

            self.throttle.record_sent(&session, item.bin.len() as u64);
            self.tracker.confirm_delivered(&session, &item.bin.key());
            if self.acceptance(&session) == PushAcceptance::Throttle {
                throttled_served.insert(session);
            }
            self.pushes_delivered += 1;
            delivered.push(item);
        }

        for item in requeue {
            self.scheduler.enqueue(item);
        }
        delivered
    }

    /// Invalidate bins everywhere: queued pushes and cache views.
    pub fn invalidate_bins(&mut self, keys: &[String]) {
        self.scheduler.remove_bins(keys);
        self.tracker.invalidate(keys);
    }

    /// Forget every trace of a session.
    pub fn forget_session(&mut self, session_id: &str) {
        self.predictor.forget_session(session_id);
        self.scheduler.remove_session(session_id);
        self.tracker.forget_session(session_id);
        self.acceptance.remove(session_id);
        self.throttle.forget_client(session_id);
    }

    pub fn queued(&self) -> usize {
        self.scheduler.len()
    }

    pub fn pushes_enqueued(&self) -> u64 {
        self.pushes_enqueued
    }

    pub fn pushes_delivered(&self) -> u64 {
        self.pushes_delivered
    }

    pub fn delta_saved_bins(&self) -> u64 {
        self.tracker.delta_saved_bins()
    }
}

/// Row-major index of a tile within its level grid.
fn tile_linear_index(tiles: &TileManager, tile: &TileId) -> u32 {
    let geometry = tiles.level_geometry(tile.resolution);
    tile.y * geometry.cols + tile.x
}
