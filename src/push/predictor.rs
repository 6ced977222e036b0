//! Viewport prediction from navigation history.
//!
//! The engine keeps a bounded viewport history per session and derives
//! three kinds of predictions on demand:
//!
//! - movement: extrapolate the average pan delta and prefetch the tiles
//!   the viewport is heading into;
//! - resolution: detect a zoom direction and prefetch the current tiles at
//!   the next level, or refine in place when the level is stable;
//! - spatial locality: prefetch the neighbor ring around every covered
//!   tile.
//!
//! Predictions below the confidence threshold are dropped; survivors are
//! sorted by priority then confidence and truncated to the prefetch depth.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::geometry::Viewport;
use crate::stream::tiles::{TileId, TileManager};

/// How far ahead the engine reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggressiveness {
    Conservative,
    Moderate,
    Aggressive,
}

impl Aggressiveness {
    /// Extrapolation steps and neighbor radius.
    pub const fn value(self) -> u32 {
        match self {
            Aggressiveness::Conservative => 1,
            Aggressiveness::Moderate => 2,
            Aggressiveness::Aggressive => 3,
        }
    }
}

/// What a prediction is for, ordered by urgency ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrefetchPriority {
    /// Refinement of tiles already on screen
    Quality,

    /// A zoom level change
    Resolution,

    /// Panning into new territory
    Spatial,
}

impl PrefetchPriority {
    /// Rank used by the push queue.
    pub const fn rank(self) -> u8 {
        match self {
            PrefetchPriority::Quality => 1,
            PrefetchPriority::Resolution => 2,
            PrefetchPriority::Spatial => 3,
        }
    }
}

/// One predicted tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePrediction {
    pub tile: TileId,
    pub confidence: f64,
    pub priority: PrefetchPriority,
}

/// Prefetch engine tuning.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Viewports remembered per session
    pub max_history_size: usize,

    /// Predictions returned per call
    pub max_prefetch_depth: usize,

    /// Predictions below this confidence are dropped
    pub confidence_threshold: f64,

    pub aggressiveness: Aggressiveness,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_history_size: 20,
            max_prefetch_depth: 16,
            confidence_threshold: 0.3,
            aggressiveness: Aggressiveness::Moderate,
        }
    }
}

/// Movement window: how many trailing history entries feed the pan delta.
const MOVEMENT_WINDOW: usize = 5;

/// Confidence for refine-in-place predictions when the level is stable.
const STABLE_LEVEL_CONFIDENCE: f64 = 0.4;

/// Per-session navigation history and prediction.
#[derive(Debug)]
pub struct PrefetchEngine {
    config: PrefetchConfig,
    history: HashMap<String, VecDeque<Viewport>>,
}

impl PrefetchEngine {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Append a viewport to a session's history.
    pub fn record_viewport(&mut self, session_id: &str, viewport: Viewport) {
        let history = self.history.entry(session_id.to_string()).or_default();
        history.push_back(viewport);
        while history.len() > self.config.max_history_size {
            history.pop_front();
        }
    }

    /// Forget a departed session.
    pub fn forget_session(&mut self, session_id: &str) {
        self.history.remove(session_id);
    }

    pub fn history_len(&self, session_id: &str) -> usize {
        self.history.get(session_id).map_or(0, VecDeque::len)
    }

    /// Produce predictions for a session against the current tile grid.
    pub fn predict(&self, session_id: &str, tiles: &TileManager) -> Vec<TilePrediction> {
        let Some(history) = self.history.get(session_id) else {
            return Vec::new();
        };
        let Some(current) = history.back().copied() else {
            return Vec::new();
        };

        let mut predictions = Vec::new();
        predictions.extend(self.predict_movement(history, &current, tiles));
        predictions.extend(self.predict_resolution(history, &current, tiles));
        predictions.extend(self.predict_spatial_locality(&current, tiles));

        predictions.retain(|p| p.confidence >= self.config.confidence_threshold);
        predictions.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        predictions.truncate(self.config.max_prefetch_depth);
        predictions
    }

    /// Extrapolate the average pan delta over the movement window.
    fn predict_movement(
        &self,
        history: &VecDeque<Viewport>,
        current: &Viewport,
        tiles: &TileManager,
    ) -> Vec<TilePrediction> {
        let window: Vec<&Viewport> = history
            .iter()
            .skip(history.len().saturating_sub(MOVEMENT_WINDOW))
            .collect();
        if window.len() < 2 {
            return Vec::new();
        }

        let mut dx = 0.0;
        let mut dy = 0.0;
        for pair in window.windows(2) {
            let (ax, ay) = pair[0].center();
            let (bx, by) = pair[1].center();
            dx += bx - ax;
            dy += by - ay;
        }
        let steps = (window.len() - 1) as f64;
        let dx = dx / steps;
        let dy = dy / steps;
        let magnitude = (dx * dx + dy * dy).sqrt();
        if magnitude < 1.0 {
            return Vec::new();
        }

        let reach = f64::from(self.config.aggressiveness.value());
        let predicted = Viewport::new(
            (f64::from(current.x) + dx * reach).max(0.0) as u32,
            (f64::from(current.y) + dy * reach).max(0.0) as u32,
            current.width,
            current.height,
            current.resolution_level,
        );

        let confidence =
            (1.0 - magnitude / f64::from(current.width.max(current.height))).max(0.1);

        let current_tiles: HashSet<TileId> = covered_tiles(current, tiles).into_iter().collect();
        covered_tiles(&predicted, tiles)
            .into_iter()
            .filter(|tile| !current_tiles.contains(tile))
            .map(|tile| TilePrediction {
                tile,
                confidence,
                priority: PrefetchPriority::Spatial,
            })
            .collect()
    }

    /// Detect a zoom direction from the level deltas between entries.
    fn predict_resolution(
        &self,
        history: &VecDeque<Viewport>,
        current: &Viewport,
        tiles: &TileManager,
    ) -> Vec<TilePrediction> {
        let changes: Vec<i64> = history
            .iter()
            .zip(history.iter().skip(1))
            .map(|(a, b)| i64::from(b.resolution_level) - i64::from(a.resolution_level))
            .filter(|delta| *delta != 0)
            .collect();

        let max_level = tiles.config().resolution_levels.saturating_sub(1);
        if changes.is_empty() {
            // Stable level: refine what is on screen.
            return covered_tiles(current, tiles)
                .into_iter()
                .map(|tile| TilePrediction {
                    tile,
                    confidence: STABLE_LEVEL_CONFIDENCE,
                    priority: PrefetchPriority::Quality,
                })
                .collect();
        }

        let direction = changes[changes.len() - 1].signum();
        let next_level = (i64::from(current.resolution_level) + direction)
            .clamp(0, i64::from(max_level)) as u32;
        let confidence = (changes.len() as f64 * 0.3).min(1.0);

        covered_tiles(current, tiles)
            .into_iter()
            .map(|tile| TilePrediction {
                tile: TileId::new(tile.component, next_level, tile.x, tile.y),
                confidence,
                priority: PrefetchPriority::Resolution,
            })
            .collect()
    }

    /// Neighbor rings around every covered tile.
    fn predict_spatial_locality(
        &self,
        current: &Viewport,
        tiles: &TileManager,
    ) -> Vec<TilePrediction> {
        let radius = self.config.aggressiveness.value();
        let geometry = tiles.level_geometry(current.resolution_level);
        let covered: HashSet<TileId> = covered_tiles(current, tiles).into_iter().collect();
        let (cx, cy) = current.center();

        let scale = f64::from(1u32 << current.resolution_level.min(31));
        let tile_w = f64::from(geometry.tile_width) * scale;
        let tile_h = f64::from(geometry.tile_height) * scale;
        let center_col = cx / tile_w;
        let center_row = cy / tile_h;
        let norm = f64::from(radius) * std::f64::consts::SQRT_2;

        let mut seen = HashSet::new();
        let mut predictions = Vec::new();
        for tile in &covered {
            let radius = radius as i64;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let col = i64::from(tile.x) + dx;
                    let row = i64::from(tile.y) + dy;
                    if col < 0
                        || row < 0
                        || col >= i64::from(geometry.cols)
                        || row >= i64::from(geometry.rows)
                    {
                        continue;
                    }
                    let neighbor =
                        TileId::new(tile.component, tile.resolution, col as u32, row as u32);
                    if covered.contains(&neighbor) || !seen.insert(neighbor) {
                        continue;
                    }

                    let distance = ((f64::from(neighbor.x) + 0.5 - center_col).powi(2)
                        + (f64::from(neighbor.y) + 0.5 - center_row).powi(2))
                    .sqrt();
                    predictions.push(TilePrediction {
                        tile: neighbor,
                        confidence: (1.0 - distance / norm).max(0.1),
                        priority: PrefetchPriority::Spatial,
                    });
                }
            }
        }
        predictions
    }
}

/// Tiles a viewport covers at its own resolution level.
fn covered_tiles(viewport: &Viewport, tiles: &TileManager) -> Vec<TileId> {
    let geometry = tiles.level_geometry(viewport.resolution_level);
    let scale = 1u32 << viewport.resolution_level.min(31);
    let (c0, c1, r0, r1) = viewport.tile_coverage(
        geometry.tile_width * scale,
        geometry.tile_height * scale,
        geometry.cols,
        geometry.rows,
    );
    let mut covered = Vec::new();
    for y in r0..r1 {
        for x in c0..c1 {
            covered.push(TileId::new(0, viewport.resolution_level, x, y));
        }
    }
    covered
}
