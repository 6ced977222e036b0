//! Multi-resolution tile decomposition and viewport prioritization.
//!
//! An image of `w x h` pixels at resolution level `r` shrinks to
//! `ceil(w / 2^r) x ceil(h / 2^r)`; tile dimensions shrink the same way,
//! scaled by a granularity factor, and never collapse below one pixel.
//! Tiles are enumerated row-major per component.
//!
//! On every viewport update the tile set is re-prioritized: tiles outside
//! the viewport are background, tiles inside classify by how close their
//! center sits to the viewport center. Per-tile layer targets scale with
//! priority and visible fraction.

use std::collections::HashMap;

use crate::geometry::Viewport;

/// Delivery priority of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TilePriority {
    Background,
    Low,
    Normal,
    High,
    Critical,
}

/// Identifies a tile at a component, resolution level and grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    pub component: u32,
    pub resolution: u32,
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub fn new(component: u32, resolution: u32, x: u32, y: u32) -> Self {
        Self {
            component,
            resolution,
            x,
            y,
        }
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}r{}t{}x{}", self.component, self.resolution, self.x, self.y)
    }
}

/// Current priority state of one tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileState {
    pub id: TileId,
    pub priority: TilePriority,

    /// Quality layers this tile should reach
    pub target_layers: u32,

    /// Visible fraction of the tile, in `[0, 1]`
    pub visibility_score: f64,

    /// Normalized distance of the tile center from the viewport center
    pub center_distance: f64,
}

/// Static decomposition parameters.
#[derive(Debug, Clone)]
pub struct TileManagerConfig {
    /// Full-resolution image width in pixels
    pub image_width: u32,

    /// Full-resolution image height in pixels
    pub image_height: u32,

    /// Tile width at full resolution
    pub base_tile_width: u32,

    /// Tile height at full resolution
    pub base_tile_height: u32,

    /// Number of resolution levels
    pub resolution_levels: u32,

    /// Number of image components
    pub components: u32,

    /// Scale applied to per-level tile dimensions
    pub granularity: f64,

    /// Most quality layers a tile can target
    pub max_quality_layers: u32,
}

impl Default for TileManagerConfig {
    fn default() -> Self {
        Self {
            image_width: 4096,
            image_height: 4096,
            base_tile_width: 512,
            base_tile_height: 512,
            resolution_levels: 6,
            components: 1,
            granularity: 1.0,
            max_quality_layers: 12,
        }
    }
}

/// Per-level grid geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelGeometry {
    pub level: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub cols: u32,
    pub rows: u32,
}

/// Image-to-tile decomposition with viewport-driven priorities.
#[derive(Debug)]
pub struct TileManager {
    config: TileManagerConfig,
    viewport: Option<Viewport>,
    states: HashMap<TileId, TileState>,
    /// Tile ids ordered by descending priority, rebuilt on viewport change
    ordered: Vec<TileId>,
}

impl TileManager {
    pub fn new(config: TileManagerConfig) -> Self {
        Self {
            config,
            viewport: None,
            states: HashMap::new(),
            ordered: Vec::new(),
        }
    }

    pub fn config(&self) -> &TileManagerConfig {
        &self.config
    }

    pub fn viewport(&self) -> Option<&Viewport> {
        self.viewport.as_ref()
    }

    /// Grid geometry at a resolution level.
    pub fn level_geometry(&self, level: u32) -> LevelGeometry {
        let divisor = 1u32 << level.min(31);
        let image_width = self.config.image_width.div_ceil(divisor);
        let image_height = self.config.image_height.div_ceil(divisor);
        let tile_width = (((f64::from(self.config.base_tile_width) / f64::from(divisor))
            * self.config.granularity)
            .floor() as u32)
            .max(1);
        let tile_height = (((f64::from(self.config.base_tile_height) / f64::from(divisor))
            * self.config.granularity)
            .floor() as u32)
            .max(1);
        LevelGeometry {
            level,
            image_width,
            image_height,
            tile_width,
            tile_height,
            cols: image_width.div_ceil(tile_width),
            rows: image_height.div_ceil(tile_height),
        }
    }

    /// All tile ids at one level, row-major per component.
    pub fn tiles_at_level(&self, level: u32) -> Vec<TileId> {
        let geometry = self.level_geometry(level);
        let mut tiles =
            Vec::with_capacity((geometry.cols * geometry.rows * self.config.components) as usize);
        for component in 0..self.config.components {
            for y in 0..geometry.rows {
                for x in 0..geometry.cols {
                    tiles.push(TileId::new(component, level, x, y));
                }
            }
        }
        tiles
    }

    /// Full-resolution pixel rectangle of a tile: `(x, y, w, h)`.
    pub fn tile_rect_full_res(&self, id: &TileId) -> (u32, u32, u32, u32) {
        let geometry = self.level_geometry(id.resolution);
        let scale = 1u32 << id.resolution.min(31);
        let x = id.x * geometry.tile_width * scale;
        let y = id.y * geometry.tile_height * scale;
        let w = geometry.tile_width * scale;
        let h = geometry.tile_height * scale;
        (x, y, w, h)
    }

    /// Re-prioritize every tile for a new viewport.
    pub fn update_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
        self.states.clear();

        let (vx, vy) = viewport.center();
        let half_diagonal = (f64::from(viewport.width).powi(2)
            + f64::from(viewport.height).powi(2))
        .sqrt()
            / 2.0;

        for level in 0..self.config.resolution_levels {
            for id in self.tiles_at_level(level) {
                let (tx, ty, tw, th) = self.tile_rect_full_res(&id);
                let state = if !viewport.intersects(tx, ty, tw, th) {
                    TileState {
                        id,
                        priority: TilePriority::Background,
                        target_layers: 1,
                        visibility_score: 0.0,
                        center_distance: f64::INFINITY,
                    }
                } else {
                    let cx = f64::from(tx) + f64::from(tw) / 2.0;
                    let cy = f64::from(ty) + f64::from(th) / 2.0;
                    let d_norm = ((cx - vx).powi(2) + (cy - vy).powi(2)).sqrt() / half_diagonal;

                    let priority = if d_norm < 0.2
                        && level >= self.config.resolution_levels.saturating_sub(2)
                    {
                        TilePriority::Critical
                    } else if d_norm < 0.4 {
                        TilePriority::High
                    } else if d_norm < 0.7 {
                        TilePriority::Normal
                    } else {
                        TilePriority::Low
                    };

                    let tile_area = u64::from(tw) * u64::from(th);
                    let visibility = if tile_area == 0 {
                        0.0
                    } else {
                        viewport.intersection_area(tx, ty, tw, th) as f64 / tile_area as f64
                    };

                    TileState {
                        id,
                        priority,
                        target_layers: self.layers_for(priority, visibility),
                        visibility_score: visibility,
                        center_distance: d_norm,
                    }
                };
                self.states.insert(id, state);
            }
        }

        let mut ordered: Vec<TileId> = self.states.keys().copied().collect();
        ordered.sort_by(|a, b| {
            let sa = &self.states[a];
            let sb = &self.states[b];
            sb.priority
                .cmp(&sa.priority)
                .then(
                    sa.center_distance
                        .partial_cmp(&sb.center_distance)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(sa.id.resolution.cmp(&sb.id.resolution))
        });
        self.ordered = ordered;
    }

    fn layers_for(&self, priority: TilePriority, visibility: f64) -> u32 {
        let max = self.config.max_quality_layers.max(1);
        let base = match priority {
            TilePriority::Critical => max,
            TilePriority::High => max * 3 / 4,
            TilePriority::Normal => max / 2,
            TilePriority::Low => max / 4,
            TilePriority::Background => 1,
        };
        let scaled = (f64::from(base) * visibility.clamp(0.0, 1.0)).round() as u32;
        scaled.clamp(1, max)
    }

    /// Tile states ordered by descending priority.
    pub fn prioritized_tiles(&self) -> impl Iterator<Item = &TileState> {
        self.ordered.iter().filter_map(|id| self.states.get(id))
    }

    /// The `n` highest-priority tiles at one resolution level.
    pub fn top_tiles_at_level(&self, level: u32, n: usize) -> Vec<&TileState> {
        self.prioritized_tiles()
            .filter(|state| state.id.resolution == level)
            .take(n)
            .collect()
    }

    /// State of one tile, when a viewport has been applied.
    pub fn tile_state(&self, id: &TileId) -> Option<&TileState> {
        self.states.get(id)
    }

    /// Tiles the current viewport covers at its own resolution level.
    pub fn visible_tiles(&self) -> Vec<TileId> {
        let Some(viewport) = self.viewport else {
            return Vec::new();
        };
        let geometry = self.level_geometry(viewport.resolution_level);
        let scale = 1u32 << viewport.resolution_level.min(31);
        let (c0, c1, r0, r1) = viewport.tile_coverage(
            geometry.tile_width * scale,
            geometry.tile_height * scale,
            geometry.cols,
            geometry.rows,
        );
        let mut tiles = Vec::new();
        for component in 0..self.config.components {
            for y in r0..r1 {
                for x in c0..c1 {
                    tiles.push(TileId::new(component, viewport.resolution_level, x, y));
                }
            }
        }
        tiles
    }
}
