//! Progression modes and the progressive delivery pipeline.
//!
//! The pipeline turns a view-window request into an ordered plan of
//! delivery units, then hands the plan to a [`DeliveryScheduler`] that
//! releases batches sized to the predicted bandwidth. Units the session has
//! already acknowledged are skipped; cancellation is sticky and suppresses
//! all further emission.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::geometry::{StreamingRegion, Viewport, Viewport3D};
use crate::request::ViewWindowRequest;

use super::bandwidth::BandwidthEstimate;
use super::quality::{AdaptiveQualityEngine, QoeMetrics, QualityConfig, QualityDecision};
use super::tiles::{TileId, TileManager, TilePriority};

/// Nominal bytes per quality layer of one unit, for batch budgeting.
const NOMINAL_LAYER_BYTES: u64 = 16 * 1024;

/// Tiles delivered before the pipeline counts as interactive.
const INTERACTIVE_TILE_THRESHOLD: u64 = 10;

/// Order in which refinements are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionMode {
    /// Coarse-to-fine over resolution levels at minimal quality
    ResolutionFirst,

    /// Fixed resolution, layer by layer
    QualityFirst,

    /// A coarse preview pass, then the target resolution
    Hybrid,

    /// One step per volume slice, ascending Z
    SliceForward,

    /// One step per volume slice, descending Z
    SliceReverse,

    /// Slices expanding outward from the middle of the Z range
    SliceBidirectional,

    /// Volume bricks visible in the view frustum, one full-quality pass
    ViewDependent,

    /// Volume bricks ascending by distance to the view origin
    DistanceOrdered,

    /// Cartesian sweep over (resolution, layer) pairs
    Adaptive,
}

/// One schedulable unit of delivery: a tile or volume step at a layer count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUnit {
    /// 2D tile, or the brick position for volume modes
    pub tile: Option<TileId>,

    /// Slice or brick depth index for volume modes
    pub slice_index: Option<u32>,

    pub resolution_level: u32,
    pub quality_layers: u32,
    pub estimated_bytes: u64,
}

impl DeliveryUnit {
    fn for_tile(tile: TileId, layers: u32) -> Self {
        Self {
            tile: Some(tile),
            slice_index: None,
            resolution_level: tile.resolution,
            quality_layers: layers,
            estimated_bytes: NOMINAL_LAYER_BYTES * u64::from(layers.max(1)),
        }
    }

    fn for_slice(slice: u32, resolution: u32, layers: u32) -> Self {
        Self {
            tile: None,
            slice_index: Some(slice),
            resolution_level: resolution,
            quality_layers: layers,
            estimated_bytes: NOMINAL_LAYER_BYTES * u64::from(layers.max(1)),
        }
    }

    /// Key under which acknowledgements are tracked.
    pub fn key(&self) -> String {
        match (&self.tile, self.slice_index) {
            (Some(tile), Some(z)) => format!("{tile}z{z}@{}", self.quality_layers),
            (Some(tile), None) => format!("{tile}@{}", self.quality_layers),
            (None, Some(z)) => format!("slice:{z}r{}@{}", self.resolution_level, self.quality_layers),
            (None, None) => format!("r{}@{}", self.resolution_level, self.quality_layers),
        }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Layers delivered in preview passes
    pub minimum_initial_layers: u32,

    /// Tiles scheduled per pass
    pub max_concurrent_deliveries: usize,

    /// Time the bandwidth budget of one batch covers
    pub batch_window: Duration,

    /// Brick edge length for volume modes, in voxels
    pub brick_size: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            minimum_initial_layers: 1,
            max_concurrent_deliveries: 8,
            batch_window: Duration::from_millis(200),
            brick_size: 64,
        }
    }
}

/// FIFO of pending units released in bandwidth-budgeted batches.
#[derive(Debug, Default)]
pub struct DeliveryScheduler {
    pending: VecDeque<DeliveryUnit>,
    acknowledged: HashSet<String>,
    cancelled: bool,
    batch_window: Duration,
    delivered_units: u64,
    delivered_bytes: u64,
    /// Batches requested while the bandwidth budget was zero
    deferred_intents: u64,
}

impl DeliveryScheduler {
    pub fn new(batch_window: Duration) -> Self {
        Self {
            batch_window,
            ..Default::default()
        }
    }

    /// Append units to the pending queue. No-op after cancellation.
    pub fn enqueue(&mut self, units: impl IntoIterator<Item = DeliveryUnit>) {
        if self.cancelled {
            return;
        }
        self.pending.extend(units);
    }

    /// Mark a unit key as already held by the session.
    pub fn acknowledge(&mut self, key: impl Into<String>) {
        self.acknowledged.insert(key.into());
    }

    /// Release the next batch under the given predicted bandwidth.
    ///
    /// Acknowledged units are dropped, not delivered. With zero bandwidth
    /// nothing is released but the intent is recorded. At least one unit is
    /// released per batch when bandwidth is nonzero, so a unit larger than
    /// the whole budget cannot wedge the queue.
    pub fn release_batch(&mut self, predicted_bandwidth_bps: u64) -> Vec<DeliveryUnit> {
        if self.cancelled || self.pending.is_empty() {
            return Vec::new();
        }
        if predicted_bandwidth_bps == 0 {
            self.deferred_intents += 1;
            return Vec::new();
        }

        let budget =
            (predicted_bandwidth_bps as f64 * self.batch_window.as_secs_f64()).ceil() as u64;
        let mut batch = Vec::new();
        let mut spent = 0u64;

        while let Some(front) = self.pending.front() {
            if self.acknowledged.contains(&front.key()) {
                self.pending.pop_front();
                continue;
            }
            if !batch.is_empty() && spent + front.estimated_bytes > budget {
                break;
            }
            let Some(unit) = self.pending.pop_front() else {
                break;
            };
            spent += unit.estimated_bytes;
            batch.push(unit);
        }

        self.delivered_units += batch.len() as u64;
        self.delivered_bytes += spent;
        batch
    }

    /// Drop all pending units and refuse everything from now on.
    ///
    /// Idempotent; the flag is sticky.
    pub fn cancel(&mut self) {
        self.pending.clear();
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn delivered_units(&self) -> u64 {
        self.delivered_units
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes
    }

    pub fn deferred_intents(&self) -> u64 {
        self.deferred_intents
    }
}

/// The progressive delivery pipeline.
///
/// Owns the tile manager, quality engine, scheduler and QoE marks for one
/// streaming session.
pub struct ProgressivePipeline {
    config: PipelineConfig,
    mode: ProgressionMode,
    tiles: TileManager,
    quality: AdaptiveQualityEngine,
    scheduler: DeliveryScheduler,
    qoe: QoeMetrics,
    started_at: Instant,
    tiles_delivered: u64,
}

impl ProgressivePipeline {
    pub fn new(
        config: PipelineConfig,
        tiles: TileManager,
        quality_config: QualityConfig,
        mode: ProgressionMode,
    ) -> Self {
        let batch_window = config.batch_window;
        Self {
            config,
            mode,
            tiles,
            quality: AdaptiveQualityEngine::new(quality_config),
            scheduler: DeliveryScheduler::new(batch_window),
            qoe: QoeMetrics::new(),
            started_at: Instant::now(),
            tiles_delivered: 0,
        }
    }

    pub fn set_mode(&mut self, mode: ProgressionMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ProgressionMode {
        self.mode
    }

    pub fn qoe(&self) -> &QoeMetrics {
        &self.qoe
    }

    pub fn scheduler(&self) -> &DeliveryScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut DeliveryScheduler {
        &mut self.scheduler
    }

    /// Cancel delivery: pending units are dropped, emission stops for good.
    pub fn cancel(&mut self) {
        self.scheduler.cancel();
    }

    /// Process one view-window request and release the first batch.
    pub fn process_request(
        &mut self,
        request: &ViewWindowRequest,
        estimate: &BandwidthEstimate,
    ) -> Result<Vec<DeliveryUnit>, ProtocolError> {
        request.validate()?;
        if self.scheduler.is_cancelled() {
            return Ok(Vec::new());
        }

        let decision = self.quality.decide(estimate);
        let viewport = self.viewport_for(request, &decision);
        self.tiles.update_viewport(viewport);

        let plan = self.plan_2d(&decision);
        self.scheduler.enqueue(plan);
        Ok(self.release(estimate))
    }

    /// Plan and release a batch for a volume region.
    pub fn process_volume_request(
        &mut self,
        region: &StreamingRegion,
        viewport: Option<&Viewport3D>,
        estimate: &BandwidthEstimate,
    ) -> Result<Vec<DeliveryUnit>, ProtocolError> {
        if !region.is_valid() {
            return Err(ProtocolError::InvalidParameter {
                field: "region",
                message: "empty streaming region".to_string(),
            });
        }
        if self.scheduler.is_cancelled() {
            return Ok(Vec::new());
        }

        let plan = self.plan_volume(region, viewport);
        self.scheduler.enqueue(plan);
        Ok(self.release(estimate))
    }

    fn release(&mut self, estimate: &BandwidthEstimate) -> Vec<DeliveryUnit> {
        let batch = self
            .scheduler
            .release_batch(estimate.predicted_bandwidth_bps);
        if !batch.is_empty() {
            self.qoe.mark_first_byte(self.started_at.elapsed());
            self.tiles_delivered += batch.len() as u64;
            if self.tiles_delivered >= INTERACTIVE_TILE_THRESHOLD {
                self.qoe.mark_interactive(self.started_at.elapsed());
            }
        }
        batch
    }

    fn viewport_for(&self, request: &ViewWindowRequest, decision: &QualityDecision) -> Viewport {
        let level = request
            .resolution_level
            .unwrap_or(decision.target_resolution_level);
        match (request.region_offset, request.region_size) {
            (Some((x, y)), Some((w, h))) => Viewport::new(x, y, w, h, level),
            _ => {
                let (w, h) = request.full_size.unwrap_or((
                    self.tiles.config().image_width,
                    self.tiles.config().image_height,
                ));
                Viewport::new(0, 0, w, h, level)
            }
        }
    }

    fn plan_2d(&self, decision: &QualityDecision) -> Vec<DeliveryUnit> {
        let r_target = decision.target_resolution_level;
        let l_target = decision.target_quality_layers;
        let per_pass = self.config.max_concurrent_deliveries;
        let mut plan = Vec::new();

        match self.mode {
            ProgressionMode::ResolutionFirst => {
                for level in 0..=r_target {
                    for state in self.tiles.top_tiles_at_level(level, per_pass) {
                        plan.push(DeliveryUnit::for_tile(
                            state.id,
                            self.config.minimum_initial_layers,
                        ));
                    }
                }
            }
            ProgressionMode::QualityFirst => {
                for layer in 1..=l_target {
                    for state in self.tiles.top_tiles_at_level(r_target, per_pass) {
                        if layer <= state.target_layers {
                            plan.push(DeliveryUnit::for_tile(state.id, layer));
                        }
                    }
                }
            }
            ProgressionMode::Hybrid => {
                let preview_level = r_target.saturating_sub(2);
                for state in self.tiles.top_tiles_at_level(preview_level, per_pass) {
                    plan.push(DeliveryUnit::for_tile(
                        state.id,
                        self.config.minimum_initial_layers,
                    ));
                }
                for state in self.tiles.top_tiles_at_level(r_target, usize::MAX) {
                    if state.priority >= TilePriority::Normal {
                        plan.push(DeliveryUnit::for_tile(state.id, state.target_layers));
                    }
                }
            }
            ProgressionMode::Adaptive => {
                for level in 0..=r_target {
                    for layer in 1..=l_target {
                        for state in self.tiles.top_tiles_at_level(level, per_pass) {
                            plan.push(DeliveryUnit::for_tile(state.id, layer));
                        }
                    }
                }
            }
            // Volume modes plan nothing from a 2D request.
            _ => {}
        }

        plan
    }

    fn plan_volume(
        &self,
        region: &StreamingRegion,
        viewport: Option<&Viewport3D>,
    ) -> Vec<DeliveryUnit> {
        let resolution = region.target_resolution;
        let layers = region.target_quality.max(1);

        match self.mode {
            ProgressionMode::SliceForward => (region.z.start..region.z.end)
                .map(|z| DeliveryUnit::for_slice(z, resolution, layers))
                .collect(),
            ProgressionMode::SliceReverse => (region.z.start..region.z.end)
                .rev()
                .map(|z| DeliveryUnit::for_slice(z, resolution, layers))
                .collect(),
            ProgressionMode::SliceBidirectional => {
                let mid = region.z.mid();
                let mut plan = vec![DeliveryUnit::for_slice(mid, resolution, layers)];
                let mut step = 1u32;
                loop {
                    let above = mid.checked_add(step).filter(|z| region.z.contains(*z));
                    let below = mid.checked_sub(step).filter(|z| region.z.contains(*z));
                    if above.is_none() && below.is_none() {
                        break;
                    }
                    if let Some(z) = above {
                        plan.push(DeliveryUnit::for_slice(z, resolution, layers));
                    }
                    if let Some(z) = below {
                        plan.push(DeliveryUnit::for_slice(z, resolution, layers));
                    }
                    step += 1;
                }
                plan
            }
            ProgressionMode::ViewDependent | ProgressionMode::DistanceOrdered => {
                self.plan_bricks(region, viewport, layers)
            }
            // 2D modes plan nothing from a volume request.
            _ => Vec::new(),
        }
    }

    fn plan_bricks(
        &self,
        region: &StreamingRegion,
        viewport: Option<&Viewport3D>,
        layers: u32,
    ) -> Vec<DeliveryUnit> {
        use crate::geometry::{AxisRange, Vec3};

        let brick = self.config.brick_size.max(1);
        let mut bricks: Vec<(u32, u32, u32, f64)> = Vec::new();

        let origin = viewport
            .and_then(|vp| vp.frustum)
            .map(|f| f.origin)
            .unwrap_or(Vec3::new(
                f64::from(region.x.mid()),
                f64::from(region.y.mid()),
                f64::from(region.z.mid()),
            ));

        let mut z = region.z.start;
        while z < region.z.end {
            let mut y = region.y.start;
            while y < region.y.end {
                let mut x = region.x.start;
                while x < region.x.end {
                    let bx = AxisRange::new(x, (x + brick).min(region.x.end));
                    let by = AxisRange::new(y, (y + brick).min(region.y.end));
                    let bz = AxisRange::new(z, (z + brick).min(region.z.end));

                    let visible = viewport.map_or(true, |vp| vp.intersects_box(bx, by, bz));
                    if visible {
                        let center = Vec3::new(
                            f64::from(bx.mid()),
                            f64::from(by.mid()),
                            f64::from(bz.mid()),
                        );
                        let distance = center.sub(&origin).length();
                        bricks.push((x / brick, y / brick, z / brick, distance));
                    }
                    x += brick;
                }
                y += brick;
            }
            z += brick;
        }

        if self.mode == ProgressionMode::DistanceOrdered {
            bricks.sort_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal));
        }

        bricks
            .into_iter()
            .map(|(bx, by, bz, _)| {
                let mut unit = DeliveryUnit::for_tile(
                    TileId::new(0, region.target_resolution, bx, by),
                    layers,
                );
                unit.slice_index = Some(bz);
                unit
            })
            .collect()
    }

    pub fn tiles_delivered(&self) -> u64 {
        self.tiles_delivered
    }

    pub fn tile_manager(&self) -> &TileManager {
        &self.tiles
    }
}
