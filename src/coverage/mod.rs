pub mod cpu;
pub mod gpu;
pub mod origins;
pub mod planner;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bevy::tasks::{AsyncComputeTaskPool, Task, TaskPool};
use futures_lite::future;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cancel::{Ticket, TokenCounter};
use crate::error::{AnalysisError, AnalysisResult};
use crate::geo::{lon_scale_at, zoom_for_grid_step, GeoPoint, METERS_PER_DEG_LAT};
use crate::physics::link_budget::LinkBudgetConfig;
use crate::terrain::TerrainProvider;

pub use origins::{Origin, OriginSet};
pub use planner::{estimate_cost, CostEstimate, Resolution, ResolutionPlanner};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterConfig {
    pub grid_step_m: f64,
    pub sample_step_m: f64,
    pub max_cells: u64,
    pub auto_resolution: bool,
    pub terrain: bool,
    pub tx_agl_m: f64,
    pub rx_agl_m: f64,
    pub tx_msl_m: Option<f64>,
    pub rx_msl_m: Option<f64>,
    /// Scale cell alpha with the best link margin.
    pub fade_by_margin: bool,
    pub prefer_gpu: bool,
    /// Fraction of the base range to render; ignored in cutoff mode.
    pub range_factor: f64,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            grid_step_m: 90.0,
            sample_step_m: 90.0,
            max_cells: 120_000,
            auto_resolution: true,
            terrain: true,
            tx_agl_m: 2.0,
            rx_agl_m: 1.0,
            tx_msl_m: None,
            rx_msl_m: None,
            fade_by_margin: false,
            prefer_gpu: false,
            range_factor: 1.0,
        }
    }
}

impl RasterConfig {
    /// Applies the accepted input ranges; non-finite values fall back to defaults.
    pub fn sanitized(&self) -> Self {
        let d = Self::default();
        let or = |v: f64, fallback: f64| if v.is_finite() { v } else { fallback };
        Self {
            grid_step_m: or(self.grid_step_m, d.grid_step_m).max(planner::MIN_STEP_M),
            sample_step_m: or(self.sample_step_m, d.sample_step_m).max(planner::MIN_STEP_M),
            max_cells: self.max_cells.clamp(20_000, 500_000),
            tx_agl_m: or(self.tx_agl_m, 0.0).max(0.0),
            rx_agl_m: or(self.rx_agl_m, 0.0).max(0.0),
            tx_msl_m: self.tx_msl_m.filter(|v| v.is_finite()),
            rx_msl_m: self.rx_msl_m.filter(|v| v.is_finite()),
            range_factor: or(self.range_factor, 1.0).clamp(0.25, 1.0),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

/// Grid geometry shared by both execution strategies.
///
/// Bounds are the union of every origin's range box, which over-allocates when
/// origins are far apart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RasterGrid {
    pub bounds: Bounds,
    pub lat_step: f64,
    pub lon_step: f64,
    pub rows: usize,
    pub cols: usize,
    pub ref_lat: f64,
}

/// Hard ceiling on grid size, reached only when the link range outgrows what the
/// resolution planner can coarsen away.
pub const MAX_RASTER_CELLS: usize = 8_000_000;

impl RasterGrid {
    pub fn plan(origins: &[GeoPoint], render_range_m: f64, grid_step_m: f64) -> AnalysisResult<Self> {
        if origins.is_empty() {
            return Err(AnalysisError::NoOrigins);
        }
        let ref_lat = origins.iter().map(|o| o.lat).sum::<f64>() / origins.len() as f64;
        let lat_step = grid_step_m / METERS_PER_DEG_LAT;
        let lon_step = grid_step_m / lon_scale_at(ref_lat);

        let lat_radius = render_range_m / METERS_PER_DEG_LAT;
        let mut bounds = Bounds {
            lat_min: f64::INFINITY,
            lat_max: f64::NEG_INFINITY,
            lon_min: f64::INFINITY,
            lon_max: f64::NEG_INFINITY,
        };
        for origin in origins {
            let lon_radius = render_range_m / lon_scale_at(origin.lat);
            bounds.lat_min = bounds.lat_min.min(origin.lat - lat_radius);
            bounds.lat_max = bounds.lat_max.max(origin.lat + lat_radius);
            bounds.lon_min = bounds.lon_min.min(origin.lon - lon_radius);
            bounds.lon_max = bounds.lon_max.max(origin.lon + lon_radius);
        }

        let rows = ((bounds.lat_max - bounds.lat_min) / lat_step).ceil().max(1.0) as usize;
        let cols = ((bounds.lon_max - bounds.lon_min) / lon_step).ceil().max(1.0) as usize;
        let cells = rows.checked_mul(cols).unwrap_or(usize::MAX);
        if cells > MAX_RASTER_CELLS {
            warn!("Refusing a {rows}x{cols} raster for a {:.0} km range", render_range_m / 1000.0);
            return Err(AnalysisError::RasterTooLarge(cells));
        }
        Ok(Self { bounds, lat_step, lon_step, rows, cols, ref_lat })
    }

    pub fn cell_center(&self, row: usize, col: usize) -> GeoPoint {
        GeoPoint {
            lat: self.bounds.lat_max - row as f64 * self.lat_step,
            lon: self.bounds.lon_min + col as f64 * self.lon_step,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// Everything sized up front for one render request.
#[derive(Debug, Clone, Serialize)]
pub struct RenderPlan {
    pub max_path_loss_db: f64,
    pub base_range_m: f64,
    pub render_range_m: f64,
    pub resolution: Resolution,
    pub grid: RasterGrid,
    pub zoom: u8,
}

impl RenderPlan {
    pub fn new(origins: &[Origin], link: &LinkBudgetConfig, config: &RasterConfig) -> AnalysisResult<Self> {
        if origins.is_empty() {
            return Err(AnalysisError::NoOrigins);
        }
        let config = config.sanitized();
        let link = link.sanitized();
        let max_path_loss_db = link.max_path_loss_db();
        let base_range_m = link.base_range_m();
        let render_range_m = if link.cutoff_mode { base_range_m } else { base_range_m * config.range_factor };

        let positions: Vec<GeoPoint> = origins.iter().map(|o| o.position).collect();
        let ref_lat = positions.iter().map(|p| p.lat).sum::<f64>() / positions.len() as f64;
        let resolution = ResolutionPlanner::from_config(&config).plan(render_range_m, origins.len(), ref_lat);
        let grid = RasterGrid::plan(&positions, render_range_m, resolution.grid_step_m)?;
        let zoom = zoom_for_grid_step(grid.ref_lat, resolution.grid_step_m);

        Ok(Self { max_path_loss_db, base_range_m, render_range_m, resolution, grid, zoom })
    }

    pub fn summary(&self) -> String {
        format!(
            "Range: {:.1} km (base {:.1} km) • {} cells • {} samples (grid {:.0} m • sample {:.0} m{})",
            self.render_range_m / 1000.0,
            self.base_range_m / 1000.0,
            self.resolution.cells,
            self.resolution.samples,
            self.resolution.grid_step_m,
            self.resolution.sample_step_m,
            if self.resolution.adjusted { ", auto" } else { "" },
        )
    }
}

/// Origins needed per cell for confirmed coverage.
pub fn required_overlap(origin_count: usize) -> usize {
    match origin_count {
        0 | 1 => 1,
        2 => 2,
        n => n,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedOrigin {
    pub position: GeoPoint,
    pub lon_scale: f64,
    pub tx_abs_m: f64,
}

/// Fully resolved, strategy-independent inputs of one computation.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub grid: RasterGrid,
    pub origins: Vec<PreparedOrigin>,
    pub render_range_m: f64,
    pub max_path_loss_db: f64,
    pub fspl_1m_db: f64,
    pub path_loss_exponent: f64,
    pub clutter_loss_db: f64,
    pub wavelength_m: f64,
    pub fresnel_factor: f64,
    pub clearance_ratio: f64,
    pub clearance_loss_db: f64,
    pub effective_earth_radius_m: f64,
    pub terrain: bool,
    pub sample_step_m: f64,
    pub zoom: u8,
    pub rx_agl_m: f64,
    pub rx_msl_m: Option<f64>,
    pub fade_by_margin: bool,
    pub required_overlap: usize,
}

impl RenderJob {
    pub fn prepare(
        origins: &[Origin],
        link: &LinkBudgetConfig,
        config: &RasterConfig,
        plan: &RenderPlan,
        terrain: Option<&dyn TerrainProvider>,
    ) -> Self {
        let config = config.sanitized();
        let use_terrain = config.terrain && terrain.is_some();
        if config.terrain && terrain.is_none() {
            warn!("Terrain mode requested without a terrain source; rendering flat");
        }

        let origins = origins
            .iter()
            .map(|o| {
                let tx_abs_m = match (o.absolute_tx_height_m, config.tx_msl_m) {
                    (Some(msl), _) | (None, Some(msl)) => msl,
                    (None, None) => {
                        let ground = match terrain {
                            Some(t) if use_terrain => t.elevation_at(o.position, plan.zoom).unwrap_or(0.0),
                            _ => 0.0,
                        };
                        ground + config.tx_agl_m
                    }
                };
                PreparedOrigin { position: o.position, lon_scale: lon_scale_at(o.position.lat), tx_abs_m }
            })
            .collect::<Vec<_>>();

        Self {
            grid: plan.grid,
            required_overlap: required_overlap(origins.len()),
            origins,
            render_range_m: plan.render_range_m,
            max_path_loss_db: plan.max_path_loss_db,
            fspl_1m_db: link.fspl_1m_db(),
            path_loss_exponent: link.path_loss_exponent,
            clutter_loss_db: if link.clutter_loss_db.is_finite() { link.clutter_loss_db } else { 0.0 },
            wavelength_m: link.wavelength_m(),
            fresnel_factor: link.fresnel_factor,
            clearance_ratio: link.clearance_ratio,
            clearance_loss_db: link.clearance_loss_db,
            effective_earth_radius_m: link.effective_earth_radius_m,
            terrain: use_terrain,
            sample_step_m: plan.resolution.sample_step_m,
            zoom: plan.zoom,
            rx_agl_m: config.rx_agl_m,
            rx_msl_m: config.rx_msl_m,
            fade_by_margin: config.fade_by_margin,
        }
    }

    pub fn finish(&self, buffers: RasterBuffers, token: u64, strategy: Strategy) -> CoverageRaster {
        CoverageRaster {
            bounds: self.grid.bounds,
            lat_step: self.grid.lat_step,
            lon_step: self.grid.lon_step,
            rows: self.grid.rows,
            cols: self.grid.cols,
            pixel_rgba: buffers.pixel_rgba,
            coverage_count: buffers.coverage_count,
            token,
            strategy,
        }
    }
}

pub struct RasterBuffers {
    pub pixel_rgba: Vec<u8>,
    pub coverage_count: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    Cpu,
    Gpu,
}

/// One completed computation. Replaced wholesale by the next one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageRaster {
    pub bounds: Bounds,
    pub lat_step: f64,
    pub lon_step: f64,
    pub rows: usize,
    pub cols: usize,
    /// Row-major RGBA, row 0 at `lat_max`.
    pub pixel_rgba: Vec<u8>,
    /// Covering origins per cell, saturating at 255.
    pub coverage_count: Vec<u8>,
    pub token: u64,
    pub strategy: Strategy,
}

impl CoverageRaster {
    pub fn cell_index(&self, lat: f64, lon: f64) -> Option<usize> {
        let b = &self.bounds;
        if lat < b.lat_min || lat > b.lat_max || lon < b.lon_min || lon > b.lon_max {
            return None;
        }
        let row = ((b.lat_max - lat) / self.lat_step).floor();
        let col = ((lon - b.lon_min) / self.lon_step).floor();
        if row < 0.0 || col < 0.0 || row as usize >= self.rows || col as usize >= self.cols {
            return None;
        }
        Some(row as usize * self.cols + col as usize)
    }

    pub fn count_at(&self, lat: f64, lon: f64) -> u8 {
        self.cell_index(lat, lon).map_or(0, |i| self.coverage_count[i])
    }

    pub fn covers(&self, lat: f64, lon: f64) -> bool {
        self.count_at(lat, lon) > 0
    }

    pub fn covered_cells(&self) -> usize {
        self.coverage_count.iter().filter(|&&c| c > 0).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderProgress {
    pub token: u64,
    pub row: usize,
    pub rows: usize,
}

impl RenderProgress {
    pub fn percent(&self) -> u32 {
        ((self.row as f64 / self.rows.max(1) as f64) * 100.0).round() as u32
    }
}

impl fmt::Display for RenderProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rendering: {}%", self.percent())
    }
}

/// Latest progress report. Writes from superseded renders are dropped.
#[derive(Debug, Default)]
pub struct ProgressSlot {
    slot: Mutex<Option<RenderProgress>>,
}

impl ProgressSlot {
    pub fn publish(&self, ticket: &Ticket, row: usize, rows: usize) -> bool {
        if !ticket.is_current() {
            return false;
        }
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(RenderProgress { token: ticket.token(), row, rows });
        true
    }

    pub fn read(&self, current_token: u64) -> Option<RenderProgress> {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.filter(|p| p.token == current_token)
    }

    fn clear(&self) {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// An in-flight render.
pub struct RenderHandle {
    pub token: u64,
    pub plan: RenderPlan,
    pub task: Task<AnalysisResult<CoverageRaster>>,
}

impl RenderHandle {
    pub fn block(self) -> AnalysisResult<CoverageRaster> {
        future::block_on(self.task)
    }
}

/// Multi-origin coverage raster computation with token-based cancellation.
pub struct CoverageEngine {
    terrain: Option<Arc<dyn TerrainProvider>>,
    tokens: TokenCounter,
    progress: Arc<ProgressSlot>,
    latest: Mutex<Option<Arc<CoverageRaster>>>,
    gpu: Arc<gpu::GpuSlot>,
}

impl CoverageEngine {
    pub fn new(terrain: Option<Arc<dyn TerrainProvider>>) -> Self {
        Self {
            terrain,
            tokens: TokenCounter::new(),
            progress: Arc::new(ProgressSlot::default()),
            latest: Mutex::new(None),
            gpu: Arc::new(gpu::GpuSlot::default()),
        }
    }

    pub fn flat() -> Self {
        Self::new(None)
    }

    pub fn current_token(&self) -> u64 {
        self.tokens.current()
    }

    pub fn progress(&self) -> Option<RenderProgress> {
        self.progress.read(self.tokens.current())
    }

    pub fn latest(&self) -> Option<Arc<CoverageRaster>> {
        self.latest.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Starts a render, superseding every earlier one.
    pub fn render(&self, origins: &[Origin], link: &LinkBudgetConfig, config: &RasterConfig) -> AnalysisResult<RenderHandle> {
        let ticket = self.tokens.issue();
        self.progress.clear();
        let plan = RenderPlan::new(origins, link, config)?;
        debug!("Render {}: {}", ticket.token(), plan.summary());

        let terrain = self.terrain.clone();
        let gpu = self.gpu.clone();
        let progress = self.progress.clone();
        let origins = origins.to_vec();
        let link = link.sanitized();
        let config = config.sanitized();
        let task_plan = plan.clone();
        let token = ticket.token();

        let pool = AsyncComputeTaskPool::get_or_init(TaskPool::default);
        let task = pool.spawn(async move {
            let started = Instant::now();
            let job = RenderJob::prepare(&origins, &link, &config, &task_plan, terrain.as_deref());
            let result = run_strategies(&job, config.prefer_gpu, terrain.as_deref(), &gpu, &ticket, &progress).await;
            match &result {
                Ok(raster) => info!(
                    "Render {} ({:?}) {}x{} in {:.2?}, {} covered cells",
                    raster.token,
                    raster.strategy,
                    raster.cols,
                    raster.rows,
                    started.elapsed(),
                    raster.covered_cells()
                ),
                Err(AnalysisError::Cancelled) => debug!("Render {} superseded", ticket.token()),
                Err(e) => warn!("Render {} failed: {e}", ticket.token()),
            }
            result
        });

        Ok(RenderHandle { token, plan, task })
    }

    /// Installs `raster` as the latest result if no newer render has started.
    pub fn commit(&self, raster: CoverageRaster) -> AnalysisResult<Arc<CoverageRaster>> {
        if !self.tokens.is_current(raster.token) {
            debug!("Dropping stale raster {} (current {})", raster.token, self.tokens.current());
            return Err(AnalysisError::Cancelled);
        }
        let raster = Arc::new(raster);
        *self.latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(raster.clone());
        Ok(raster)
    }

    /// Renders and commits, blocking the calling thread.
    pub fn render_blocking(
        &self,
        origins: &[Origin],
        link: &LinkBudgetConfig,
        config: &RasterConfig,
    ) -> AnalysisResult<Arc<CoverageRaster>> {
        let raster = self.render(origins, link, config)?.block()?;
        self.commit(raster)
    }
}

async fn run_strategies(
    job: &RenderJob,
    prefer_gpu: bool,
    terrain: Option<&dyn TerrainProvider>,
    gpu: &gpu::GpuSlot,
    ticket: &Ticket,
    progress: &ProgressSlot,
) -> AnalysisResult<CoverageRaster> {
    ticket.ensure_current()?;
    if prefer_gpu && !job.terrain {
        match gpu.render(job, ticket) {
            Ok(raster) => return Ok(raster),
            Err(AnalysisError::Cancelled) => return Err(AnalysisError::Cancelled),
            Err(e) => warn!("{e}; falling back to CPU"),
        }
    } else if prefer_gpu {
        info!("GPU strategy supports terrain-off only; using CPU");
    }
    cpu::render(job, terrain, ticket, progress).await
}
