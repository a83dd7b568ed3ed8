use serde::Serialize;

use crate::coverage::RasterConfig;
use crate::geo::{lon_scale_at, METERS_PER_DEG_LAT};

pub const MIN_STEP_M: f64 = 30.0;
pub const MAX_STEP_M: f64 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostEstimate {
    pub cells: u64,
    pub samples: u64,
}

/// Estimated grid and terrain-sample cost of covering a `render_range_m` radius.
pub fn estimate_cost(
    render_range_m: f64,
    grid_step_m: f64,
    sample_step_m: f64,
    origin_count: usize,
    ref_lat: f64,
) -> CostEstimate {
    let lon_ratio = lon_scale_at(ref_lat) / METERS_PER_DEG_LAT;
    let rows = ((render_range_m * 2.0) / grid_step_m).ceil().max(1.0);
    let cols = ((render_range_m * 2.0) / (grid_step_m * lon_ratio)).ceil().max(1.0);
    let cells = rows * cols;
    let avg_samples = ((render_range_m / sample_step_m).ceil() + 1.0).max(2.0);
    let multiplier = origin_count.max(1) as f64;
    CostEstimate {
        cells: cells as u64,
        samples: (cells * avg_samples * multiplier).round() as u64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Resolution {
    pub grid_step_m: f64,
    pub sample_step_m: f64,
    pub cells: u64,
    pub samples: u64,
    /// Steps were coarsened to fit the budget.
    pub adjusted: bool,
}

fn rescale_step(step: f64, scale: f64) -> f64 {
    ((step * scale / 5.0).round() * 5.0).clamp(MIN_STEP_M, MAX_STEP_M)
}

/// Sizes grid and sample spacing against a total cell budget.
///
/// The rescale is a single correction pass; the resulting cell count can still
/// land somewhat above the budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionPlanner {
    pub grid_step_m: f64,
    pub sample_step_m: f64,
    pub max_cells: u64,
    pub auto_resolution: bool,
}

impl ResolutionPlanner {
    pub fn from_config(config: &RasterConfig) -> Self {
        Self {
            grid_step_m: config.grid_step_m,
            sample_step_m: config.sample_step_m,
            max_cells: config.max_cells,
            auto_resolution: config.auto_resolution,
        }
    }

    pub fn plan(&self, render_range_m: f64, origin_count: usize, ref_lat: f64) -> Resolution {
        let origins = origin_count.max(1);
        let mut grid_step_m = self.grid_step_m;
        let mut sample_step_m = self.sample_step_m;
        let mut estimate = estimate_cost(render_range_m, grid_step_m, sample_step_m, origins, ref_lat);
        let per_origin_budget = self.max_cells as f64 / origins as f64;
        let mut adjusted = false;

        if self.auto_resolution && estimate.cells as f64 > per_origin_budget {
            let scale = (estimate.cells as f64 / per_origin_budget).sqrt();
            grid_step_m = rescale_step(grid_step_m, scale);
            sample_step_m = rescale_step(sample_step_m, scale);
            estimate = estimate_cost(render_range_m, grid_step_m, sample_step_m, origins, ref_lat);
            adjusted = true;
        }

        Resolution {
            grid_step_m,
            sample_step_m,
            cells: estimate.cells,
            samples: estimate.samples,
            adjusted,
        }
    }
}
