//! Parallel CPU strategy. The only strategy that models terrain.

use bevy::tasks::{ComputeTaskPool, TaskPool};
use futures_lite::future;

use crate::cancel::Ticket;
use crate::coverage::{CoverageRaster, PreparedOrigin, ProgressSlot, RasterBuffers, RenderJob, Strategy};
use crate::error::AnalysisResult;
use crate::geo::{GeoPoint, METERS_PER_DEG_LAT};
use crate::physics::diffraction::{clearance_penalty_db, diffraction_parameter, fresnel_radius_m, knife_edge_loss_db};
use crate::physics::link_budget::log_distance_loss_db;
use crate::physics::refraction::earth_bulge_m;
use crate::render::shade_cell;
use crate::terrain::TerrainProvider;

/// Rows between progress reports and cancellation checks.
pub const ROWS_PER_YIELD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellCoverage {
    pub count: u32,
    pub best_margin_db: f64,
}

/// Planar distance from an origin to a point, using the origin's longitude scale.
pub fn origin_distance_m(origin: &PreparedOrigin, point: GeoPoint) -> f64 {
    let dx = (point.lon - origin.position.lon) * origin.lon_scale;
    let dy = (point.lat - origin.position.lat) * METERS_PER_DEG_LAT;
    (dx * dx + dy * dy).sqrt()
}

/// Knife-edge plus Fresnel-clearance loss along the origin→cell path.
pub fn terrain_loss_db(
    job: &RenderJob,
    terrain: &dyn TerrainProvider,
    origin: &PreparedOrigin,
    cell: GeoPoint,
    distance_m: f64,
    rx_abs_m: f64,
) -> f64 {
    let samples = ((distance_m / job.sample_step_m).ceil() as usize + 1).max(2);
    let mut max_v = 0.0f64;
    let mut min_clearance_ratio = f64::INFINITY;

    for i in 1..samples - 1 {
        let t = i as f64 / (samples - 1) as f64;
        let Some(elevation) = terrain.elevation_at(origin.position.lerp(cell, t), job.zoom) else {
            continue;
        };
        let line = origin.tx_abs_m + (rx_abs_m - origin.tx_abs_m) * t;
        let d1 = distance_m * t;
        let d2 = distance_m * (1.0 - t);
        let f1 = fresnel_radius_m(job.wavelength_m, d1, d2);
        let effective = elevation + earth_bulge_m(d1, d2, job.effective_earth_radius_m);

        if f1 > 0.0 {
            min_clearance_ratio = min_clearance_ratio.min((line - effective) / f1);
        }
        let fresnel = if job.fresnel_factor > 0.0 { job.fresnel_factor * f1 } else { 0.0 };
        let obstruction = (effective - line) - fresnel;
        if obstruction <= 0.0 {
            continue;
        }
        max_v = max_v.max(diffraction_parameter(obstruction, job.wavelength_m, d1, d2));
    }

    knife_edge_loss_db(max_v) + clearance_penalty_db(min_clearance_ratio, job.clearance_ratio, job.clearance_loss_db)
}

/// Link margin of one origin at a cell; `None` outside `(1 m, render range]`.
pub fn origin_margin_db(
    job: &RenderJob,
    terrain: Option<&dyn TerrainProvider>,
    origin: &PreparedOrigin,
    cell: GeoPoint,
    end_ground_m: Option<f64>,
) -> Option<f64> {
    let distance_m = origin_distance_m(origin, cell);
    if distance_m <= 1.0 || distance_m > job.render_range_m {
        return None;
    }

    let mut path_loss = log_distance_loss_db(job.fspl_1m_db, job.path_loss_exponent, distance_m, job.clutter_loss_db);
    if let (true, Some(terrain), Some(ground)) = (job.terrain, terrain, end_ground_m) {
        let rx_abs_m = job.rx_msl_m.unwrap_or(ground + job.rx_agl_m);
        path_loss += terrain_loss_db(job, terrain, origin, cell, distance_m, rx_abs_m);
    }
    Some(job.max_path_loss_db - path_loss)
}

/// Coverage at one cell. `None` when terrain mode has no ground data there.
pub fn evaluate_cell(job: &RenderJob, terrain: Option<&dyn TerrainProvider>, row: usize, col: usize) -> Option<CellCoverage> {
    let cell = job.grid.cell_center(row, col);
    let end_ground_m = match (job.terrain, terrain) {
        (true, Some(t)) => Some(t.elevation_at(cell, job.zoom)?),
        _ => None,
    };

    let mut coverage = CellCoverage { count: 0, best_margin_db: f64::NEG_INFINITY };
    for origin in &job.origins {
        match origin_margin_db(job, terrain, origin, cell, end_ground_m) {
            Some(margin) if margin > 0.0 => {
                coverage.count += 1;
                coverage.best_margin_db = coverage.best_margin_db.max(margin);
            }
            _ => {}
        }
    }
    Some(coverage)
}

struct RowOutput {
    pixels: Vec<u8>,
    counts: Vec<u8>,
}

fn evaluate_row(job: &RenderJob, terrain: Option<&dyn TerrainProvider>, row: usize) -> RowOutput {
    let cols = job.grid.cols;
    let mut out = RowOutput { pixels: vec![0; cols * 4], counts: vec![0; cols] };
    for col in 0..cols {
        let Some(cell) = evaluate_cell(job, terrain, row, col) else {
            continue;
        };
        if cell.count > 0 {
            let rgba = shade_cell(cell.count as usize, cell.best_margin_db, job.required_overlap, job.fade_by_margin);
            out.pixels[col * 4..col * 4 + 4].copy_from_slice(&rgba);
            out.counts[col] = cell.count.min(255) as u8;
        }
    }
    out
}

/// Fills the grid in bands of [`ROWS_PER_YIELD`] rows, each band evaluated in
/// parallel, reporting progress and checking the ticket between bands.
pub async fn render(
    job: &RenderJob,
    terrain: Option<&dyn TerrainProvider>,
    ticket: &Ticket,
    progress: &ProgressSlot,
) -> AnalysisResult<CoverageRaster> {
    let rows = job.grid.rows;
    let cols = job.grid.cols;
    let mut buffers = RasterBuffers {
        pixel_rgba: vec![0; rows * cols * 4],
        coverage_count: vec![0; rows * cols],
    };
    let pool = ComputeTaskPool::get_or_init(TaskPool::default);

    for band_start in (0..rows).step_by(ROWS_PER_YIELD) {
        ticket.ensure_current()?;
        progress.publish(ticket, band_start, rows);

        let band_end = (band_start + ROWS_PER_YIELD).min(rows);
        let outputs = pool.scope(|s| {
            for row in band_start..band_end {
                s.spawn(async move { evaluate_row(job, terrain, row) });
            }
        });

        for (row, out) in (band_start..band_end).zip(outputs) {
            buffers.pixel_rgba[row * cols * 4..(row + 1) * cols * 4].copy_from_slice(&out.pixels);
            buffers.coverage_count[row * cols..(row + 1) * cols].copy_from_slice(&out.counts);
        }
        future::yield_now().await;
    }

    ticket.ensure_current()?;
    progress.publish(ticket, rows, rows);
    Ok(job.finish(buffers, ticket.token(), Strategy::Cpu))
}
