use image::RgbaImage;
use itertools::Itertools;

use crate::coverage::{CoverageRaster, Origin};
use crate::geo::{haversine_m, GeoPoint};

/// Enough origins reach the cell.
pub const CONFIRMED_RGB: [u8; 3] = [34, 197, 94];
/// Fewer origins than required reach the cell.
pub const WEAK_RGB: [u8; 3] = [239, 68, 68];

/// Margin (dB) at which fade-by-margin shading reaches full opacity.
pub const FULL_STRENGTH_MARGIN_DB: f64 = 20.0;

pub fn cell_alpha(best_margin_db: f64, fade_by_margin: bool) -> u8 {
    if !fade_by_margin {
        return 255;
    }
    let strength = (best_margin_db / FULL_STRENGTH_MARGIN_DB).clamp(0.0, 1.0);
    (255.0 * strength + 0.5).floor() as u8
}

/// RGBA of a cell reached by `count` origins. Transparent when uncovered.
pub fn shade_cell(count: usize, best_margin_db: f64, required_overlap: usize, fade_by_margin: bool) -> [u8; 4] {
    if count == 0 {
        return [0, 0, 0, 0];
    }
    let [r, g, b] = if count >= required_overlap { CONFIRMED_RGB } else { WEAK_RGB };
    [r, g, b, cell_alpha(best_margin_db, fade_by_margin)]
}

/// Overlay image of the raster, north up.
pub fn coverage_image(raster: &CoverageRaster) -> Option<RgbaImage> {
    RgbaImage::from_raw(raster.cols as u32, raster.rows as u32, raster.pixel_rgba.clone())
}

/// A point of interest (typically a tracked device) the raster may reach.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub label: String,
    pub position: GeoPoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reached {
    pub id: String,
    pub label: String,
    pub distance_m: f64,
}

/// Candidates inside covered cells, nearest origin first. Candidates that are
/// themselves origins are skipped.
pub fn likely_reached(raster: &CoverageRaster, origins: &[Origin], candidates: &[Candidate]) -> Vec<Reached> {
    if origins.is_empty() {
        return Vec::new();
    }
    candidates
        .iter()
        .filter(|c| !origins.iter().any(|o| o.id.as_deref() == Some(c.id.as_str())))
        .filter(|c| raster.covers(c.position.lat, c.position.lon))
        .map(|c| Reached {
            id: c.id.clone(),
            label: c.label.clone(),
            distance_m: origins
                .iter()
                .map(|o| haversine_m(o.position, c.position))
                .fold(f64::INFINITY, f64::min),
        })
        .sorted_by(|a, b| a.distance_m.total_cmp(&b.distance_m))
        .collect()
}

/// Status line such as `Likely to hit 2 nodes: alpha, beta`.
pub fn reach_status(reached: &[Reached]) -> String {
    let count = reached.len();
    let mut status = format!("Likely to hit {} node{}", count, if count == 1 { "" } else { "s" });
    if count > 0 {
        status.push_str(": ");
        status.push_str(&reached.iter().take(5).map(|r| r.label.as_str()).join(", "));
        if count > 5 {
            status.push_str(&format!(" +{} more", count - 5));
        }
    }
    status
}
