use std::f64::consts::PI;

use serde::{Serialize, Deserialize};

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS: f64 = 6_371_000.0;

/// Meters per degree of latitude used by the raster grid.
pub const METERS_PER_DEG_LAT: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Linear interpolation in lat/lon space. Good enough for link distances under ~100 km.
    pub fn lerp(self, other: GeoPoint, t: f64) -> GeoPoint {
        GeoPoint {
            lat: self.lat + (other.lat - self.lat) * t,
            lon: self.lon + (other.lon - self.lon) * t,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Haversine distance in meters.
pub fn haversine_m(p1: GeoPoint, p2: GeoPoint) -> f64 {
    let lat1 = p1.lat.to_radians();
    let lat2 = p2.lat.to_radians();
    let dlat = (p2.lat - p1.lat).to_radians();
    let dlon = (p2.lon - p1.lon).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS * c
}

/// Meters per degree of longitude at the given latitude.
pub fn lon_scale_at(lat: f64) -> f64 {
    METERS_PER_DEG_LAT * lat.to_radians().cos()
}

/// Position of a point inside the Web Mercator slippy-tile pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePixel {
    pub tile_x: i64,
    pub tile_y: i64,
    pub px: usize,
    pub py: usize,
}

/// Project lat/lon (WGS84) onto the tile grid of the given zoom level.
/// Pixel offsets are clamped into the tile.
pub fn latlon_to_tile_pixel(point: GeoPoint, zoom: u8, tile_size: usize) -> TilePixel {
    let lat_rad = point.lat * PI / 180.0;
    let n = 2f64.powi(zoom as i32);
    let x = n * ((point.lon + 180.0) / 360.0);
    let y = n * (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0;

    let tile_x = x.floor() as i64;
    let tile_y = y.floor() as i64;
    let max_px = (tile_size - 1) as f64;
    let px = ((x - tile_x as f64) * tile_size as f64).floor().clamp(0.0, max_px) as usize;
    let py = ((y - tile_y as f64) * tile_size as f64).floor().clamp(0.0, max_px) as usize;

    TilePixel { tile_x, tile_y, px, py }
}

/// Ground resolution of one Web Mercator pixel (256 px tiles) at zoom 0, at the equator.
pub const MERCATOR_M_PER_PX_Z0: f64 = 156_543.033_92;

/// Zoom level whose pixel size best matches `grid_step_m` at `ref_lat`, clamped to [8, 12].
pub fn zoom_for_grid_step(ref_lat: f64, grid_step_m: f64) -> u8 {
    let ratio = MERCATOR_M_PER_PX_Z0 * ref_lat.to_radians().cos() / grid_step_m.max(1.0);
    let zoom = ratio.log2().round();
    if zoom.is_finite() { zoom.clamp(8.0, 12.0) as u8 } else { 8 }
}
