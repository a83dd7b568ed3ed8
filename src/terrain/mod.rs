use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::cache::{CacheMetrics, TileCache};
use crate::geo::{latlon_to_tile_pixel, GeoPoint};

pub const TILE_SIZE: usize = 256;
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 256;

/// Slippy-map tile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub zoom: u8,
    pub x: i64,
    pub y: i64,
}

impl TileKey {
    pub fn is_in_range(&self) -> bool {
        let n = 1i64 << self.zoom;
        self.x >= 0 && self.y >= 0 && self.x < n && self.y < n
    }
}

/// Terrarium encoding: `(r * 256 + g + b / 256) - 32768` meters.
pub fn decode_terrarium(r: u8, g: u8, b: u8) -> f64 {
    (r as f64 * 256.0 + g as f64 + b as f64 / 256.0) - 32768.0
}

#[derive(Debug, Clone)]
pub struct ElevationTile {
    pub key: TileKey,
    pub size: usize,
    pub data: Vec<f32>, // Row-major, meters
}

impl ElevationTile {
    pub fn from_terrarium_rgba(key: TileKey, size: usize, rgba: &[u8]) -> Result<Self> {
        if rgba.len() != size * size * 4 {
            anyhow::bail!("Terrarium tile {:?}: expected {} bytes, got {}", key, size * size * 4, rgba.len());
        }
        let data = rgba
            .chunks_exact(4)
            .map(|px| decode_terrarium(px[0], px[1], px[2]) as f32)
            .collect();
        Ok(Self { key, size, data })
    }

    pub fn from_fn(key: TileKey, size: usize, f: impl Fn(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(size * size);
        for py in 0..size {
            for px in 0..size {
                data.push(f(px, py));
            }
        }
        Self { key, size, data }
    }

    #[inline(always)]
    pub fn get_height(&self, px: usize, py: usize) -> f64 {
        self.data[py.min(self.size - 1) * self.size + px.min(self.size - 1)] as f64
    }
}

/// Where elevation tiles come from. `Ok(None)` means the tile does not exist.
pub trait TileSource: Send + Sync {
    fn fetch(&self, key: TileKey) -> Result<Option<ElevationTile>>;
}

/// Reads Terrarium PNG tiles laid out as `{root}/{z}/{x}/{y}.png`.
pub struct TerrariumDirSource {
    pub root: PathBuf,
}

impl TerrariumDirSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn tile_path(&self, key: TileKey) -> PathBuf {
        self.root
            .join(key.zoom.to_string())
            .join(key.x.to_string())
            .join(format!("{}.png", key.y))
    }
}

impl TileSource for TerrariumDirSource {
    fn fetch(&self, key: TileKey) -> Result<Option<ElevationTile>> {
        let path = self.tile_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let image = image::open(&path)
            .with_context(|| format!("Failed to decode {:?}", path))?
            .to_rgba8();
        if image.width() != image.height() {
            anyhow::bail!("Non-square tile {:?}: {}x{}", path, image.width(), image.height());
        }
        let tile = ElevationTile::from_terrarium_rgba(key, image.width() as usize, image.as_raw())?;
        Ok(Some(tile))
    }
}

/// Synchronous ground-elevation lookup used by the raster engine.
pub trait TerrainProvider: Send + Sync {
    /// Ground elevation in meters, `None` where no data exists.
    fn elevation_at(&self, point: GeoPoint, zoom: u8) -> Option<f64>;
}

/// Tile-backed elevation lookups with a bounded per-session tile cache.
pub struct TerrainSampler {
    source: Box<dyn TileSource>,
    cache: TileCache,
}

impl TerrainSampler {
    pub fn new(source: impl TileSource + 'static, cache_capacity: usize) -> Self {
        Self {
            source: Box::new(source),
            cache: TileCache::new(cache_capacity),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        self.cache.metrics()
    }

    pub fn cached_tiles(&self) -> usize {
        self.cache.len()
    }

    pub fn get_tile(&self, key: TileKey) -> Option<Arc<ElevationTile>> {
        if !key.is_in_range() {
            return None;
        }
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let tile = match self.source.fetch(key) {
            Ok(tile) => tile.map(Arc::new),
            Err(e) => {
                // Remembered as missing for the rest of the session.
                warn!("Elevation tile {}/{}/{} failed: {:#}", key.zoom, key.x, key.y, e);
                None
            }
        };
        if tile.is_none() {
            debug!("No elevation tile {}/{}/{}", key.zoom, key.x, key.y);
        }
        self.cache.insert(key, tile.clone());
        tile
    }
}

impl TerrainProvider for TerrainSampler {
    fn elevation_at(&self, point: GeoPoint, zoom: u8) -> Option<f64> {
        let pos = latlon_to_tile_pixel(point, zoom, TILE_SIZE);
        let key = TileKey { zoom, x: pos.tile_x, y: pos.tile_y };
        let tile = self.get_tile(key)?;
        // Sources may deliver tiles at another pixel size.
        let scale = tile.size as f64 / TILE_SIZE as f64;
        let px = (pos.px as f64 * scale) as usize;
        let py = (pos.py as f64 * scale) as usize;
        Some(tile.get_height(px, py))
    }
}

impl<T: TerrainProvider + ?Sized> TerrainProvider for Arc<T> {
    fn elevation_at(&self, point: GeoPoint, zoom: u8) -> Option<f64> {
        (**self).elevation_at(point, zoom)
    }
}
