use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::PointCache;
use crate::error::{AnalysisError, AnalysisResult};
use crate::geo::GeoPoint;
use crate::terrain::TerrainProvider;

pub const DEFAULT_POINT_CACHE_TTL: Duration = Duration::from_secs(21_600);
pub const DEFAULT_POINT_CACHE_CAPACITY: usize = 50_000;

/// Batch elevation lookup. Must answer in request order with one value per point,
/// or fail the whole batch.
pub trait ElevationService: Send + Sync {
    fn elevations(&self, points: &[GeoPoint]) -> impl Future<Output = AnalysisResult<Vec<f64>>> + Send;
}

impl<S: ElevationService + ?Sized> ElevationService for Arc<S> {
    fn elevations(&self, points: &[GeoPoint]) -> impl Future<Output = AnalysisResult<Vec<f64>>> + Send {
        (**self).elevations(points)
    }
}

/// Answers elevation batches from local terrain tiles at a fixed zoom.
pub struct TerrainElevationService<T> {
    terrain: T,
    zoom: u8,
}

impl<T: TerrainProvider> TerrainElevationService<T> {
    pub fn new(terrain: T, zoom: u8) -> Self {
        Self { terrain, zoom }
    }
}

impl<T: TerrainProvider> ElevationService for TerrainElevationService<T> {
    async fn elevations(&self, points: &[GeoPoint]) -> AnalysisResult<Vec<f64>> {
        points
            .iter()
            .map(|&p| {
                self.terrain
                    .elevation_at(p, self.zoom)
                    .ok_or_else(|| AnalysisError::elevation(format!("no terrain at {:.5},{:.5}", p.lat, p.lon)))
            })
            .collect()
    }
}

/// Caches point elevations from an inner service; only misses are forwarded,
/// in their original order.
pub struct CachedElevationService<S> {
    inner: S,
    cache: PointCache,
}

impl<S: ElevationService> CachedElevationService<S> {
    pub fn new(inner: S, capacity: usize, ttl: Duration) -> Self {
        Self { inner, cache: PointCache::new(capacity, ttl) }
    }

    pub fn with_defaults(inner: S) -> Self {
        Self::new(inner, DEFAULT_POINT_CACHE_CAPACITY, DEFAULT_POINT_CACHE_TTL)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache(&self) -> &PointCache {
        &self.cache
    }
}

impl<S: ElevationService> ElevationService for CachedElevationService<S> {
    async fn elevations(&self, points: &[GeoPoint]) -> AnalysisResult<Vec<f64>> {
        let mut results: Vec<Option<f64>> = points.iter().map(|&p| self.cache.get(p)).collect();
        let missing: Vec<usize> = (0..points.len()).filter(|&i| results[i].is_none()).collect();

        if !missing.is_empty() {
            let query: Vec<GeoPoint> = missing.iter().map(|&i| points[i]).collect();
            let fetched = self.inner.elevations(&query).await?;
            if fetched.len() != query.len() {
                return Err(AnalysisError::elevation("unexpected result length"));
            }
            for (&i, elevation) in missing.iter().zip(fetched) {
                if !elevation.is_finite() {
                    return Err(AnalysisError::elevation("missing elevation"));
                }
                self.cache.insert(points[i], elevation);
                results[i] = Some(elevation);
            }
        }

        results
            .into_iter()
            .map(|e| e.ok_or_else(|| AnalysisError::elevation("incomplete results")))
            .collect()
    }
}
