use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::geo::GeoPoint;
use crate::terrain::{ElevationTile, TileKey};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheMetrics {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bounded LRU of decoded tiles. A `None` entry records a tile known to be missing.
pub struct TileCache {
    cache: Mutex<LruCache<TileKey, Option<Arc<ElevationTile>>>>,
    metrics: CacheMetrics,
}

impl TileCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity(cap))),
            metrics: CacheMetrics::default(),
        }
    }

    /// Outer `None`: not cached. Inner `None`: cached as missing.
    pub fn get(&self, key: &TileKey) -> Option<Option<Arc<ElevationTile>>> {
        let found = lock(&self.cache).get(key).cloned();
        self.metrics.record(found.is_some());
        found
    }

    pub fn insert(&self, key: TileKey, tile: Option<Arc<ElevationTile>>) {
        lock(&self.cache).put(key, tile);
    }

    pub fn len(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.cache).clear();
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

/// Point key at 5-decimal (~1 m) precision.
#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
pub struct PointKey {
    lat_e5: i64,
    lon_e5: i64,
}

impl From<GeoPoint> for PointKey {
    fn from(p: GeoPoint) -> Self {
        Self {
            lat_e5: (p.lat * 1e5).round() as i64,
            lon_e5: (p.lon * 1e5).round() as i64,
        }
    }
}

/// Per-point elevation cache with expiry, bounded by LRU capacity.
pub struct PointCache {
    cache: Mutex<LruCache<PointKey, (f64, Instant)>>,
    ttl: Duration,
    metrics: CacheMetrics,
}

impl PointCache {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity(cap))),
            ttl,
            metrics: CacheMetrics::default(),
        }
    }

    pub fn get(&self, point: GeoPoint) -> Option<f64> {
        self.get_at(point, Instant::now())
    }

    pub fn get_at(&self, point: GeoPoint, now: Instant) -> Option<f64> {
        let key = PointKey::from(point);
        let mut cache = lock(&self.cache);
        let found = match cache.get(&key) {
            Some(&(elevation, stored)) if now.saturating_duration_since(stored) <= self.ttl => Some(elevation),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        };
        self.metrics.record(found.is_some());
        found
    }

    pub fn insert(&self, point: GeoPoint, elevation: f64) {
        self.insert_at(point, elevation, Instant::now());
    }

    pub fn insert_at(&self, point: GeoPoint, elevation: f64, now: Instant) {
        lock(&self.cache).put(PointKey::from(point), (elevation, now));
    }

    pub fn len(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}
