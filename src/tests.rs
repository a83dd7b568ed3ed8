use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_lite::future::block_on;

use crate::cancel::TokenCounter;
use crate::coverage::{
    required_overlap, CoverageEngine, Origin, OriginSet, ProgressSlot, RasterConfig, RasterGrid, RenderPlan,
    Strategy, MAX_RASTER_CELLS,
};
use crate::elevation::{CachedElevationService, ElevationService, TerrainElevationService};
use crate::error::{AnalysisError, AnalysisResult};
use crate::geo::GeoPoint;
use crate::io::EngineSettings;
use crate::physics::link_budget::{LinkBudgetConfig, PropagationModel};
use crate::physics::los::{
    suggest_relay, EndpointHeight, LineOfSightAnalyzer, LosRequest, LosSettings, PathSample,
};
use crate::render::{likely_reached, reach_status, shade_cell, Candidate, CONFIRMED_RGB, WEAK_RGB};
use crate::terrain::{decode_terrarium, ElevationTile, TerrainProvider, TerrainSampler, TileKey, TileSource};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct FnTerrain<F>(F);

impl<F> TerrainProvider for FnTerrain<F>
where
    F: Fn(GeoPoint) -> Option<f64> + Send + Sync,
{
    fn elevation_at(&self, point: GeoPoint, _zoom: u8) -> Option<f64> {
        (self.0)(point)
    }
}

/// Elevation service over a closure that records the size of every batch.
struct MockElevation<F> {
    f: F,
    batches: Mutex<Vec<usize>>,
}

impl<F: Fn(GeoPoint) -> f64 + Send + Sync> MockElevation<F> {
    fn new(f: F) -> Self {
        Self { f, batches: Mutex::new(Vec::new()) }
    }

    fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

impl<F> ElevationService for MockElevation<F>
where
    F: Fn(GeoPoint) -> f64 + Send + Sync,
{
    async fn elevations(&self, points: &[GeoPoint]) -> AnalysisResult<Vec<f64>> {
        self.batches.lock().unwrap().push(points.len());
        Ok(points.iter().map(|&p| (self.f)(p)).collect())
    }
}

struct FailingElevation;

impl ElevationService for FailingElevation {
    async fn elevations(&self, _points: &[GeoPoint]) -> AnalysisResult<Vec<f64>> {
        Err(AnalysisError::elevation("upstream 503"))
    }
}

struct ShortElevation;

impl ElevationService for ShortElevation {
    async fn elevations(&self, points: &[GeoPoint]) -> AnalysisResult<Vec<f64>> {
        Ok(vec![0.0; points.len().saturating_sub(1)])
    }
}

/// Supersedes the caller's request on its first batch.
struct SupersedingElevation {
    tokens: TokenCounter,
    calls: AtomicUsize,
}

impl ElevationService for SupersedingElevation {
    async fn elevations(&self, points: &[GeoPoint]) -> AnalysisResult<Vec<f64>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.tokens.issue();
        }
        Ok(vec![0.0; points.len()])
    }
}

/// Gaussian ridge 300 m high along lon 0.05.
fn ridge(p: GeoPoint) -> f64 {
    300.0 * (-((p.lon - 0.05) / 0.005).powi(2)).exp()
}

fn ridge_request() -> LosRequest {
    LosRequest {
        start: GeoPoint::new(0.0, 0.0),
        end: GeoPoint::new(0.0, 0.1),
        start_height: EndpointHeight::AboveGround(10.0),
        end_height: EndpointHeight::AboveGround(10.0),
    }
}

/// Short-range radio so terrain renders stay small.
fn low_power_link() -> LinkBudgetConfig {
    LinkBudgetConfig { tx_power_dbm: 0.0, antenna_gain_db: 0.0, ..Default::default() }
}

fn flat_config() -> RasterConfig {
    RasterConfig { terrain: false, ..Default::default() }
}

// ---------------------------------------------------------------- line of sight

#[test]
fn test_los_clear_over_flat_ground() {
    init_logger();
    let analyzer = LineOfSightAnalyzer::new(MockElevation::new(|_| 100.0), LosSettings::default());
    let mut request = ridge_request();
    request.end = GeoPoint::new(0.0, 0.02);

    let result = block_on(analyzer.analyze(&request)).unwrap();
    assert!(!result.blocked);
    assert_eq!(result.max_obstruction_m, 0.0);
    assert!(result.suggested_relay.is_none());
    assert_eq!(result.profile.len(), result.samples);
    assert!((result.profile[0].line_of_sight_elevation_m - 110.0).abs() < 1e-9);
    assert!(result.status().starts_with("LOS: clear"));
}

#[test]
fn test_los_single_ridge_blocks_and_is_the_only_peak() {
    init_logger();
    let analyzer = LineOfSightAnalyzer::new(MockElevation::new(ridge), LosSettings::default());
    let result = block_on(analyzer.analyze(&ridge_request())).unwrap();

    assert!(result.blocked);
    assert!((result.max_obstruction_m - 290.0).abs() < 1.0, "{}", result.max_obstruction_m);
    assert_eq!(result.peaks.len(), 1);
    let peak = result.peaks[0];
    assert_eq!(peak.index, 1);
    assert!((peak.elevation_m - 300.0).abs() < 1e-6);
    assert!((peak.distance_m - result.distance_m / 2.0).abs() < 1.0);
    assert!((result.max_terrain_m - 300.0).abs() < 1e-6);
}

#[test]
fn test_los_is_symmetric() {
    let analyzer = LineOfSightAnalyzer::new(MockElevation::new(ridge), LosSettings::default());
    let request = LosRequest {
        end_height: EndpointHeight::AboveGround(40.0),
        ..ridge_request()
    };
    let forward = block_on(analyzer.analyze(&request)).unwrap();
    let backward = block_on(analyzer.analyze(&request.reversed())).unwrap();

    assert_eq!(forward.blocked, backward.blocked);
    assert!((forward.max_obstruction_m - backward.max_obstruction_m).abs() < 1e-6);
    assert!((forward.distance_m - backward.distance_m).abs() < 1e-6);
}

#[test]
fn test_los_relay_on_ridge_top_is_clear() {
    let analyzer = LineOfSightAnalyzer::new(MockElevation::new(ridge), LosSettings::default());
    let result = block_on(analyzer.analyze(&ridge_request())).unwrap();

    let relay = result.suggested_relay.expect("blocked path suggests a relay");
    assert!(relay.clear);
    assert_eq!(relay.max_obstruction_m, 0.0);
    assert!((relay.lon - 0.05).abs() < 1e-9);
    assert!((relay.elevation_m - 300.0).abs() < 1e-6);
}

#[test]
fn test_relay_falls_back_to_lowest_obstruction() {
    let samples: Vec<PathSample> = (0..5)
        .map(|i| {
            let t = i as f64 / 4.0;
            PathSample { point: GeoPoint::new(0.0, t * 0.01), t }
        })
        .collect();
    let terrain = [0.0, 100.0, 0.0, 100.0, 0.0];
    let heights = [10.0, 100.0, 0.0, 100.0, 10.0];

    let relay = suggest_relay(&samples, &terrain, &heights, 0.0).unwrap();
    assert!(!relay.clear);
    assert!((relay.max_obstruction_m - 60.0).abs() < 1e-6);
    assert_eq!(relay.elevation_m, 100.0);
}

#[test]
fn test_los_zero_distance_is_invalid() {
    let analyzer = LineOfSightAnalyzer::new(MockElevation::new(|_| 0.0), LosSettings::default());
    let p = GeoPoint::new(45.0, 5.0);
    let err = block_on(analyzer.analyze(&LosRequest::new(p, p))).unwrap_err();
    assert_eq!(err, AnalysisError::InvalidPath);
    assert!(analyzer.service().batches().is_empty());

    let bad = LosRequest::new(GeoPoint::new(f64::NAN, 0.0), p);
    assert_eq!(block_on(analyzer.analyze(&bad)).unwrap_err(), AnalysisError::InvalidPath);
}

#[test]
fn test_los_elevation_failures() {
    init_logger();
    let request = ridge_request();

    let failing = LineOfSightAnalyzer::new(FailingElevation, LosSettings::default());
    assert!(matches!(
        block_on(failing.analyze(&request)),
        Err(AnalysisError::ElevationUnavailable(_))
    ));

    let short = LineOfSightAnalyzer::new(ShortElevation, LosSettings::default());
    assert!(matches!(
        block_on(short.analyze(&request)),
        Err(AnalysisError::ElevationUnavailable(_))
    ));

    let holes = LineOfSightAnalyzer::new(MockElevation::new(|_| f64::NAN), LosSettings::default());
    assert!(matches!(
        block_on(holes.analyze(&request)),
        Err(AnalysisError::ElevationUnavailable(_))
    ));
}

#[test]
fn test_los_chunking_does_not_change_the_result() {
    let request = ridge_request();
    let whole = LineOfSightAnalyzer::new(MockElevation::new(ridge), LosSettings::default());
    let chunked = LineOfSightAnalyzer::new(
        MockElevation::new(ridge),
        LosSettings { chunk_size: 7, ..Default::default() },
    );

    let a = block_on(whole.analyze(&request)).unwrap();
    let b = block_on(chunked.analyze(&request)).unwrap();
    assert_eq!(a, b);

    let batches = chunked.service().batches();
    assert_eq!(batches.iter().sum::<usize>(), a.samples);
    assert_eq!(batches.len(), a.samples.div_ceil(7));
    assert!(batches.iter().all(|&n| n <= 7));
    assert_eq!(whole.service().batches(), vec![a.samples]);
}

#[test]
fn test_los_sample_count_is_clamped() {
    let analyzer = LineOfSightAnalyzer::new(MockElevation::new(|_| 0.0), LosSettings::default());

    let near = LosRequest::new(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 0.001));
    assert_eq!(block_on(analyzer.analyze(&near)).unwrap().samples, 10);

    let far = LosRequest::new(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0));
    assert_eq!(block_on(analyzer.analyze(&far)).unwrap().samples, 80);
}

#[test]
fn test_los_superseded_request_is_cancelled() {
    let tokens = TokenCounter::new();
    let service = SupersedingElevation { tokens: tokens.clone(), calls: AtomicUsize::new(0) };
    let analyzer = LineOfSightAnalyzer::new(service, LosSettings { chunk_size: 5, ..Default::default() });

    let ticket = tokens.issue();
    let err = block_on(analyzer.analyze_with(&ridge_request(), &ticket)).unwrap_err();
    assert_eq!(err, AnalysisError::Cancelled);
    assert!(err.is_silent());
    // Stopped at the first chunk boundary after the newer request.
    assert_eq!(analyzer.service().calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------- elevation services

#[test]
fn test_cached_elevation_forwards_only_misses() {
    let cached = CachedElevationService::with_defaults(MockElevation::new(|p: GeoPoint| p.lat * 1000.0));
    let a = GeoPoint::new(0.1, 0.0);
    let b = GeoPoint::new(0.2, 0.0);
    let c = GeoPoint::new(0.3, 0.0);

    let first = block_on(cached.elevations(&[a, b])).unwrap();
    assert_eq!(first, vec![100.0, 200.0]);

    let second = block_on(cached.elevations(&[c, a, b])).unwrap();
    assert_eq!(second, vec![300.0, 100.0, 200.0]);
    assert_eq!(cached.cache().len(), 3);

    // Only `c` reached the inner service the second time.
    assert_eq!(cached.inner().batches(), vec![2, 1]);
}

#[test]
fn test_point_cache_expires() {
    let cached = CachedElevationService::new(MockElevation::new(|_| 1.0), 16, Duration::from_secs(60));
    let p = GeoPoint::new(1.0, 1.0);
    let now = Instant::now();
    cached.cache().insert_at(p, 42.0, now);

    assert_eq!(cached.cache().get_at(p, now + Duration::from_secs(30)), Some(42.0));
    assert_eq!(cached.cache().get_at(p, now + Duration::from_secs(61)), None);
    assert!(cached.cache().is_empty());
}

#[test]
fn test_terrain_elevation_service_reports_gaps() {
    let terrain = FnTerrain(|p: GeoPoint| if p.lat > 1.0 { None } else { Some(5.0) });
    let service = TerrainElevationService::new(terrain, 10);
    assert_eq!(block_on(service.elevations(&[GeoPoint::new(0.5, 0.0)])).unwrap(), vec![5.0]);
    assert!(matches!(
        block_on(service.elevations(&[GeoPoint::new(0.5, 0.0), GeoPoint::new(2.0, 0.0)])),
        Err(AnalysisError::ElevationUnavailable(_))
    ));
}

// ---------------------------------------------------------------- terrain tiles

struct CountingSource {
    fetches: AtomicUsize,
    fail: bool,
}

impl TileSource for CountingSource {
    fn fetch(&self, key: TileKey) -> anyhow::Result<Option<ElevationTile>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("disk on fire");
        }
        if key.x % 2 == 1 {
            return Ok(None);
        }
        Ok(Some(ElevationTile::from_fn(key, 256, |px, _| px as f32)))
    }
}

#[test]
fn test_terrarium_decoding() {
    assert_eq!(decode_terrarium(128, 0, 0), 0.0);
    assert_eq!(decode_terrarium(0, 0, 0), -32768.0);
    assert_eq!(decode_terrarium(128, 100, 128), 100.5);

    let key = TileKey { zoom: 1, x: 0, y: 0 };
    let rgba = [128, 10, 0, 255, 128, 20, 0, 255, 128, 30, 0, 255, 128, 40, 0, 255];
    let tile = ElevationTile::from_terrarium_rgba(key, 2, &rgba).unwrap();
    assert_eq!(tile.get_height(1, 1), 40.0);
    assert!(ElevationTile::from_terrarium_rgba(key, 3, &rgba).is_err());
}

#[test]
fn test_sampler_caches_tiles_and_misses() {
    init_logger();
    let sampler = TerrainSampler::new(CountingSource { fetches: AtomicUsize::new(0), fail: false }, 8);
    let p = GeoPoint::new(10.0, 10.0);

    let first = sampler.elevation_at(p, 10);
    let second = sampler.elevation_at(p, 10);
    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(sampler.metrics().misses(), 1);
    assert_eq!(sampler.metrics().hits(), 1);
    assert_eq!(sampler.cached_tiles(), 1);

    // Out-of-range keys never hit the source.
    assert!(sampler.get_tile(TileKey { zoom: 2, x: 4, y: 0 }).is_none());
    assert!(sampler.get_tile(TileKey { zoom: 2, x: -1, y: 0 }).is_none());
    assert_eq!(sampler.cached_tiles(), 1);
}

#[test]
fn test_sampler_remembers_missing_and_failed_tiles() {
    init_logger();
    let missing = TerrainSampler::new(CountingSource { fetches: AtomicUsize::new(0), fail: false }, 8);
    let odd = TileKey { zoom: 3, x: 1, y: 1 };
    assert!(missing.get_tile(odd).is_none());
    assert!(missing.get_tile(odd).is_none());

    let source = Arc::new(CountingSource { fetches: AtomicUsize::new(0), fail: true });
    let failing = TerrainSampler::new(ArcSource(source.clone()), 8);
    assert!(failing.elevation_at(GeoPoint::new(1.0, 1.0), 9).is_none());
    assert!(failing.elevation_at(GeoPoint::new(1.0, 1.0), 9).is_none());
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
}

struct ArcSource(Arc<CountingSource>);

impl TileSource for ArcSource {
    fn fetch(&self, key: TileKey) -> anyhow::Result<Option<ElevationTile>> {
        self.0.fetch(key)
    }
}

#[test]
fn test_tile_cache_is_bounded() {
    let sampler = TerrainSampler::new(CountingSource { fetches: AtomicUsize::new(0), fail: false }, 2);
    for x in [0, 2, 4, 6] {
        sampler.get_tile(TileKey { zoom: 4, x, y: 0 });
    }
    assert_eq!(sampler.cached_tiles(), 2);
}

// ---------------------------------------------------------------- raster engine

#[test]
fn test_no_origins() {
    let engine = CoverageEngine::flat();
    assert!(matches!(
        engine.render(&[], &LinkBudgetConfig::default(), &flat_config()),
        Err(AnalysisError::NoOrigins)
    ));
    assert_eq!(RasterGrid::plan(&[], 1000.0, 90.0), Err(AnalysisError::NoOrigins));
}

#[test]
fn test_continental_range_is_refused() {
    init_logger();
    // Free space at the sensitivity floor reaches thousands of kilometres.
    let link = LinkBudgetConfig { cutoff_mode: true, min_rx_dbm: -150.0, ..Default::default() }
        .with_model(PropagationModel::FreeSpace);
    let origins = [Origin::new(45.0, 5.0)];

    let plan = RenderPlan::new(&origins, &link, &flat_config());
    assert!(matches!(plan, Err(AnalysisError::RasterTooLarge(cells)) if cells > MAX_RASTER_CELLS));
    let engine = CoverageEngine::flat();
    assert!(matches!(engine.render(&origins, &link, &flat_config()), Err(AnalysisError::RasterTooLarge(_))));

    let far = RasterGrid::plan(&[GeoPoint::new(0.0, 0.0)], 1.0e7, 30.0);
    assert!(matches!(far, Err(AnalysisError::RasterTooLarge(_))));
    assert!(RasterGrid::plan(&[GeoPoint::new(45.0, 5.0)], 47_000.0, 90.0).is_ok());
}

#[test]
fn test_plan_fits_budget_and_reports_summary() {
    let origins = [Origin::new(45.0, 5.0)];
    let plan = RenderPlan::new(&origins, &LinkBudgetConfig::default(), &flat_config()).unwrap();
    assert!(plan.resolution.adjusted);
    assert!(plan.resolution.grid_step_m > 90.0);
    assert!((8..=12).contains(&plan.zoom));
    assert!(plan.summary().contains("auto"));

    let cutoff = LinkBudgetConfig { cutoff_mode: true, ..Default::default() };
    let config = RasterConfig { range_factor: 0.5, ..flat_config() };
    let plan = RenderPlan::new(&origins, &cutoff, &config).unwrap();
    assert_eq!(plan.render_range_m, plan.base_range_m);
}

#[test]
fn test_raster_is_deterministic() {
    init_logger();
    let engine = CoverageEngine::flat();
    let origins = [Origin::new(0.0, 0.0), Origin::new(0.0, 0.02)];
    let link = low_power_link();

    let a = engine.render_blocking(&origins, &link, &flat_config()).unwrap();
    let b = engine.render_blocking(&origins, &link, &flat_config()).unwrap();
    assert_eq!(a.strategy, Strategy::Cpu);
    assert_eq!(a.coverage_count, b.coverage_count);
    assert_eq!(a.pixel_rgba, b.pixel_rgba);
    assert_eq!(a.pixel_rgba.len(), a.rows * a.cols * 4);
    assert!(b.token > a.token);
    assert_eq!(engine.latest().unwrap().token, b.token);
}

#[test]
fn test_superseded_render_is_never_committed() {
    init_logger();
    let engine = CoverageEngine::flat();
    let link = low_power_link();
    let first = engine.render(&[Origin::new(0.0, 0.0)], &link, &flat_config()).unwrap();
    let second = engine.render(&[Origin::new(1.0, 1.0)], &link, &flat_config()).unwrap();

    let b = second.block().unwrap();
    let b_token = b.token;
    engine.commit(b).unwrap();

    match first.block() {
        Err(AnalysisError::Cancelled) => {}
        Ok(a) => assert!(matches!(engine.commit(a), Err(AnalysisError::Cancelled))),
        Err(e) => panic!("unexpected error: {e}"),
    }
    assert_eq!(engine.latest().unwrap().token, b_token);
}

#[test]
fn test_progress_ignores_stale_tokens() {
    let tokens = TokenCounter::new();
    let slot = ProgressSlot::default();
    let old = tokens.issue();
    assert!(slot.publish(&old, 10, 100));
    assert_eq!(slot.read(old.token()).unwrap().to_string(), "Rendering: 10%");

    let new = tokens.issue();
    assert!(slot.read(new.token()).is_none());
    assert!(!slot.publish(&old, 20, 100));
    assert!(slot.publish(&new, 50, 100));
    assert_eq!(slot.read(new.token()).unwrap().percent(), 50);
}

#[test]
fn test_partial_overlap_renders_weak() {
    let engine = CoverageEngine::flat();
    let origins = [Origin::new(0.0, 0.0), Origin::new(0.0, 0.01), Origin::new(0.0, 0.08)];
    let raster = engine.render_blocking(&origins, &low_power_link(), &flat_config()).unwrap();

    let idx = raster.cell_index(0.0, 0.005).unwrap();
    assert_eq!(raster.coverage_count[idx], 2);
    assert_eq!(&raster.pixel_rgba[idx * 4..idx * 4 + 3], &WEAK_RGB);
    assert_eq!(raster.pixel_rgba[idx * 4 + 3], 255);

    assert_eq!(required_overlap(1), 1);
    assert_eq!(required_overlap(2), 2);
    assert_eq!(required_overlap(3), 3);
    assert_eq!(shade_cell(2, 5.0, 3, false), [239, 68, 68, 255]);
    assert_eq!(shade_cell(3, 5.0, 3, false)[..3], CONFIRMED_RGB);
    assert_eq!(shade_cell(1, 10.0, 1, true), [34, 197, 94, 128]);
    assert_eq!(shade_cell(0, 10.0, 1, false), [0, 0, 0, 0]);
}

#[test]
fn test_terrain_wall_blocks_coverage() {
    init_logger();
    let wall = |p: GeoPoint| -> Option<f64> {
        if p.lat > 0.02 {
            None
        } else if (0.02..=0.025).contains(&p.lon) {
            Some(2000.0)
        } else {
            Some(0.0)
        }
    };
    let engine = CoverageEngine::new(Some(Arc::new(FnTerrain(wall))));
    let origins = [Origin::new(0.0, 0.0)];
    let link = low_power_link();

    let with_terrain = engine.render_blocking(&origins, &link, &RasterConfig::default()).unwrap();
    let flat = CoverageEngine::flat().render_blocking(&origins, &link, &flat_config()).unwrap();

    assert!(with_terrain.covers(0.0, -0.005));
    assert!(flat.covers(0.0, 0.028));
    assert!(!with_terrain.covers(0.0, 0.028));
    // No ground data north of 0.02: transparent and uncounted.
    assert!(flat.covers(0.025, 0.0));
    let idx = with_terrain.cell_index(0.025, 0.0).unwrap();
    assert_eq!(with_terrain.coverage_count[idx], 0);
    assert_eq!(with_terrain.pixel_rgba[idx * 4 + 3], 0);
    assert!(with_terrain.covered_cells() < flat.covered_cells());
}

#[test]
fn test_flat_ground_clearance_and_bulge() {
    init_logger();
    let engine = CoverageEngine::new(Some(Arc::new(FnTerrain(|_: GeoPoint| Some(0.0)))));
    let origins = [Origin::new(0.0, 0.0)];
    let link = low_power_link();
    let render = |link: &LinkBudgetConfig| engine.render_blocking(&origins, link, &RasterConfig::default()).unwrap();

    let flat = CoverageEngine::flat().render_blocking(&origins, &link, &flat_config()).unwrap();
    // Low antennas leave the first Fresnel zone mostly obstructed by the ground.
    let grazing = render(&link);
    assert!(grazing.covered_cells() < flat.covered_cells());

    // No clearance penalty and a nearly flat earth: terrain adds no loss at all.
    let unpenalised = render(&LinkBudgetConfig { clearance_loss_db: 0.0, effective_earth_radius_m: 1e12, ..link.clone() });
    assert_eq!(unpenalised.coverage_count, flat.coverage_count);

    // A tight effective radius raises the bulge mid-path into a diffracting obstacle.
    let bulging = render(&LinkBudgetConfig { effective_earth_radius_m: 1e5, ..link.clone() });
    assert!(bulging.covered_cells() < grazing.covered_cells());
}

#[test]
fn test_gpu_preference_matches_cpu() {
    init_logger();
    let origins = [Origin::new(10.0, 10.0), Origin::new(10.0, 10.03)];
    let link = low_power_link();
    let cpu = CoverageEngine::flat().render_blocking(&origins, &link, &flat_config()).unwrap();
    let gpu_config = RasterConfig { prefer_gpu: true, ..flat_config() };
    let gpu = CoverageEngine::flat().render_blocking(&origins, &link, &gpu_config).unwrap();
    if gpu.strategy != Strategy::Gpu {
        log::info!("No compute adapter; GPU agreement covered by the packed-job test only");
        return;
    }

    assert_eq!((cpu.rows, cpu.cols), (gpu.rows, gpu.cols));
    // f32 on the device may flip cells sitting exactly on the range edge.
    let mismatches = cpu
        .coverage_count
        .iter()
        .zip(&gpu.coverage_count)
        .filter(|(a, b)| a != b)
        .count();
    assert!(mismatches * 100 <= cpu.coverage_count.len(), "{mismatches} mismatched cells");
}

// ---------------------------------------------------------------- origins, reach, settings

#[test]
fn test_origin_set_modes() {
    let mut set = OriginSet::new(false);
    set.upsert(GeoPoint::new(1.0, 1.0), None);
    set.upsert(GeoPoint::new(2.0, 2.0), None);
    assert_eq!(set.len(), 1);
    assert_eq!(set.as_slice()[0].position, GeoPoint::new(2.0, 2.0));

    set.set_multi(true);
    let key = set.upsert(GeoPoint::new(3.0, 3.0), None).key.clone().unwrap();
    set.upsert(GeoPoint::new(4.0, 4.0), Some("node-a".into()));
    set.upsert(GeoPoint::new(5.0, 5.0), Some("node-a".into()));
    assert_eq!(set.len(), 3);

    assert!(set.move_device("node-a", GeoPoint::new(6.0, 6.0)));
    assert!(!set.move_device("node-b", GeoPoint::new(6.0, 6.0)));
    assert_eq!(set.remove(&key).unwrap().position, GeoPoint::new(3.0, 3.0));
    assert_eq!(set.len(), 2);
    set.clear();
    assert!(set.is_empty());
}

#[test]
fn test_likely_reached_nodes() {
    let engine = CoverageEngine::flat();
    let origins = [Origin::new(0.0, 0.0).with_id("tx")];
    let raster = engine.render_blocking(&origins, &low_power_link(), &flat_config()).unwrap();
    let candidate = |id: &str, lon: f64| Candidate {
        id: id.into(),
        label: id.to_uppercase(),
        position: GeoPoint::new(0.0, lon),
    };
    let candidates = [candidate("far", 0.2), candidate("mid", 0.02), candidate("near", 0.005), candidate("tx", 0.0)];

    let reached = likely_reached(&raster, &origins, &candidates);
    let ids: Vec<&str> = reached.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["near", "mid"]);
    assert_eq!(reach_status(&reached), "Likely to hit 2 nodes: NEAR, MID");
    assert_eq!(reach_status(&[]), "Likely to hit 0 nodes");
}

#[test]
fn test_settings_json_defaults_and_roundtrip() {
    let settings: EngineSettings =
        serde_json::from_str(r#"{"model":"urban","link":{"tx_power_dbm":27.0,"min_rx_dbm":-200.0}}"#).unwrap();
    assert_eq!(settings.link.tx_power_dbm, 27.0);
    assert_eq!(settings.raster, RasterConfig::default());
    assert_eq!(settings.los.max_samples, 80);

    let link = settings.effective_link();
    assert_eq!(link.path_loss_exponent, PropagationModel::Urban.path_loss_exponent());
    assert_eq!(link.min_rx_dbm, -150.0);

    let path = std::env::temp_dir().join(format!("meshmap_rf_settings_{}.json", std::process::id()));
    crate::io::save_settings_to_json(&path, &settings).unwrap();
    let loaded = crate::io::load_settings_from_json(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded.model, Some(PropagationModel::Urban));
    assert_eq!(loaded.link.tx_power_dbm, 27.0);
    assert_eq!(loaded.raster, settings.raster);
    assert_eq!(loaded.los, settings.los);

    assert!(crate::io::load_settings_from_json(std::env::temp_dir().join("meshmap_rf_missing.json")).is_err());
}

// ---------------------------------------------------------------- ECS plugin

#[test]
fn test_plugin_applies_current_render() {
    use bevy::prelude::App;

    use crate::plugin::{CoveragePlugin, CoverageState, RenderCoverage};

    init_logger();
    let mut app = App::new();
    app.add_plugins(CoveragePlugin::new(None));
    app.world_mut().send_event(RenderCoverage {
        origins: vec![Origin::new(0.0, 0.0)],
        link: low_power_link(),
        config: flat_config(),
    });

    for _ in 0..500 {
        app.update();
        if app.world().resource::<CoverageState>().raster.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let state = app.world().resource::<CoverageState>();
    let raster = state.raster.as_ref().expect("render finished");
    assert_eq!(raster.token, state.engine.current_token());
    assert!(state.status.starts_with("Coverage ready"));
    let shown = raster.token;

    app.world_mut().send_event(RenderCoverage {
        origins: Vec::new(),
        link: low_power_link(),
        config: flat_config(),
    });
    app.update();
    // A request without origins reports but leaves the last raster on screen.
    let state = app.world().resource::<CoverageState>();
    assert_eq!(state.raster.as_ref().map(|r| r.token), Some(shown));
    assert_eq!(state.status, AnalysisError::NoOrigins.to_string());
}
