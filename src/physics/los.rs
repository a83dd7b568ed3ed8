use std::time::Instant;

use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cancel::{Ticket, TokenCounter};
use crate::elevation::ElevationService;
use crate::error::{AnalysisError, AnalysisResult};
use crate::geo::{haversine_m, GeoPoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LosSettings {
    pub sample_step_m: f64,
    pub min_samples: usize,
    pub max_samples: usize,
    pub max_peaks: usize,
    /// Points per elevation-service request.
    pub chunk_size: usize,
    /// Mast height assumed for a suggested relay.
    pub relay_height_agl_m: f64,
}

impl Default for LosSettings {
    fn default() -> Self {
        Self {
            sample_step_m: 250.0,
            min_samples: 10,
            max_samples: 80,
            max_peaks: 4,
            chunk_size: 100,
            relay_height_agl_m: 0.0,
        }
    }
}

/// Antenna height at one end of the link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointHeight {
    AboveGround(f64),
    /// Absolute height above mean sea level, ignores the terrain under the endpoint.
    Absolute(f64),
}

impl Default for EndpointHeight {
    fn default() -> Self {
        EndpointHeight::AboveGround(0.0)
    }
}

impl EndpointHeight {
    pub fn resolve(&self, ground_m: f64) -> f64 {
        match *self {
            EndpointHeight::AboveGround(agl) => ground_m + agl,
            EndpointHeight::Absolute(msl) => msl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LosRequest {
    pub start: GeoPoint,
    pub end: GeoPoint,
    #[serde(default)]
    pub start_height: EndpointHeight,
    #[serde(default)]
    pub end_height: EndpointHeight,
}

impl LosRequest {
    pub fn new(start: GeoPoint, end: GeoPoint) -> Self {
        Self {
            start,
            end,
            start_height: EndpointHeight::default(),
            end_height: EndpointHeight::default(),
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            start: self.end,
            end: self.start,
            start_height: self.end_height,
            end_height: self.start_height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathSample {
    pub point: GeoPoint,
    pub t: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub distance_m: f64,
    pub terrain_elevation_m: f64,
    pub line_of_sight_elevation_m: f64,
    pub fraction_t: f64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelaySuggestion {
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: f64,
    pub clear: bool,
    pub max_obstruction_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// 1-based, in path order.
    pub index: usize,
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: f64,
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LosResult {
    pub distance_m: f64,
    pub blocked: bool,
    pub max_obstruction_m: f64,
    pub profile: Vec<ProfilePoint>,
    pub suggested_relay: Option<RelaySuggestion>,
    pub peaks: Vec<Peak>,
    pub samples: usize,
    pub start_elevation_m: f64,
    pub end_elevation_m: f64,
    pub max_terrain_m: f64,
}

impl LosResult {
    /// One-line operator status.
    pub fn status(&self) -> String {
        if self.blocked {
            format!(
                "LOS: blocked ({:.1} km, {:.0} m obstruction)",
                self.distance_m / 1000.0,
                self.max_obstruction_m
            )
        } else {
            format!("LOS: clear ({:.1} km)", self.distance_m / 1000.0)
        }
    }
}

/// Evenly spaced samples in interpolation fraction `t`, endpoints included.
pub fn sample_path(start: GeoPoint, end: GeoPoint, settings: &LosSettings) -> Vec<PathSample> {
    let distance = haversine_m(start, end);
    if distance <= 0.0 {
        return vec![PathSample { point: start, t: 0.0 }, PathSample { point: end, t: 1.0 }];
    }
    let raw = (distance / settings.sample_step_m.max(1.0)).floor() as usize + 1;
    let count = raw.min(settings.max_samples).max(settings.min_samples).max(2);

    (0..count)
        .map(|i| {
            let t = i as f64 / (count - 1) as f64;
            PathSample { point: start.lerp(end, t), t }
        })
        .collect()
}

/// Largest height of `heights[start+1..end]` above the straight line joining
/// `heights[start]` and `heights[end]`. Never negative.
pub fn max_obstruction(samples: &[PathSample], heights: &[f64], start: usize, end: usize) -> f64 {
    if end <= start + 1 {
        return 0.0;
    }
    let start_t = samples[start].t;
    let end_t = samples[end].t;
    if end_t <= start_t {
        return 0.0;
    }
    let start_h = heights[start];
    let end_h = heights[end];

    (start + 1..end).fold(0.0, |worst, idx| {
        let frac = (samples[idx].t - start_t) / (end_t - start_t);
        let line = start_h + (end_h - start_h) * frac;
        let clearance = heights[idx] - line;
        if clearance > worst { clearance } else { worst }
    })
}

/// Best interior relay site: any clear candidate (highest ground wins), else the
/// candidate with the smallest worst-segment obstruction (first wins).
pub fn suggest_relay(
    samples: &[PathSample],
    terrain: &[f64],
    heights: &[f64],
    relay_height_agl_m: f64,
) -> Option<RelaySuggestion> {
    if samples.len() < 3 {
        return None;
    }
    let last = samples.len() - 1;
    let mut best: Option<(usize, f64, bool)> = None;
    let mut segment = heights.to_vec();

    for idx in 1..last {
        segment[idx] = terrain[idx] + relay_height_agl_m;
        let score = max_obstruction(samples, &segment, 0, idx)
            .max(max_obstruction(samples, &segment, idx, last));
        segment[idx] = heights[idx];
        let clear = score <= 0.0;

        best = match best {
            None => Some((idx, score, clear)),
            Some((_, _, false)) if clear => Some((idx, score, true)),
            Some((best_idx, _, true)) if clear && terrain[idx] > terrain[best_idx] => {
                Some((idx, score, true))
            }
            Some((_, best_score, false)) if score < best_score => Some((idx, score, false)),
            keep => keep,
        };
    }

    best.map(|(idx, score, clear)| RelaySuggestion {
        lat: samples[idx].point.lat,
        lon: samples[idx].point.lon,
        elevation_m: terrain[idx],
        clear,
        max_obstruction_m: score,
    })
}

/// Interior local maxima, strongest `max_peaks` kept, returned in path order.
pub fn find_peaks(samples: &[PathSample], terrain: &[f64], distance_m: f64, max_peaks: usize) -> Vec<Peak> {
    if samples.len() < 3 {
        return Vec::new();
    }
    let last = terrain.len() - 1;
    let mut candidates: Vec<usize> = (1..last)
        .filter(|&i| terrain[i] >= terrain[i - 1] && terrain[i] >= terrain[i + 1])
        .collect();

    if candidates.is_empty() {
        // First index wins ties.
        let top = (1..last).fold(1, |best, i| if terrain[i] > terrain[best] { i } else { best });
        candidates.push(top);
    }

    candidates
        .into_iter()
        .sorted_by(|&a, &b| terrain[b].total_cmp(&terrain[a]))
        .take(max_peaks)
        .sorted_by(|&a, &b| samples[a].t.total_cmp(&samples[b].t))
        .enumerate()
        .map(|(i, idx)| Peak {
            index: i + 1,
            lat: samples[idx].point.lat,
            lon: samples[idx].point.lon,
            elevation_m: terrain[idx],
            distance_m: distance_m * samples[idx].t,
        })
        .collect()
}

/// Fetches elevations chunk by chunk, in order. Any failure fails the whole batch.
pub async fn fetch_profile<E: ElevationService>(
    service: &E,
    samples: &[PathSample],
    chunk_size: usize,
    ticket: Option<&Ticket>,
) -> AnalysisResult<Vec<f64>> {
    let points: Vec<GeoPoint> = samples.iter().map(|s| s.point).collect();
    let mut elevations = Vec::with_capacity(points.len());

    for chunk in points.chunks(chunk_size.max(1)) {
        if let Some(ticket) = ticket {
            ticket.ensure_current()?;
        }
        let batch = service.elevations(chunk).await?;
        if batch.len() != chunk.len() {
            return Err(AnalysisError::elevation("unexpected result length"));
        }
        if batch.iter().any(|e| !e.is_finite()) {
            return Err(AnalysisError::elevation("missing elevation"));
        }
        elevations.extend(batch);
    }
    Ok(elevations)
}

/// Assembles the verdict from sampled terrain. Pure; used by the async pipeline.
pub fn evaluate_profile(
    request: &LosRequest,
    samples: &[PathSample],
    terrain: &[f64],
    settings: &LosSettings,
) -> AnalysisResult<LosResult> {
    let distance_m = haversine_m(request.start, request.end);
    if !(distance_m > 0.0) || samples.len() < 2 || terrain.len() != samples.len() {
        return Err(AnalysisError::InvalidPath);
    }
    let last = samples.len() - 1;
    let start_abs = request.start_height.resolve(terrain[0]);
    let end_abs = request.end_height.resolve(terrain[last]);

    let mut heights = terrain.to_vec();
    heights[0] = start_abs;
    heights[last] = end_abs;

    let max_obstruction_m = max_obstruction(samples, &heights, 0, last);
    let blocked = max_obstruction_m > 0.0;
    let suggested_relay = if blocked {
        suggest_relay(samples, terrain, &heights, settings.relay_height_agl_m)
    } else {
        None
    };

    let profile = samples
        .iter()
        .zip(terrain)
        .map(|(s, &elev)| ProfilePoint {
            distance_m: distance_m * s.t,
            terrain_elevation_m: elev,
            line_of_sight_elevation_m: start_abs + (end_abs - start_abs) * s.t,
            fraction_t: s.t,
            lat: s.point.lat,
            lon: s.point.lon,
        })
        .collect();

    Ok(LosResult {
        distance_m,
        blocked,
        max_obstruction_m,
        profile,
        suggested_relay,
        peaks: find_peaks(samples, terrain, distance_m, settings.max_peaks),
        samples: samples.len(),
        start_elevation_m: terrain[0],
        end_elevation_m: terrain[last],
        max_terrain_m: terrain.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

/// Two-point terrain line-of-sight analysis against an elevation service.
///
/// Every call to [`LineOfSightAnalyzer::analyze`] supersedes the previous one; the
/// older call returns [`AnalysisError::Cancelled`] at its next chunk boundary.
pub struct LineOfSightAnalyzer<E> {
    service: E,
    settings: LosSettings,
    tokens: TokenCounter,
}

impl<E: ElevationService> LineOfSightAnalyzer<E> {
    pub fn new(service: E, settings: LosSettings) -> Self {
        Self { service, settings, tokens: TokenCounter::new() }
    }

    pub fn settings(&self) -> &LosSettings {
        &self.settings
    }

    pub fn service(&self) -> &E {
        &self.service
    }

    pub fn tokens(&self) -> &TokenCounter {
        &self.tokens
    }

    pub async fn analyze(&self, request: &LosRequest) -> AnalysisResult<LosResult> {
        let ticket = self.tokens.issue();
        self.analyze_with(request, &ticket).await
    }

    pub async fn analyze_with(&self, request: &LosRequest, ticket: &Ticket) -> AnalysisResult<LosResult> {
        if !request.start.is_valid() || !request.end.is_valid() {
            return Err(AnalysisError::InvalidPath);
        }
        let distance_m = haversine_m(request.start, request.end);
        if !(distance_m > 0.0) {
            return Err(AnalysisError::InvalidPath);
        }

        let started = Instant::now();
        let samples = sample_path(request.start, request.end, &self.settings);
        debug!("LOS {:.0} m, {} samples (token {})", distance_m, samples.len(), ticket.token());

        let terrain = match fetch_profile(&self.service, &samples, self.settings.chunk_size, Some(ticket)).await {
            Ok(terrain) => terrain,
            Err(AnalysisError::Cancelled) => {
                debug!("LOS token {} superseded", ticket.token());
                return Err(AnalysisError::Cancelled);
            }
            Err(e) => {
                warn!("LOS elevation fetch failed: {e}");
                return Err(e);
            }
        };
        ticket.ensure_current()?;

        let result = evaluate_profile(request, &samples, &terrain, &self.settings)?;
        info!(
            "LOS {} in {:.2?} (max obstruction {:.1} m)",
            if result.blocked { "blocked" } else { "clear" },
            started.elapsed(),
            result.max_obstruction_m
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn even_samples(n: usize) -> Vec<PathSample> {
        (0..n)
            .map(|i| {
                let t = i as f64 / (n - 1) as f64;
                PathSample { point: GeoPoint::new(0.0, t * 0.1), t }
            })
            .collect()
    }

    #[test]
    fn strongest_peaks_are_kept_in_path_order() {
        let terrain = [0.0, 50.0, 0.0, 300.0, 0.0, 100.0, 0.0, 200.0, 0.0];
        let samples = even_samples(terrain.len());
        let peaks = find_peaks(&samples, &terrain, 8_000.0, 2);

        let elevations: Vec<f64> = peaks.iter().map(|p| p.elevation_m).collect();
        let indices: Vec<usize> = peaks.iter().map(|p| p.index).collect();
        assert_eq!(elevations, vec![300.0, 200.0]);
        assert_eq!(indices, vec![1, 2]);
        assert!((peaks[0].distance_m - 3_000.0).abs() < 1e-9);
        assert!((peaks[1].distance_m - 7_000.0).abs() < 1e-9);
    }

    #[test]
    fn monotonic_profile_falls_back_to_highest_interior_sample() {
        let terrain: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let samples = even_samples(terrain.len());
        let peaks = find_peaks(&samples, &terrain, 8_000.0, 4);

        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].elevation_m, 7.0);
        assert_eq!(peaks[0].index, 1);
    }

    #[test]
    fn obstruction_is_measured_against_the_endpoint_line() {
        let samples = even_samples(5);
        let heights = [0.0, 10.0, 30.0, 10.0, 40.0];
        // Line reaches 20 m at the midpoint.
        assert!((max_obstruction(&samples, &heights, 0, 4) - 10.0).abs() < 1e-9);
        assert_eq!(max_obstruction(&samples, &heights, 0, 1), 0.0);
    }
}
