use std::sync::Arc;

use bevy::prelude::*;
use bevy::tasks::Task;
use futures_lite::future;
use log::warn;

use crate::coverage::{CoverageEngine, CoverageRaster, Origin, RasterConfig};
use crate::error::AnalysisResult;
use crate::physics::link_budget::LinkBudgetConfig;
use crate::physics::refraction::RefractionParams;
use crate::terrain::TerrainProvider;

/// Drives a [`CoverageEngine`] from an ECS app.
pub struct CoveragePlugin {
    terrain: Option<Arc<dyn TerrainProvider>>,
}

impl CoveragePlugin {
    pub fn new(terrain: Option<Arc<dyn TerrainProvider>>) -> Self {
        Self { terrain }
    }
}

impl Plugin for CoveragePlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(CoverageState::new(CoverageEngine::new(self.terrain.clone())))
            .init_resource::<RefractionParams>()
            .add_event::<RenderCoverage>()
            .add_event::<CoverageUpdated>()
            .add_systems(Update, (start_renders, poll_renders, report_progress).chain());
    }
}

#[derive(Resource)]
pub struct CoverageState {
    pub engine: Arc<CoverageEngine>,
    pub raster: Option<Arc<CoverageRaster>>,
    pub status: String,
}

impl CoverageState {
    pub fn new(engine: CoverageEngine) -> Self {
        Self { engine: Arc::new(engine), raster: None, status: String::new() }
    }
}

/// Request for a new raster. Supersedes any render in flight.
#[derive(Event, Debug, Clone)]
pub struct RenderCoverage {
    pub origins: Vec<Origin>,
    pub link: LinkBudgetConfig,
    pub config: RasterConfig,
}

/// Sent after a raster becomes the latest result.
#[derive(Event, Debug, Clone)]
pub struct CoverageUpdated {
    pub raster: Arc<CoverageRaster>,
}

#[derive(Component)]
pub struct CoverageTask {
    pub token: u64,
    task: Task<AnalysisResult<CoverageRaster>>,
}

fn start_renders(
    mut commands: Commands,
    mut requests: EventReader<RenderCoverage>,
    mut state: ResMut<CoverageState>,
    refraction: Res<RefractionParams>,
) {
    // Only the newest request matters; the engine would cancel the others anyway.
    let Some(request) = requests.read().last() else {
        return;
    };
    // The app-wide refraction setting wins over the per-request value.
    let link = LinkBudgetConfig {
        effective_earth_radius_m: refraction.effective_earth_radius(),
        ..request.link.clone()
    };

    match state.engine.render(&request.origins, &link, &request.config) {
        Ok(handle) => {
            state.status = handle.plan.summary();
            commands.spawn(CoverageTask { token: handle.token, task: handle.task });
        }
        // The last raster stays in place; only the status changes.
        Err(e) => state.status = e.to_string(),
    }
}

fn poll_renders(
    mut commands: Commands,
    mut tasks: Query<(Entity, &mut CoverageTask)>,
    mut state: ResMut<CoverageState>,
    mut updated: EventWriter<CoverageUpdated>,
) {
    for (entity, mut task) in &mut tasks {
        let Some(result) = future::block_on(future::poll_once(&mut task.task)) else {
            continue;
        };
        commands.entity(entity).despawn();

        match result.and_then(|raster| state.engine.commit(raster)) {
            Ok(raster) => {
                state.status = format!("Coverage ready ({} cells covered)", raster.covered_cells());
                state.raster = Some(raster.clone());
                updated.send(CoverageUpdated { raster });
            }
            Err(e) if e.is_silent() => {}
            Err(e) => {
                warn!("Coverage render {} failed: {e}", task.token);
                state.status = e.to_string();
            }
        }
    }
}

fn report_progress(mut state: ResMut<CoverageState>, tasks: Query<&CoverageTask>) {
    if tasks.is_empty() {
        return;
    }
    if let Some(progress) = state.engine.progress().filter(|p| p.row < p.rows) {
        state.status = progress.to_string();
    }
}
