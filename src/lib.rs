pub mod cache;
pub mod cancel;
pub mod coverage;
pub mod elevation;
pub mod error;
pub mod geo;
pub mod io;
pub mod physics;
pub mod plugin;
pub mod render;
pub mod terrain;

#[cfg(test)]
mod tests;

pub use coverage::{CoverageEngine, CoverageRaster, Origin, RasterConfig};
pub use error::{AnalysisError, AnalysisResult};
pub use geo::GeoPoint;
pub use physics::link_budget::{LinkBudgetConfig, PropagationModel};
pub use physics::los::{LineOfSightAnalyzer, LosRequest, LosResult, LosSettings};
