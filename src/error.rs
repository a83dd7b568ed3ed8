use thiserror::Error;

/// Failure of a single LOS or coverage request.
///
/// The `Display` text is the short status string shown to the operator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("invalid path: endpoints are degenerate or zero distance apart")]
    InvalidPath,
    #[error("elevation unavailable: {0}")]
    ElevationUnavailable(String),
    #[error("no transmitter origins selected")]
    NoOrigins,
    #[error("coverage area too large: {0} cells")]
    RasterTooLarge(usize),
    #[error("compute backend unavailable: {0}")]
    ComputeBackendUnavailable(String),
    #[error("superseded by a newer request")]
    Cancelled,
}

impl AnalysisError {
    pub fn elevation(reason: impl Into<String>) -> Self {
        AnalysisError::ElevationUnavailable(reason.into())
    }

    /// Stale results are dropped silently rather than reported.
    pub fn is_silent(&self) -> bool {
        matches!(self, AnalysisError::Cancelled | AnalysisError::ComputeBackendUnavailable(_))
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
