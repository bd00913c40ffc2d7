use thiserror::Error;

use crate::types::SourceKind;

/// Estimator error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Invalid time of day: {0}")]
    InvalidTime(String),

    #[error("Invalid prediction interval: {0} s (time must advance)")]
    InvalidInterval(f64),

    #[error("Innovation covariance is singular")]
    SingularInnovation,

    #[error("The {0} source terminated")]
    SourceTerminated(SourceKind),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FusionError {
    /// Per-step numeric failures: skip the step and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FusionError::InvalidTime(_)
                | FusionError::InvalidInterval(_)
                | FusionError::SingularInnovation
        )
    }
}

/// Result type for estimator operations
pub type FusionResult<T> = Result<T, FusionError>;
