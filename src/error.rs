//! Error types for the recognition pipeline.

use thiserror::Error;

/// Errors produced by recognition components.
///
/// Per-model data problems (bad correspondence indices, missing models) are
/// deliberately *not* represented here: they are logged and the affected
/// model is skipped, so one bad model never aborts a recognition call.
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// A configuration parameter failed validation at construction time.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The scene cloud is structurally inconsistent (e.g. normals present
    /// but of different length than the points).
    #[error("malformed scene cloud: {0}")]
    MalformedScene(String),
}

/// A parameter that failed fail-fast validation.
#[derive(Debug, Error)]
#[error("{parameter}: {reason}")]
pub struct ConfigError {
    /// Name of the offending parameter.
    pub parameter: &'static str,
    /// Why it was rejected.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self {
            parameter,
            reason: reason.into(),
        }
    }
}

/// Check that a distance-like parameter is finite and non-negative.
pub(crate) fn check_non_negative(parameter: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::new(
            parameter,
            format!("must be finite and non-negative, got {value}"),
        ));
    }
    Ok(())
}

/// Check that a ratio-like parameter lies in [0, 1].
pub(crate) fn check_unit_interval(parameter: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::new(
            parameter,
            format!("must lie in [0, 1], got {value}"),
        ));
    }
    Ok(())
}
