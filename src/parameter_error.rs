//! Error handling for configuration, calibration artifacts and session archives

use std::io;
use thiserror::Error;

/// Unified error to report failures while reading or validating any file the crate consumes
/// (teleoperation YAML, calibration board, persisted extrinsics, recorded sessions).
#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),

    #[error("Parse Error: {0}")]
    ParseError(String),

    #[error("Missing Field: {0}")]
    MissingField(String),

    #[error("Unknown joint identifier: {0}")]
    UnknownJoint(String),

    #[error("Joint {joint} is not permitted in {mode} base mode")]
    JointNotPermitted { joint: String, mode: String },

    #[error("Value {value} of {field} is outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{0} must be finite")]
    NotFinite(String),

    #[error("Rotation is not orthonormal (deviation {0:.3e})")]
    NotOrthonormal(f64),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<serde_json::Error> for ParameterError {
    fn from(err: serde_json::Error) -> Self {
        ParameterError::ParseError(err.to_string())
    }
}

/// Checks that the named value is finite.
pub(crate) fn require_finite(field: &str, value: f64) -> Result<f64, ParameterError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParameterError::NotFinite(field.to_string()))
    }
}
