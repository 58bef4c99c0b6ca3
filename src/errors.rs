//! Conditions that end a session or prevent it from starting.

use thiserror::Error;

use crate::joints::BaseMode;
use crate::parameter_error::ParameterError;

#[derive(Error, Debug)]
pub enum TeleopError {
    #[error(
        "calibration rejected: reprojection error {error_px:.3} px exceeds {threshold_px:.3} px, calibration must be redone"
    )]
    CalibrationRejected { error_px: f64, threshold_px: f64 },

    #[error("calibration cannot be solved: {0}")]
    CalibrationUnsolvable(String),

    #[error("robot is not ready for motion: {0}")]
    ActuatorNotReady(String),

    #[error("actuator failure: {0}")]
    Actuator(String),

    #[error("archive was recorded in {archive} mode but the session runs in {session} mode")]
    ModeMismatch { archive: BaseMode, session: BaseMode },

    #[error("archive contains no joint configurations")]
    EmptyArchive,

    #[error("session already stopped")]
    Stopped,

    #[error(transparent)]
    Configuration(#[from] ParameterError),
}
