//! Persisted camera extrinsics.

use std::fs;
use std::path::Path;

use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::parameter_error::ParameterError;

/// Largest deviation of `R * R^T` from identity accepted when loading a rotation.
const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// Rigid transform from the camera frame to the robot reference frame with the quality of the
/// calibration that produced it. Read only once loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraExtrinsics {
    transform: Isometry3<f64>,
    reprojection_error_px: f64,
    alignment_rms_m: f64,
    frames: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtrinsicsJson {
    /// Row major
    rotation: [[f64; 3]; 3],
    translation: [f64; 3],
    reprojection_error_px: f64,
    #[serde(default)]
    alignment_rms_m: f64,
    #[serde(default)]
    frames: usize,
}

impl CameraExtrinsics {
    pub fn new(transform: Isometry3<f64>, reprojection_error_px: f64, alignment_rms_m: f64, frames: usize) -> Self {
        CameraExtrinsics {
            transform,
            reprojection_error_px,
            alignment_rms_m,
            frames,
        }
    }

    /// Camera frame coincides with the robot frame. Useful for tests and bench setups.
    pub fn identity() -> Self {
        Self::new(Isometry3::identity(), 0.0, 0.0, 0)
    }

    /// Maps camera frame coordinates into the robot reference frame.
    pub fn transform(&self) -> &Isometry3<f64> {
        &self.transform
    }

    pub fn reprojection_error_px(&self) -> f64 {
        self.reprojection_error_px
    }

    pub fn alignment_rms_m(&self) -> f64 {
        self.alignment_rms_m
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn to_json(&self) -> Result<String, ParameterError> {
        let m = self.transform.rotation.to_rotation_matrix().into_inner();
        let t = self.transform.translation.vector;
        let json = ExtrinsicsJson {
            rotation: [
                [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
                [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
                [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
            ],
            translation: [t.x, t.y, t.z],
            reprojection_error_px: self.reprojection_error_px,
            alignment_rms_m: self.alignment_rms_m,
            frames: self.frames,
        };
        Ok(serde_json::to_string_pretty(&json)?)
    }

    /// Parses and validates: all values finite, the rotation orthonormal and right handed.
    pub fn from_json(json: &str) -> Result<Self, ParameterError> {
        let data: ExtrinsicsJson = serde_json::from_str(json)?;
        let r = data.rotation;
        let m = Matrix3::new(
            r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
        );
        if m.iter().chain(data.translation.iter()).any(|v| !v.is_finite()) {
            return Err(ParameterError::NotFinite("extrinsics".into()));
        }
        crate::parameter_error::require_finite("reprojection_error_px", data.reprojection_error_px)?;

        let deviation = (m * m.transpose() - Matrix3::identity()).abs().max();
        if deviation > ORTHONORMAL_TOLERANCE || m.determinant() < 0.0 {
            return Err(ParameterError::NotOrthonormal(deviation));
        }

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m));
        let translation = Translation3::from(Vector3::from(data.translation));
        Ok(Self::new(
            Isometry3::from_parts(translation, rotation),
            data.reprojection_error_px,
            data.alignment_rms_m,
            data.frames,
        ))
    }

    pub fn save(&self, path: &Path) -> Result<(), ParameterError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ParameterError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Point3;

    #[test]
    fn test_extrinsics_serialization() {
        let transform = Isometry3::from_parts(
            Translation3::new(0.4, -0.1, 1.2),
            UnitQuaternion::from_euler_angles(-2.0, 0.1, 0.7),
        );
        let original = CameraExtrinsics::new(transform, 0.42, 0.0015, 12);

        let json = original.to_json().unwrap();
        let loaded = CameraExtrinsics::from_json(&json).unwrap();

        let test_point = Point3::new(1.0, 3.0, 9.0);
        assert_abs_diff_eq!(
            original.transform() * test_point,
            loaded.transform() * test_point,
            epsilon = 1e-9
        );
        assert_eq!(loaded.reprojection_error_px(), 0.42);
        assert_eq!(loaded.frames(), 12);
    }

    #[test]
    fn test_non_orthonormal_rotation_rejected() {
        let json = r#"{
            "rotation": [[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 1.0]],
            "translation": [0.0, 0.0, 0.0],
            "reprojection_error_px": 0.3
        }"#;
        assert!(matches!(
            CameraExtrinsics::from_json(json),
            Err(ParameterError::NotOrthonormal(_))
        ));

        let mirror = json.replace("2.0", "-1.0");
        assert!(CameraExtrinsics::from_json(&mirror).is_err());
    }

    #[test]
    fn test_missing_error_metric_rejected() {
        let json = r#"{
            "rotation": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            "translation": [0.0, 0.0, 0.0]
        }"#;
        assert!(CameraExtrinsics::from_json(json).is_err());
    }
}
