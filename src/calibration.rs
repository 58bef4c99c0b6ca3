//! Camera extrinsic calibration from a board of markers at known places on the robot.
//!
//! The board is a set of markers whose poses in the robot reference frame are measured once
//! (a YAML file). Every frame in which board markers are detected contributes their four
//! corners twice: in the camera frame (from the single marker pose) and in the robot frame
//! (from the board description). The extrinsics are the rigid transform that best aligns the
//! first set to the second. Its quality is the pixel reprojection error of the board corners
//! through the found transform.

use std::collections::BTreeMap;
use std::path::Path;

use image::GrayImage;
use nalgebra::{Isometry3, Point2, Point3, Translation3, UnitQuaternion, Vector3};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::computer_vision::detection::{DecodedMarker, MarkerDetector};
use crate::computer_vision::find_transform::{alignment_rms, find_rigid_transform};
use crate::computer_vision::pose_estimation::{
    CameraIntrinsics, estimate_marker_pose, marker_object_corners, reprojection_rms,
};
use crate::computer_vision::transform_io::CameraExtrinsics;
use crate::errors::TeleopError;
use crate::parameter_error::{ParameterError, require_finite};
use crate::parameters_from_file::from_yaml_str;

/// Markers of known size at measured poses in the robot reference frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBoard {
    marker_size: f64,
    markers: BTreeMap<u32, Isometry3<f64>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BoardYaml {
    marker_size: f64,
    markers: Vec<BoardMarkerYaml>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BoardMarkerYaml {
    id: u32,
    translation: [f64; 3],
    /// Roll, pitch, yaw
    #[serde(default)]
    rotation: [f64; 3],
}

impl CalibrationBoard {
    pub fn new(marker_size: f64, markers: BTreeMap<u32, Isometry3<f64>>) -> Result<Self, ParameterError> {
        if !(marker_size.is_finite() && marker_size > 0.0) {
            return Err(ParameterError::OutOfRange {
                field: "marker_size".into(),
                value: marker_size,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        if markers.is_empty() {
            return Err(ParameterError::MissingField("markers".into()));
        }
        Ok(CalibrationBoard { marker_size, markers })
    }

    /// Reads the board from YAML like
    /// ```yaml
    /// marker_size: 0.08
    /// markers:
    ///   - id: 10
    ///     translation: [0.35, 0.0, 0.0]
    ///     rotation: [0.0, 0.0, deg(90)]
    ///   - id: 11
    ///     translation: [0.35, 0.2, 0.0]
    /// ```
    /// Translations in meters, rotations as roll, pitch, yaw (radians or `deg(...)`).
    pub fn from_yaml(yaml: &str) -> Result<Self, ParameterError> {
        let root: BoardYaml = from_yaml_str(yaml)?;
        let mut markers = BTreeMap::new();
        for marker in root.markers {
            for value in marker.translation.iter().chain(marker.rotation.iter()) {
                crate::parameter_error::require_finite("board marker pose", *value)?;
            }
            let [roll, pitch, yaw] = marker.rotation;
            let pose = Isometry3::from_parts(
                Translation3::from(Vector3::from(marker.translation)),
                UnitQuaternion::from_euler_angles(roll, pitch, yaw),
            );
            if markers.insert(marker.id, pose).is_some() {
                return Err(ParameterError::InvalidConfiguration(format!(
                    "marker {} appears twice on the board",
                    marker.id
                )));
            }
        }
        Self::new(root.marker_size, markers)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ParameterError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn marker_size(&self) -> f64 {
        self.marker_size
    }

    pub fn contains(&self, id: u32) -> bool {
        self.markers.contains_key(&id)
    }

    /// Corners of the marker in the robot reference frame.
    pub fn world_corners(&self, id: u32) -> Option<[Point3<f64>; 4]> {
        let pose = self.markers.get(&id)?;
        Some(marker_object_corners(self.marker_size).map(|c| pose * c))
    }
}

/// One board corner seen in one frame.
#[derive(Debug, Clone, Copy)]
struct Correspondence {
    camera: Point3<f64>,
    world: Point3<f64>,
    pixel: Point2<f64>,
}

/// Accumulates board observations over frames and solves the extrinsics.
pub struct CalibrationEngine {
    board: CalibrationBoard,
    intrinsics: CameraIntrinsics,
    max_reprojection_error_px: f64,
    correspondences: Vec<Correspondence>,
    frames: usize,
}

impl CalibrationEngine {
    pub fn new(
        board: CalibrationBoard,
        intrinsics: CameraIntrinsics,
        max_reprojection_error_px: f64,
    ) -> Result<Self, ParameterError> {
        Ok(CalibrationEngine {
            board,
            intrinsics,
            max_reprojection_error_px: check_threshold(max_reprojection_error_px)?,
            correspondences: Vec::new(),
            frames: 0,
        })
    }

    /// Adds the decoded markers of one frame. Markers not on the board are ignored.
    /// Returns the number of board markers used.
    pub fn add_frame(&mut self, markers: &[DecodedMarker]) -> usize {
        let mut used = 0;
        for marker in markers {
            let Some(world) = self.board.world_corners(marker.id) else {
                continue;
            };
            let pose = match estimate_marker_pose(&marker.corners, self.board.marker_size, &self.intrinsics) {
                Ok(pose) => pose,
                Err(e) => {
                    debug!("board marker {} skipped: {}", marker.id, e);
                    continue;
                }
            };
            let camera = marker_object_corners(self.board.marker_size).map(|c| pose * c);
            for k in 0..4 {
                self.correspondences.push(Correspondence {
                    camera: camera[k],
                    world: world[k],
                    pixel: marker.corners[k],
                });
            }
            used += 1;
        }
        if used > 0 {
            self.frames += 1;
        }
        used
    }

    /// Detects the board in the image and adds it.
    pub fn observe(&mut self, detector: &MarkerDetector, image: &GrayImage) -> usize {
        let markers = detector.find_markers(image);
        let used = self.add_frame(&markers);
        debug!("frame {}: {} of {} markers on the board", self.frames, used, markers.len());
        used
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Least squares extrinsics. Fails if nothing usable was observed, or if the reprojection
    /// error exceeds the configured limit: then calibration must be redone.
    pub fn solve(&self) -> Result<CameraExtrinsics, TeleopError> {
        if self.correspondences.is_empty() {
            return Err(TeleopError::CalibrationUnsolvable(
                "no board markers were observed".into(),
            ));
        }
        let camera: Vec<Point3<f64>> = self.correspondences.iter().map(|c| c.camera).collect();
        let world: Vec<Point3<f64>> = self.correspondences.iter().map(|c| c.world).collect();

        let robot_from_camera = find_rigid_transform(&camera, &world)
            .map_err(|e| TeleopError::CalibrationUnsolvable(e.to_string()))?;
        let camera_from_robot = robot_from_camera.inverse();

        let projected: Vec<(Point3<f64>, Point2<f64>)> = self
            .correspondences
            .iter()
            .map(|c| (camera_from_robot * c.world, c.pixel))
            .collect();
        let error_px = reprojection_rms(&self.intrinsics, &projected).ok_or_else(|| {
            TeleopError::CalibrationUnsolvable("board corners fall behind the camera".into())
        })?;
        let rms_m = alignment_rms(&robot_from_camera, &camera, &world);

        if error_px > self.max_reprojection_error_px {
            error!(
                "calibration rejected: {:.3} px over {} frames (limit {:.3} px)",
                error_px, self.frames, self.max_reprojection_error_px
            );
            return Err(TeleopError::CalibrationRejected {
                error_px,
                threshold_px: self.max_reprojection_error_px,
            });
        }
        info!(
            "calibration accepted: {:.3} px, {:.4} m over {} frames",
            error_px, rms_m, self.frames
        );
        Ok(CameraExtrinsics::new(robot_from_camera, error_px, rms_m, self.frames))
    }
}

/// Loads persisted extrinsics for a session. A missing file, an invalid one or one whose error
/// exceeds the limit prevents the session from starting.
pub fn load_extrinsics(path: &Path, max_reprojection_error_px: f64) -> Result<CameraExtrinsics, TeleopError> {
    check_threshold(max_reprojection_error_px)?;
    let extrinsics = CameraExtrinsics::load(path).inspect_err(|e| {
        error!("cannot load calibration from {}: {}", path.display(), e);
    })?;
    if extrinsics.reprojection_error_px() > max_reprojection_error_px {
        error!(
            "calibration in {} has error {:.3} px (limit {:.3} px)",
            path.display(),
            extrinsics.reprojection_error_px(),
            max_reprojection_error_px
        );
        return Err(TeleopError::CalibrationRejected {
            error_px: extrinsics.reprojection_error_px(),
            threshold_px: max_reprojection_error_px,
        });
    }
    Ok(extrinsics)
}

/// A NaN limit would accept any error.
fn check_threshold(max_reprojection_error_px: f64) -> Result<f64, ParameterError> {
    let threshold = require_finite("max_reprojection_error_px", max_reprojection_error_px)?;
    if threshold <= 0.0 {
        return Err(ParameterError::OutOfRange {
            field: "max_reprojection_error_px".into(),
            value: threshold,
            min: 0.0,
            max: f64::INFINITY,
        });
    }
    Ok(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &str = r#"
marker_size: 0.06
markers:
  - id: 3
    translation: [0.4, 0.1, 0.0]
  - id: 5
    translation: [0.4, -0.1, 0.0]
    rotation: [0.0, 0.0, deg(90)]
"#;

    #[test]
    fn test_board_from_yaml() {
        let board = CalibrationBoard::from_yaml(BOARD).unwrap();
        assert_eq!(board.marker_size(), 0.06);
        assert!(board.contains(3) && board.contains(5) && !board.contains(4));

        // Marker 5 is turned a quarter turn: its top left corner lies towards -x, -y.
        let corners = board.world_corners(5).unwrap();
        assert!((corners[0].x - 0.37).abs() < 1e-12);
        assert!((corners[0].y - -0.13).abs() < 1e-12);
    }

    #[test]
    fn test_board_rejects_duplicates_and_unknown_fields() {
        let duplicate = "marker_size: 0.06\nmarkers:\n  - id: 1\n    translation: [0.0, 0.0, 0.0]\n  - id: 1\n    translation: [1.0, 0.0, 0.0]\n";
        assert!(CalibrationBoard::from_yaml(duplicate).is_err());
        let unknown = "marker_size: 0.06\ncolour: red\nmarkers:\n  - id: 1\n    translation: [0.0, 0.0, 0.0]\n";
        assert!(CalibrationBoard::from_yaml(unknown).is_err());
        let empty = "marker_size: 0.06\nmarkers: []\n";
        assert!(CalibrationBoard::from_yaml(empty).is_err());
    }

    #[test]
    fn test_nothing_observed_is_unsolvable() {
        let board = CalibrationBoard::from_yaml(BOARD).unwrap();
        let engine = CalibrationEngine::new(board, CameraIntrinsics::default(), 1.0).unwrap();
        assert!(matches!(engine.solve(), Err(TeleopError::CalibrationUnsolvable(_))));
    }

    #[test]
    fn test_unusable_error_limit_is_rejected() {
        let board = CalibrationBoard::from_yaml(BOARD).unwrap();
        let intrinsics = CameraIntrinsics::default();
        assert!(matches!(
            CalibrationEngine::new(board.clone(), intrinsics, f64::NAN),
            Err(ParameterError::NotFinite(_))
        ));
        for limit in [-1.0, 0.0] {
            assert!(matches!(
                CalibrationEngine::new(board.clone(), intrinsics, limit),
                Err(ParameterError::OutOfRange { .. })
            ));
        }
        assert!(matches!(
            load_extrinsics(Path::new("does/not/matter.json"), f64::NAN),
            Err(TeleopError::Configuration(ParameterError::NotFinite(_)))
        ));
    }
}
