//! Kinematics interface of the manipulator

use nalgebra::Isometry3;

use crate::joints::JointConfiguration;

/// Pose is used as a pose of the pinch point. It contains both Cartesian position and rotation quaternion
/// ```
/// extern crate nalgebra as na;
/// use na::{Isometry3, Translation3, UnitQuaternion, Vector3};
///
/// type Pose = Isometry3<f64>;
///
/// let translation = Translation3::new(0.1, -0.4, 0.7);
/// // Gripper axis pointing forward, tilted 30 degrees down
/// let rotation = UnitQuaternion::from_euler_angles(0.0, 30_f64.to_radians(), 0.0);
/// let transform = Pose::from_parts(translation, rotation);
/// ```
pub type Pose = Isometry3<f64>;

/// Outcome of the inverse kinematics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IkResult {
    /// Joint targets if reachable, otherwise the unchanged current configuration.
    pub configuration: JointConfiguration,

    /// False if any joint would need to leave its limits to reach the goal.
    pub reachable: bool,

    /// Distance in meters between the goal and the pinch point of `configuration`.
    pub residual: f64,

    /// Rotation angle in radians between the goal and the gripper orientation of `configuration`.
    pub angular_residual: f64,
}

pub trait Kinematics {
    /// Joint targets for the pinch point pose, expressed in the current base frame. The gripper
    /// value is carried over from `current`; the base joint receives the increment the base must
    /// travel. Wrapping joints take the shortest path from `current`.
    fn inverse(&self, pose: &Pose, current: &JointConfiguration) -> IkResult;

    /// Pinch point pose for the joint values, with the base increment applied.
    fn forward(&self, joints: &JointConfiguration) -> Pose;
}
