//! Helper functions

use nalgebra::{Isometry3, UnitQuaternion};
use std::f64::consts::PI;

/// Wraps the angle into (-π, π].
pub fn normalize_angle(a: f64) -> f64 {
    let x = a.rem_euclid(2.0 * PI);
    if x > PI { x - 2.0 * PI } else { x }
}

/// Signed shortest rotation from `from` to `to`.
pub fn angle_difference(from: f64, to: f64) -> f64 {
    normalize_angle(to - from)
}

/// Translation distance and rotation angle between two poses.
pub fn pose_distance(a: &Isometry3<f64>, b: &Isometry3<f64>) -> (f64, f64) {
    let translation = (a.translation.vector - b.translation.vector).norm();
    let mut angle = a.rotation.angle_to(&b.rotation);
    // angle_to may produce NaN on tiny numerical drift near identity
    if angle.is_nan() {
        angle = 0.0;
    }
    (translation, angle)
}

pub fn dump_pose(isometry: &Isometry3<f64>) {
    // Extract translation components
    let translation = isometry.translation.vector;
    let rotation: UnitQuaternion<f64> = isometry.rotation;
    let (roll, pitch, yaw) = rotation.euler_angles();

    println!(
        "x: {:.5}, y: {:.5}, z: {:.5},  rpy: {:.2},{:.2},{:.2} deg",
        translation.x,
        translation.y,
        translation.z,
        roll.to_degrees(),
        pitch.to_degrees(),
        yaw.to_degrees()
    );
}

/// formatting for YAML output
pub(crate) fn deg(x: &f64) -> String {
    if *x == 0.0 {
        return "0".to_string();
    }
    format!("deg({:.4})", x.to_degrees())
}
