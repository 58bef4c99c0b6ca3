//! Defines the geometric parameters of the manipulator chain

use serde::{Deserialize, Serialize};

use crate::utils::deg;

/// Geometry of the chain base → lift → telescoping arm → wrist yaw → wrist pitch → wrist roll →
/// pinch point. All lengths in meters, expressed in the base frame (x forward, y left, z up) with
/// every joint at zero. See [parameters_robots.rs](parameters_robots.rs) for the concrete robot.
///
/// With all joints at zero the wrist yaw axis is vertical and passes through
/// `(mast_x, mast_y - arm_y0)`, at height `lift_z0`. The lift raises it along z, the arm extends it
/// along -y.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default = "Parameters::stretch", deny_unknown_fields)]
pub struct Parameters {
    /// x coordinate of the plane in which the arm extends.
    pub mast_x: f64,

    /// y coordinate of the lift mast.
    pub mast_y: f64,

    /// Height of the wrist yaw bracket when the lift is at zero.
    pub lift_z0: f64,

    /// Distance from the mast to the wrist yaw axis with the arm fully retracted.
    pub arm_y0: f64,

    /// Horizontal distance from the yaw axis to the pitch axis, along the gripper heading.
    pub yaw_to_pitch: f64,

    /// Vertical distance from the yaw bracket to the pitch axis (negative is below).
    pub yaw_to_pitch_z: f64,

    /// Distance from the pitch axis to the pinch point between the fingertips, along the
    /// gripper axis. Wrist roll turns about this axis and does not move the pinch point.
    pub pitch_to_pinch: f64,

    /// Heading of the gripper axis in the base frame when wrist yaw is zero (radians).
    pub yaw_mount: f64,
}

impl Parameters {
    /// Convert to string yaml representation (quick viewing, etc).
    pub fn to_yaml(&self) -> String {
        format!(
            "chain:\n  \
              mast_x: {}\n  \
              mast_y: {}\n  \
              lift_z0: {}\n  \
              arm_y0: {}\n  \
              yaw_to_pitch: {}\n  \
              yaw_to_pitch_z: {}\n  \
              pitch_to_pinch: {}\n  \
              yaw_mount: {}\n",
            self.mast_x,
            self.mast_y,
            self.lift_z0,
            self.arm_y0,
            self.yaw_to_pitch,
            self.yaw_to_pitch_z,
            self.pitch_to_pinch,
            deg(&self.yaw_mount),
        )
    }

    /// Every length must be a finite number; the arm must point away from the mast.
    pub(crate) fn validate(&self) -> Result<(), crate::parameter_error::ParameterError> {
        use crate::parameter_error::{ParameterError, require_finite};
        for (name, value) in [
            ("chain.mast_x", self.mast_x),
            ("chain.mast_y", self.mast_y),
            ("chain.lift_z0", self.lift_z0),
            ("chain.arm_y0", self.arm_y0),
            ("chain.yaw_to_pitch", self.yaw_to_pitch),
            ("chain.yaw_to_pitch_z", self.yaw_to_pitch_z),
            ("chain.pitch_to_pinch", self.pitch_to_pinch),
            ("chain.yaw_mount", self.yaw_mount),
        ] {
            require_finite(name, value)?;
        }
        if self.arm_y0 < 0.0 {
            return Err(ParameterError::InvalidConfiguration(
                "chain.arm_y0 must not be negative".into(),
            ));
        }
        Ok(())
    }
}
