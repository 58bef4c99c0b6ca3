//! Hardcoded chain parameters

use crate::parameters::Parameters;
use std::f64::consts::PI;

impl Parameters {
    /// All offsets zero, arm pointing along -y.
    pub fn new() -> Self {
        Parameters {
            mast_x: 0.0,
            mast_y: 0.0,
            lift_z0: 0.0,
            arm_y0: 0.0,
            yaw_to_pitch: 0.0,
            yaw_to_pitch_z: 0.0,
            pitch_to_pinch: 0.0,
            yaw_mount: -PI / 2.0,
        }
    }

    /// Stretch 3 with the dexterous wrist. Arm telescopes towards -y, the mast stands
    /// slightly behind the wheel axis.
    pub fn stretch() -> Self {
        Parameters {
            mast_x: -0.07,
            mast_y: -0.135,
            lift_z0: 0.19,
            arm_y0: 0.115,
            yaw_to_pitch: 0.02,
            yaw_to_pitch_z: -0.06,
            pitch_to_pinch: 0.21,
            ..Self::new()
        }
    }

    /// Wrist without offsets: the pinch point sits on the yaw axis. Handy for checking
    /// positions by hand.
    pub fn point_wrist() -> Self {
        Parameters {
            mast_x: 0.0,
            mast_y: 0.0,
            lift_z0: 0.0,
            arm_y0: 0.1,
            ..Self::new()
        }
    }
}
