//! Closed-form inverse and forward kinematics of the lift / telescoping arm / three-axis wrist chain
//! on a mobile base.
//!
//! The gripper orientation is `Rz(heading) * Ry(-pitch) * Rx(roll)` where the heading is
//! `yaw_mount + wrist_yaw` (plus the base rotation in rotary mode). All three z rotations commute,
//! so the pinch point offset from the yaw axis depends on the goal orientation only. The inverse
//! therefore decouples: orientation gives heading, pitch and roll, the wrist yaw axis position
//! follows by subtracting the offset, and lift, arm and the base increment follow from that
//! position. Wrist yaw is what remains of the heading after the base. No iteration is involved.

use nalgebra::{Matrix3, Translation3, UnitQuaternion, Vector3};
use std::f64::consts::PI;

use crate::constraints::JointLimits;
use crate::joints::{BaseMode, JointConfiguration, JointId};
use crate::kinematic_traits::{IkResult, Kinematics, Pose};
use crate::parameters::Parameters;
use crate::utils::{normalize_angle, pose_distance};

/// Below this, cos(pitch) is treated as zero and heading and roll are no longer separable.
const SINGULARITY_THRESHOLD: f64 = 1e-6;

/// Every solution is checked with forward kinematics against these tolerances.
const FK_DISTANCE_TOLERANCE: f64 = 1e-6;
const FK_ANGULAR_TOLERANCE: f64 = 1e-6;

/// Weights of [transition_costs]: moving the base is the most expensive.
const TRANSITION_COEFFICIENTS: [f64; 7] = [1.0, 1.0, 0.3, 0.3, 0.3, 0.0, 3.0];

#[derive(Debug, Clone)]
pub struct StretchKinematics {
    parameters: Parameters,
    limits: JointLimits,
    mode: BaseMode,
}

/// Gripper orientation split into heading, pitch joint value and roll joint value.
#[derive(Debug, Clone, Copy)]
struct WristAngles {
    heading: f64,
    pitch: f64,
    roll: f64,
}

impl StretchKinematics {
    /// Creates a new `StretchKinematics` instance with the given parameters.
    pub fn new(parameters: Parameters, limits: JointLimits, mode: BaseMode) -> Self {
        StretchKinematics {
            parameters,
            limits,
            mode,
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    pub fn mode(&self) -> BaseMode {
        self.mode
    }

    /// Offset from the wrist yaw axis (at bracket height) to the pinch point.
    fn pinch_offset(&self, heading: f64, pitch: f64) -> Vector3<f64> {
        let p = &self.parameters;
        let (sp, cp) = pitch.sin_cos();
        let (sh, ch) = heading.sin_cos();
        let horizontal = p.yaw_to_pitch + p.pitch_to_pinch * cp;
        let vertical = p.yaw_to_pitch_z + p.pitch_to_pinch * sp;
        Vector3::new(horizontal * ch, horizontal * sh, vertical)
    }

    /// Both Euler triplets that produce the rotation. Near the pitch singularity the current
    /// heading is kept and the whole rotation about the vertical goes into roll.
    fn wrist_candidates(&self, rotation: &Matrix3<f64>, current_heading: f64) -> [WristAngles; 2] {
        let r11 = rotation[(0, 0)];
        let r21 = rotation[(1, 0)];
        let r31 = rotation[(2, 0)];
        let cos_beta = r11.hypot(r21);

        if cos_beta > SINGULARITY_THRESHOLD {
            let beta = f64::atan2(-r31, cos_beta);
            let heading = f64::atan2(r21, r11);
            let roll = f64::atan2(rotation[(2, 1)], rotation[(2, 2)]);
            [
                WristAngles { heading, pitch: -beta, roll },
                WristAngles {
                    heading: heading + PI,
                    pitch: -(PI - beta),
                    roll: roll + PI,
                },
            ]
        } else {
            let r12 = rotation[(0, 1)];
            let r22 = rotation[(1, 1)];
            let heading = current_heading;
            let angles = if r31 < 0.0 {
                // Gripper axis points straight down: roll - heading is observable
                WristAngles {
                    heading,
                    pitch: -PI / 2.0,
                    roll: f64::atan2(r12, r22) + heading,
                }
            } else {
                // Straight up: roll + heading is observable
                WristAngles {
                    heading,
                    pitch: PI / 2.0,
                    roll: f64::atan2(-r12, r22) - heading,
                }
            };
            [angles, angles]
        }
    }

    /// Lift, arm and base increment placing the wrist yaw axis at `wrist`, or None if the point
    /// is off the reachable envelope. Rotary bases can reach a point two ways.
    fn position_candidates(&self, wrist: &Vector3<f64>) -> [Option<(f64, f64, f64)>; 2] {
        let p = &self.parameters;
        let lift = wrist.z - p.lift_z0;
        let retracted = p.mast_y - p.arm_y0;
        match self.mode {
            BaseMode::Prismatic => {
                let base = wrist.x - p.mast_x;
                let arm = retracted - wrist.y;
                [Some((lift, arm, base)), None]
            }
            BaseMode::Rotary => {
                let r2 = wrist.x * wrist.x + wrist.y * wrist.y;
                let d2 = r2 - p.mast_x * p.mast_x;
                if d2 < 0.0 {
                    return [None, None];
                }
                let d = d2.sqrt();
                let bearing = f64::atan2(wrist.y, wrist.x);
                let solve = |u: f64| {
                    let arm = retracted - u;
                    let theta = normalize_angle(bearing - f64::atan2(u, p.mast_x));
                    Some((lift, arm, theta))
                };
                [solve(-d), solve(d)]
            }
        }
    }

    /// Gripper heading in the base frame (radians), including base rotation in rotary mode.
    pub fn heading(&self, joints: &JointConfiguration) -> f64 {
        let base_rotation = match self.mode {
            BaseMode::Rotary => joints.base(),
            BaseMode::Prismatic => 0.0,
        };
        self.parameters.yaw_mount + joints.arm(JointId::WristYaw) + base_rotation
    }

    fn unreachable(&self, pose: &Pose, current: &JointConfiguration) -> IkResult {
        let (residual, angular_residual) = pose_distance(pose, &self.forward(&current.without_base_motion()));
        IkResult {
            configuration: *current,
            reachable: false,
            residual,
            angular_residual,
        }
    }
}

/// Weighted joint travel from one configuration to another.
fn transition_costs(from: &JointConfiguration, to: &JointConfiguration) -> f64 {
    from.values()
        .iter()
        .zip(to.values().iter())
        .zip(TRANSITION_COEFFICIENTS.iter())
        .enumerate()
        .map(|(slot, ((a, b), k))| {
            // The base slot of `from` holds the previous increment, not a position
            let a = if slot == 6 { 0.0 } else { *a };
            (a - b).abs() * k
        })
        .sum()
}

impl Kinematics for StretchKinematics {
    fn inverse(&self, pose: &Pose, current: &JointConfiguration) -> IkResult {
        let rotation = pose.rotation.to_rotation_matrix();
        let limits = &self.limits;
        let current_heading = self.parameters.yaw_mount + current.arm(JointId::WristYaw);

        let mut best: Option<(f64, JointConfiguration)> = None;
        for wrist in self.wrist_candidates(rotation.matrix(), current_heading) {
            let Some(pitch) = limits.admissible(JointId::WristPitch, wrist.pitch, current.arm(JointId::WristPitch))
            else {
                continue;
            };
            let Some(roll) = limits.admissible(JointId::WristRoll, wrist.roll, current.arm(JointId::WristRoll))
            else {
                continue;
            };
            let yaw_axis = pose.translation.vector - self.pinch_offset(wrist.heading, wrist.pitch);

            for (lift, arm, base) in self.position_candidates(&yaw_axis).into_iter().flatten() {
                let base_joint = self.mode.base_joint();
                let solved = (|| {
                    let lift = limits.admissible(JointId::Lift, lift, current.arm(JointId::Lift))?;
                    let arm = limits.admissible(JointId::ArmExtension, arm, current.arm(JointId::ArmExtension))?;
                    let base = limits.admissible(base_joint, base, 0.0)?;
                    let base_rotation = if self.mode == BaseMode::Rotary { base } else { 0.0 };
                    let yaw = limits.admissible(
                        JointId::WristYaw,
                        wrist.heading - self.parameters.yaw_mount - base_rotation,
                        current.arm(JointId::WristYaw),
                    )?;
                    let gripper = current.arm(JointId::Gripper);
                    Some([lift, arm, yaw, pitch, roll, gripper, base])
                })();
                let Some(values) = solved else { continue };

                let mut candidate = JointConfiguration::zeros(self.mode);
                for (joint, value) in self.mode.allowed_joints().into_iter().zip(values) {
                    candidate.set_unchecked(joint, value);
                }

                // Cross-check with forward kinematics
                let (distance, angle) = pose_distance(pose, &self.forward(&candidate));
                if distance > FK_DISTANCE_TOLERANCE || angle > FK_ANGULAR_TOLERANCE {
                    continue;
                }

                let cost = transition_costs(current, &candidate);
                if best.as_ref().is_none_or(|(c, _)| cost < *c) {
                    best = Some((cost, candidate));
                }
            }
        }

        match best {
            Some((_, configuration)) => {
                let (residual, angular_residual) = pose_distance(pose, &self.forward(&configuration));
                IkResult {
                    configuration,
                    reachable: true,
                    residual,
                    angular_residual,
                }
            }
            None => self.unreachable(pose, current),
        }
    }

    fn forward(&self, joints: &JointConfiguration) -> Pose {
        let p = &self.parameters;
        let lift = joints.arm(JointId::Lift);
        let arm = joints.arm(JointId::ArmExtension);
        let pitch = joints.arm(JointId::WristPitch);
        let roll = joints.arm(JointId::WristRoll);

        let (base_x, base_theta) = match self.mode {
            BaseMode::Prismatic => (joints.base(), 0.0),
            BaseMode::Rotary => (0.0, joints.base()),
        };

        // Everything below is in the frame of the base after its increment.
        let local_heading = p.yaw_mount + joints.arm(JointId::WristYaw);
        let yaw_axis = Vector3::new(p.mast_x, p.mast_y - p.arm_y0 - arm, p.lift_z0 + lift);
        let pinch = yaw_axis + self.pinch_offset(local_heading, pitch);
        let orientation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), local_heading)
            * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -pitch)
            * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), roll);

        let base = Pose::from_parts(
            Translation3::new(base_x, 0.0, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), base_theta),
        );
        base * Pose::from_parts(Translation3::from(pinch), orientation)
    }
}
