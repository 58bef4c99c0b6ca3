use std::f64::consts::PI;

use crate::joints::{JOINT_COUNT, JointId};
use crate::parameter_error::ParameterError;

/// Values this close outside a limit are still accepted (and clamped) as numerical noise.
pub const LIMIT_TOLERANCE: f64 = 1e-9;

/// Documented [min, max] range of every joint, indexed by [JointId::index].
/// For base joints the range bounds a single increment.
#[derive(Debug, Clone, PartialEq)]
pub struct JointLimits {
    /// Lower limit
    pub from: [f64; JOINT_COUNT],

    /// Upper limit
    pub to: [f64; JOINT_COUNT],
}

impl Default for JointLimits {
    /// Limits of the calibrated URDF: lift and telescoping arm travel, wrist yaw
    /// -100.27 .. 229.18 deg, pitch -89.95 .. 32.09 deg, roll about half a turn either way.
    fn default() -> Self {
        JointLimits {
            from: [0.01, 0.0, -1.75, -1.57, -3.14, 0.0, -1.0, -PI],
            to: [1.09, 0.52, 4.0, 0.56, 3.14, 1.0, 1.0, PI],
        }
    }
}

impl JointLimits {
    pub fn new(from: [f64; JOINT_COUNT], to: [f64; JOINT_COUNT]) -> Result<Self, ParameterError> {
        for joint in JointId::ALL {
            let (lo, hi) = (from[joint.index()], to[joint.index()]);
            if !lo.is_finite() || !hi.is_finite() {
                return Err(ParameterError::NotFinite(format!("limits of {}", joint)));
            }
            if lo > hi {
                return Err(ParameterError::InvalidConfiguration(format!(
                    "lower limit {} of {} exceeds upper limit {}",
                    lo, joint, hi
                )));
            }
        }
        Ok(JointLimits { from, to })
    }

    pub fn range(&self, joint: JointId) -> (f64, f64) {
        (self.from[joint.index()], self.to[joint.index()])
    }

    /// Replaces the range of a single joint.
    pub fn with_range(mut self, joint: JointId, from: f64, to: f64) -> Result<Self, ParameterError> {
        self.from[joint.index()] = from;
        self.to[joint.index()] = to;
        Self::new(self.from, self.to)
    }

    pub fn contains(&self, joint: JointId, value: f64) -> bool {
        let (lo, hi) = self.range(joint);
        value >= lo - LIMIT_TOLERANCE && value <= hi + LIMIT_TOLERANCE
    }

    pub fn check(&self, joint: JointId, value: f64) -> Result<(), ParameterError> {
        if self.contains(joint, value) {
            Ok(())
        } else {
            let (lo, hi) = self.range(joint);
            Err(ParameterError::OutOfRange {
                field: joint.name().to_string(),
                value,
                min: lo,
                max: hi,
            })
        }
    }

    pub fn clamp(&self, joint: JointId, value: f64) -> f64 {
        let (lo, hi) = self.range(joint);
        value.clamp(lo, hi)
    }

    /// Finds the admissible value for a joint target. For wrapping joints, full turns are added
    /// or removed so that the result lies within limits and is closest to `current`. Returns None
    /// if no admissible equivalent exists. Never returns a clipped target.
    pub fn admissible(&self, joint: JointId, target: f64, current: f64) -> Option<f64> {
        if !target.is_finite() {
            return None;
        }
        if !joint.wraps() {
            return self.contains(joint, target).then(|| self.clamp(joint, target));
        }
        let two_pi = 2.0 * PI;
        let nearest = target + two_pi * ((current - target) / two_pi).round();
        [nearest, nearest - two_pi, nearest + two_pi, nearest - 2.0 * two_pi, nearest + 2.0 * two_pi]
            .into_iter()
            .filter(|&c| self.contains(joint, c))
            .min_by(|a, b| (a - current).abs().total_cmp(&(b - current).abs()))
            .map(|c| self.clamp(joint, c))
    }

    /// Center of the range, used where no previous value exists.
    pub fn center(&self, joint: JointId) -> f64 {
        let (lo, hi) = self.range(joint);
        0.5 * (lo + hi)
    }
}
