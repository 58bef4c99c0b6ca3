//! Closed set of joint identifiers and the per-tick joint configuration.
//!
//! The manipulator exposes six joints that are always present (lift, arm extension, the three
//! wrist joints and the gripper) and one base joint that depends on the session's base mode.
//! Base joints carry increments ("translate by", "rotate by") rather than absolute positions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constraints::JointLimits;
use crate::parameter_error::ParameterError;

/// Identifier of a commanded joint. Names match those used by the actuator and by recorded sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JointId {
    #[serde(rename = "joint_lift")]
    Lift,
    #[serde(rename = "joint_arm_l0")]
    ArmExtension,
    #[serde(rename = "joint_wrist_yaw")]
    WristYaw,
    #[serde(rename = "joint_wrist_pitch")]
    WristPitch,
    #[serde(rename = "joint_wrist_roll")]
    WristRoll,
    #[serde(rename = "stretch_gripper")]
    Gripper,
    #[serde(rename = "joint_mobile_base_translate_by")]
    BaseTranslate,
    #[serde(rename = "joint_mobile_base_rotate_by")]
    BaseRotate,
}

/// Number of distinct joint identifiers.
pub const JOINT_COUNT: usize = 8;

/// Joints present in every configuration, regardless of base mode.
pub const ARM_JOINTS: [JointId; 6] = [
    JointId::Lift,
    JointId::ArmExtension,
    JointId::WristYaw,
    JointId::WristPitch,
    JointId::WristRoll,
    JointId::Gripper,
];

impl JointId {
    pub const ALL: [JointId; JOINT_COUNT] = [
        JointId::Lift,
        JointId::ArmExtension,
        JointId::WristYaw,
        JointId::WristPitch,
        JointId::WristRoll,
        JointId::Gripper,
        JointId::BaseTranslate,
        JointId::BaseRotate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JointId::Lift => "joint_lift",
            JointId::ArmExtension => "joint_arm_l0",
            JointId::WristYaw => "joint_wrist_yaw",
            JointId::WristPitch => "joint_wrist_pitch",
            JointId::WristRoll => "joint_wrist_roll",
            JointId::Gripper => "stretch_gripper",
            JointId::BaseTranslate => "joint_mobile_base_translate_by",
            JointId::BaseRotate => "joint_mobile_base_rotate_by",
        }
    }

    /// Position of this joint in per-joint arrays such as [JointLimits].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Revolute joints whose target may be shifted by full turns to stay close to the current value.
    pub fn wraps(&self) -> bool {
        matches!(self, JointId::WristYaw | JointId::WristRoll | JointId::BaseRotate)
    }

    pub fn is_base(&self) -> bool {
        matches!(self, JointId::BaseTranslate | JointId::BaseRotate)
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JointId {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JointId::ALL
            .iter()
            .find(|j| j.name() == s)
            .copied()
            .ok_or_else(|| ParameterError::UnknownJoint(s.to_string()))
    }
}

/// How the mobile base takes part in the motion. Fixed for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseMode {
    /// The base drives forward and backward along its x axis.
    Prismatic,
    /// The base turns in place about its vertical axis.
    Rotary,
}

impl BaseMode {
    /// The single base joint a configuration may contain in this mode.
    pub fn base_joint(&self) -> JointId {
        match self {
            BaseMode::Prismatic => JointId::BaseTranslate,
            BaseMode::Rotary => JointId::BaseRotate,
        }
    }

    pub fn permits(&self, joint: JointId) -> bool {
        !joint.is_base() || joint == self.base_joint()
    }

    /// Joints that may appear in commands of this mode, in emission order.
    pub fn allowed_joints(&self) -> [JointId; 7] {
        let [a, b, c, d, e, f] = ARM_JOINTS;
        [a, b, c, d, e, f, self.base_joint()]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BaseMode::Prismatic => "prismatic",
            BaseMode::Rotary => "rotary",
        }
    }
}

impl fmt::Display for BaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BaseMode {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prismatic" => Ok(BaseMode::Prismatic),
            "rotary" => Ok(BaseMode::Rotary),
            other => Err(ParameterError::ParseError(format!(
                "unknown base mode '{}' (expected prismatic or rotary)",
                other
            ))),
        }
    }
}

/// Slot of the base joint in [JointConfiguration::values].
const BASE_SLOT: usize = 6;

/// Values for the six arm joints plus the one base joint of the session's mode.
/// The identifier of the other base joint can never be stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointConfiguration {
    mode: BaseMode,
    /// Indexed as [BaseMode::allowed_joints].
    values: [f64; 7],
}

impl JointConfiguration {
    /// All joints at zero, no base motion. Zero is not necessarily within limits.
    pub fn zeros(mode: BaseMode) -> Self {
        JointConfiguration { mode, values: [0.0; 7] }
    }

    /// Builds a configuration from values ordered as [BaseMode::allowed_joints],
    /// rejecting non-finite values and values outside the limits.
    pub fn new(mode: BaseMode, values: [f64; 7], limits: &JointLimits) -> Result<Self, ParameterError> {
        let configuration = JointConfiguration { mode, values };
        for (joint, value) in configuration.iter() {
            if !value.is_finite() {
                return Err(ParameterError::NotFinite(joint.name().to_string()));
            }
            limits.check(joint, value)?;
        }
        Ok(configuration)
    }

    /// Builds a configuration from a joint map. All six arm joints must be present and finite.
    /// The base joint of the mode defaults to zero (no base motion); the base joint of the other
    /// mode is dropped. Values outside the limits are clamped into them.
    pub fn from_map(
        mode: BaseMode,
        map: &BTreeMap<JointId, f64>,
        limits: &JointLimits,
    ) -> Result<Self, ParameterError> {
        let mut configuration = JointConfiguration::zeros(mode);
        for joint in mode.allowed_joints() {
            let value = match map.get(&joint) {
                Some(v) => *v,
                None if joint.is_base() => 0.0,
                None => return Err(ParameterError::MissingField(joint.name().to_string())),
            };
            if !value.is_finite() {
                return Err(ParameterError::NotFinite(joint.name().to_string()));
            }
            configuration.set_clamped(joint, value, limits)?;
        }
        Ok(configuration)
    }

    pub fn mode(&self) -> BaseMode {
        self.mode
    }

    pub fn values(&self) -> &[f64; 7] {
        &self.values
    }

    fn slot(&self, joint: JointId) -> Option<usize> {
        if !self.mode.permits(joint) {
            return None;
        }
        Some(if joint.is_base() { BASE_SLOT } else { joint.index() })
    }

    /// Value of the joint, or None for the base joint the mode does not have.
    pub fn get(&self, joint: JointId) -> Option<f64> {
        self.slot(joint).map(|s| self.values[s])
    }

    /// Value of a joint that is always present.
    pub fn arm(&self, joint: JointId) -> f64 {
        debug_assert!(!joint.is_base());
        self.values[joint.index()]
    }

    pub fn base(&self) -> f64 {
        self.values[BASE_SLOT]
    }

    /// Sets the joint, clamped into its limits. Setting the base joint of the other mode is an error.
    pub fn set_clamped(&mut self, joint: JointId, value: f64, limits: &JointLimits) -> Result<(), ParameterError> {
        let slot = self.slot(joint).ok_or_else(|| ParameterError::JointNotPermitted {
            joint: joint.name().to_string(),
            mode: self.mode.name().to_string(),
        })?;
        self.values[slot] = limits.clamp(joint, value);
        Ok(())
    }

    pub(crate) fn set_unchecked(&mut self, joint: JointId, value: f64) {
        if let Some(slot) = self.slot(joint) {
            self.values[slot] = value;
        }
    }

    /// Same configuration without base motion. Held commands must not repeat a base increment.
    pub fn without_base_motion(&self) -> Self {
        let mut held = *self;
        held.values[BASE_SLOT] = 0.0;
        held
    }

    pub fn iter(&self) -> impl Iterator<Item = (JointId, f64)> + '_ {
        self.mode
            .allowed_joints()
            .into_iter()
            .zip(self.values.iter().copied())
    }

    /// String-keyed map as written into recorded sessions.
    pub fn to_map(&self) -> BTreeMap<JointId, f64> {
        self.iter().collect()
    }
}

impl fmt::Display for JointConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(j, v)| format!("{}: {:.4}", j.name(), v))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
