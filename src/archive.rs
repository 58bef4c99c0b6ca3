//! Recorded sessions: the base mode and every joint command that was sent, tick by tick.
//!
//! Stored as JSON with exactly two fields:
//! ```json
//! {
//!   "base_move_mode": "rotary",
//!   "joint_config_to_save": [
//!     { "joint_lift": 0.8, "joint_arm_l0": 0.05, "joint_wrist_yaw": 0.0,
//!       "joint_wrist_pitch": -0.6, "joint_wrist_roll": 0.0, "stretch_gripper": 1.0,
//!       "joint_mobile_base_rotate_by": 0.0 }
//!   ]
//! }
//! ```
//! Anything else (other fields, unknown joint names, an unknown base mode) is rejected.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constraints::JointLimits;
use crate::errors::TeleopError;
use crate::joints::{BaseMode, JointConfiguration, JointId};
use crate::parameter_error::ParameterError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionArchive {
    pub base_move_mode: BaseMode,
    pub joint_config_to_save: Vec<BTreeMap<JointId, f64>>,
}

impl SessionArchive {
    pub fn new(base_move_mode: BaseMode) -> Self {
        SessionArchive {
            base_move_mode,
            joint_config_to_save: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.joint_config_to_save.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joint_config_to_save.is_empty()
    }

    pub fn to_json(&self) -> Result<String, ParameterError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ParameterError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ParameterError> {
        fs::write(path, self.to_json()?)?;
        info!("saved {} configurations to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ParameterError> {
        let archive = Self::from_json(&fs::read_to_string(path)?)?;
        info!(
            "loaded {} configurations in {} mode from {}",
            archive.len(),
            archive.base_move_mode,
            path.display()
        );
        Ok(archive)
    }

    /// The recorded configurations, restricted to the joints of the recorded base mode. All six
    /// arm joints must be present and finite; a missing base increment means no base motion.
    /// Values outside the limits are clamped into them with a warning, so a recording made
    /// with wider limits still plays back.
    pub fn configurations(&self, limits: &JointLimits) -> Result<Vec<JointConfiguration>, TeleopError> {
        if self.is_empty() {
            return Err(TeleopError::EmptyArchive);
        }
        let mode = self.base_move_mode;
        let mut configurations = Vec::with_capacity(self.len());
        for (index, map) in self.joint_config_to_save.iter().enumerate() {
            let configuration = JointConfiguration::from_map(mode, map, limits)?;
            for (joint, applied) in configuration.iter() {
                if let Some(recorded) = map.get(&joint).filter(|recorded| **recorded != applied) {
                    warn!(
                        "configuration {}: {} of {} clamped to {}",
                        index,
                        joint.name(),
                        recorded,
                        applied
                    );
                }
            }
            configurations.push(configuration);
        }
        Ok(configurations)
    }
}

/// Collects the commands of a running session into an archive.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    archive: SessionArchive,
}

impl SessionRecorder {
    pub fn new(mode: BaseMode) -> Self {
        SessionRecorder {
            archive: SessionArchive::new(mode),
        }
    }

    /// Records one emitted command. Only the joints permitted in the session's mode are stored.
    pub fn record(&mut self, configuration: &JointConfiguration) {
        let mode = self.archive.base_move_mode;
        self.archive.joint_config_to_save.push(
            configuration
                .iter()
                .filter(|(joint, _)| mode.permits(*joint))
                .collect(),
        );
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    pub fn archive(&self) -> &SessionArchive {
        &self.archive
    }

    pub fn into_archive(self) -> SessionArchive {
        self.archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROTARY: &str = r#"{
        "base_move_mode": "rotary",
        "joint_config_to_save": [
            {"stretch_gripper": 0.5, "joint_arm_l0": 0.1, "joint_lift": 0.6, "joint_wrist_yaw": 0.0,
             "joint_wrist_pitch": -0.5, "joint_wrist_roll": 0.0, "joint_mobile_base_rotate_by": 0.01,
             "joint_mobile_base_translate_by": 0.02}
        ]
    }"#;

    #[test]
    fn test_archive_filters_other_base_joint() {
        let archive = SessionArchive::from_json(ROTARY).unwrap();
        assert_eq!(archive.base_move_mode, BaseMode::Rotary);
        let configurations = archive.configurations(&JointLimits::default()).unwrap();
        assert_eq!(configurations.len(), 1);
        assert_eq!(configurations[0].get(JointId::BaseRotate), Some(0.01));
        assert_eq!(configurations[0].get(JointId::BaseTranslate), None);
    }

    #[test]
    fn test_schema_is_strict() {
        let unknown_joint = ROTARY.replace("joint_wrist_roll", "joint_head_tilt");
        assert!(SessionArchive::from_json(&unknown_joint).is_err());

        let unknown_mode = ROTARY.replace("\"rotary\"", "\"diagonal\"");
        assert!(SessionArchive::from_json(&unknown_mode).is_err());

        let extra_field = ROTARY.replacen('{', "{\"payload\": \"x\",", 1);
        assert!(SessionArchive::from_json(&extra_field).is_err());

        assert!(SessionArchive::from_json(r#"{"base_move_mode": "rotary"}"#).is_err());
    }

    #[test]
    fn test_empty_archive_has_no_configurations() {
        let archive = SessionArchive::new(BaseMode::Prismatic);
        assert!(matches!(
            archive.configurations(&JointLimits::default()),
            Err(TeleopError::EmptyArchive)
        ));
    }

    #[test]
    fn test_recorder_round_trip() {
        let limits = JointLimits::default();
        let configuration =
            JointConfiguration::new(BaseMode::Prismatic, [0.5, 0.1, 0.2, -0.5, 0.0, 1.0, 0.003], &limits).unwrap();
        let mut recorder = SessionRecorder::new(BaseMode::Prismatic);
        recorder.record(&configuration);
        recorder.record(&configuration.without_base_motion());

        let json = recorder.archive().to_json().unwrap();
        let restored = SessionArchive::from_json(&json).unwrap();
        assert_eq!(&restored, recorder.archive());
        let configurations = restored.configurations(&limits).unwrap();
        assert_eq!(configurations, vec![configuration, configuration.without_base_motion()]);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let limits = JointLimits::default();
        let archive = SessionArchive::from_json(&ROTARY.replace("0.6", "1.2").replace("0.01", "7.0")).unwrap();
        let configuration = archive.configurations(&limits).unwrap()[0];
        assert_eq!(configuration.arm(JointId::Lift), limits.range(JointId::Lift).1);
        assert_eq!(configuration.base(), limits.range(JointId::BaseRotate).1);
        assert_eq!(configuration.arm(JointId::ArmExtension), 0.1);
    }

    #[test]
    fn test_incomplete_or_non_finite_records_are_refused() {
        let limits = JointLimits::default();
        let missing = SessionArchive::from_json(&ROTARY.replace("\"joint_lift\": 0.6,", "")).unwrap();
        assert!(matches!(
            missing.configurations(&limits),
            Err(TeleopError::Configuration(ParameterError::MissingField(_)))
        ));

        let mut archive = SessionArchive::from_json(ROTARY).unwrap();
        archive.joint_config_to_save[0].insert(JointId::WristYaw, f64::NAN);
        assert!(matches!(
            archive.configurations(&limits),
            Err(TeleopError::Configuration(ParameterError::NotFinite(_)))
        ));
    }
}
