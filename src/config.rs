//! Settings of a teleoperation session, read once at startup from YAML

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::computer_vision::detection::{DetectorSettings, MarkerDetector};
use crate::computer_vision::pose_estimation::CameraIntrinsics;
use crate::constraints::JointLimits;
use crate::goal::{BaseMotionSettings, FilterSettings, ToolGeometry};
use crate::joints::{BaseMode, JOINT_COUNT, JointConfiguration, JointId};
use crate::parameter_error::{ParameterError, require_finite};
use crate::parameters::Parameters;
use crate::parameters_from_file::from_yaml_str;
use crate::utils::deg;

/// Period of the recorded sessions, seconds.
pub const RECORDED_TICK_PERIOD: f64 = 0.03;

/// Named velocity presets of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedProfile {
    #[default]
    Slow,
    Default,
    Fast,
    Max,
}

impl SpeedProfile {
    /// Maximum velocity of every joint, indexed by [JointId::index]. Lift and arm in m/s, wrist
    /// and base rotation in rad/s, gripper in aperture per second, base translation in m/s.
    pub fn max_velocities(&self) -> [f64; JOINT_COUNT] {
        //    lift  arm   yaw  pitch roll  grip  base_x base_yaw
        match self {
            SpeedProfile::Slow => [0.1, 0.1, 0.5, 0.5, 0.5, 0.5, 0.05, 0.2],
            SpeedProfile::Default => [0.2, 0.2, 1.0, 1.0, 1.0, 1.0, 0.1, 0.3],
            SpeedProfile::Fast => [0.3, 0.3, 1.5, 1.5, 1.5, 1.5, 0.15, 0.5],
            SpeedProfile::Max => [0.4, 0.4, 2.0, 2.0, 2.0, 2.0, 0.2, 0.7],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SpeedProfile::Slow => "slow",
            SpeedProfile::Default => "default",
            SpeedProfile::Fast => "fast",
            SpeedProfile::Max => "max",
        }
    }
}

impl fmt::Display for SpeedProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SpeedProfile {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [SpeedProfile::Slow, SpeedProfile::Default, SpeedProfile::Fast, SpeedProfile::Max]
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| ParameterError::ParseError(format!("unknown speed profile '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationSettings {
    /// Largest accepted RMS reprojection error of the board corners, pixels.
    pub max_reprojection_error_px: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings {
            max_reprojection_error_px: 2.0,
        }
    }
}

/// Everything a session needs, immutable once loaded. A YAML file may omit any field:
/// ```yaml
/// base_mode: rotary
/// tick_rate_hz: 30.0
/// ground: false
/// speed: slow
/// max_velocity:
///   joint_lift: 0.15
/// joint_limits:
///   joint_lift: [0.2, 1.05]
/// chain:
///   yaw_mount: deg(-90)
/// tool:
///   primary_marker: 0
///   secondary_marker: 1
///   hand_eye_translation: [0.0, 0.0, -0.09]
/// filter:
///   time_constant_s: 0.05
/// camera:
///   fx: 620.0
///   fy: 620.0
///   cx: 319.5
///   cy: 239.5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeleopConfig {
    pub base_mode: BaseMode,
    pub tick_rate_hz: f64,

    /// Manipulation happens near the floor rather than at table height.
    pub ground: bool,

    pub speed: SpeedProfile,

    /// Per-joint velocities replacing those of the speed profile.
    pub max_velocity: BTreeMap<JointId, f64>,

    /// Per-joint [min, max] replacing the default limits.
    pub joint_limits: BTreeMap<JointId, [f64; 2]>,

    pub chain: Parameters,
    pub tool: ToolGeometry,
    pub filter: FilterSettings,
    pub base_motion: BaseMotionSettings,
    pub calibration: CalibrationSettings,
    pub camera: CameraIntrinsics,
    pub detector: DetectorSettings,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        TeleopConfig {
            base_mode: BaseMode::Rotary,
            tick_rate_hz: 30.0,
            ground: false,
            speed: SpeedProfile::default(),
            max_velocity: BTreeMap::new(),
            joint_limits: BTreeMap::new(),
            chain: Parameters::stretch(),
            tool: ToolGeometry::default(),
            filter: FilterSettings::default(),
            base_motion: BaseMotionSettings::default(),
            calibration: CalibrationSettings::default(),
            camera: CameraIntrinsics::default(),
            detector: DetectorSettings::default(),
        }
    }
}

impl TeleopConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, ParameterError> {
        let config: TeleopConfig = from_yaml_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ParameterError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        require_finite("tick_rate_hz", self.tick_rate_hz)?;
        if self.tick_rate_hz <= 0.0 {
            return Err(ParameterError::InvalidConfiguration("tick_rate_hz must be positive".into()));
        }
        for (joint, v) in &self.max_velocity {
            require_finite(joint.name(), *v)?;
            if *v <= 0.0 {
                return Err(ParameterError::InvalidConfiguration(format!(
                    "max_velocity of {} must be positive",
                    joint
                )));
            }
        }
        self.limits()?;
        self.chain.validate()?;
        self.tool.validate()?;
        self.filter.validate()?;
        self.base_motion.validate()?;
        require_finite(
            "calibration.max_reprojection_error_px",
            self.calibration.max_reprojection_error_px,
        )?;
        if self.calibration.max_reprojection_error_px <= 0.0 {
            return Err(ParameterError::InvalidConfiguration(
                "calibration.max_reprojection_error_px must be positive".into(),
            ));
        }
        self.camera.validate()?;
        self.detector.validate()?;
        if self.tool.primary_marker as usize >= self.detector.dictionary_size {
            return Err(ParameterError::InvalidConfiguration(format!(
                "tool marker {} is not in the dictionary of {} markers",
                self.tool.primary_marker, self.detector.dictionary_size
            )));
        }
        Ok(())
    }

    /// Default limits with the configured overrides applied.
    pub fn limits(&self) -> Result<JointLimits, ParameterError> {
        self.joint_limits
            .iter()
            .try_fold(JointLimits::default(), |limits, (joint, [from, to])| {
                limits.with_range(*joint, *from, *to)
            })
    }

    /// Speed profile velocities with the configured overrides applied.
    pub fn velocities(&self) -> [f64; JOINT_COUNT] {
        let mut velocities = self.speed.max_velocities();
        for (joint, v) in &self.max_velocity {
            velocities[joint.index()] = *v;
        }
        velocities
    }

    /// Tick duration, seconds.
    pub fn tick_duration(&self) -> f64 {
        1.0 / self.tick_rate_hz
    }

    /// Detector for the tongs markers.
    pub fn marker_detector(&self) -> Result<MarkerDetector, ParameterError> {
        MarkerDetector::new(self.camera, self.tool.marker_size, self.detector.clone())
    }

    /// Lift height from which manipulation starts, clamped into the lift range.
    pub fn lift_middle(&self, limits: &JointLimits) -> f64 {
        let height = if self.ground { 0.3 } else { 0.8 };
        limits.clamp(JointId::Lift, height)
    }

    /// Configuration the session moves to before tracking starts: lift in the middle of the
    /// working height, arm slightly out, gripper looking forward and tilted down, open,
    /// base still.
    pub fn starting_configuration(&self) -> Result<JointConfiguration, ParameterError> {
        let limits = self.limits()?;
        let mut start = JointConfiguration::zeros(self.base_mode);
        for (joint, value) in [
            (JointId::Lift, self.lift_middle(&limits)),
            (JointId::ArmExtension, 0.05),
            (JointId::WristYaw, 0.0),
            (JointId::WristPitch, -0.6),
            (JointId::WristRoll, 0.0),
            (JointId::Gripper, 1.0),
            (self.base_mode.base_joint(), 0.0),
        ] {
            start.set_clamped(joint, value, &limits)?;
        }
        Ok(start)
    }

    /// Convert to string yaml representation. The output parses back into the same
    /// configuration.
    pub fn to_yaml(&self) -> String {
        let limits = self.limits().unwrap_or_default();
        let velocities = self.velocities();
        let mut yaml = format!(
            "base_mode: {}\n\
             tick_rate_hz: {:?}\n\
             ground: {}\n\
             speed: {}\n",
            self.base_mode, self.tick_rate_hz, self.ground, self.speed
        );

        yaml.push_str("max_velocity:\n");
        for joint in JointId::ALL {
            yaml.push_str(&format!("  {}: {:?}\n", joint, velocities[joint.index()]));
        }
        yaml.push_str("joint_limits:\n");
        for joint in JointId::ALL {
            let (from, to) = limits.range(joint);
            yaml.push_str(&format!("  {}: [{:?}, {:?}]\n", joint, from, to));
        }

        yaml.push_str(&self.chain.to_yaml());

        let tool = &self.tool;
        let [hx, hy, hz] = tool.hand_eye_translation;
        let [roll, pitch, yaw] = tool.hand_eye_rotation;
        yaml.push_str(&format!(
            "tool:\n  \
               primary_marker: {}\n  \
               secondary_marker: {}\n  \
               marker_size: {:?}\n  \
               hand_eye_translation: [{:?}, {:?}, {:?}]\n  \
               hand_eye_rotation: [{}, {}, {}]\n  \
               closed_separation: {:?}\n  \
               open_separation: {:?}\n",
            tool.primary_marker,
            tool.secondary_marker.map_or("~".to_string(), |id| id.to_string()),
            tool.marker_size,
            hx,
            hy,
            hz,
            deg(&roll),
            deg(&pitch),
            deg(&yaw),
            tool.closed_separation,
            tool.open_separation,
        ));

        let filter = &self.filter;
        yaml.push_str(&format!(
            "filter:\n  \
               time_constant_s: {:?}\n  \
               jump_threshold_m: {:?}\n  \
               jump_confirm_frames: {}\n  \
               min_confidence: {:?}\n",
            filter.time_constant_s, filter.jump_threshold_m, filter.jump_confirm_frames, filter.min_confidence,
        ));
        yaml.push_str(&format!(
            "base_motion:\n  \
               translation_deadband_m: {:?}\n  \
               rotation_deadband_rad: {:?}\n\
             calibration:\n  \
               max_reprojection_error_px: {:?}\n",
            self.base_motion.translation_deadband_m,
            self.base_motion.rotation_deadband_rad,
            self.calibration.max_reprojection_error_px,
        ));

        let camera = &self.camera;
        let d = camera.distortion;
        yaml.push_str(&format!(
            "camera:\n  \
               fx: {:?}\n  \
               fy: {:?}\n  \
               cx: {:?}\n  \
               cy: {:?}\n  \
               distortion: [{:?}, {:?}, {:?}, {:?}, {:?}]\n",
            camera.fx, camera.fy, camera.cx, camera.cy, d[0], d[1], d[2], d[3], d[4],
        ));

        let detector = &self.detector;
        yaml.push_str(&format!(
            "detector:\n  \
               threshold_window: {}\n  \
               threshold_offset: {:?}\n  \
               min_perimeter_px: {:?}\n  \
               min_contrast: {:?}\n  \
               max_corrections: {}\n  \
               bits_per_side: {}\n  \
               dictionary_size: {}\n  \
               min_code_distance: {}\n",
            detector.threshold_window,
            detector.threshold_offset,
            detector.min_perimeter_px,
            detector.min_contrast,
            detector.max_corrections,
            detector.bits_per_side,
            detector.dictionary_size,
            detector.min_code_distance,
        ));
        yaml
    }
}
