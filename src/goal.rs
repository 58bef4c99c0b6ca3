//! Pinch point goal from the tracked tongs.
//!
//! The primary marker gives the pose of the tongs. Calibration maps it into the robot reference
//! frame, the hand-eye offset moves it from the marker to the pinch point between the tips.
//! The distance to the secondary marker, fixed on the other arm of the tongs, gives the grip
//! width. The goal is smoothed and single frame jumps are rejected. Whenever no trustworthy
//! observation is available, the previous goal is kept.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::computer_vision::markers::{MarkerCollection, MarkerObservation};
use crate::computer_vision::transform_io::CameraExtrinsics;
use crate::joints::BaseMode;
use crate::kinematic_traits::Pose;
use crate::parameter_error::{ParameterError, require_finite};

/// Markers on the tongs and the offset from the primary marker to the pinch point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolGeometry {
    pub primary_marker: u32,

    /// Marker on the other arm of the tongs, if grip width is tracked.
    pub secondary_marker: Option<u32>,

    /// Printed side of the tongs markers, meters.
    pub marker_size: f64,

    /// Pinch point in the primary marker frame, meters.
    pub hand_eye_translation: [f64; 3],

    /// Gripper frame relative to the marker frame as roll, pitch, yaw. The x axis of the gripper
    /// frame points from the wrist towards the fingertips.
    pub hand_eye_rotation: [f64; 3],

    /// Marker separation with the tongs closed and fully open, meters.
    pub closed_separation: f64,
    pub open_separation: f64,
}

impl Default for ToolGeometry {
    fn default() -> Self {
        ToolGeometry {
            primary_marker: 0,
            secondary_marker: Some(1),
            marker_size: 0.024,
            hand_eye_translation: [0.0; 3],
            hand_eye_rotation: [0.0; 3],
            closed_separation: 0.035,
            open_separation: 0.115,
        }
    }
}

impl ToolGeometry {
    pub fn hand_eye(&self) -> Isometry3<f64> {
        let [roll, pitch, yaw] = self.hand_eye_rotation;
        Isometry3::from_parts(
            Translation3::from(Vector3::from(self.hand_eye_translation)),
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }

    /// Widest grip the tongs can express, meters.
    pub fn max_grip_width(&self) -> f64 {
        self.open_separation - self.closed_separation
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        for v in self.hand_eye_translation.iter().chain(self.hand_eye_rotation.iter()) {
            require_finite("tool.hand_eye", *v)?;
        }
        require_finite("tool.marker_size", self.marker_size)?;
        require_finite("tool.closed_separation", self.closed_separation)?;
        require_finite("tool.open_separation", self.open_separation)?;
        if self.marker_size <= 0.0 {
            return Err(ParameterError::InvalidConfiguration(
                "tool.marker_size must be positive".into(),
            ));
        }
        if self.open_separation <= self.closed_separation || self.closed_separation < 0.0 {
            return Err(ParameterError::InvalidConfiguration(format!(
                "tool.open_separation ({}) must exceed tool.closed_separation ({})",
                self.open_separation, self.closed_separation
            )));
        }
        if self.secondary_marker == Some(self.primary_marker) {
            return Err(ParameterError::InvalidConfiguration(
                "tool markers must have different ids".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSettings {
    /// Exponential smoothing time constant, seconds. Zero disables smoothing.
    pub time_constant_s: f64,

    /// Largest plausible displacement of the pinch point between two frames, meters.
    pub jump_threshold_m: f64,

    /// Consecutive frames that must agree on a displaced position before it is accepted as real
    /// motion.
    pub jump_confirm_frames: u32,

    /// Observations below this detector confidence are ignored.
    pub min_confidence: f64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings {
            time_constant_s: 0.05,
            jump_threshold_m: 0.15,
            jump_confirm_frames: 3,
            min_confidence: 0.3,
        }
    }
}

impl FilterSettings {
    pub fn validate(&self) -> Result<(), ParameterError> {
        for (field, value) in [
            ("filter.time_constant_s", self.time_constant_s),
            ("filter.jump_threshold_m", self.jump_threshold_m),
            ("filter.min_confidence", self.min_confidence),
        ] {
            require_finite(field, value)?;
            if value < 0.0 {
                return Err(ParameterError::InvalidConfiguration(format!("{} must not be negative", field)));
            }
        }
        if self.jump_threshold_m == 0.0 {
            return Err(ParameterError::InvalidConfiguration(
                "filter.jump_threshold_m must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Base increments smaller than these are accumulated rather than sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaseMotionSettings {
    pub translation_deadband_m: f64,
    pub rotation_deadband_rad: f64,
}

impl Default for BaseMotionSettings {
    fn default() -> Self {
        BaseMotionSettings {
            translation_deadband_m: 0.005,
            rotation_deadband_rad: 0.01,
        }
    }
}

impl BaseMotionSettings {
    pub fn validate(&self) -> Result<(), ParameterError> {
        require_finite("base_motion.translation_deadband_m", self.translation_deadband_m)?;
        require_finite("base_motion.rotation_deadband_rad", self.rotation_deadband_rad)?;
        if self.translation_deadband_m < 0.0 || self.rotation_deadband_rad < 0.0 {
            return Err(ParameterError::InvalidConfiguration(
                "base motion deadbands must not be negative".into(),
            ));
        }
        Ok(())
    }

    fn deadband(&self, mode: BaseMode) -> f64 {
        match mode {
            BaseMode::Prismatic => self.translation_deadband_m,
            BaseMode::Rotary => self.rotation_deadband_rad,
        }
    }
}

/// Target of the pinch point in the robot reference frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalPose {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,

    /// Opening between the fingertips, meters, from 0 (closed) to the tool's maximum.
    pub grip_width: f64,

    /// Capture time of the observation the goal was last updated from.
    pub timestamp: f64,
}

impl GoalPose {
    pub fn pose(&self) -> Pose {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }
}

/// Why the goal was not updated this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldReason {
    /// The primary tool marker is not in the frame.
    NoObservation,
    /// The tool marker was decoded too unreliably to be trusted.
    LowConfidence,
    /// The tool appeared far from where it was a frame ago.
    PoseJump,
    /// The goal is outside the reachable workspace.
    Unreachable,
}

/// Goal for this tick: either freshly updated, or the previous one with the reason it was kept.
/// `goal` is None until the tool has been seen once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalUpdate {
    pub goal: Option<GoalPose>,
    pub hold: Option<HoldReason>,
}

/// Base pose relative to where the session started, and the base increment the kinematics ask
/// for but that has not been sent yet.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseMotion {
    mode: BaseMode,
    deadband: f64,
    odometry: Isometry3<f64>,
    pending: f64,
}

impl BaseMotion {
    pub fn new(mode: BaseMode, settings: &BaseMotionSettings) -> Self {
        BaseMotion {
            mode,
            deadband: settings.deadband(mode),
            odometry: Isometry3::identity(),
            pending: 0.0,
        }
    }

    /// The pose, given in the reference frame, as seen from the current base frame.
    pub fn to_base_frame(&self, pose: &Pose) -> Pose {
        self.odometry.inverse() * pose
    }

    /// Records the increment the latest solution needs. The requirement is relative to the
    /// current base frame, so it already accumulates everything not yet sent.
    pub fn observe(&mut self, required: f64) {
        self.pending = if required.is_finite() { required } else { 0.0 };
    }

    /// The pending increment if it exceeds the deadband. The accumulator is reset once taken.
    pub fn take(&mut self) -> Option<f64> {
        if self.pending.abs() > self.deadband {
            let delta = self.pending;
            self.pending = 0.0;
            Some(delta)
        } else {
            None
        }
    }

    /// The increment actually sent to the base.
    pub fn commit(&mut self, applied: f64) {
        let step = match self.mode {
            BaseMode::Prismatic => Isometry3::translation(applied, 0.0, 0.0),
            BaseMode::Rotary => Isometry3::rotation(Vector3::z() * applied),
        };
        self.odometry *= step;
    }

    pub fn odometry(&self) -> &Isometry3<f64> {
        &self.odometry
    }

    pub fn pending(&self) -> f64 {
        self.pending
    }
}

/// Raw pinch pose of a frame that disagrees with the accepted track, waiting for confirmation.
#[derive(Debug, Clone, Copy)]
struct JumpCandidate {
    position: Vector3<f64>,
    frames: u32,
}

pub struct GoalSynthesizer {
    extrinsics: CameraExtrinsics,
    hand_eye: Isometry3<f64>,
    tool: ToolGeometry,
    filter: FilterSettings,
    base: BaseMotion,

    goal: Option<GoalPose>,
    /// Unfiltered pinch position of the last accepted observation.
    last_accepted: Option<Vector3<f64>>,
    candidate: Option<JumpCandidate>,
    grip_width: Option<f64>,
}

impl GoalSynthesizer {
    pub fn new(
        extrinsics: CameraExtrinsics,
        tool: &ToolGeometry,
        filter: &FilterSettings,
        base_mode: BaseMode,
        base_motion: &BaseMotionSettings,
    ) -> Self {
        GoalSynthesizer {
            extrinsics,
            hand_eye: tool.hand_eye(),
            tool: tool.clone(),
            filter: filter.clone(),
            base: BaseMotion::new(base_mode, base_motion),
            goal: None,
            last_accepted: None,
            candidate: None,
            grip_width: None,
        }
    }

    pub fn goal(&self) -> Option<&GoalPose> {
        self.goal.as_ref()
    }

    pub fn base_motion(&self) -> &BaseMotion {
        &self.base
    }

    pub fn base_motion_mut(&mut self) -> &mut BaseMotion {
        &mut self.base
    }

    /// Forgets the goal and the base odometry, as at session start.
    pub fn reset(&mut self) {
        self.goal = None;
        self.last_accepted = None;
        self.candidate = None;
        self.grip_width = None;
        self.base.odometry = Isometry3::identity();
        self.base.pending = 0.0;
    }

    /// Pinch pose in the robot reference frame for one marker observation, no filtering.
    pub fn pinch_pose(&self, marker: &MarkerObservation) -> Pose {
        self.extrinsics.transform() * marker.pose() * self.hand_eye
    }

    /// Updates the goal from the markers of one frame, `dt` seconds after the previous tick.
    pub fn update(&mut self, markers: &MarkerCollection, dt: f64) -> GoalUpdate {
        let Some(primary) = markers.get(self.tool.primary_marker) else {
            debug!("tool marker {} not in frame, holding goal", self.tool.primary_marker);
            return self.hold(HoldReason::NoObservation);
        };
        if primary.confidence < self.filter.min_confidence {
            debug!(
                "tool marker confidence {:.2} below {:.2}, holding goal",
                primary.confidence, self.filter.min_confidence
            );
            return self.hold(HoldReason::LowConfidence);
        }
        let raw = self.pinch_pose(primary);
        if raw.translation.vector.iter().any(|v| !v.is_finite()) {
            return self.hold(HoldReason::NoObservation);
        }

        if !self.plausible(&raw.translation.vector) {
            return self.hold(HoldReason::PoseJump);
        }

        let grip_width = self.grip_width(primary, markers);
        let alpha = if self.filter.time_constant_s > 0.0 && dt > 0.0 {
            1.0 - (-dt / self.filter.time_constant_s).exp()
        } else {
            1.0
        };

        let goal = match (self.goal, self.candidate.take()) {
            // Confirmed jumps are taken over without smoothing towards the stale goal.
            (Some(previous), None) => GoalPose {
                position: previous.position.lerp(&raw.translation.vector, alpha),
                orientation: previous
                    .orientation
                    .try_slerp(&raw.rotation, alpha, 1.0e-9)
                    .unwrap_or(raw.rotation),
                grip_width: previous.grip_width + alpha * (grip_width - previous.grip_width),
                timestamp: primary.timestamp,
            },
            _ => GoalPose {
                position: raw.translation.vector,
                orientation: raw.rotation,
                grip_width,
                timestamp: primary.timestamp,
            },
        };

        self.last_accepted = Some(raw.translation.vector);
        self.goal = Some(goal);
        GoalUpdate {
            goal: self.goal,
            hold: None,
        }
    }

    fn hold(&self, reason: HoldReason) -> GoalUpdate {
        GoalUpdate {
            goal: self.goal,
            hold: Some(reason),
        }
    }

    /// False while the position is an unconfirmed jump away from the accepted track. A jump is
    /// confirmed once `jump_confirm_frames` consecutive frames agree on the new place; the
    /// candidate is then left in place so the update snaps to it.
    fn plausible(&mut self, position: &Vector3<f64>) -> bool {
        let threshold = self.filter.jump_threshold_m;
        let Some(last) = self.last_accepted else {
            return true;
        };
        if (position - last).norm() <= threshold {
            self.candidate = None;
            return true;
        }

        let frames = match self.candidate {
            Some(c) if (position - c.position).norm() <= threshold => c.frames + 1,
            _ => 1,
        };
        self.candidate = Some(JumpCandidate {
            position: *position,
            frames,
        });
        if frames >= self.filter.jump_confirm_frames.max(1) {
            debug!("pose jump confirmed after {} frames", frames);
            true
        } else {
            debug!("pose jump of {:.3} m rejected", (position - last).norm());
            false
        }
    }

    /// Grip width from the marker separation, or the last known width without the secondary
    /// marker.
    fn grip_width(&mut self, primary: &MarkerObservation, markers: &MarkerCollection) -> f64 {
        let secondary = self
            .tool
            .secondary_marker
            .and_then(|id| markers.get(id))
            .filter(|m| m.confidence >= self.filter.min_confidence);
        match secondary {
            Some(secondary) => {
                let separation = (secondary.position - primary.position).norm();
                let width =
                    (separation - self.tool.closed_separation).clamp(0.0, self.tool.max_grip_width());
                self.grip_width = Some(width);
                width
            }
            None => self.grip_width.unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Point2;

    fn marker(id: u32, position: Vector3<f64>, timestamp: f64) -> MarkerObservation {
        MarkerObservation {
            id,
            position,
            orientation: UnitQuaternion::identity(),
            confidence: 1.0,
            timestamp,
            corners: [Point2::origin(); 4],
        }
    }

    fn synthesizer(filter: FilterSettings) -> GoalSynthesizer {
        GoalSynthesizer::new(
            CameraExtrinsics::identity(),
            &ToolGeometry::default(),
            &filter,
            BaseMode::Prismatic,
            &BaseMotionSettings::default(),
        )
    }

    fn frame(markers: Vec<MarkerObservation>) -> MarkerCollection {
        markers.into_iter().collect()
    }

    #[test]
    fn test_no_goal_before_first_observation() {
        let mut synth = synthesizer(FilterSettings::default());
        let update = synth.update(&MarkerCollection::empty(0.0), 0.033);
        assert_eq!(update.goal, None);
        assert_eq!(update.hold, Some(HoldReason::NoObservation));
    }

    #[test]
    fn test_first_observation_is_taken_as_is() {
        let mut synth = synthesizer(FilterSettings::default());
        let p = Vector3::new(0.1, 0.2, 0.5);
        let update = synth.update(&frame(vec![marker(0, p, 0.0)]), 0.033);
        assert_eq!(update.hold, None);
        assert_abs_diff_eq!(update.goal.unwrap().position, p, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_marker_holds_previous_goal() {
        let mut synth = synthesizer(FilterSettings::default());
        let first = synth.update(&frame(vec![marker(0, Vector3::new(0.1, 0.0, 0.4), 0.0)]), 0.033);
        let held = synth.update(&frame(vec![marker(7, Vector3::zeros(), 0.1)]), 0.033);
        assert_eq!(held.hold, Some(HoldReason::NoObservation));
        assert_eq!(held.goal, first.goal);
    }

    #[test]
    fn test_low_confidence_holds() {
        let mut synth = synthesizer(FilterSettings::default());
        let mut weak = marker(0, Vector3::new(0.1, 0.0, 0.4), 0.0);
        weak.confidence = 0.1;
        assert_eq!(synth.update(&frame(vec![weak]), 0.033).hold, Some(HoldReason::LowConfidence));
    }

    #[test]
    fn test_single_frame_jump_rejected_then_confirmed() {
        let settings = FilterSettings {
            time_constant_s: 0.0,
            ..FilterSettings::default()
        };
        let mut synth = synthesizer(settings);
        let here = Vector3::new(0.1, 0.0, 0.4);
        let there = Vector3::new(0.6, 0.0, 0.4);
        synth.update(&frame(vec![marker(0, here, 0.0)]), 0.033);

        // One outlier frame, then back: the outlier never reaches the goal.
        let outlier = synth.update(&frame(vec![marker(0, there, 0.1)]), 0.033);
        assert_eq!(outlier.hold, Some(HoldReason::PoseJump));
        assert_abs_diff_eq!(outlier.goal.unwrap().position, here, epsilon = 1e-12);
        let back = synth.update(&frame(vec![marker(0, here, 0.2)]), 0.033);
        assert_eq!(back.hold, None);

        // The tool really moved: accepted on the third agreeing frame.
        assert_eq!(synth.update(&frame(vec![marker(0, there, 0.3)]), 0.033).hold, Some(HoldReason::PoseJump));
        assert_eq!(synth.update(&frame(vec![marker(0, there, 0.4)]), 0.033).hold, Some(HoldReason::PoseJump));
        let moved = synth.update(&frame(vec![marker(0, there, 0.5)]), 0.033);
        assert_eq!(moved.hold, None);
        assert_abs_diff_eq!(moved.goal.unwrap().position, there, epsilon = 1e-12);
    }

    #[test]
    fn test_smoothing_converges_to_constant_input() {
        let mut synth = synthesizer(FilterSettings::default());
        synth.update(&frame(vec![marker(0, Vector3::new(0.1, 0.0, 0.4), 0.0)]), 0.033);
        let target = Vector3::new(0.15, 0.02, 0.42);
        let first = synth.update(&frame(vec![marker(0, target, 0.033)]), 0.033).goal.unwrap();
        // One tick moves part of the way only.
        assert!((first.position - target).norm() > 1e-3);

        let mut last = first;
        for i in 0..60 {
            last = synth.update(&frame(vec![marker(0, target, 0.066 + i as f64 * 0.033)]), 0.033).goal.unwrap();
        }
        assert_abs_diff_eq!(last.position, target, epsilon = 1e-9);
    }

    #[test]
    fn test_grip_width_from_marker_separation() {
        let mut synth = synthesizer(FilterSettings {
            time_constant_s: 0.0,
            ..FilterSettings::default()
        });
        let primary = marker(0, Vector3::new(0.1, 0.0, 0.4), 0.0);
        let open = marker(1, Vector3::new(0.1, 0.075, 0.4), 0.0);
        let goal = synth.update(&frame(vec![primary.clone(), open]), 0.033).goal.unwrap();
        assert_abs_diff_eq!(goal.grip_width, 0.04, epsilon = 1e-12);

        // Secondary hidden: width is kept.
        let goal = synth.update(&frame(vec![primary.clone()]), 0.033).goal.unwrap();
        assert_abs_diff_eq!(goal.grip_width, 0.04, epsilon = 1e-12);

        // Squeezed beyond closed: clamped to zero.
        let squeezed = marker(1, Vector3::new(0.1, 0.01, 0.4), 0.0);
        let goal = synth.update(&frame(vec![primary, squeezed]), 0.033).goal.unwrap();
        assert_eq!(goal.grip_width, 0.0);
    }

    #[test]
    fn test_hand_eye_offset_moves_goal_to_pinch_point() {
        let tool = ToolGeometry {
            hand_eye_translation: [0.0, 0.0, -0.1],
            ..ToolGeometry::default()
        };
        let mut synth = GoalSynthesizer::new(
            CameraExtrinsics::identity(),
            &tool,
            &FilterSettings::default(),
            BaseMode::Rotary,
            &BaseMotionSettings::default(),
        );
        let goal = synth
            .update(&frame(vec![marker(0, Vector3::new(0.0, 0.0, 0.5), 0.0)]), 0.033)
            .goal
            .unwrap();
        assert_abs_diff_eq!(goal.position, Vector3::new(0.0, 0.0, 0.4), epsilon = 1e-12);
    }

    #[test]
    fn test_base_motion_accumulates_until_deadband() {
        let mut base = BaseMotion::new(BaseMode::Prismatic, &BaseMotionSettings::default());
        base.observe(0.003);
        assert_eq!(base.take(), None);
        base.observe(0.008);
        assert_eq!(base.take(), Some(0.008));
        assert_eq!(base.pending(), 0.0);
        base.commit(0.008);

        let goal = Isometry3::translation(0.5, 0.0, 0.3);
        let seen = base.to_base_frame(&goal);
        assert_abs_diff_eq!(seen.translation.vector.x, 0.492, epsilon = 1e-12);
    }
}
