//! Per-tick conversion of the goal into the joint command that is actually sent.
//!
//! Every tick produces exactly one command. A fresh goal is solved with the inverse kinematics;
//! the solution is merged with the grip width and the base increment and then rate limited
//! against the previous command. Without a fresh goal, or when the goal is out of reach, the
//! previous command is repeated with the base standing still.

use tracing::{debug, info, warn};

use crate::computer_vision::markers::MarkerCollection;
use crate::computer_vision::transform_io::CameraExtrinsics;
use crate::config::TeleopConfig;
use crate::constraints::JointLimits;
use crate::errors::TeleopError;
use crate::goal::{GoalPose, GoalSynthesizer, GoalUpdate, HoldReason};
use crate::joints::{BaseMode, JOINT_COUNT, JointConfiguration, JointId};
use crate::kinematic_traits::Kinematics;
use crate::kinematics_impl::StretchKinematics;
use crate::rate_limiting::{limit_rate_increment, limit_rate_joint_positions};

/// Largest joint difference, rad or m, at which an approach has arrived.
const ARRIVAL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not started. The first tick emits the starting configuration.
    Idle,
    /// The last command followed a fresh, reachable goal.
    Tracking,
    /// The last command repeated the previous one.
    Holding,
    /// Terminal.
    Stopped,
}

/// What the loop remembers between ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlLoopState {
    pub previous_command: JointConfiguration,
    pub previous_goal: Option<GoalPose>,
    /// Capture time of the last observation that updated the goal.
    pub last_observation: Option<f64>,
    pub hold: Option<HoldReason>,
}

impl ControlLoopState {
    fn new(start: JointConfiguration) -> Self {
        ControlLoopState {
            previous_command: start,
            previous_goal: None,
            last_observation: None,
            hold: None,
        }
    }
}

pub struct MotionOrchestrator {
    kinematics: StretchKinematics,
    synthesizer: GoalSynthesizer,
    limits: JointLimits,
    velocities: [f64; JOINT_COUNT],
    tick_duration: f64,
    max_grip_width: f64,
    start: JointConfiguration,
    state: LoopState,
    control: ControlLoopState,
}

impl MotionOrchestrator {
    pub fn new(config: &TeleopConfig, extrinsics: CameraExtrinsics) -> Result<Self, TeleopError> {
        config.validate()?;
        let limits = config.limits()?;
        let start = config.starting_configuration()?;
        let synthesizer = GoalSynthesizer::new(
            extrinsics,
            &config.tool,
            &config.filter,
            config.base_mode,
            &config.base_motion,
        );
        Ok(MotionOrchestrator {
            kinematics: StretchKinematics::new(config.chain, limits.clone(), config.base_mode),
            synthesizer,
            limits,
            velocities: config.velocities(),
            tick_duration: config.tick_duration(),
            max_grip_width: config.tool.max_grip_width(),
            start,
            state: LoopState::Idle,
            control: ControlLoopState::new(start),
        })
    }

    /// Replaces the configuration the session starts from, for instance with the first
    /// recorded configuration of a replay. Only possible before the first tick.
    pub fn with_start(mut self, start: JointConfiguration) -> Result<Self, TeleopError> {
        if start.mode() != self.mode() {
            return Err(TeleopError::ModeMismatch {
                archive: start.mode(),
                session: self.mode(),
            });
        }
        self.start = start.without_base_motion();
        self.control = ControlLoopState::new(self.start);
        Ok(self)
    }

    pub fn mode(&self) -> BaseMode {
        self.kinematics.mode()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn control_state(&self) -> &ControlLoopState {
        &self.control
    }

    pub fn kinematics(&self) -> &StretchKinematics {
        &self.kinematics
    }

    pub fn synthesizer(&self) -> &GoalSynthesizer {
        &self.synthesizer
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    pub fn velocities(&self) -> &[f64; JOINT_COUNT] {
        &self.velocities
    }

    pub fn tick_duration(&self) -> f64 {
        self.tick_duration
    }

    pub fn starting_configuration(&self) -> &JointConfiguration {
        &self.start
    }

    /// Runs one tick on the markers of the latest frame, `dt` seconds after the previous tick.
    pub fn tick(&mut self, markers: &MarkerCollection, dt: f64) -> Result<JointConfiguration, TeleopError> {
        match self.state {
            LoopState::Stopped => Err(TeleopError::Stopped),
            LoopState::Idle => Ok(self.begin()),
            LoopState::Tracking | LoopState::Holding => {
                let update = self.synthesizer.update(markers, dt);
                Ok(self.step(&update))
            }
        }
    }

    /// Emits a recorded command unchanged, apart from clamping into the limits. Recorded
    /// commands were rate limited when they were recorded.
    pub fn play(&mut self, recorded: &JointConfiguration) -> Result<JointConfiguration, TeleopError> {
        if self.state == LoopState::Stopped {
            return Err(TeleopError::Stopped);
        }
        if recorded.mode() != self.mode() {
            return Err(TeleopError::ModeMismatch {
                archive: recorded.mode(),
                session: self.mode(),
            });
        }
        let mut command = JointConfiguration::zeros(self.mode());
        for (joint, value) in recorded.iter() {
            command.set_clamped(joint, value, &self.limits)?;
        }
        self.state = LoopState::Tracking;
        self.control.previous_command = command;
        self.control.hold = None;
        Ok(command)
    }

    /// Moves the arm one tick towards `target` at the velocities of the speed profile, with the
    /// base standing still. Returns None once the arm has arrived. On an idle orchestrator the
    /// first command is the starting configuration.
    pub fn approach(&mut self, target: &JointConfiguration) -> Result<Option<JointConfiguration>, TeleopError> {
        if target.mode() != self.mode() {
            return Err(TeleopError::ModeMismatch {
                archive: target.mode(),
                session: self.mode(),
            });
        }
        match self.state {
            LoopState::Stopped => return Err(TeleopError::Stopped),
            LoopState::Idle => return Ok(Some(self.begin())),
            LoopState::Tracking | LoopState::Holding => {}
        }
        let mut desired = JointConfiguration::zeros(self.mode());
        for (joint, value) in target.without_base_motion().iter() {
            desired.set_clamped(joint, value, &self.limits)?;
        }
        let previous = self.control.previous_command;
        let arrived = desired
            .iter()
            .zip(previous.iter())
            .all(|((_, wanted), (_, sent))| (wanted - sent).abs() <= ARRIVAL_TOLERANCE);
        if arrived {
            return Ok(None);
        }
        let command = limit_rate_joint_positions(
            &self.velocities,
            self.tick_duration,
            &desired,
            &previous,
            &self.limits,
        );
        self.state = LoopState::Holding;
        self.control.previous_command = command;
        Ok(Some(command))
    }

    pub fn stop(&mut self) {
        if self.state != LoopState::Stopped {
            info!("motion orchestrator stopped");
            self.state = LoopState::Stopped;
        }
    }

    fn begin(&mut self) -> JointConfiguration {
        self.synthesizer.reset();
        self.control = ControlLoopState::new(self.start);
        self.state = LoopState::Holding;
        info!("starting from {}", self.start);
        self.start
    }

    fn step(&mut self, update: &GoalUpdate) -> JointConfiguration {
        self.control.previous_goal = update.goal;
        let goal = match (update.goal, update.hold) {
            (Some(goal), None) => goal,
            (_, reason) => return self.hold(reason.unwrap_or(HoldReason::NoObservation)),
        };

        let previous = self.control.previous_command.without_base_motion();
        let local_goal = self.synthesizer.base_motion().to_base_frame(&goal.pose());
        let solution = self.kinematics.inverse(&local_goal, &previous);
        if !solution.reachable {
            if self.control.hold != Some(HoldReason::Unreachable) {
                warn!(
                    "goal [{:.3}, {:.3}, {:.3}] is out of reach ({:.3} m away), holding position",
                    goal.position.x, goal.position.y, goal.position.z, solution.residual
                );
            }
            return self.hold(HoldReason::Unreachable);
        }

        let mut desired = solution.configuration;
        let required = desired.base();
        let base_joint = self.mode().base_joint();
        let base_motion = self.synthesizer.base_motion_mut();
        base_motion.observe(required);
        let increment = base_motion.take().unwrap_or(0.0);
        let applied = self.limits.clamp(
            base_joint,
            limit_rate_increment(self.velocities[base_joint.index()], self.tick_duration, increment),
        );
        self.synthesizer.base_motion_mut().commit(applied);
        desired.set_unchecked(base_joint, applied);

        if self.mode() == BaseMode::Rotary {
            // The wrist turns for the base rotation that is not sent this tick.
            let yaw = desired.arm(JointId::WristYaw) + required - applied;
            desired.set_unchecked(JointId::WristYaw, self.limits.clamp(JointId::WristYaw, yaw));
        }

        let (closed, open) = self.limits.range(JointId::Gripper);
        let aperture = (goal.grip_width / self.max_grip_width).clamp(0.0, 1.0);
        desired.set_unchecked(JointId::Gripper, closed + aperture * (open - closed));

        let command = limit_rate_joint_positions(
            &self.velocities,
            self.tick_duration,
            &desired,
            &self.control.previous_command,
            &self.limits,
        );

        if self.state == LoopState::Holding {
            debug!("tracking resumed");
        }
        self.state = LoopState::Tracking;
        self.control.previous_command = command;
        self.control.last_observation = Some(goal.timestamp);
        self.control.hold = None;
        command
    }

    fn hold(&mut self, reason: HoldReason) -> JointConfiguration {
        if self.control.hold != Some(reason) {
            debug!("holding: {:?}", reason);
        }
        self.state = LoopState::Holding;
        self.control.hold = Some(reason);
        self.control.previous_command = self.control.previous_command.without_base_motion();
        self.control.previous_command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer_vision::markers::MarkerObservation;
    use nalgebra::{Point2, UnitQuaternion, Vector3};

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

    fn orchestrator(mode: BaseMode) -> MotionOrchestrator {
        let config = TeleopConfig {
            base_mode: mode,
            ..TeleopConfig::default()
        };
        MotionOrchestrator::new(&config, CameraExtrinsics::identity()).unwrap()
    }

    #[test]
    fn test_first_tick_emits_starting_configuration() {
        let mut orchestrator = orchestrator(BaseMode::Rotary);
        assert_eq!(orchestrator.state(), LoopState::Idle);
        let first = orchestrator.tick(&MarkerCollection::empty(0.0), 0.033).unwrap();
        assert_eq!(&first, orchestrator.starting_configuration());
        assert_eq!(orchestrator.state(), LoopState::Holding);
    }

    #[test]
    fn test_missing_markers_repeat_command() {
        let mut orchestrator = orchestrator(BaseMode::Prismatic);
        let first = orchestrator.tick(&MarkerCollection::empty(0.0), 0.033).unwrap();
        for i in 1..10 {
            let held = orchestrator.tick(&MarkerCollection::empty(i as f64 * 0.033), 0.033).unwrap();
            assert_eq!(held, first);
        }
        assert_eq!(orchestrator.control_state().hold, Some(HoldReason::NoObservation));
    }

    #[test]
    fn test_unreachable_goal_holds() {
        let mut orchestrator = orchestrator(BaseMode::Prismatic);
        let first = orchestrator.tick(&MarkerCollection::empty(0.0), 0.033).unwrap();
        // Far above anything the lift reaches.
        let frame: MarkerCollection = vec![marker(0, Vector3::new(0.0, -0.5, 3.0), 0.033)].into_iter().collect();
        let held = orchestrator.tick(&frame, 0.033).unwrap();
        assert_eq!(held, first);
        assert_eq!(orchestrator.state(), LoopState::Holding);
        assert_eq!(orchestrator.control_state().hold, Some(HoldReason::Unreachable));
    }

    #[test]
    fn test_stopped_emits_nothing() {
        let mut orchestrator = orchestrator(BaseMode::Rotary);
        orchestrator.tick(&MarkerCollection::empty(0.0), 0.033).unwrap();
        orchestrator.stop();
        assert!(matches!(
            orchestrator.tick(&MarkerCollection::empty(0.1), 0.033),
            Err(TeleopError::Stopped)
        ));
    }

    #[test]
    fn test_approach_starts_then_arrives() {
        let mut orchestrator = orchestrator(BaseMode::Prismatic);
        let mut target = *orchestrator.starting_configuration();
        target.set_unchecked(JointId::Lift, target.arm(JointId::Lift) + 0.01);
        target.set_unchecked(JointId::BaseTranslate, 0.2);

        let first = orchestrator.approach(&target).unwrap().unwrap();
        assert_eq!(&first, orchestrator.starting_configuration());
        let mut last = first;
        while let Some(command) = orchestrator.approach(&target).unwrap() {
            assert_eq!(command.base(), 0.0);
            last = command;
        }
        assert!((last.arm(JointId::Lift) - target.arm(JointId::Lift)).abs() < 1e-9);
        assert_eq!(orchestrator.approach(&target).unwrap(), None);

        orchestrator.stop();
        assert!(matches!(orchestrator.approach(&target), Err(TeleopError::Stopped)));
    }

    #[test]
    fn test_play_rejects_other_mode() {
        let mut orchestrator = orchestrator(BaseMode::Rotary);
        let recorded = JointConfiguration::zeros(BaseMode::Prismatic);
        assert!(matches!(orchestrator.play(&recorded), Err(TeleopError::ModeMismatch { .. })));
    }
}
