//! A teleoperation session: the control loop between the camera and the robot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use image::GrayImage;
use tracing::{debug, error, info};

use crate::archive::{SessionArchive, SessionRecorder};
use crate::computer_vision::detection::MarkerDetector;
use crate::computer_vision::markers::MarkerCollection;
use crate::errors::TeleopError;
use crate::frame_buffer::FrameReader;
use crate::joints::JointConfiguration;
use crate::orchestrator::MotionOrchestrator;

/// The robot side of the session.
pub trait Actuator {
    /// Whether the robot can take motion commands (powered, homed, no runstop).
    fn is_ready(&mut self) -> Result<(), String>;

    /// Sends one command. Called once per tick. A failure ends the session.
    fn send(&mut self, command: &JointConfiguration) -> Result<(), String>;

    /// Ends motion control. Called exactly once per session.
    fn release(&mut self);
}

/// Writes every command to the log instead of moving a robot.
#[derive(Debug, Default)]
pub struct LoggingActuator {
    sent: usize,
}

impl LoggingActuator {
    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl Actuator for LoggingActuator {
    fn is_ready(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn send(&mut self, command: &JointConfiguration) -> Result<(), String> {
        self.sent += 1;
        info!("command {}: {}", self.sent, command);
        Ok(())
    }

    fn release(&mut self) {
        info!("released after {} commands", self.sent);
    }
}

/// Duration statistics of loop iterations. Observational only.
#[derive(Debug, Clone, Default)]
pub struct LoopTimer {
    started: Option<Instant>,
    count: usize,
    min: Option<Duration>,
    max: Duration,
    total: Duration,
}

impl LoopTimer {
    pub fn start_of_iteration(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn end_of_iteration(&mut self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed());
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.max = self.max.max(duration);
        self.min = Some(self.min.map_or(duration, |m| m.min(duration)));
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Minimum, mean and maximum iteration time.
    pub fn summary(&self) -> Option<(Duration, Duration, Duration)> {
        let count = u32::try_from(self.count).ok().filter(|c| *c > 0)?;
        Some((self.min?, self.total / count, self.max))
    }

    pub fn log(&self) {
        if let Some((min, mean, max)) = self.summary() {
            debug!(
                "{} iterations, min {:.1} ms, mean {:.1} ms, max {:.1} ms",
                self.count,
                min.as_secs_f64() * 1000.0,
                mean.as_secs_f64() * 1000.0,
                max.as_secs_f64() * 1000.0
            );
        }
    }
}

pub struct Session<A: Actuator> {
    orchestrator: MotionOrchestrator,
    actuator: A,
    recorder: Option<SessionRecorder>,
    timer: LoopTimer,
    released: bool,
}

impl<A: Actuator> Session<A> {
    /// Fails without sending anything if the robot is not ready for motion.
    pub fn new(orchestrator: MotionOrchestrator, mut actuator: A) -> Result<Self, TeleopError> {
        if let Err(reason) = actuator.is_ready() {
            error!("robot is not ready: {}", reason);
            actuator.release();
            return Err(TeleopError::ActuatorNotReady(reason));
        }
        info!("session started in {} mode", orchestrator.mode());
        Ok(Session {
            orchestrator,
            actuator,
            recorder: None,
            timer: LoopTimer::default(),
            released: false,
        })
    }

    /// Keeps every command sent, to be saved as an archive.
    pub fn recording(mut self) -> Self {
        self.recorder = Some(SessionRecorder::new(self.orchestrator.mode()));
        self
    }

    pub fn orchestrator(&self) -> &MotionOrchestrator {
        &self.orchestrator
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn timer(&self) -> &LoopTimer {
        &self.timer
    }

    /// The archive recorded so far, if recording.
    pub fn take_recording(&mut self) -> Option<SessionArchive> {
        self.recorder.take().map(SessionRecorder::into_archive)
    }

    /// One control tick on already detected markers.
    pub fn tick(&mut self, markers: &MarkerCollection, dt: f64) -> Result<JointConfiguration, TeleopError> {
        let command = self.orchestrator.tick(markers, dt)?;
        self.emit(&command)?;
        Ok(command)
    }

    fn emit(&mut self, command: &JointConfiguration) -> Result<(), TeleopError> {
        if self.released {
            return Err(TeleopError::Stopped);
        }
        if let Err(reason) = self.actuator.send(command) {
            error!("command not taken: {}", reason);
            return Err(TeleopError::Actuator(reason));
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(command);
        }
        Ok(())
    }

    /// Runs the control loop until `stop` is set or the camera goes away. Each tick takes the
    /// newest frame, if there is one; without a new frame the tick holds.
    pub fn run(
        &mut self,
        frames: &mut FrameReader<GrayImage>,
        detector: &MarkerDetector,
        stop: &AtomicBool,
    ) -> Result<(), TeleopError> {
        let period = Duration::from_secs_f64(self.orchestrator.tick_duration());
        let clock = Instant::now();
        let mut last_tick: Option<Instant> = None;

        let result = loop {
            if stop.load(Ordering::Relaxed) {
                info!("stop requested");
                break Ok(());
            }
            let tick_start = Instant::now();
            let dt = last_tick.map_or(period.as_secs_f64(), |t| tick_start.duration_since(t).as_secs_f64());
            last_tick = Some(tick_start);
            self.timer.start_of_iteration();

            let markers = match frames.take_latest() {
                Some(frame) => detector.detect(&frame.image, frame.timestamp),
                None if frames.is_closed() => {
                    info!("camera closed");
                    break Ok(());
                }
                None => MarkerCollection::empty(clock.elapsed().as_secs_f64()),
            };
            if let Err(e) = self.tick(&markers, dt) {
                break Err(e);
            }

            self.timer.end_of_iteration();
            let elapsed = tick_start.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        };
        self.stop();
        result
    }

    /// Brings the arm to `target` at the speed of the profile, one command per `pace`. On a
    /// session that has not started, the starting configuration is sent first.
    /// Returns the number of commands sent.
    pub fn approach(
        &mut self,
        target: &JointConfiguration,
        pace: Option<Duration>,
        stop: &AtomicBool,
    ) -> Result<usize, TeleopError> {
        let mut sent = 0;
        loop {
            if stop.load(Ordering::Relaxed) {
                info!("approach interrupted after {} commands", sent);
                break;
            }
            let tick_start = Instant::now();
            let Some(command) = self.orchestrator.approach(target)? else {
                break;
            };
            self.emit(&command)?;
            sent += 1;
            self.timer.record(tick_start.elapsed());
            if let Some(pace) = pace {
                thread::sleep(pace.saturating_sub(tick_start.elapsed()));
            }
        }
        debug!("approach took {} commands", sent);
        Ok(sent)
    }

    /// Sends the recorded commands in order, one per `pace` (as fast as possible without).
    /// Returns the number of commands sent.
    pub fn replay(
        &mut self,
        archive: &SessionArchive,
        pace: Option<Duration>,
        stop: &AtomicBool,
    ) -> Result<usize, TeleopError> {
        if archive.base_move_mode != self.orchestrator.mode() {
            error!(
                "archive recorded in {} mode, session runs in {} mode",
                archive.base_move_mode,
                self.orchestrator.mode()
            );
            return Err(TeleopError::ModeMismatch {
                archive: archive.base_move_mode,
                session: self.orchestrator.mode(),
            });
        }
        let configurations = archive.configurations(self.orchestrator.limits())?;

        let mut sent = 0;
        for (i, recorded) in configurations.iter().enumerate() {
            if stop.load(Ordering::Relaxed) {
                info!("replay interrupted after {} of {}", sent, configurations.len());
                break;
            }
            let tick_start = Instant::now();
            let command = self.orchestrator.play(recorded)?;
            self.emit(&command)?;
            sent += 1;
            if (i + 1) % 100 == 0 {
                debug!("{}/{} configurations sent", i + 1, configurations.len());
            }
            self.timer.record(tick_start.elapsed());
            if let Some(pace) = pace {
                thread::sleep(pace.saturating_sub(tick_start.elapsed()));
            }
        }
        Ok(sent)
    }

    /// Stops the orchestrator and releases the robot. Later calls do nothing.
    pub fn stop(&mut self) {
        if self.released {
            return;
        }
        self.orchestrator.stop();
        self.timer.log();
        self.actuator.release();
        self.released = true;
        info!("session stopped");
    }
}

impl<A: Actuator> Drop for Session<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer_vision::transform_io::CameraExtrinsics;
    use crate::config::TeleopConfig;
    use crate::frame_buffer::latest_frame_channel;
    use crate::joints::BaseMode;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingActuator {
        ready: bool,
        /// Commands accepted before `send` starts failing.
        capacity: usize,
        sent: Vec<JointConfiguration>,
        releases: Rc<Cell<usize>>,
    }

    impl Actuator for CountingActuator {
        fn is_ready(&mut self) -> Result<(), String> {
            if self.ready { Ok(()) } else { Err("not homed".into()) }
        }

        fn send(&mut self, command: &JointConfiguration) -> Result<(), String> {
            if self.sent.len() == self.capacity {
                return Err("runstop pressed".into());
            }
            self.sent.push(*command);
            Ok(())
        }

        fn release(&mut self) {
            self.releases.set(self.releases.get() + 1);
        }
    }

    fn actuator(ready: bool) -> (CountingActuator, Rc<Cell<usize>>) {
        let releases = Rc::new(Cell::new(0));
        (
            CountingActuator {
                ready,
                capacity: usize::MAX,
                sent: Vec::new(),
                releases: releases.clone(),
            },
            releases,
        )
    }

    fn orchestrator() -> MotionOrchestrator {
        MotionOrchestrator::new(&TeleopConfig::default(), CameraExtrinsics::identity()).unwrap()
    }

    #[test]
    fn test_not_ready_sends_nothing() {
        let (actuator, releases) = actuator(false);
        let result = Session::new(orchestrator(), actuator);
        assert!(matches!(result, Err(TeleopError::ActuatorNotReady(_))));
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_released_exactly_once() {
        let (actuator, releases) = actuator(true);
        let mut session = Session::new(orchestrator(), actuator).unwrap();
        session.tick(&MarkerCollection::empty(0.0), 0.033).unwrap();
        session.stop();
        session.stop();
        assert!(session.tick(&MarkerCollection::empty(0.1), 0.033).is_err());
        drop(session);
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_run_ends_when_camera_closes() {
        let (actuator, releases) = actuator(true);
        let config = TeleopConfig {
            tick_rate_hz: 1000.0,
            ..TeleopConfig::default()
        };
        let detector = config.marker_detector().unwrap();
        let orchestrator = MotionOrchestrator::new(&config, CameraExtrinsics::identity()).unwrap();
        let mut session = Session::new(orchestrator, actuator).unwrap().recording();

        let (mut writer, mut reader) = latest_frame_channel();
        writer.publish(0.0, GrayImage::from_pixel(64, 48, image::Luma([128])));
        drop(writer);

        let stop = AtomicBool::new(false);
        session.run(&mut reader, &detector, &stop).unwrap();
        assert_eq!(releases.get(), 1);
        assert_eq!(session.actuator().sent.len(), 1);
        assert_eq!(session.take_recording().unwrap().len(), 1);
        assert_eq!(session.orchestrator().state(), crate::orchestrator::LoopState::Stopped);
    }

    #[test]
    fn test_replay_rejects_mode_mismatch() {
        let (actuator, _) = actuator(true);
        let mut session = Session::new(orchestrator(), actuator).unwrap();
        let mut archive = SessionArchive::new(BaseMode::Prismatic);
        archive.joint_config_to_save.push(JointConfiguration::zeros(BaseMode::Prismatic).to_map());
        let stop = AtomicBool::new(false);
        assert!(matches!(
            session.replay(&archive, None, &stop),
            Err(TeleopError::ModeMismatch { .. })
        ));
        assert!(session.actuator().sent.is_empty());
    }

    #[test]
    fn test_failed_send_ends_run_with_actuator_error() {
        let (mut actuator, releases) = actuator(true);
        actuator.capacity = 2;
        let config = TeleopConfig {
            tick_rate_hz: 1000.0,
            ..TeleopConfig::default()
        };
        let detector = config.marker_detector().unwrap();
        let orchestrator = MotionOrchestrator::new(&config, CameraExtrinsics::identity()).unwrap();
        let mut session = Session::new(orchestrator, actuator).unwrap().recording();

        // The camera stays open, so only the failing actuator ends the loop.
        let (_writer, mut reader) = latest_frame_channel::<GrayImage>();
        let result = session.run(&mut reader, &detector, &AtomicBool::new(false));
        match result {
            Err(TeleopError::Actuator(reason)) => assert_eq!(reason, "runstop pressed"),
            other => panic!("expected actuator failure, got {:?}", other),
        }
        assert_eq!(session.actuator().sent.len(), 2);
        assert_eq!(session.take_recording().unwrap().len(), 2);
        assert_eq!(releases.get(), 1);
    }
}
