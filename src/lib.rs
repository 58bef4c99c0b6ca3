//! Teleoperation of a Stretch style mobile manipulator with a pair of tongs.
//!
//! A webcam watches a pair of tongs fitted with two fiducial markers. The pose of the primary
//! marker, mapped into the robot frame by a one-time camera calibration, gives the goal of the
//! pinch point between the gripper fingertips; the distance between the two markers gives the
//! grip width. A closed-form inverse kinematics for the lift, telescoping arm, three-axis wrist
//! and mobile base turns the goal into joint targets, which are rate limited and sent once per
//! control tick.
//!
//! # Features
//!
//! - Square binary markers from a deterministic dictionary, detected and decoded without
//!   external vision libraries; pose from a single marker via planar homography.
//! - Camera extrinsic calibration from a board of markers at measured places on the robot,
//!   rejected if the reprojection error is too large.
//! - Goal smoothing, single frame jump rejection, and holding the last goal whenever the tongs
//!   are not seen.
//! - Analytical inverse and forward kinematics, cross-checked with each other. The base either
//!   drives along its axis (`prismatic`) or turns in place (`rotary`), never both in one session.
//! - Every emitted command is within the joint limits and within maximum velocity times tick
//!   duration of the previous one.
//! - Sessions can be recorded and played back.
//!
//! # Chain
//!
//! The chain geometry is described by [parameters::Parameters]. With all joints at zero the wrist yaw
//! axis is vertical, the lift raises it along z and the arm extends it sideways, along -y of the
//! base frame (x forward, y left, z up). [parameters::Parameters::stretch] gives the values of the real
//! robot.
//!
//! # Configuration
//!
//! Everything tunable is in [config::TeleopConfig], read from YAML. Angles can be written as
//! `deg(90)`.

pub mod parameters;
pub mod parameters_robots;
pub mod parameters_from_file;
pub mod parameter_error;

#[path = "utils/utils.rs"]
pub mod utils;
pub mod kinematic_traits;
pub mod kinematics_impl;

pub mod constraints;
pub mod joints;

pub mod computer_vision;
pub mod calibration;
pub mod goal;

pub mod rate_limiting;
pub mod orchestrator;

pub mod config;
pub mod errors;

pub mod frame_buffer;
pub mod archive;
pub mod session;

#[cfg(test)]
mod tests;
