//! Bounds the change of joint commands between consecutive ticks.

use crate::constraints::JointLimits;
use crate::joints::{JOINT_COUNT, JointConfiguration, JointId};

/// Limits the rate of a desired joint position.
/// # Arguments
/// * `max_velocity` - Maximum allowed velocity.
/// * `delta_t` - Tick duration, seconds.
/// * `commanded_position` - Commanded joint position of the current tick.
/// * `last_commanded_position` - Commanded joint position of the previous tick.
/// # Return
/// Position at most `max_velocity * delta_t` away from the last one.
pub fn limit_rate_position(
    max_velocity: f64,
    delta_t: f64,
    commanded_position: f64,
    last_commanded_position: f64,
) -> f64 {
    let step = (max_velocity * delta_t).max(0.0);
    if !commanded_position.is_finite() {
        return last_commanded_position;
    }
    last_commanded_position + (commanded_position - last_commanded_position).clamp(-step, step)
}

/// Limits a base increment. Increments are not positions: the bound applies to the increment
/// itself, not to its difference from the previous one.
pub fn limit_rate_increment(max_velocity: f64, delta_t: f64, commanded_increment: f64) -> f64 {
    let step = (max_velocity * delta_t).max(0.0);
    if !commanded_increment.is_finite() {
        return 0.0;
    }
    commanded_increment.clamp(-step, step)
}

/// Limits the rate of every joint of a configuration, then clamps into the joint limits.
/// # Arguments
/// * `max_velocity` - Per-joint maximum velocity, indexed by [JointId::index].
/// * `delta_t` - Tick duration, seconds.
/// * `commanded` - Desired configuration of the current tick.
/// * `last_commanded` - Configuration emitted on the previous tick.
/// * `limits` - Joint limits.
pub fn limit_rate_joint_positions(
    max_velocity: &[f64; JOINT_COUNT],
    delta_t: f64,
    commanded: &JointConfiguration,
    last_commanded: &JointConfiguration,
    limits: &JointLimits,
) -> JointConfiguration {
    let mut limited = *commanded;
    for (joint, value) in commanded.iter() {
        let v_max = max_velocity[joint.index()];
        let bounded = if joint.is_base() {
            limit_rate_increment(v_max, delta_t, value)
        } else {
            let last = last_commanded.get(joint).unwrap_or(value);
            limit_rate_position(v_max, delta_t, value, last)
        };
        limited.set_unchecked(joint, limits.clamp(joint, bounded));
    }
    limited
}

/// Largest per-joint change between two configurations relative to what the velocities allow
/// in `delta_t`. Values up to 1 respect the rate limit. Base increments are compared as
/// magnitudes.
pub fn rate_ratio(
    max_velocity: &[f64; JOINT_COUNT],
    delta_t: f64,
    next: &JointConfiguration,
    previous: &JointConfiguration,
) -> f64 {
    next.iter()
        .map(|(joint, value)| {
            let change = if joint.is_base() {
                value.abs()
            } else {
                (value - previous.get(joint).unwrap_or(value)).abs()
            };
            let step = max_velocity[joint.index()] * delta_t;
            if step > 0.0 {
                change / step
            } else if change > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        })
        .fold(0.0, f64::max)
}
