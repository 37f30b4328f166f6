//! Critically damped smoothing of remote positions
//!
//! The presented position chases its target like a critically damped
//! spring. With stiffness `omega = convergence / interval`, a step change
//! settles to `(1 + c) * e^-c` of its size after one broadcast interval,
//! about 0.05% for the default `c = 10`. The update below is the exact
//! solution of the spring equation, so the result does not depend on how
//! the elapsed time is split into frames.

use std::f32::consts::PI;
use std::time::Duration;

use crate::protocol::{Rotation, Vec3};

/// Below this error and speed the smoother snaps onto the target
const SETTLE_EPSILON: f32 = 1e-4;

/// Per-peer critically damped spring
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoother {
    omega: f32,
    velocity: Vec3,
}

impl Smoother {
    /// Smoother that converges within `interval` for the given convergence factor
    pub fn for_interval(interval: Duration, convergence: f32) -> Self {
        let secs = interval.as_secs_f32().max(f32::EPSILON);
        Self {
            omega: convergence.max(1.0) / secs,
            velocity: Vec3::ZERO,
        }
    }

    /// Advance `current` toward `target` by `dt`
    pub fn step(&mut self, current: Vec3, target: Vec3, dt: Duration) -> Vec3 {
        let dt = dt.as_secs_f32();
        if dt <= 0.0 {
            return current;
        }

        let error = current - target;
        let decay = (-self.omega * dt).exp();
        let temp = (self.velocity + error * self.omega) * dt;
        self.velocity = (self.velocity - temp * self.omega) * decay;
        let error = (error + temp) * decay;

        if error.length() < SETTLE_EPSILON && self.velocity.length() < SETTLE_EPSILON * self.omega {
            self.velocity = Vec3::ZERO;
            return target;
        }
        target + error
    }

    /// Stop all motion, used when the peer goes stale
    pub fn halt(&mut self) {
        self.velocity = Vec3::ZERO;
    }

    /// Ease `current` toward `target` along the shortest arc
    pub fn step_rotation(&self, current: Rotation, target: Rotation, dt: Duration) -> Rotation {
        let alpha = 1.0 - (-self.omega * dt.as_secs_f32()).exp();
        Rotation {
            pitch: current.pitch + (target.pitch - current.pitch) * alpha,
            yaw: current.yaw + shortest_arc(current.yaw, target.yaw) * alpha,
        }
    }
}

/// Signed angle from `from` to `to`, in `[-PI, PI)`
fn shortest_arc(from: f32, to: f32) -> f32 {
    (to - from + PI).rem_euclid(2.0 * PI) - PI
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_micros(16_667);

    #[test]
    fn test_step_change_converges_within_one_interval() {
        let mut smoother = Smoother::for_interval(INTERVAL, 10.0);
        let target = Vec3::new(1.0, 0.0, -2.0);
        let mut presented = Vec3::ZERO;

        // Render at a higher rate than the broadcast
        let frame = INTERVAL / 4;
        for _ in 0..4 {
            presented = smoother.step(presented, target, frame);
        }
        let initial_error = target.length();
        assert!(presented.distance(target) < initial_error * 0.01);
    }

    #[test]
    fn test_no_overshoot() {
        let mut smoother = Smoother::for_interval(INTERVAL, 10.0);
        let target = Vec3::new(5.0, 0.0, 0.0);
        let mut presented = Vec3::ZERO;

        for _ in 0..100 {
            presented = smoother.step(presented, target, Duration::from_millis(1));
            assert!(presented.x <= target.x + 1e-4);
        }
    }

    #[test]
    fn test_frame_split_does_not_change_result() {
        let target = Vec3::new(3.0, 1.0, 0.0);

        let mut coarse = Smoother::for_interval(INTERVAL, 10.0);
        let a = coarse.step(Vec3::ZERO, target, Duration::from_millis(8));

        let mut fine = Smoother::for_interval(INTERVAL, 10.0);
        let mut b = Vec3::ZERO;
        for _ in 0..8 {
            b = fine.step(b, target, Duration::from_millis(1));
        }
        assert!(a.distance(b) < 1e-3);
    }

    #[test]
    fn test_zero_dt_is_noop() {
        let mut smoother = Smoother::for_interval(INTERVAL, 10.0);
        let current = Vec3::new(1.0, 1.0, 1.0);
        assert_eq!(smoother.step(current, Vec3::ZERO, Duration::ZERO), current);
    }

    #[test]
    fn test_rotation_takes_shortest_arc() {
        let smoother = Smoother::for_interval(INTERVAL, 10.0);
        let current = Rotation {
            pitch: 0.0,
            yaw: PI - 0.1,
        };
        let target = Rotation {
            pitch: 0.0,
            yaw: -PI + 0.1,
        };
        let next = smoother.step_rotation(current, target, INTERVAL / 4);
        // Moving through PI, not back through zero
        assert!(next.yaw > current.yaw);
    }
}
