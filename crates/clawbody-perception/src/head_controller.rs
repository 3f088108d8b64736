//! Head-tracking control law.
//!
//! [`HeadController::step`] turns one perception observation into at most
//! one new head pose.  Pan and tilt each run a [`PidController`] whose
//! measurement is the target's normalised offset from the frame centre.
//!
//! Sign conventions: positive yaw turns the head left and positive pitch
//! looks up, while image `x` grows to the right and `y` grows downwards.
//! With a set-point of `0` the PID output already has the right sign for
//! both axes.
//!
//! When the target disappears the head holds for `face_lost_delay`, then
//! eases back to [`HeadPose::NEUTRAL`] over `return_duration`.  When the
//! camera itself is gone the head simply holds.

use std::time::{Duration, Instant};

use clawbody_hal::pid::{Gains, PidController};
use clawbody_types::{Detection, HeadPose};

/// What the perception worker saw on one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Target(Detection),
    NoTarget,
    CameraLost,
}

/// Tuning for [`HeadController`].  Angles are in radians.
#[derive(Debug, Clone, Copy)]
pub struct HeadControlConfig {
    /// PID gains shared by the pan and tilt loops.
    pub gains: Gains,
    /// Largest per-tick correction on either axis, in radians.
    pub max_step: f32,
    /// Scales the PID output before it is applied.
    pub tracking_scale: f32,
    /// Commanded yaw is clamped to `±yaw_limit`.
    pub yaw_limit: f32,
    /// Commanded pitch is clamped to `±pitch_limit`.
    pub pitch_limit: f32,
    /// Offsets smaller than this are treated as centred.
    pub deadband: f32,
    /// Poses closer than this to the last emitted one are not re-emitted.
    pub min_change: f32,
    /// How long the head holds its pose after the target disappears.
    pub face_lost_delay: Duration,
    /// Length of the ease back to neutral once the hold expires.
    pub return_duration: Duration,
}

impl Default for HeadControlConfig {
    fn default() -> Self {
        Self {
            gains: Gains::new(0.6, 0.0, 0.05),
            max_step: 0.08,
            tracking_scale: 0.6,
            yaw_limit: 0.8,
            pitch_limit: 0.5,
            deadband: 0.03,
            min_change: 0.002,
            face_lost_delay: Duration::from_secs(2),
            return_duration: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Return {
    from: HeadPose,
    started: Instant,
}

pub struct HeadController {
    config: HeadControlConfig,
    pan: PidController,
    tilt: PidController,
    pose: HeadPose,
    last_emitted: HeadPose,
    last_seen: Option<Instant>,
    returning: Option<Return>,
}

impl HeadController {
    pub fn new(config: HeadControlConfig) -> Self {
        let pid = || {
            PidController::new(config.gains).with_output_limits(-config.max_step, config.max_step)
        };
        Self {
            config,
            pan: pid(),
            tilt: pid(),
            pose: HeadPose::NEUTRAL,
            last_emitted: HeadPose::NEUTRAL,
            last_seen: None,
            returning: None,
        }
    }

    /// The pose the controller currently believes it has commanded.
    pub fn pose(&self) -> HeadPose {
        self.pose
    }

    /// Advance the controller by `dt` seconds at `now`.
    ///
    /// Returns the pose to command, or `None` when the head should stay
    /// where it is.
    pub fn step(&mut self, observation: &Observation, now: Instant, dt: f32) -> Option<HeadPose> {
        match observation {
            Observation::Target(detection) => {
                self.last_seen = Some(now);
                self.returning = None;
                let dx = self.deadband(detection.point.x);
                let dy = self.deadband(detection.point.y);
                let yaw_step = self.pan.update(dx, dt) * self.config.tracking_scale;
                let pitch_step = self.tilt.update(dy, dt) * self.config.tracking_scale;
                self.pose = HeadPose {
                    yaw_rad: (self.pose.yaw_rad + yaw_step)
                        .clamp(-self.config.yaw_limit, self.config.yaw_limit),
                    pitch_rad: (self.pose.pitch_rad + pitch_step)
                        .clamp(-self.config.pitch_limit, self.config.pitch_limit),
                };
                self.emit_if_changed()
            }
            Observation::NoTarget => {
                self.pan.reset();
                self.tilt.reset();
                let lost_for = self
                    .last_seen
                    .map_or(self.config.face_lost_delay, |seen| now.saturating_duration_since(seen));
                if lost_for < self.config.face_lost_delay || self.pose == HeadPose::NEUTRAL {
                    return None;
                }
                let ret = *self.returning.get_or_insert(Return {
                    from: self.pose,
                    started: now,
                });
                let total = self.config.return_duration.as_secs_f32();
                let t = if total <= 0.0 {
                    1.0
                } else {
                    now.saturating_duration_since(ret.started).as_secs_f32() / total
                };
                self.pose = if t >= 1.0 {
                    self.returning = None;
                    HeadPose::NEUTRAL
                } else {
                    ret.from.lerp(HeadPose::NEUTRAL, t)
                };
                self.emit_if_changed()
            }
            Observation::CameraLost => {
                self.pan.reset();
                self.tilt.reset();
                self.returning = None;
                None
            }
        }
    }

    fn deadband(&self, offset: f32) -> f32 {
        if offset.abs() < self.config.deadband {
            0.0
        } else {
            offset
        }
    }

    fn emit_if_changed(&mut self) -> Option<HeadPose> {
        let moved = (self.pose.yaw_rad - self.last_emitted.yaw_rad)
            .abs()
            .max((self.pose.pitch_rad - self.last_emitted.pitch_rad).abs());
        let arrived = self.pose == HeadPose::NEUTRAL && self.last_emitted != HeadPose::NEUTRAL;
        if moved < self.config.min_change && !arrived {
            return None;
        }
        self.last_emitted = self.pose;
        Some(self.pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawbody_types::TargetPoint;

    fn target(x: f32, y: f32) -> Observation {
        Observation::Target(Detection {
            point: TargetPoint { x, y },
            confidence: 1.0,
        })
    }

    #[test]
    fn target_right_and_below_turns_head_right_and_down() {
        let mut head = HeadController::new(HeadControlConfig::default());
        let now = Instant::now();
        let pose = head.step(&target(0.5, 0.4), now, 0.04).expect("moves");
        assert!(pose.yaw_rad < 0.0);
        assert!(pose.pitch_rad < 0.0);
    }

    #[test]
    fn step_size_and_range_are_bounded() {
        let cfg = HeadControlConfig::default();
        let mut head = HeadController::new(cfg);
        let mut now = Instant::now();
        let mut prev = HeadPose::NEUTRAL;
        for _ in 0..200 {
            now += Duration::from_millis(40);
            if let Some(p) = head.step(&target(-1.0, -1.0), now, 0.04) {
                assert!((p.yaw_rad - prev.yaw_rad).abs() <= cfg.max_step * cfg.tracking_scale + 1e-6);
                prev = p;
            }
        }
        assert!((head.pose().yaw_rad - cfg.yaw_limit).abs() < 1e-6);
        assert!((head.pose().pitch_rad - cfg.pitch_limit).abs() < 1e-6);
    }

    #[test]
    fn configured_limits_clamp_both_axes() {
        let cfg = HeadControlConfig {
            yaw_limit: 0.2,
            pitch_limit: 0.1,
            ..HeadControlConfig::default()
        };
        let mut head = HeadController::new(cfg);
        let mut now = Instant::now();
        for _ in 0..100 {
            now += Duration::from_millis(40);
            head.step(&target(1.0, 1.0), now, 0.04);
        }
        assert!((head.pose().yaw_rad + 0.2).abs() < 1e-6);
        assert!((head.pose().pitch_rad + 0.1).abs() < 1e-6);
    }

    #[test]
    fn centred_target_inside_deadband_holds() {
        let mut head = HeadController::new(HeadControlConfig::default());
        assert!(head.step(&target(0.01, -0.02), Instant::now(), 0.04).is_none());
        assert_eq!(head.pose(), HeadPose::NEUTRAL);
    }

    #[test]
    fn lost_target_holds_then_returns_to_neutral() {
        let cfg = HeadControlConfig::default();
        let mut head = HeadController::new(cfg);
        let t0 = Instant::now();
        for i in 0..10 {
            head.step(&target(0.6, 0.0), t0 + Duration::from_millis(40 * i), 0.04);
        }
        let held = head.pose();
        assert!(held.yaw_rad < 0.0);

        let t1 = t0 + Duration::from_millis(400);
        assert!(head.step(&Observation::NoTarget, t1 + Duration::from_secs(1), 0.04).is_none());
        assert_eq!(head.pose(), held);

        let start = t1 + Duration::from_millis(2100);
        head.step(&Observation::NoTarget, start, 0.04);
        let mid = head
            .step(&Observation::NoTarget, start + Duration::from_millis(500), 0.04)
            .expect("easing");
        assert!(mid.yaw_rad < 0.0 && mid.yaw_rad > held.yaw_rad);

        let end = head.step(&Observation::NoTarget, start + Duration::from_millis(1100), 0.04);
        assert_eq!(end, Some(HeadPose::NEUTRAL));
        assert!(head
            .step(&Observation::NoTarget, start + Duration::from_millis(1200), 0.04)
            .is_none());
    }

    #[test]
    fn camera_loss_holds_pose() {
        let mut head = HeadController::new(HeadControlConfig::default());
        let t0 = Instant::now();
        head.step(&target(0.8, 0.0), t0, 0.04);
        let held = head.pose();
        for s in 1..10 {
            assert!(head
                .step(&Observation::CameraLost, t0 + Duration::from_secs(s), 0.04)
                .is_none());
        }
        assert_eq!(head.pose(), held);
    }
}
