//! Generic PID (Proportional–Integral–Derivative) controller.
//!
//! The head tracker runs one controller per axis: the measurement is the
//! target's normalised offset from the frame centre, the set-point is `0`,
//! and the output is an incremental angle to add to the commanded pose.
//!
//! # Example
//!
//! ```rust
//! use clawbody_hal::pid::{Gains, PidController};
//!
//! let mut pan = PidController::new(Gains::new(0.6, 0.0, 0.05)).with_output_limits(-0.1, 0.1);
//!
//! // Target sits to the right of centre: the correction turns the head right.
//! let step = pan.update(0.4, 0.04);
//! assert!(step < 0.0);
//! ```

/// Proportional, integral and derivative gains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Gains {
    pub const fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }
}

/// A tunable PID controller for closed-loop feedback control.
#[derive(Debug, Clone)]
pub struct PidController {
    gains: Gains,
    set_point: f32,
    integral: f32,
    last_error: Option<f32>,
    output_min: f32,
    output_max: f32,
}

impl PidController {
    /// Create a controller with the given gains and a set-point of `0`.
    ///
    /// Output is unclamped until [`with_output_limits`][Self::with_output_limits]
    /// is applied.
    pub fn new(gains: Gains) -> Self {
        Self {
            gains,
            set_point: 0.0,
            integral: 0.0,
            last_error: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        }
    }

    /// Clamp the output (and the integral contribution) to `[min, max]`.
    pub fn with_output_limits(mut self, min: f32, max: f32) -> Self {
        self.output_min = min.min(max);
        self.output_max = max.max(min);
        self
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: Gains) {
        self.gains = gains;
    }

    /// Compute the next output for `measurement` after `dt` seconds.
    ///
    /// Returns `0.0` and leaves the state untouched when `dt` is not
    /// positive.
    pub fn update(&mut self, measurement: f32, dt: f32) -> f32 {
        if dt <= 0.0 || !dt.is_finite() {
            return 0.0;
        }
        let Gains { kp, ki, kd } = self.gains;
        let error = self.set_point - measurement;

        // Anti-windup: clamp the integral contribution and back-calculate.
        self.integral += error * dt;
        let i = (ki * self.integral).clamp(self.output_min, self.output_max);
        if ki.abs() > f32::EPSILON {
            self.integral = i / ki;
        }

        let d = self
            .last_error
            .map_or(0.0, |prev| kd * (error - prev) / dt);
        self.last_error = Some(error);

        (kp * error + i + d).clamp(self.output_min, self.output_max)
    }

    /// Forget accumulated state, e.g. when the tracked target is lost.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centred_target_needs_no_correction() {
        let mut pid = PidController::new(Gains::new(1.0, 0.5, 0.1));
        assert!(pid.update(0.0, 0.04).abs() < 1e-6);
    }

    #[test]
    fn proportional_term_opposes_offset() {
        let mut pid = PidController::new(Gains::new(0.5, 0.0, 0.0));
        assert!((pid.update(0.4, 0.04) + 0.2).abs() < 1e-6);
        assert!((pid.update(-0.4, 0.04) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn output_is_clamped_to_step_limit() {
        let mut pid = PidController::new(Gains::new(10.0, 0.0, 0.0)).with_output_limits(-0.05, 0.05);
        assert_eq!(pid.update(1.0, 0.04), -0.05);
        assert_eq!(pid.update(-1.0, 0.04), 0.05);
    }

    #[test]
    fn integral_accumulates_and_is_bounded() {
        let mut pid = PidController::new(Gains::new(0.0, 1.0, 0.0)).with_output_limits(-0.3, 0.3);
        // Constant offset of 1.0 for 0.5 s → integral contribution -0.5,
        // clamped at the -0.3 limit and not wound up beyond it.
        for _ in 0..5 {
            pid.update(1.0, 0.1);
        }
        assert!((pid.update(1.0, 0.1) + 0.3).abs() < 1e-6);
        // Reversing the offset starts unwinding from the limit, not from the
        // unclamped -0.6 accumulator.
        assert!((pid.update(-1.0, 0.1) + 0.2).abs() < 1e-6);
    }

    #[test]
    fn derivative_damps_fast_motion() {
        let mut pid = PidController::new(Gains::new(0.0, 0.0, 0.1));
        pid.update(0.0, 0.1);
        // Error went from 0 to -0.5 in 0.1 s → d = 0.1 * -5 = -0.5
        assert!((pid.update(0.5, 0.1) + 0.5).abs() < 1e-5);
    }

    #[test]
    fn reset_matches_fresh_controller() {
        let gains = Gains::new(1.0, 1.0, 1.0);
        let mut used = PidController::new(gains);
        used.update(0.7, 0.1);
        used.update(0.2, 0.1);
        used.reset();
        let mut fresh = PidController::new(gains);
        assert!((used.update(0.3, 0.1) - fresh.update(0.3, 0.1)).abs() < 1e-6);
    }

    #[test]
    fn non_positive_dt_is_ignored() {
        let mut pid = PidController::new(Gains::new(1.0, 1.0, 1.0));
        assert_eq!(pid.update(0.5, 0.0), 0.0);
        assert_eq!(pid.update(0.5, -1.0), 0.0);
        assert_eq!(pid.update(0.5, f32::NAN), 0.0);
        let mut fresh = PidController::new(Gains::new(1.0, 1.0, 1.0));
        assert!((pid.update(0.5, 0.1) - fresh.update(0.5, 0.1)).abs() < 1e-6);
    }

    #[test]
    fn set_gains_takes_effect() {
        let mut pid = PidController::new(Gains::new(1.0, 0.0, 0.0));
        pid.set_gains(Gains::new(3.0, 0.0, 0.0));
        assert_eq!(pid.gains().kp, 3.0);
        assert!((pid.update(-0.1, 0.04) - 0.3).abs() < 1e-6);
    }
}
