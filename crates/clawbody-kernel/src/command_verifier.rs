//! [`CommandVerifier`] – last physical check before the motors.
//!
//! The dispatcher passes every [`ActionCommand`] through
//! [`CommandVerifier::verify`].  Rules are evaluated in order; the first
//! violation returns [`BodyError::Rejected`] and the command is **not**
//! executed.
//!
//! Built-in rules:
//! - [`HeadPoseLimitRule`] – keeps head poses inside the neck's range.
//! - [`SwayAmplitudeRule`] – caps body sway.
//! - [`AudioFormatRule`] – only accepts speech audio at the expected rate.

use clawbody_types::{ActionCommand, ActionTarget, BodyError, SPEECH_SAMPLE_RATE};

/// A single invariant a command must satisfy.
pub trait CommandRule: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(())` when `command` satisfies the rule, [`BodyError::Rejected`]
    /// otherwise.
    fn check(&self, command: &ActionCommand) -> Result<(), BodyError>;
}

/// Ordered list of [`CommandRule`]s.
///
/// # Example
///
/// ```
/// use clawbody_kernel::command_verifier::{CommandVerifier, SwayAmplitudeRule};
/// use clawbody_types::{ActionCommand, ActionTarget, Issuer, Priority};
///
/// let mut verifier = CommandVerifier::new();
/// verifier.add_rule(Box::new(SwayAmplitudeRule { max_amplitude: 1.0 }));
///
/// let gentle = ActionCommand::new(ActionTarget::Sway { amplitude: 0.4 }, Priority::Ambient, Issuer::Sway);
/// assert!(verifier.verify(&gentle).is_ok());
///
/// let wild = ActionCommand::new(ActionTarget::Sway { amplitude: 3.0 }, Priority::Ambient, Issuer::Sway);
/// assert!(verifier.verify(&wild).is_err());
/// ```
#[derive(Default)]
pub struct CommandVerifier {
    rules: Vec<Box<dyn CommandRule>>,
}

impl CommandVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A verifier loaded with the built-in rules at their default limits.
    pub fn with_default_rules() -> Self {
        let mut verifier = Self::new();
        verifier.add_rule(Box::new(HeadPoseLimitRule::default()));
        verifier.add_rule(Box::new(SwayAmplitudeRule::default()));
        verifier.add_rule(Box::new(AudioFormatRule::default()));
        verifier
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn CommandRule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, command: &ActionCommand) -> Result<(), BodyError> {
        for rule in &self.rules {
            rule.check(command)?;
        }
        Ok(())
    }
}

fn rejected(rule: &str, details: String) -> BodyError {
    BodyError::Rejected {
        rule: rule.to_string(),
        details,
    }
}

/// Rejects head poses outside `[-max_yaw, max_yaw]` × `[-max_pitch, max_pitch]`
/// or with non-finite angles.
pub struct HeadPoseLimitRule {
    pub max_yaw_rad: f32,
    pub max_pitch_rad: f32,
}

impl Default for HeadPoseLimitRule {
    fn default() -> Self {
        Self {
            max_yaw_rad: 1.2,
            max_pitch_rad: 0.7,
        }
    }
}

impl CommandRule for HeadPoseLimitRule {
    fn name(&self) -> &str {
        "head_pose_limit"
    }

    fn check(&self, command: &ActionCommand) -> Result<(), BodyError> {
        if let ActionTarget::HeadPose(pose) = &command.target {
            if !(pose.yaw_rad.is_finite() && pose.yaw_rad.abs() <= self.max_yaw_rad) {
                return Err(rejected(
                    self.name(),
                    format!("yaw {} outside ±{}", pose.yaw_rad, self.max_yaw_rad),
                ));
            }
            if !(pose.pitch_rad.is_finite() && pose.pitch_rad.abs() <= self.max_pitch_rad) {
                return Err(rejected(
                    self.name(),
                    format!("pitch {} outside ±{}", pose.pitch_rad, self.max_pitch_rad),
                ));
            }
        }
        Ok(())
    }
}

/// Rejects sway amplitudes outside `[0, max_amplitude]`.
pub struct SwayAmplitudeRule {
    pub max_amplitude: f32,
}

impl Default for SwayAmplitudeRule {
    fn default() -> Self {
        Self { max_amplitude: 1.0 }
    }
}

impl CommandRule for SwayAmplitudeRule {
    fn name(&self) -> &str {
        "sway_amplitude"
    }

    fn check(&self, command: &ActionCommand) -> Result<(), BodyError> {
        if let ActionTarget::Sway { amplitude } = command.target {
            if !(0.0..=self.max_amplitude).contains(&amplitude) {
                return Err(rejected(
                    self.name(),
                    format!("amplitude {amplitude} outside [0, {}]", self.max_amplitude),
                ));
            }
        }
        Ok(())
    }
}

/// Rejects speech audio at any rate other than `sample_rate`.
pub struct AudioFormatRule {
    pub sample_rate: u32,
}

impl Default for AudioFormatRule {
    fn default() -> Self {
        Self {
            sample_rate: SPEECH_SAMPLE_RATE,
        }
    }
}

impl CommandRule for AudioFormatRule {
    fn name(&self) -> &str {
        "audio_format"
    }

    fn check(&self, command: &ActionCommand) -> Result<(), BodyError> {
        if let ActionTarget::SpeechAudio(chunk) = &command.target {
            if chunk.sample_rate != self.sample_rate {
                return Err(rejected(
                    self.name(),
                    format!("{} Hz audio, expected {} Hz", chunk.sample_rate, self.sample_rate),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawbody_types::{AudioChunk, HeadPose, Issuer, Priority};
    use uuid::Uuid;

    fn head(yaw_rad: f32, pitch_rad: f32) -> ActionCommand {
        ActionCommand::new(
            ActionTarget::HeadPose(HeadPose { yaw_rad, pitch_rad }),
            Priority::Tracking,
            Issuer::Perception,
        )
    }

    fn audio(sample_rate: u32) -> ActionCommand {
        ActionCommand::new(
            ActionTarget::SpeechAudio(AudioChunk {
                turn_id: Uuid::new_v4(),
                seq: 0,
                sample_rate,
                samples: vec![0; 16],
            }),
            Priority::Speech,
            Issuer::Speech,
        )
    }

    #[test]
    fn head_pose_inside_range_passes() {
        let v = CommandVerifier::with_default_rules();
        assert!(v.verify(&head(0.5, -0.3)).is_ok());
        assert!(v.verify(&head(-1.2, 0.7)).is_ok());
    }

    #[test]
    fn head_pose_outside_range_is_rejected() {
        let v = CommandVerifier::with_default_rules();
        let err = v.verify(&head(1.5, 0.0)).unwrap_err();
        assert!(matches!(err, BodyError::Rejected { ref rule, .. } if rule == "head_pose_limit"));
        assert!(v.verify(&head(0.0, -0.9)).is_err());
        assert!(v.verify(&head(f32::NAN, 0.0)).is_err());
    }

    #[test]
    fn sway_amplitude_is_capped() {
        let v = CommandVerifier::with_default_rules();
        let ok = ActionCommand::new(ActionTarget::Sway { amplitude: 0.0 }, Priority::Ambient, Issuer::Sway);
        let negative = ActionCommand::new(ActionTarget::Sway { amplitude: -0.1 }, Priority::Ambient, Issuer::Sway);
        assert!(v.verify(&ok).is_ok());
        assert!(v.verify(&negative).is_err());
    }

    #[test]
    fn audio_must_match_speech_rate() {
        let v = CommandVerifier::with_default_rules();
        assert!(v.verify(&audio(SPEECH_SAMPLE_RATE)).is_ok());
        let err = v.verify(&audio(16_000)).unwrap_err();
        assert!(matches!(err, BodyError::Rejected { ref rule, .. } if rule == "audio_format"));
    }

    #[test]
    fn behaviors_are_not_range_checked() {
        let v = CommandVerifier::with_default_rules();
        let cmd = ActionCommand::new(
            ActionTarget::Behavior { name: "wave".into() },
            Priority::Cue,
            Issuer::Gesture,
        );
        assert!(v.verify(&cmd).is_ok());
    }

    #[test]
    fn empty_verifier_accepts_everything() {
        assert!(CommandVerifier::new().verify(&head(9.0, 9.0)).is_ok());
    }
}
