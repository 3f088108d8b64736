//! Speech-synced body sway.
//!
//! [`SwayGenerator`] follows the loudness of outgoing synthesized audio and
//! turns it into [`ActionTarget::Sway`] commands at [`Priority::Ambient`].
//! It never looks at transcript content and has no cooldown; it only stays
//! quiet while the amplitude barely moves.

use clawbody_types::{ActionCommand, ActionTarget, Issuer, Priority};

#[derive(Debug, Clone)]
pub struct SwayConfig {
    /// Envelope smoothing while loudness rises, in `(0, 1]`.
    pub attack: f32,
    /// Envelope smoothing while loudness falls, in `(0, 1]`.
    pub release: f32,
    /// RMS → amplitude multiplier.  Speech RMS rarely exceeds a quarter of
    /// full scale.
    pub gain: f32,
    /// Smallest amplitude change worth a command.
    pub min_change: f32,
}

impl Default for SwayConfig {
    fn default() -> Self {
        Self {
            attack: 0.6,
            release: 0.15,
            gain: 4.0,
            min_change: 0.05,
        }
    }
}

pub struct SwayGenerator {
    config: SwayConfig,
    envelope: f32,
    last_sent: f32,
}

impl SwayGenerator {
    pub fn new(config: SwayConfig) -> Self {
        Self {
            config,
            envelope: 0.0,
            last_sent: 0.0,
        }
    }

    pub fn amplitude(&self) -> f32 {
        self.last_sent
    }

    /// Feed one chunk of synthesized audio.
    pub fn feed(&mut self, samples: &[i16]) -> Option<ActionCommand> {
        if samples.is_empty() {
            return None;
        }
        let level = rms(samples);
        let k = if level > self.envelope {
            self.config.attack
        } else {
            self.config.release
        };
        self.envelope += k * (level - self.envelope);

        let amplitude = (self.envelope * self.config.gain).clamp(0.0, 1.0);
        if (amplitude - self.last_sent).abs() < self.config.min_change {
            return None;
        }
        self.last_sent = amplitude;
        Some(sway_command(amplitude))
    }

    /// Forget the envelope and settle the body.  `None` when already still.
    pub fn reset(&mut self) -> Option<ActionCommand> {
        self.envelope = 0.0;
        if self.last_sent == 0.0 {
            return None;
        }
        self.last_sent = 0.0;
        Some(sway_command(0.0))
    }
}

fn sway_command(amplitude: f32) -> ActionCommand {
    ActionCommand::new(
        ActionTarget::Sway { amplitude },
        Priority::Ambient,
        Issuer::Sway,
    )
}

/// Root mean square normalised to `[0, 1]`.
fn rms(samples: &[i16]) -> f32 {
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32_768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amplitude_of(cmd: &ActionCommand) -> f32 {
        match cmd.target {
            ActionTarget::Sway { amplitude } => amplitude,
            ref other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn silence_produces_nothing() {
        let mut g = SwayGenerator::new(SwayConfig::default());
        assert!(g.feed(&[0; 480]).is_none());
        assert!(g.feed(&[]).is_none());
    }

    #[test]
    fn loud_audio_raises_amplitude_within_bounds() {
        let mut g = SwayGenerator::new(SwayConfig::default());
        let loud = vec![20_000i16; 480];
        let cmd = g.feed(&loud).expect("first loud chunk moves the body");
        assert_eq!(cmd.priority, Priority::Ambient);
        assert_eq!(cmd.issuer, Issuer::Sway);
        let a = amplitude_of(&cmd);
        assert!(a > 0.0 && a <= 1.0);

        for _ in 0..20 {
            if let Some(cmd) = g.feed(&loud) {
                assert!(amplitude_of(&cmd) <= 1.0);
            }
        }
        assert_eq!(g.amplitude(), 1.0);
    }

    #[test]
    fn steady_level_stops_emitting() {
        let mut g = SwayGenerator::new(SwayConfig::default());
        let quiet = vec![1_500i16; 480];
        let emitted = (0..30).filter(|_| g.feed(&quiet).is_some()).count();
        assert!(emitted < 30);
        assert!(g.feed(&quiet).is_none());
    }

    #[test]
    fn reset_settles_once() {
        let mut g = SwayGenerator::new(SwayConfig::default());
        g.feed(&vec![20_000i16; 480]);
        let cmd = g.reset().expect("body was moving");
        assert_eq!(amplitude_of(&cmd), 0.0);
        assert!(g.reset().is_none());
    }

    #[test]
    fn rms_of_full_scale_square_is_one() {
        assert!((rms(&[i16::MIN; 64]) - 1.0).abs() < 1e-6);
    }
}
