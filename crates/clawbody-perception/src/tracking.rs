//! [`TrackingEstimator`] – the single writer of [`TrackingState`].
//!
//! Readers hold a `watch::Receiver` and always see the latest estimate.
//! A fresh, confident detection replaces the state outright.  Anything else
//! (no detection, weak detection, camera gone) clears the target and lets
//! confidence decay linearly to zero.

use chrono::Utc;
use clawbody_types::{Detection, TrackingState};
use tokio::sync::watch;

/// Tuning for [`TrackingEstimator`].
#[derive(Debug, Clone, Copy)]
pub struct TrackingConfig {
    /// Confidence lost per second without a usable detection.
    pub decay_per_sec: f32,
    /// Detections below this confidence are ignored.
    pub min_confidence: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            decay_per_sec: 1.0,
            min_confidence: 0.3,
        }
    }
}

pub struct TrackingEstimator {
    config: TrackingConfig,
    state: TrackingState,
    tx: watch::Sender<TrackingState>,
}

impl TrackingEstimator {
    pub fn new(config: TrackingConfig) -> (Self, watch::Receiver<TrackingState>) {
        let state = TrackingState {
            target: None,
            confidence: 0.0,
            updated_at: Utc::now(),
        };
        let (tx, rx) = watch::channel(state);
        (Self { config, state, tx }, rx)
    }

    /// Fold one observation taken `dt` seconds after the previous one.
    pub fn observe(&mut self, detection: Option<Detection>, dt: f32) -> TrackingState {
        match detection {
            Some(d) if d.confidence >= self.config.min_confidence => {
                self.state.target = Some(d.point);
                self.state.confidence = d.confidence.clamp(0.0, 1.0);
            }
            _ => {
                self.state.target = None;
                let decay = self.config.decay_per_sec * dt.max(0.0);
                self.state.confidence = (self.state.confidence - decay).max(0.0);
            }
        }
        self.state.updated_at = Utc::now();
        self.tx.send_replace(self.state);
        self.state
    }

    pub fn current(&self) -> TrackingState {
        self.state
    }
}
