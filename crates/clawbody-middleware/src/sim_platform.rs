//! In-process simulated robot.
//!
//! [`SimPlatform`] implements both [`RobotPlatform`] and [`BehaviorStore`].
//! It keeps a configurable behavior catalog, tracks the commanded head pose,
//! and records every call so that simulation runs can be inspected and tests
//! can assert on exactly what reached the "hardware".

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use clawbody_types::{
    ActionTarget, BehaviorCategory, BehaviorDescriptor, BodyError, HeadPose, Subsystem,
};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::platform::{BehaviorStore, RobotPlatform};

/// One call observed by the simulated robot.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    Executed(ActionTarget),
    Stopped(Subsystem),
}

#[derive(Default)]
struct SimState {
    calls: Vec<PlatformCall>,
    catalog: Vec<BehaviorDescriptor>,
    failing: HashSet<String>,
    scan_error: Option<BodyError>,
    head: HeadPose,
}

/// A recording robot backend.
#[derive(Default)]
pub struct SimPlatform {
    state: Mutex<SimState>,
    changed: Notify,
}

impl SimPlatform {
    /// An empty robot: no recorded behaviors.
    pub fn new() -> Self {
        Self::default()
    }

    /// A robot with a small recorded repertoire, used by simulation mode.
    pub fn with_demo_catalog() -> Self {
        let sim = Self::new();
        sim.set_catalog(vec![
            BehaviorDescriptor::recorded("wave", BehaviorCategory::Gesture, 1_500),
            BehaviorDescriptor::recorded("look_around", BehaviorCategory::Gesture, 2_500),
            BehaviorDescriptor::recorded("cheerful", BehaviorCategory::Emotion, 2_000),
            BehaviorDescriptor::recorded("groovy_sway", BehaviorCategory::Dance, 6_000),
            BehaviorDescriptor::recorded("chicken_peck", BehaviorCategory::Dance, 5_000),
        ]);
        sim
    }

    /// Replace the behaviors reported by the next scan.
    pub fn set_catalog(&self, catalog: Vec<BehaviorDescriptor>) {
        self.lock().catalog = catalog;
    }

    /// Make the next scans fail with `error` (`None` restores scanning).
    pub fn set_scan_error(&self, error: Option<BodyError>) {
        self.lock().scan_error = error;
    }

    /// Make playback of `name` fail.
    pub fn fail_behavior(&self, name: impl Into<String>) {
        self.lock().failing.insert(name.into());
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.lock().calls.clone()
    }

    /// Every executed target, in order.
    pub fn executed(&self) -> Vec<ActionTarget> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                PlatformCall::Executed(t) => Some(t.clone()),
                PlatformCall::Stopped(_) => None,
            })
            .collect()
    }

    /// The last head pose commanded.
    pub fn head_pose(&self) -> HeadPose {
        self.lock().head
    }

    /// Wait until `predicate` holds for the recorded calls, or `timeout`
    /// elapses.  Returns whether the predicate was satisfied.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[PlatformCall]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if predicate(&self.lock().calls) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return predicate(&self.lock().calls);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: PlatformCall) {
        self.lock().calls.push(call);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl RobotPlatform for SimPlatform {
    async fn execute(&self, target: &ActionTarget) -> Result<(), BodyError> {
        match target {
            ActionTarget::Behavior { name } => {
                if self.lock().failing.contains(name) {
                    return Err(BodyError::TransientIo {
                        component: "sim-player".to_string(),
                        details: format!("playback of '{name}' failed"),
                    });
                }
                info!(behavior = %name, "sim: playing behavior");
            }
            ActionTarget::HeadPose(pose) => {
                self.lock().head = *pose;
                debug!(yaw = pose.yaw_rad, pitch = pose.pitch_rad, "sim: head pose");
            }
            ActionTarget::SpeechAudio(chunk) => {
                debug!(turn = %chunk.turn_id, seq = chunk.seq, samples = chunk.samples.len(), "sim: audio chunk");
            }
            ActionTarget::Sway { amplitude } => {
                debug!(amplitude, "sim: sway");
            }
        }
        self.record(PlatformCall::Executed(target.clone()));
        Ok(())
    }

    async fn stop(&self, subsystem: Subsystem) -> Result<(), BodyError> {
        info!(subsystem = subsystem.as_str(), "sim: stop");
        self.record(PlatformCall::Stopped(subsystem));
        Ok(())
    }
}

#[async_trait]
impl BehaviorStore for SimPlatform {
    async fn scan(&self) -> Result<Vec<BehaviorDescriptor>, BodyError> {
        let state = self.lock();
        match &state.scan_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.catalog.clone()),
        }
    }
}
