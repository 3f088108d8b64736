//! The Robot Platform Seam.
//!
//! The orchestrator never speaks directly to actuator firmware or to the
//! behavior daemon.  The dispatcher drives a [`RobotPlatform`]; the
//! capability registry scans a [`BehaviorStore`].  Backends implement one or
//! both:
//!
//! - [`SimPlatform`][crate::sim_platform::SimPlatform] – records every call,
//!   used for simulation mode and tests.
//! - [`DaemonPlatform`][crate::daemon_platform::DaemonPlatform] – talks HTTP
//!   to the on-robot daemon.

use async_trait::async_trait;
use clawbody_types::{ActionTarget, BehaviorDescriptor, BodyError, Subsystem};

/// Physical output of the robot.
///
/// # Contract
///
/// * `execute` – perform one arbitrated action.  Only the dispatcher calls
///   this, one call at a time.
/// * `stop` – halt whatever `subsystem` is currently doing (e.g. flush the
///   speaker on barge-in).
#[async_trait]
pub trait RobotPlatform: Send + Sync {
    async fn execute(&self, target: &ActionTarget) -> Result<(), BodyError>;

    async fn stop(&self, subsystem: Subsystem) -> Result<(), BodyError>;
}

/// Source of recorded behaviors.
#[async_trait]
pub trait BehaviorStore: Send + Sync {
    /// List every behavior currently available.  Ordinals in the returned
    /// descriptors are ignored; the registry assigns its own.
    async fn scan(&self) -> Result<Vec<BehaviorDescriptor>, BodyError>;
}
