//! `clawbody-perception` – The Eyes
//!
//! Turns camera frames into a tracked target, head corrections, and periodic
//! scene descriptions.
//!
//! # Modules
//!
//! - [`detector`] – [`TargetDetector`] implementations: a bright-spot
//!   detector for simulation and a remote HTTP detection service.
//! - [`tracking`] – [`TrackingEstimator`]: owns the published
//!   [`TrackingState`][clawbody_types::TrackingState] and decays confidence
//!   when the target disappears.
//! - [`head_controller`] – [`HeadController`]: pan/tilt PID tracking, hold on
//!   camera loss, and an eased return to neutral once the face is gone.
//! - [`scene`] – the [`SceneDescriber`] seam.
//! - [`perception_loop`] – [`PerceptionLoop`]: the fixed-rate scheduler tying
//!   everything together.

pub mod detector;
pub mod head_controller;
pub mod perception_loop;
pub mod scene;
pub mod tracking;

pub use detector::{BrightSpotDetector, RemoteDetector, TargetDetector};
pub use head_controller::{HeadControlConfig, HeadController, Observation};
pub use perception_loop::{
    MAX_RATE_HZ, PerceptionConfig, PerceptionCounters, PerceptionHandle, PerceptionLoop,
    valid_rate,
};
pub use scene::SceneDescriber;
pub use tracking::{TrackingConfig, TrackingEstimator};
