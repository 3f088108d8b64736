//! `clawbody-kernel` – Arbitration & Capabilities
//!
//! The brainstem of the body.  It does not think; it decides what the robot
//! is able to do and which of the competing requests actually reaches the
//! motors.
//!
//! # Modules
//!
//! - [`capability_registry`] – [`CapabilityRegistry`][capability_registry::CapabilityRegistry]:
//!   the published set of playable behaviors, rescanned from the
//!   [`BehaviorStore`][clawbody_middleware::BehaviorStore] and swapped in as
//!   an immutable snapshot so readers never see a half-built set.
//! - [`command_verifier`] – [`CommandVerifier`][command_verifier::CommandVerifier]:
//!   a rule engine that checks every
//!   [`ActionCommand`][clawbody_types::ActionCommand] against physical
//!   limits (head range, sway amplitude, audio format) before dispatch.
//! - [`dispatcher`] – [`Dispatcher`][dispatcher::Dispatcher]: the single
//!   consumer of all action commands.  Orders by priority, coalesces
//!   superseded commands, flushes speech on barge-in, and is the only caller
//!   of the [`RobotPlatform`][clawbody_middleware::RobotPlatform].

pub mod capability_registry;
pub mod command_verifier;
pub mod dispatcher;

pub use capability_registry::{CapabilityRegistry, CapabilitySnapshot};
pub use command_verifier::{
    AudioFormatRule, CommandRule, CommandVerifier, HeadPoseLimitRule, SwayAmplitudeRule,
};
pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherMsg};
