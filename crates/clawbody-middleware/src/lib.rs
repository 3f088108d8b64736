//! `clawbody-middleware` – The Nervous System
//!
//! Routes data between the orchestrator and the outside world without caring
//! about its meaning.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`platform`] – the [`RobotPlatform`] and [`BehaviorStore`] seams every
//!   robot backend implements.
//! - [`sim_platform`] – an in-process robot that records every call.
//! - [`daemon_platform`] – HTTP client for the on-robot behavior daemon.
//! - [`realtime`] – the [`SpeechTransport`] seam and its realtime WebSocket
//!   implementation.

pub mod bus;
pub mod daemon_platform;
pub mod platform;
pub mod realtime;
pub mod sim_platform;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use daemon_platform::DaemonPlatform;
pub use platform::{BehaviorStore, RobotPlatform};
pub use realtime::{ClientCommand, ProviderEvent, RealtimeConfig, RealtimeWsTransport, SpeechTransport};
pub use sim_platform::{PlatformCall, SimPlatform};
