//! `clawbody-runtime` – The Conversation Engine
//!
//! Where a remote agent becomes a body that listens, talks and moves.
//!
//! # Modules
//!
//! - [`speech`] – [`SpeechChannel`][speech::SpeechChannel]: the full-duplex
//!   connection to the realtime speech provider.  Streams microphone audio
//!   up, turns provider events into ordered conversational turns, detects
//!   barge-in, and reconnects with backoff.
//! - [`gesture`] – [`GestureEngine`][gesture::GestureEngine]: picks cue-word
//!   and natural gestures from the streaming transcript, with a cooldown, and
//!   maps agent directives to commands.
//! - [`sway`] – [`SwayGenerator`][sway::SwayGenerator]: body sway following
//!   the loudness of synthesized speech.
//! - [`bridge`] – [`GatewayClient`][bridge::GatewayClient] and
//!   [`BridgeWorker`][bridge::BridgeWorker]: hands finalized turns to the
//!   remote agent gateway and degrades to a fallback reply when it is down.
//! - [`session`] – [`Session`][session::Session]: wires every component
//!   together and tears them down deterministically.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP export.
//!
//! # Actuation
//!
//! Nothing in this crate talks to the robot directly.  Every gesture, sway
//! update, directive and speech chunk becomes an
//! [`ActionCommand`][clawbody_types::ActionCommand] submitted to the
//! [`Dispatcher`], which arbitrates and executes them one at a time.

pub mod bridge;
pub mod gesture;
pub mod session;
pub mod speech;
pub mod sway;
pub mod telemetry;

pub use bridge::{
    AgentReply, BridgeConfig, BridgeHandle, BridgeOutcome, BridgeRequest, BridgeWorker,
    FALLBACK_IDENTITY, Gateway, GatewayClient, GatewayConfig, GatewayError,
    GatewaySceneDescriber, TurnContext, agent_persona,
};
pub use gesture::{CueTarget, DirectiveOutcome, EngineState, GestureConfig, GestureEngine};
pub use session::{Session, SessionConfig, SessionDeps};
pub use speech::{SpeechChannel, SpeechConfig, SpeechEvents, SpeechHandle};
pub use sway::{SwayConfig, SwayGenerator};
pub use telemetry::{TracerProviderGuard, init_tracing};

pub use clawbody_kernel::Dispatcher;
