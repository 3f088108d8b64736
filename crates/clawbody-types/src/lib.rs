//! `clawbody-types` – shared data model for the embodiment orchestrator.
//!
//! Every crate in the workspace speaks in terms of these types: conversational
//! [`Turn`]s and their [`TranscriptDelta`]s, playable [`BehaviorDescriptor`]s,
//! arbitrated [`ActionCommand`]s, the perception [`TrackingState`], and the
//! [`BodyError`] taxonomy.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Sample rate of every PCM16 stream exchanged with the speech provider.
pub const SPEECH_SAMPLE_RATE: u32 = 24_000;

// ─────────────────────────────────────────────────────────────────────────────
// Conversation
// ─────────────────────────────────────────────────────────────────────────────

/// Who is speaking in a [`Turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// Lifecycle of a [`Turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Open,
    Closed,
    /// An agent turn interrupted by barge-in (or a user turn cut by a dropped
    /// connection).
    Aborted,
}

/// Whether a [`TranscriptDelta`] is an incremental fragment or the complete
/// transcript of its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Partial,
    Final,
}

/// Incremental transcript fragment.
///
/// Sequence numbers strictly increase within a turn.  For
/// [`DeltaKind::Final`] deltas `text` holds the complete turn transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptDelta {
    pub turn_id: Uuid,
    pub role: Role,
    pub seq: u64,
    pub text: String,
    pub kind: DeltaKind,
}

impl TranscriptDelta {
    pub fn is_final(&self) -> bool {
        self.kind == DeltaKind::Final
    }
}

/// One conversational exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub role: Role,
    pub text: String,
    pub status: TurnStatus,
    last_seq: Option<u64>,
}

impl Turn {
    /// Open a new turn for `role`.
    pub fn open(role: Role) -> Self {
        Self::open_with_id(Uuid::new_v4(), role)
    }

    /// Open a turn with a caller-chosen id (used when the id is handed out
    /// before the provider confirms the turn).
    pub fn open_with_id(id: Uuid, role: Role) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            role,
            text: String::new(),
            status: TurnStatus::Open,
            last_seq: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TurnStatus::Open
    }

    /// Highest sequence number applied so far.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// The sequence number the next delta of this turn must carry.
    pub fn next_seq(&self) -> u64 {
        self.last_seq.map_or(1, |s| s + 1)
    }

    /// Fold `delta` into the turn.
    ///
    /// Partial deltas append to the running text; a final delta replaces it
    /// and closes the turn.
    ///
    /// # Errors
    ///
    /// * [`BodyError::InvalidState`] when the turn is no longer open or the
    ///   delta belongs to another turn.
    /// * [`BodyError::OutOfOrder`] when `delta.seq` does not exceed the last
    ///   applied sequence number.
    pub fn apply(&mut self, delta: &TranscriptDelta) -> Result<(), BodyError> {
        if delta.turn_id != self.id {
            return Err(BodyError::InvalidState(format!(
                "delta for turn {} applied to turn {}",
                delta.turn_id, self.id
            )));
        }
        if !self.is_open() {
            return Err(BodyError::InvalidState(format!(
                "turn {} is {:?}",
                self.id, self.status
            )));
        }
        if let Some(last) = self.last_seq
            && delta.seq <= last
        {
            return Err(BodyError::OutOfOrder {
                last,
                got: delta.seq,
            });
        }
        self.last_seq = Some(delta.seq);
        match delta.kind {
            DeltaKind::Partial => self.text.push_str(&delta.text),
            DeltaKind::Final => {
                self.text = delta.text.clone();
                self.status = TurnStatus::Closed;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.is_open() {
            self.status = TurnStatus::Closed;
        }
    }

    pub fn abort(&mut self) {
        if self.is_open() {
            self.status = TurnStatus::Aborted;
        }
    }
}

/// Events produced by the speech duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpeechEvent {
    Transcript(TranscriptDelta),
    TurnStarted { turn_id: Uuid, role: Role },
    TurnEnded { turn_id: Uuid, role: Role, aborted: bool },
    /// User speech started while an agent turn was in flight.
    BargeIn { aborted_turn: Uuid },
    SynthAudio(AudioChunk),
    ConnectionError { fatal: bool, message: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Behaviors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorCategory {
    Gesture,
    Emotion,
    Dance,
}

/// Where a behavior comes from: a recorded move on the robot, or a motion
/// synthesized on the fly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorSource {
    Recorded,
    Synthesized,
}

/// A playable behavior exposed by the robot platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDescriptor {
    pub name: String,
    pub category: BehaviorCategory,
    pub duration_ms: u64,
    pub source: BehaviorSource,
    /// Assigned by the capability registry the first time the name is seen.
    /// Higher means more recently registered.  Stores leave it at `0`.
    #[serde(default)]
    pub ordinal: u64,
}

impl BehaviorDescriptor {
    pub fn recorded(name: impl Into<String>, category: BehaviorCategory, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            category,
            duration_ms,
            source: BehaviorSource::Recorded,
            ordinal: 0,
        }
    }

    pub fn synthesized(
        name: impl Into<String>,
        category: BehaviorCategory,
        duration_ms: u64,
    ) -> Self {
        Self {
            source: BehaviorSource::Synthesized,
            ..Self::recorded(name, category, duration_ms)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────────────────────────

/// Head orientation in radians.  Positive yaw turns left, positive pitch
/// looks up.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw_rad: f32,
    pub pitch_rad: f32,
}

impl HeadPose {
    pub const NEUTRAL: HeadPose = HeadPose {
        yaw_rad: 0.0,
        pitch_rad: 0.0,
    };

    /// Linear interpolation towards `to`; `t` is clamped to `[0, 1]`.
    pub fn lerp(self, to: HeadPose, t: f32) -> HeadPose {
        let t = t.clamp(0.0, 1.0);
        HeadPose {
            yaw_rad: self.yaw_rad + (to.yaw_rad - self.yaw_rad) * t,
            pitch_rad: self.pitch_rad + (to.pitch_rad - self.pitch_rad) * t,
        }
    }
}

/// A chunk of PCM16 mono audio belonging to one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub turn_id: Uuid,
    pub seq: u64,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

/// What an [`ActionCommand`] drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionTarget {
    Behavior { name: String },
    HeadPose(HeadPose),
    SpeechAudio(AudioChunk),
    /// Body sway amplitude in `[0, 1]`.
    Sway { amplitude: f32 },
}

impl ActionTarget {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            ActionTarget::Behavior { .. } => Subsystem::Player,
            ActionTarget::HeadPose(_) => Subsystem::Head,
            ActionTarget::SpeechAudio(_) => Subsystem::Speaker,
            ActionTarget::Sway { .. } => Subsystem::Sway,
        }
    }
}

/// Physical output channel of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Head,
    Player,
    Sway,
    Speaker,
}

impl Subsystem {
    /// Pending commands for a coalescible subsystem are superseded by newer
    /// ones.  Speaker audio is an ordered stream and never coalesced.
    pub fn is_coalescible(self) -> bool {
        !matches!(self, Subsystem::Speaker)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Head => "head",
            Subsystem::Player => "player",
            Subsystem::Sway => "sway",
            Subsystem::Speaker => "speaker",
        }
    }
}

/// Dispatch priority, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Speech-synced sway.
    Ambient,
    /// Perception head corrections.
    Tracking,
    /// Magnitude-triggered gestures.
    Natural,
    /// Cue-word gestures.
    Cue,
    /// Explicit agent directives.
    Directed,
    /// Synthesized speech audio.
    Speech,
}

/// The component that issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Issuer {
    Gesture,
    Perception,
    Bridge,
    Sway,
    Speech,
    Session,
}

impl std::fmt::Display for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Issuer::Gesture => "gesture",
            Issuer::Perception => "perception",
            Issuer::Bridge => "bridge",
            Issuer::Sway => "sway",
            Issuer::Speech => "speech",
            Issuer::Session => "session",
        };
        f.write_str(s)
    }
}

/// A candidate actuator command, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub id: Uuid,
    pub target: ActionTarget,
    pub priority: Priority,
    pub issuer: Issuer,
    pub timestamp: DateTime<Utc>,
}

impl ActionCommand {
    /// Build a command stamped with the current time.
    pub fn new(target: ActionTarget, priority: Priority, issuer: Issuer) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            priority,
            issuer,
            timestamp: Utc::now(),
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        self.target.subsystem()
    }
}

/// Anything that accepts [`ActionCommand`]s for dispatch.
///
/// Implemented by the dispatcher handle; components that emit commands hold
/// an `Arc<dyn ActionSink>` so they never talk to the robot directly.
pub trait ActionSink: Send + Sync {
    /// Enqueue `command` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::Channel`] when the consumer has shut down.
    fn submit(&self, command: ActionCommand) -> Result<(), BodyError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent directives
// ─────────────────────────────────────────────────────────────────────────────

/// An explicit action the remote agent asks the body to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentDirective {
    /// Play a named behavior of any category.
    PlayBehavior { name: String },
    /// Dance; without a name the most recently registered dance is used.
    Dance { name: Option<String> },
    /// Express a named emotion.
    Emotion { name: String },
    /// Turn the head to an absolute orientation in degrees.
    LookAt { yaw_deg: f32, pitch_deg: f32 },
    /// Stop whatever behavior is currently playing.
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// Perception
// ─────────────────────────────────────────────────────────────────────────────

/// Target position normalised to the frame: `(0, 0)` is the centre, `x`
/// grows to the right and `y` grows downwards, both in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetPoint {
    pub x: f32,
    pub y: f32,
}

/// One detector hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub point: TargetPoint,
    pub confidence: f32,
}

/// Latest tracking estimate.  Written only by the perception loop.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingState {
    pub target: Option<TargetPoint>,
    pub confidence: f32,
    pub updated_at: DateTime<Utc>,
}

/// Natural-language description of what the camera currently sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Event bus payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"clawbody-kernel::dispatcher"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A component fell back to a reduced mode of operation.
    Degraded { component: String, reason: String },
    SceneDescribed(SceneDescription),
    DispatchFailed {
        issuer: Issuer,
        command_id: Uuid,
        details: String,
    },
    BehaviorsRefreshed { generation: u64, count: usize },
    TurnEnded {
        turn_id: Uuid,
        role: Role,
        aborted: bool,
    },
    SessionClosed { reason: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every component.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BodyError {
    #[error("Transient I/O failure in {component}: {details}")]
    TransientIo { component: String, details: String },

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("External service {service} failed: {details}")]
    ExternalService { service: String, details: String },

    #[error("Fatal connection loss: {0}")]
    FatalConnectionLoss(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Out-of-order transcript delta: got seq {got} after {last}")]
    OutOfOrder { last: u64, got: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Command rejected by {rule}: {details}")]
    Rejected { rule: String, details: String },

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BodyError {
    /// Faults a component is expected to retry locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BodyError::TransientIo { .. } | BodyError::ResourceUnavailable(_)
        )
    }

    /// Faults that must tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BodyError::FatalConnectionLoss(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(turn: &Turn, seq: u64, text: &str, kind: DeltaKind) -> TranscriptDelta {
        TranscriptDelta {
            turn_id: turn.id,
            role: turn.role,
            seq,
            text: text.to_string(),
            kind,
        }
    }

    #[test]
    fn turn_accumulates_partials_and_closes_on_final() {
        let mut turn = Turn::open(Role::User);
        turn.apply(&delta(&turn, 1, "hel", DeltaKind::Partial)).unwrap();
        turn.apply(&delta(&turn, 2, "lo", DeltaKind::Partial)).unwrap();
        assert_eq!(turn.text, "hello");
        assert_eq!(turn.next_seq(), 3);

        turn.apply(&delta(&turn, 3, "hello there", DeltaKind::Final)).unwrap();
        assert_eq!(turn.text, "hello there");
        assert_eq!(turn.status, TurnStatus::Closed);
    }

    #[test]
    fn turn_rejects_non_increasing_seq() {
        let mut turn = Turn::open(Role::User);
        turn.apply(&delta(&turn, 5, "a", DeltaKind::Partial)).unwrap();
        let err = turn.apply(&delta(&turn, 5, "b", DeltaKind::Partial)).unwrap_err();
        assert_eq!(err, BodyError::OutOfOrder { last: 5, got: 5 });
        let err = turn.apply(&delta(&turn, 2, "c", DeltaKind::Partial)).unwrap_err();
        assert!(matches!(err, BodyError::OutOfOrder { .. }));
        assert_eq!(turn.text, "a");
    }

    #[test]
    fn closed_turn_rejects_deltas() {
        let mut turn = Turn::open(Role::Agent);
        turn.abort();
        assert_eq!(turn.status, TurnStatus::Aborted);
        let err = turn.apply(&delta(&turn, 1, "x", DeltaKind::Partial)).unwrap_err();
        assert!(matches!(err, BodyError::InvalidState(_)));

        // Closing an aborted turn must not resurrect it as closed.
        turn.close();
        assert_eq!(turn.status, TurnStatus::Aborted);
    }

    #[test]
    fn priority_order_puts_speech_first() {
        let mut all = vec![
            Priority::Speech,
            Priority::Ambient,
            Priority::Cue,
            Priority::Tracking,
            Priority::Directed,
            Priority::Natural,
        ];
        all.sort();
        assert_eq!(
            all,
            vec![
                Priority::Ambient,
                Priority::Tracking,
                Priority::Natural,
                Priority::Cue,
                Priority::Directed,
                Priority::Speech,
            ]
        );
    }

    #[test]
    fn only_speaker_is_not_coalescible() {
        assert!(Subsystem::Head.is_coalescible());
        assert!(Subsystem::Player.is_coalescible());
        assert!(Subsystem::Sway.is_coalescible());
        assert!(!Subsystem::Speaker.is_coalescible());
    }

    #[test]
    fn directive_uses_action_tag() {
        let json = r#"{"action":"dance","name":null}"#;
        let d: AgentDirective = serde_json::from_str(json).unwrap();
        assert_eq!(d, AgentDirective::Dance { name: None });

        let look: AgentDirective =
            serde_json::from_str(r#"{"action":"look_at","yaw_deg":10.0,"pitch_deg":-5.0}"#)
                .unwrap();
        assert!(matches!(look, AgentDirective::LookAt { .. }));

        let stop = serde_json::to_string(&AgentDirective::Stop).unwrap();
        assert_eq!(stop, r#"{"action":"stop"}"#);
    }

    #[test]
    fn head_pose_lerp_clamps() {
        let from = HeadPose {
            yaw_rad: 1.0,
            pitch_rad: -0.5,
        };
        assert_eq!(from.lerp(HeadPose::NEUTRAL, 2.0), HeadPose::NEUTRAL);
        let mid = from.lerp(HeadPose::NEUTRAL, 0.5);
        assert!((mid.yaw_rad - 0.5).abs() < 1e-6);
        assert!((mid.pitch_rad + 0.25).abs() < 1e-6);
    }

    #[test]
    fn body_error_classification() {
        let transient = BodyError::TransientIo {
            component: "camera".into(),
            details: "timeout".into(),
        };
        assert!(transient.is_transient());
        assert!(!transient.is_fatal());
        assert!(BodyError::FatalConnectionLoss("gone".into()).is_fatal());
        assert!(transient.to_string().contains("camera"));
    }
}
