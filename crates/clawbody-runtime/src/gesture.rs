//! Gesture & Emotion Engine.
//!
//! Watches the user's transcript as it streams in and decides when the body
//! should react with a behavior from the [`CapabilityRegistry`].
//!
//! ```text
//! Idle ──delta──▶ Listening ──cue / magnitude──▶ Deciding ──command──▶ Cooldown
//!   ▲                                                                   │
//!   └──────────────────────────── interval elapsed ◀────────────────────┘
//! ```
//!
//! Two triggers exist.  A **cue word** (e.g. "dance", "happy") maps to a
//! behavior category or a named behavior.  A **natural gesture** fires when a
//! single delta completes at least `natural_token_threshold` new words.  Cues
//! win over natural gestures, a turn gets at most one natural gesture, and
//! nothing fires during cooldown.  When several behaviors qualify the most
//! recently registered one is chosen.
//!
//! Agent directives bypass all of this: [`GestureEngine::directive_command`]
//! resolves them straight to [`Priority::Directed`] commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clawbody_kernel::CapabilityRegistry;
use clawbody_types::{
    ActionCommand, ActionTarget, AgentDirective, BehaviorCategory, BehaviorDescriptor, BodyError,
    DeltaKind, HeadPose, Issuer, Priority, Role, TranscriptDelta,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_LOOK_YAW_DEG: f32 = 60.0;
const MAX_LOOK_PITCH_DEG: f32 = 35.0;

/// What a cue word asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum CueTarget {
    /// The most recently registered behavior of the category.
    Category(BehaviorCategory),
    Named(String),
}

#[derive(Debug, Clone)]
pub struct GestureConfig {
    pub natural_token_threshold: usize,
    pub cooldown: Duration,
    /// Lower-case cue word → target.
    pub cues: HashMap<String, CueTarget>,
}

impl Default for GestureConfig {
    fn default() -> Self {
        let mut cues = HashMap::new();
        for word in ["dance", "celebrate"] {
            cues.insert(word.to_string(), CueTarget::Category(BehaviorCategory::Dance));
        }
        for emotion in [
            "happy",
            "sad",
            "surprised",
            "curious",
            "thinking",
            "confused",
            "excited",
        ] {
            cues.insert(emotion.to_string(), CueTarget::Named(emotion.to_string()));
        }
        Self {
            natural_token_threshold: 6,
            cooldown: Duration::from_secs(3),
            cues,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Listening,
    Deciding,
    Cooldown { until: Instant },
}

/// Result of resolving an [`AgentDirective`].
#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveOutcome {
    Command(ActionCommand),
    /// Stop every actuator.
    StopAll,
}

struct TurnProgress {
    id: Uuid,
    text: String,
    words_seen: usize,
    natural_fired: bool,
}

pub struct GestureEngine {
    registry: Arc<CapabilityRegistry>,
    config: GestureConfig,
    state: EngineState,
    turn: Option<TurnProgress>,
}

impl GestureEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, config: GestureConfig) -> Self {
        Self {
            registry,
            config,
            state: EngineState::Idle,
            turn: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Feed a transcript delta.  Agent deltas are ignored.
    pub fn on_delta(&mut self, delta: &TranscriptDelta, now: Instant) -> Option<ActionCommand> {
        if delta.role != Role::User {
            return None;
        }
        if let EngineState::Cooldown { until } = self.state
            && now >= until
        {
            self.transition(EngineState::Idle);
        }
        if self.state == EngineState::Idle {
            self.transition(EngineState::Listening);
        }

        let new_words = self.absorb(delta);
        if matches!(self.state, EngineState::Cooldown { .. }) || new_words.is_empty() {
            return None;
        }

        let cue = new_words
            .iter()
            .find_map(|w| self.config.cues.get(w).map(|target| (w, target)));
        if let Some((word, target)) = cue {
            match self.resolve(target) {
                Some(behavior) => {
                    info!(cue = %word, behavior = %behavior.name, "cue gesture");
                    return Some(self.fire(behavior, Priority::Cue, now));
                }
                None => warn!(cue = %word, "no behavior available for cue word"),
            }
        }

        let natural_fired = self.turn.as_ref().is_some_and(|t| t.natural_fired);
        if new_words.len() >= self.config.natural_token_threshold && !natural_fired {
            let snapshot = self.registry.snapshot();
            let Some(behavior) = snapshot.by_category(BehaviorCategory::Gesture).first().map(|d| (*d).clone())
            else {
                debug!("no gesture behaviors registered");
                return None;
            };
            if let Some(turn) = self.turn.as_mut() {
                turn.natural_fired = true;
            }
            debug!(behavior = %behavior.name, words = new_words.len(), "natural gesture");
            return Some(self.fire(behavior, Priority::Natural, now));
        }
        None
    }

    /// Forget the per-turn progress of `turn_id`.
    pub fn on_turn_ended(&mut self, turn_id: Uuid) {
        if self.turn.as_ref().is_some_and(|t| t.id == turn_id) {
            self.turn = None;
            if self.state == EngineState::Listening {
                self.transition(EngineState::Idle);
            }
        }
    }

    /// Map an agent directive to a command.
    ///
    /// # Errors
    ///
    /// [`BodyError::NotFound`] when the named behavior is not registered.
    pub fn directive_command(
        &self,
        directive: &AgentDirective,
    ) -> Result<DirectiveOutcome, BodyError> {
        let target = match directive {
            AgentDirective::PlayBehavior { name } | AgentDirective::Emotion { name } => {
                ActionTarget::Behavior {
                    name: self.registry.lookup(name)?.name,
                }
            }
            AgentDirective::Dance { name: Some(name) } => ActionTarget::Behavior {
                name: self.registry.lookup(name)?.name,
            },
            AgentDirective::Dance { name: None } => {
                let snapshot = self.registry.snapshot();
                let dance = snapshot
                    .by_category(BehaviorCategory::Dance)
                    .first()
                    .map(|d| d.name.clone())
                    .ok_or_else(|| BodyError::NotFound("any dance".to_string()))?;
                ActionTarget::Behavior { name: dance }
            }
            AgentDirective::LookAt { yaw_deg, pitch_deg } => ActionTarget::HeadPose(HeadPose {
                yaw_rad: clamp_deg(*yaw_deg, MAX_LOOK_YAW_DEG).to_radians(),
                pitch_rad: clamp_deg(*pitch_deg, MAX_LOOK_PITCH_DEG).to_radians(),
            }),
            AgentDirective::Stop => return Ok(DirectiveOutcome::StopAll),
        };
        Ok(DirectiveOutcome::Command(ActionCommand::new(
            target,
            Priority::Directed,
            Issuer::Bridge,
        )))
    }

    /// Fold `delta` into the current turn and return the words it completed.
    fn absorb(&mut self, delta: &TranscriptDelta) -> Vec<String> {
        if self.turn.as_ref().is_none_or(|t| t.id != delta.turn_id) {
            self.turn = Some(TurnProgress {
                id: delta.turn_id,
                text: String::new(),
                words_seen: 0,
                natural_fired: false,
            });
        }
        let Some(turn) = self.turn.as_mut() else {
            return Vec::new();
        };
        match delta.kind {
            DeltaKind::Partial => turn.text.push_str(&delta.text),
            DeltaKind::Final => turn.text.clone_from(&delta.text),
        }

        let words = words(&turn.text);
        // The last word of a partial transcript may still be growing.
        let complete = match delta.kind {
            DeltaKind::Final => words.len(),
            DeltaKind::Partial if turn.text.ends_with(char::is_whitespace) => words.len(),
            DeltaKind::Partial => words.len().saturating_sub(1),
        };
        let fresh = words
            .into_iter()
            .take(complete)
            .skip(turn.words_seen)
            .collect();
        turn.words_seen = turn.words_seen.max(complete);
        fresh
    }

    fn resolve(&self, target: &CueTarget) -> Option<BehaviorDescriptor> {
        let snapshot = self.registry.snapshot();
        match target {
            CueTarget::Category(category) => {
                snapshot.by_category(*category).first().map(|d| (*d).clone())
            }
            CueTarget::Named(name) => snapshot.lookup(name).cloned(),
        }
    }

    fn fire(&mut self, behavior: BehaviorDescriptor, priority: Priority, now: Instant) -> ActionCommand {
        self.transition(EngineState::Deciding);
        let command = ActionCommand::new(
            ActionTarget::Behavior {
                name: behavior.name,
            },
            priority,
            Issuer::Gesture,
        );
        self.transition(EngineState::Cooldown {
            until: now + self.config.cooldown,
        });
        command
    }

    fn transition(&mut self, next: EngineState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "gesture engine");
            self.state = next;
        }
    }
}

fn clamp_deg(value: f32, limit: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-limit, limit)
    } else {
        0.0
    }
}

/// Lower-cased words with surrounding punctuation removed.
fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}
