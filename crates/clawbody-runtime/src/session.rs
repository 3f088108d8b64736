//! [`Session`] – one live embodiment of the agent.
//!
//! A session is built explicitly from its dependencies ([`SessionDeps`]) and
//! owns every background task it starts:
//!
//! | Task | Role |
//! |---|---|
//! | dispatcher | sole consumer of action commands, sole caller of the robot |
//! | registry refresher | periodic and on-demand behavior rescans |
//! | perception | camera sampling, head tracking, scene descriptions |
//! | speech | realtime provider connection and turn tracking |
//! | bridge | gateway submissions |
//! | conversation | routes speech events to gestures, sway, dispatcher and bridge |
//!
//! [`Session::shutdown`] cancels the shared token and awaits all of them, so
//! the speech connection is closed and the camera dropped before it returns.
//! A fatal speech error cancels the token on its own; [`Session::closed`]
//! resolves when that happens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clawbody_hal::Camera;
use clawbody_kernel::{CapabilityRegistry, CommandVerifier, Dispatcher, DispatcherHandle};
use clawbody_middleware::{BehaviorStore, EventBus, RobotPlatform, SpeechTransport, Topic};
use clawbody_perception::{
    PerceptionConfig, PerceptionHandle, PerceptionLoop, SceneDescriber, TargetDetector,
};
use clawbody_types::{
    ActionCommand, ActionSink, ActionTarget, AgentDirective, BodyError, EventPayload, HeadPose,
    Issuer, Priority, Role, SpeechEvent, Subsystem, TranscriptDelta,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{
    BridgeConfig, BridgeHandle, BridgeOutcome, BridgeRequest, BridgeWorker, Gateway, TurnContext,
};
use crate::gesture::{DirectiveOutcome, EngineState, GestureConfig, GestureEngine};
use crate::speech::{SpeechChannel, SpeechConfig, SpeechEvents, SpeechHandle};
use crate::sway::{SwayConfig, SwayGenerator};

const SOURCE: &str = "clawbody-runtime::session";

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Held while the user talks: centred, chin slightly up.
const LISTENING_POSE: HeadPose = HeadPose {
    yaw_rad: 0.0,
    pitch_rad: 0.1,
};

/// Emotion played while the agent works on a reply.
const THINKING_BEHAVIOR: &str = "thinking";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub speech: SpeechConfig,
    pub perception: PerceptionConfig,
    pub gesture: GestureConfig,
    pub sway: SwayConfig,
    pub bridge: BridgeConfig,
    pub registry_refresh: Duration,
    pub bus_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            speech: SpeechConfig::default(),
            perception: PerceptionConfig::default(),
            gesture: GestureConfig::default(),
            sway: SwayConfig::default(),
            bridge: BridgeConfig::default(),
            registry_refresh: Duration::from_secs(60),
            bus_capacity: 256,
        }
    }
}

/// Everything a session talks to.
pub struct SessionDeps {
    pub platform: Arc<dyn RobotPlatform>,
    pub store: Arc<dyn BehaviorStore>,
    pub camera: Box<dyn Camera>,
    pub detector: Box<dyn TargetDetector>,
    pub describer: Option<Arc<dyn SceneDescriber>>,
    pub transport: Box<dyn SpeechTransport>,
    pub gateway: Arc<dyn Gateway>,
}

pub struct Session {
    cancel: CancellationToken,
    bus: EventBus,
    registry: Arc<CapabilityRegistry>,
    dispatcher: DispatcherHandle,
    perception: PerceptionHandle,
    speech: SpeechHandle,
    gesture_state: watch::Receiver<EngineState>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Session {
    /// Start every component.
    ///
    /// An unreachable behavior store or gateway only degrades the session.
    ///
    /// # Errors
    ///
    /// Fails when the perception configuration is invalid or the speech
    /// provider cannot be reached.  Tasks already started are stopped first.
    pub async fn start(config: SessionConfig, deps: SessionDeps) -> Result<Self, BodyError> {
        let cancel = CancellationToken::new();
        let bus = EventBus::new(config.bus_capacity);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let registry = Arc::new(CapabilityRegistry::new(deps.store).with_bus(bus.clone()));
        if let Err(e) = registry.refresh().await {
            warn!(error = %e, "starting with built-in behaviors only");
        }
        tasks.push((
            "registry",
            registry.spawn_refresher(config.registry_refresh, cancel.clone()),
        ));

        let (dispatcher, dispatcher_handle) = Dispatcher::new(
            deps.platform,
            CommandVerifier::with_default_rules(),
            Some(bus.clone()),
        );
        tasks.push(("dispatcher", tokio::spawn(dispatcher.run(cancel.clone()))));

        let sink: Arc<dyn ActionSink> = Arc::new(dispatcher_handle.clone());
        let mut perception_loop =
            PerceptionLoop::new(config.perception, deps.camera, deps.detector, sink)
                .with_bus(bus.clone());
        if let Some(describer) = deps.describer {
            perception_loop = perception_loop.with_describer(describer);
        }
        let perception = match perception_loop.spawn(cancel.clone()) {
            Ok((handle, task)) => {
                tasks.push(("perception", task));
                handle
            }
            Err(e) => {
                abort_start(&cancel, tasks).await;
                return Err(e);
            }
        };

        match tokio::time::timeout(config.bridge.request_timeout, deps.gateway.ping()).await {
            Ok(Ok(())) => info!("agent gateway reachable"),
            Ok(Err(e)) => degrade_bridge(&bus, e.to_string()),
            Err(_) => degrade_bridge(&bus, "ping timed out".to_string()),
        }

        let (speech, events, speech_task) =
            match SpeechChannel::open(config.speech, deps.transport, cancel.clone()).await {
                Ok(opened) => opened,
                Err(e) => {
                    error!(error = %e, "speech provider unreachable");
                    abort_start(&cancel, tasks).await;
                    return Err(e);
                }
            };
        tasks.push(("speech", speech_task));

        let (bridge, outcomes, bridge_task) =
            BridgeWorker::new(Arc::clone(&deps.gateway), config.bridge)
                .with_bus(bus.clone())
                .spawn(cancel.clone());
        tasks.push(("bridge", bridge_task));

        let engine = GestureEngine::new(Arc::clone(&registry), config.gesture);
        let conversation_registry = Arc::clone(&registry);
        let (gesture_tx, gesture_state) = watch::channel(engine.state());
        let conversation = Conversation {
            engine,
            registry: conversation_registry,
            gesture_tx,
            sway: SwayGenerator::new(config.sway),
            dispatcher: dispatcher_handle.clone(),
            speech: speech.clone(),
            perception: perception.clone(),
            bridge,
            gateway: deps.gateway,
            bus: bus.clone(),
            cancel: cancel.clone(),
            exchanges: HashMap::new(),
            syncs: JoinSet::new(),
            flushed_turn: None,
            listening: false,
            thinking: false,
            awaiting: None,
        };
        tasks.push((
            "conversation",
            tokio::spawn(conversation.run(events, outcomes)),
        ));

        info!("session started");
        Ok(Self {
            cancel,
            bus,
            registry,
            dispatcher: dispatcher_handle,
            perception,
            speech,
            gesture_state,
            tasks,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn perception(&self) -> &PerceptionHandle {
        &self.perception
    }

    pub fn speech(&self) -> &SpeechHandle {
        &self.speech
    }

    pub fn gesture_state(&self) -> EngineState {
        *self.gesture_state.borrow()
    }

    /// Resolves once the session is shutting down for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Stop every task and wait for it to finish.
    pub async fn shutdown(mut self, reason: &str) {
        info!(reason, "closing session");
        self.speech.close();
        self.cancel.cancel();
        for (name, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "session task ended abnormally");
            }
        }
        self.bus.emit(
            Topic::SystemAlerts,
            SOURCE,
            EventPayload::SessionClosed {
                reason: reason.to_string(),
            },
        );
        info!("session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn abort_start(cancel: &CancellationToken, tasks: Vec<(&'static str, JoinHandle<()>)>) {
    cancel.cancel();
    for (name, task) in tasks {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task ended abnormally during aborted start");
        }
    }
}

fn degrade_bridge(bus: &EventBus, reason: String) {
    warn!(%reason, "agent gateway unavailable; replies will use the fallback");
    bus.emit(
        Topic::SystemAlerts,
        SOURCE,
        EventPayload::Degraded {
            component: "bridge".to_string(),
            reason,
        },
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation task
// ─────────────────────────────────────────────────────────────────────────────

/// User text and reply of one exchange, kept until the agent turn ends.
struct Exchange {
    user: String,
    assistant: String,
}

struct Conversation {
    engine: GestureEngine,
    registry: Arc<CapabilityRegistry>,
    gesture_tx: watch::Sender<EngineState>,
    sway: SwayGenerator,
    dispatcher: DispatcherHandle,
    speech: SpeechHandle,
    perception: PerceptionHandle,
    bridge: BridgeHandle,
    gateway: Arc<dyn Gateway>,
    bus: EventBus,
    cancel: CancellationToken,
    /// Keyed by agent turn id.
    exchanges: HashMap<Uuid, Exchange>,
    syncs: JoinSet<()>,
    /// Last agent turn flushed from the dispatcher.
    flushed_turn: Option<Uuid>,
    /// A user turn is open.
    listening: bool,
    /// The thinking emotion was issued and not yet cleared.
    thinking: bool,
    /// Latest user turn handed to the bridge.  Outcomes for any other turn
    /// are stale.
    awaiting: Option<Uuid>,
}

impl Conversation {
    async fn run(
        mut self,
        mut events: SpeechEvents,
        mut outcomes: mpsc::UnboundedReceiver<BridgeOutcome>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => self.on_speech(event),
                    None => {
                        warn!("speech channel ended; closing session");
                        self.cancel.cancel();
                        break;
                    }
                },
                Some(outcome) = outcomes.recv() => self.on_outcome(outcome).await,
                Some(joined) = self.syncs.join_next() => {
                    if let Err(e) = joined {
                        debug!(error = %e, "conversation sync task failed");
                    }
                }
            }
        }
        self.syncs.abort_all();
        debug!("conversation task stopped");
    }

    fn submit(&self, command: ActionCommand) {
        if let Err(e) = self.dispatcher.submit(command) {
            debug!(error = %e, "dispatcher gone; command dropped");
        }
    }

    fn on_speech(&mut self, event: SpeechEvent) {
        match event {
            SpeechEvent::Transcript(delta) => self.on_transcript(delta),
            SpeechEvent::TurnStarted { turn_id, role } => {
                debug!(turn = %turn_id, ?role, "turn started");
                if role == Role::User {
                    self.start_listening();
                }
            }
            SpeechEvent::TurnEnded {
                turn_id,
                role,
                aborted,
            } => self.on_turn_ended(turn_id, role, aborted),
            SpeechEvent::BargeIn { aborted_turn } => {
                self.barge_in(aborted_turn);
            }
            SpeechEvent::SynthAudio(chunk) => {
                self.stop_thinking();
                let sway = self.sway.feed(&chunk.samples);
                self.submit(ActionCommand::new(
                    ActionTarget::SpeechAudio(chunk),
                    Priority::Speech,
                    Issuer::Speech,
                ));
                if let Some(sway) = sway {
                    self.submit(sway);
                }
            }
            SpeechEvent::ConnectionError { fatal: true, message } => {
                error!(%message, "speech connection lost for good");
                self.bus.emit(
                    Topic::SystemAlerts,
                    SOURCE,
                    EventPayload::Degraded {
                        component: "speech".to_string(),
                        reason: message,
                    },
                );
                self.cancel.cancel();
            }
            SpeechEvent::ConnectionError { fatal: false, message } => {
                warn!(%message, "speech provider reported an error");
            }
        }
    }

    fn on_transcript(&mut self, delta: TranscriptDelta) {
        if delta.role != Role::User {
            return;
        }
        let gesture = self.engine.on_delta(&delta, Instant::now());
        self.gesture_tx.send_replace(self.engine.state());
        if let Some(command) = gesture {
            self.submit(command);
        }

        if delta.is_final() {
            let text = delta.text.trim();
            if text.is_empty() {
                debug!(turn = %delta.turn_id, "empty user turn; nothing to submit");
                return;
            }
            let context = TurnContext {
                scene: self.perception.scene().map(|s| s.text),
            };
            self.bridge.submit(BridgeRequest {
                turn_id: delta.turn_id,
                text: text.to_string(),
                context,
            });
            self.awaiting = Some(delta.turn_id);
            self.start_thinking();
        }
    }

    fn start_listening(&mut self) {
        self.listening = true;
        if let Some(settle) = self.sway.reset() {
            self.submit(settle);
        }
        self.submit(ActionCommand::new(
            ActionTarget::HeadPose(LISTENING_POSE),
            Priority::Ambient,
            Issuer::Session,
        ));
    }

    /// Play the thinking emotion unless a cue gesture is still cooling down.
    fn start_thinking(&mut self) {
        if self.thinking || matches!(self.engine.state(), EngineState::Cooldown { .. }) {
            return;
        }
        match self.registry.lookup(THINKING_BEHAVIOR) {
            Ok(behavior) => {
                self.submit(ActionCommand::new(
                    ActionTarget::Behavior {
                        name: behavior.name,
                    },
                    Priority::Natural,
                    Issuer::Session,
                ));
                self.thinking = true;
            }
            Err(e) => debug!(error = %e, "nothing to play while thinking"),
        }
    }

    fn stop_thinking(&mut self) {
        if !std::mem::take(&mut self.thinking) {
            return;
        }
        if let Err(e) = self.dispatcher.stop(Subsystem::Player) {
            debug!(error = %e, "dispatcher gone; stop dropped");
        }
    }

    fn on_turn_ended(&mut self, turn_id: Uuid, role: Role, aborted: bool) {
        self.bus.emit(
            Topic::Conversation,
            SOURCE,
            EventPayload::TurnEnded {
                turn_id,
                role,
                aborted,
            },
        );
        match role {
            Role::User => {
                self.listening = false;
                self.engine.on_turn_ended(turn_id);
                self.gesture_tx.send_replace(self.engine.state());
            }
            Role::Agent => {
                if let Some(settle) = self.sway.reset() {
                    self.submit(settle);
                }
                let exchange = self.exchanges.remove(&turn_id);
                if aborted {
                    self.barge_in(turn_id);
                } else if let Some(exchange) = exchange {
                    self.sync(exchange);
                }
            }
        }
    }

    fn barge_in(&mut self, turn_id: Uuid) {
        if self.flushed_turn.replace(turn_id) == Some(turn_id) {
            return;
        }
        if let Err(e) = self.dispatcher.barge_in(turn_id) {
            debug!(error = %e, "dispatcher gone; barge-in dropped");
        }
        if let Some(settle) = self.sway.reset() {
            self.submit(settle);
        }
    }

    fn sync(&mut self, exchange: Exchange) {
        let gateway = Arc::clone(&self.gateway);
        self.syncs.spawn(async move {
            let result = tokio::time::timeout(
                SYNC_TIMEOUT,
                gateway.sync_conversation(&exchange.user, &exchange.assistant),
            )
            .await;
            match result {
                Ok(Ok(())) => debug!("conversation synced to agent"),
                Ok(Err(e)) => warn!(error = %e, "conversation sync failed"),
                Err(_) => warn!("conversation sync timed out"),
            }
        });
    }

    fn apply_directives(&self, directives: &[AgentDirective]) {
        for directive in directives {
            match self.engine.directive_command(directive) {
                Ok(DirectiveOutcome::Command(command)) => self.submit(command),
                Ok(DirectiveOutcome::StopAll) => {
                    for subsystem in [Subsystem::Player, Subsystem::Head, Subsystem::Sway] {
                        if let Err(e) = self.dispatcher.stop(subsystem) {
                            debug!(error = %e, "dispatcher gone; stop dropped");
                        }
                    }
                }
                Err(e) => warn!(?directive, error = %e, "agent directive ignored"),
            }
        }
    }

    /// Act on the agent's answer to the latest user turn.
    ///
    /// Directives only reach the body together with an accepted reply, or
    /// with a silent one while nobody is talking.
    async fn on_outcome(&mut self, outcome: BridgeOutcome) {
        let (BridgeOutcome::Reply { turn_id, .. } | BridgeOutcome::Degraded { turn_id, .. }) =
            &outcome;
        if self.awaiting != Some(*turn_id) {
            debug!(user_turn = %turn_id, "outcome for a superseded turn dropped");
            return;
        }
        self.awaiting = None;
        self.stop_thinking();

        match outcome {
            BridgeOutcome::Reply {
                turn_id,
                user_text,
                reply,
            } => {
                if reply.text.is_empty() {
                    if self.listening {
                        info!(user_turn = %turn_id, "user is talking; directives dropped");
                    } else {
                        self.apply_directives(&reply.directives);
                    }
                    return;
                }
                match self.speech.speak(reply.text.clone()).await {
                    Ok(agent_turn) => {
                        self.apply_directives(&reply.directives);
                        self.exchanges.insert(
                            agent_turn,
                            Exchange {
                                user: user_text,
                                assistant: reply.text,
                            },
                        );
                    }
                    Err(e) => info!(
                        user_turn = %turn_id,
                        directives = reply.directives.len(),
                        error = %e,
                        "reply not spoken"
                    ),
                }
            }
            BridgeOutcome::Degraded {
                turn_id, fallback, ..
            } => {
                if let Err(e) = self.speech.speak(fallback).await {
                    info!(user_turn = %turn_id, error = %e, "fallback not spoken");
                }
            }
        }
    }
}
