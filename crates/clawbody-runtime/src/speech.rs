//! Speech Duplex Channel.
//!
//! [`SpeechChannel::open`] connects a [`SpeechTransport`] and spawns one task
//! that owns it.  Callers get three things back:
//!
//! * a cloneable [`SpeechHandle`] to push microphone audio (never blocks; a
//!   full uplink queue drops the chunk), ask for speech, and close;
//! * [`SpeechEvents`], the one-shot event stream of the connection;
//! * the task's `JoinHandle`.
//!
//! Provider events are folded into conversational turns by a small state
//! machine ([`TurnTracker`]).  It hands out strictly increasing delta sequence
//! numbers, keeps at most one turn open, and implements barge-in: user speech
//! while an agent turn is open aborts that turn, cancels the provider's
//! response, and suppresses any audio still arriving for it.
//!
//! Lost connections are re-established with exponential backoff.  When the
//! retry budget is exhausted a fatal [`SpeechEvent::ConnectionError`] is
//! emitted and the stream ends.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use clawbody_middleware::{ClientCommand, ProviderEvent, SpeechTransport};
use clawbody_types::{
    AudioChunk, BodyError, DeltaKind, Role, SPEECH_SAMPLE_RATE, SpeechEvent, TranscriptDelta,
    Turn,
};
use futures_util::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const SILENCE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Microphone chunks buffered while the uplink is busy.
    pub audio_queue: usize,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How long after end-of-speech a user turn waits for its final
    /// transcript before closing on what it has.
    pub silence_timeout: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            audio_queue: 64,
            max_reconnect_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(8),
            silence_timeout: Duration::from_millis(1_500),
        }
    }
}

impl SpeechConfig {
    /// Delay before reconnect `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn tracking
// ─────────────────────────────────────────────────────────────────────────────

/// What one provider event turned into.
#[derive(Debug, Default, PartialEq)]
struct Step {
    events: Vec<SpeechEvent>,
    commands: Vec<ClientCommand>,
}

struct AgentTurn {
    turn: Turn,
    audio_seq: u64,
    transcript: Option<String>,
}

/// Folds provider events into turns.  Pure: no I/O, time is passed in.
struct TurnTracker {
    silence_timeout: Duration,
    user: Option<Turn>,
    user_stopped_at: Option<Instant>,
    /// The last user turn was closed by the silence timeout; a late final
    /// transcript for it is ignored.
    closed_by_timeout: bool,
    agent: Option<AgentTurn>,
    /// Turn ids handed out by `speak` whose responses have not started yet.
    pending_speak: VecDeque<Uuid>,
    /// Responses requested before a barge-in that must be cancelled when they
    /// start.
    cancelled_responses: usize,
    /// Drop synthesized audio until the current response is done.
    suppressing: bool,
}

impl TurnTracker {
    fn new(silence_timeout: Duration) -> Self {
        Self {
            silence_timeout,
            user: None,
            user_stopped_at: None,
            closed_by_timeout: false,
            agent: None,
            pending_speak: VecDeque::new(),
            cancelled_responses: 0,
            suppressing: false,
        }
    }

    fn user_turn_open(&self) -> bool {
        self.user.as_ref().is_some_and(Turn::is_open)
    }

    /// Reserve the id of the agent turn a `speak` request will produce.
    fn reserve_agent_turn(&mut self) -> Result<Uuid, BodyError> {
        if self.user_turn_open() {
            return Err(BodyError::InvalidState(
                "cannot speak while the user is speaking".to_string(),
            ));
        }
        let id = Uuid::new_v4();
        self.pending_speak.push_back(id);
        Ok(id)
    }

    fn release_reservation(&mut self, id: Uuid) {
        self.pending_speak.retain(|pending| *pending != id);
    }

    fn on_provider(&mut self, event: ProviderEvent, now: Instant) -> Step {
        let mut step = Step::default();
        match event {
            ProviderEvent::SpeechStarted => {
                self.barge_in(&mut step);
                if !self.user_turn_open() {
                    self.open_user(&mut step);
                }
                self.user_stopped_at = None;
            }
            ProviderEvent::SpeechStopped => {
                if self.user_turn_open() {
                    self.user_stopped_at = Some(now);
                }
            }
            ProviderEvent::UserTranscriptDelta(text) => {
                if text.is_empty() {
                    return step;
                }
                if !self.user_turn_open() {
                    self.barge_in(&mut step);
                    self.open_user(&mut step);
                }
                self.push_user(text, DeltaKind::Partial, &mut step);
            }
            ProviderEvent::UserTranscriptCompleted(text) => {
                if !self.user_turn_open() {
                    if std::mem::take(&mut self.closed_by_timeout) {
                        debug!("final transcript arrived after silence timeout; ignored");
                        return step;
                    }
                    self.barge_in(&mut step);
                    self.open_user(&mut step);
                }
                self.push_user(text.trim().to_string(), DeltaKind::Final, &mut step);
            }
            ProviderEvent::ResponseCreated => {
                if self.cancelled_responses > 0 || self.user_turn_open() {
                    self.cancelled_responses = self.cancelled_responses.saturating_sub(1);
                    self.suppressing = true;
                    step.commands.push(ClientCommand::CancelResponse);
                    return step;
                }
                if let Some(previous) = self.agent.take() {
                    self.finish_agent(previous, &mut step);
                }
                let id = self.pending_speak.pop_front().unwrap_or_else(Uuid::new_v4);
                self.suppressing = false;
                self.agent = Some(AgentTurn {
                    turn: Turn::open_with_id(id, Role::Agent),
                    audio_seq: 0,
                    transcript: None,
                });
                step.events.push(SpeechEvent::TurnStarted {
                    turn_id: id,
                    role: Role::Agent,
                });
            }
            ProviderEvent::AudioDelta(samples) => {
                if self.suppressing {
                    trace!("dropping audio of a cancelled response");
                } else if let Some(agent) = self.agent.as_mut() {
                    agent.audio_seq += 1;
                    step.events.push(SpeechEvent::SynthAudio(AudioChunk {
                        turn_id: agent.turn.id,
                        seq: agent.audio_seq,
                        sample_rate: SPEECH_SAMPLE_RATE,
                        samples,
                    }));
                } else {
                    trace!("dropping audio outside an agent turn");
                }
            }
            ProviderEvent::AgentTranscriptDone(text) => {
                if let Some(agent) = self.agent.as_mut() {
                    agent.transcript = Some(text);
                }
            }
            ProviderEvent::ResponseDone => {
                self.suppressing = false;
                if let Some(agent) = self.agent.take() {
                    self.finish_agent(agent, &mut step);
                }
            }
            ProviderEvent::Error(message) => {
                step.events.push(SpeechEvent::ConnectionError {
                    fatal: false,
                    message,
                });
            }
            ProviderEvent::Other(kind) => trace!(%kind, "ignoring provider event"),
        }
        step
    }

    /// Close a user turn that went quiet without a final transcript.
    fn on_silence(&mut self, now: Instant) -> Step {
        let mut step = Step::default();
        let expired = self
            .user_stopped_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.silence_timeout);
        if expired && self.user_turn_open() {
            let text = self
                .user
                .as_ref()
                .map(|t| t.text.trim().to_string())
                .unwrap_or_default();
            debug!("silence timeout; closing user turn");
            self.push_user(text, DeltaKind::Final, &mut step);
            self.closed_by_timeout = true;
        }
        step
    }

    /// Abort whatever is open; the connection is gone.
    fn on_disconnect(&mut self) -> Step {
        let mut step = Step::default();
        if let Some(mut agent) = self.agent.take() {
            agent.turn.abort();
            step.events.push(SpeechEvent::TurnEnded {
                turn_id: agent.turn.id,
                role: Role::Agent,
                aborted: true,
            });
        }
        if let Some(user) = self.user.as_mut().filter(|t| t.is_open()) {
            user.abort();
            step.events.push(SpeechEvent::TurnEnded {
                turn_id: user.id,
                role: Role::User,
                aborted: true,
            });
        }
        self.pending_speak.clear();
        self.cancelled_responses = 0;
        self.suppressing = false;
        self.user_stopped_at = None;
        step
    }

    fn barge_in(&mut self, step: &mut Step) {
        self.cancelled_responses += self.pending_speak.len();
        self.pending_speak.clear();
        let Some(mut agent) = self.agent.take() else {
            return;
        };
        agent.turn.abort();
        info!(turn = %agent.turn.id, "barge-in: agent turn aborted");
        step.events.push(SpeechEvent::BargeIn {
            aborted_turn: agent.turn.id,
        });
        step.events.push(SpeechEvent::TurnEnded {
            turn_id: agent.turn.id,
            role: Role::Agent,
            aborted: true,
        });
        step.commands.push(ClientCommand::CancelResponse);
        self.suppressing = true;
    }

    fn open_user(&mut self, step: &mut Step) {
        let turn = Turn::open(Role::User);
        step.events.push(SpeechEvent::TurnStarted {
            turn_id: turn.id,
            role: Role::User,
        });
        self.user = Some(turn);
        self.closed_by_timeout = false;
    }

    fn push_user(&mut self, text: String, kind: DeltaKind, step: &mut Step) {
        let Some(turn) = self.user.as_mut() else {
            return;
        };
        let delta = TranscriptDelta {
            turn_id: turn.id,
            role: Role::User,
            seq: turn.next_seq(),
            text,
            kind,
        };
        if let Err(e) = turn.apply(&delta) {
            warn!(error = %e, "dropping user transcript delta");
            return;
        }
        step.events.push(SpeechEvent::Transcript(delta));
        if kind == DeltaKind::Final {
            step.events.push(SpeechEvent::TurnEnded {
                turn_id: turn.id,
                role: Role::User,
                aborted: false,
            });
            self.user_stopped_at = None;
        }
    }

    fn finish_agent(&mut self, mut agent: AgentTurn, step: &mut Step) {
        let delta = TranscriptDelta {
            turn_id: agent.turn.id,
            role: Role::Agent,
            seq: agent.turn.next_seq(),
            text: agent.transcript.take().unwrap_or_default(),
            kind: DeltaKind::Final,
        };
        if agent.turn.apply(&delta).is_ok() {
            step.events.push(SpeechEvent::Transcript(delta));
        }
        step.events.push(SpeechEvent::TurnEnded {
            turn_id: agent.turn.id,
            role: Role::Agent,
            aborted: false,
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

enum Control {
    Speak {
        text: String,
        reply: oneshot::Sender<Result<Uuid, BodyError>>,
    },
    Close,
}

fn channel_closed() -> BodyError {
    BodyError::Channel("speech channel is closed".to_string())
}

/// Producer side of an open speech channel.
#[derive(Clone, Debug)]
pub struct SpeechHandle {
    audio_tx: mpsc::Sender<Vec<i16>>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Speak { text, .. } => f.debug_struct("Speak").field("text", text).finish(),
            Control::Close => f.write_str("Close"),
        }
    }
}

impl SpeechHandle {
    /// Queue microphone audio for upload.
    ///
    /// Returns `false` when the chunk was dropped: wrong sample rate, full
    /// queue, or closed channel.
    pub fn send_audio(&self, samples: Vec<i16>, sample_rate: u32) -> bool {
        if sample_rate != SPEECH_SAMPLE_RATE {
            warn!(
                sample_rate,
                expected = SPEECH_SAMPLE_RATE,
                "dropping microphone audio at unexpected rate"
            );
            return false;
        }
        match self.audio_tx.try_send(samples) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("speech uplink queue full; dropping microphone chunk");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the provider to say `text` as a new agent turn.
    ///
    /// Returns the id the agent turn will carry.
    ///
    /// # Errors
    ///
    /// * [`BodyError::InvalidState`] while a user turn is open.
    /// * [`BodyError::Channel`] once the channel has closed.
    /// * The transport's error if the request could not be sent.
    pub async fn speak(&self, text: impl Into<String>) -> Result<Uuid, BodyError> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Speak {
                text: text.into(),
                reply,
            })
            .map_err(|_| channel_closed())?;
        rx.await.map_err(|_| channel_closed())?
    }

    /// Close the connection.  Open turns end as aborted.
    pub fn close(&self) {
        let _ = self.control_tx.send(Control::Close);
    }
}

/// Consumer side of an open speech channel.
pub struct SpeechEvents {
    rx: mpsc::UnboundedReceiver<SpeechEvent>,
}

impl SpeechEvents {
    /// `None` once the channel has closed.
    pub async fn next(&mut self) -> Option<SpeechEvent> {
        self.rx.recv().await
    }

    /// The channel's events as a stream.  Consumes the receiver: the stream
    /// cannot be restarted.
    pub fn produce_events(self) -> impl Stream<Item = SpeechEvent> + Send {
        futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}

pub struct SpeechChannel;

impl SpeechChannel {
    /// Connect `transport` and start the channel task.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when the initial connection fails; no
    /// retry is attempted at open time.
    pub async fn open(
        config: SpeechConfig,
        mut transport: Box<dyn SpeechTransport>,
        cancel: CancellationToken,
    ) -> Result<(SpeechHandle, SpeechEvents, JoinHandle<()>), BodyError> {
        transport.connect().await?;
        let (audio_tx, audio_rx) = mpsc::channel(config.audio_queue.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = ChannelWorker {
            tracker: TurnTracker::new(config.silence_timeout),
            config,
            transport,
            audio_rx,
            control_rx,
            events_tx,
            cancel,
        };
        let task = tokio::spawn(worker.run());
        info!("speech channel open");
        Ok((
            SpeechHandle {
                audio_tx,
                control_tx,
            },
            SpeechEvents { rx: events_rx },
            task,
        ))
    }
}

struct ChannelWorker {
    config: SpeechConfig,
    transport: Box<dyn SpeechTransport>,
    tracker: TurnTracker,
    audio_rx: mpsc::Receiver<Vec<i16>>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    events_tx: mpsc::UnboundedSender<SpeechEvent>,
    cancel: CancellationToken,
}

impl ChannelWorker {
    async fn run(mut self) {
        let mut silence = tokio::time::interval(SILENCE_POLL);
        silence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let healthy = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                control = self.control_rx.recv() => match control {
                    Some(Control::Speak { text, reply }) => self.speak(text, reply).await,
                    Some(Control::Close) | None => break,
                },
                Some(samples) = self.audio_rx.recv() => {
                    match self.transport.send(ClientCommand::AppendAudio(samples)).await {
                        Ok(()) => true,
                        Err(e) => self.recover(e).await,
                    }
                }
                event = self.transport.next_event() => match event {
                    Ok(Some(event)) => {
                        let step = self.tracker.on_provider(event, Instant::now());
                        self.apply(step).await
                    }
                    Ok(None) => {
                        self.recover(BodyError::TransientIo {
                            component: "speech".to_string(),
                            details: "provider closed the connection".to_string(),
                        })
                        .await
                    }
                    Err(e) => self.recover(e).await,
                },
                _ = silence.tick() => {
                    let step = self.tracker.on_silence(Instant::now());
                    self.apply(step).await
                }
            };
            if !healthy {
                break;
            }
        }

        let step = self.tracker.on_disconnect();
        for event in step.events {
            self.emit(event);
        }
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "error while closing speech transport");
        }
        info!("speech channel closed");
    }

    fn emit(&self, event: SpeechEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("speech event dropped; nobody is listening");
        }
    }

    async fn speak(
        &mut self,
        text: String,
        reply: oneshot::Sender<Result<Uuid, BodyError>>,
    ) -> bool {
        let turn_id = match self.tracker.reserve_agent_turn() {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "speak refused");
                let _ = reply.send(Err(e));
                return true;
            }
        };
        match self.transport.send(ClientCommand::Speak(text)).await {
            Ok(()) => {
                let _ = reply.send(Ok(turn_id));
                true
            }
            Err(e) => {
                self.tracker.release_reservation(turn_id);
                let _ = reply.send(Err(e.clone()));
                self.recover(e).await
            }
        }
    }

    async fn apply(&mut self, step: Step) -> bool {
        for event in step.events {
            self.emit(event);
        }
        for command in step.commands {
            if let Err(e) = self.transport.send(command).await {
                return self.recover(e).await;
            }
        }
        true
    }

    /// Reconnect with backoff.  Returns `false` when the channel must close.
    async fn recover(&mut self, error: BodyError) -> bool {
        warn!(error = %error, "speech connection lost");
        let step = self.tracker.on_disconnect();
        for event in step.events {
            self.emit(event);
        }

        let attempts = self.config.max_reconnect_attempts;
        for attempt in 1..=attempts {
            let delay = self.config.backoff(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to speech provider");
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.transport.connect().await {
                Ok(()) => {
                    info!(attempt, "speech provider reconnected");
                    return true;
                }
                Err(e) => warn!(attempt, error = %e, "speech reconnect failed"),
            }
        }

        self.emit(SpeechEvent::ConnectionError {
            fatal: true,
            message: format!("speech provider unreachable after {attempts} attempts: {error}"),
        });
        false
    }
}
