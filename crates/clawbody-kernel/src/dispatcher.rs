//! [`Dispatcher`] – single consumer of every [`ActionCommand`].
//!
//! Producers (gesture engine, perception loop, bridge, sway generator, the
//! speech path) hold a cloneable [`DispatcherHandle`] and submit without
//! blocking.  The dispatcher task:
//!
//! 1. drains everything currently in its inbox into the pending queue;
//! 2. pops the highest-priority, oldest command;
//! 3. runs it through the [`CommandVerifier`] and hands it to the
//!    [`RobotPlatform`];
//! 4. reports failures on [`Topic::Actions`] and carries on.
//!
//! Inbox messages are drained again before every dispatch, so a barge-in or a
//! newer head pose takes effect as soon as the current platform call returns.
//!
//! # Coalescing
//!
//! Head, body player and sway hold at most one pending command each; a newer
//! timestamp replaces the older one and a command older than one already
//! pending or already dispatched for that subsystem is dropped as stale.
//! Speaker audio is an ordered stream and is never coalesced.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clawbody_middleware::{EventBus, RobotPlatform, Topic};
use clawbody_types::{
    ActionCommand, ActionSink, ActionTarget, BodyError, EventPayload, Priority, Subsystem,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command_verifier::CommandVerifier;

const SOURCE: &str = "clawbody-kernel::dispatcher";

/// How many aborted turns are remembered for late-chunk suppression.
const ABORTED_TURN_MEMORY: usize = 32;

/// Inbox message of the dispatcher task.
#[derive(Debug, Clone)]
pub enum DispatcherMsg {
    Submit(ActionCommand),
    /// Flush pending speech, stop the speaker, and drop any later audio for
    /// `turn_id`.
    BargeIn { turn_id: Uuid },
    /// Stop a subsystem and discard what is pending for it.
    Stop(Subsystem),
}

/// Cloneable producer side of the dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
}

impl DispatcherHandle {
    fn send(&self, msg: DispatcherMsg) -> Result<(), BodyError> {
        self.tx
            .send(msg)
            .map_err(|_| BodyError::Channel("dispatcher has shut down".to_string()))
    }

    pub fn barge_in(&self, turn_id: Uuid) -> Result<(), BodyError> {
        self.send(DispatcherMsg::BargeIn { turn_id })
    }

    pub fn stop(&self, subsystem: Subsystem) -> Result<(), BodyError> {
        self.send(DispatcherMsg::Stop(subsystem))
    }
}

impl ActionSink for DispatcherHandle {
    fn submit(&self, command: ActionCommand) -> Result<(), BodyError> {
        self.send(DispatcherMsg::Submit(command))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pending queue
// ─────────────────────────────────────────────────────────────────────────────

/// Highest priority first, then oldest, then arrival order.
type QueueKey = (Reverse<Priority>, DateTime<Utc>, u64);

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Queued,
    /// Queued, replacing the pending command with this id.
    Superseded(Uuid),
    Stale,
    AbortedTurn,
}

#[derive(Default)]
struct PendingQueue {
    queue: BTreeMap<QueueKey, ActionCommand>,
    /// Pending key per coalescible subsystem.
    slots: HashMap<Subsystem, QueueKey>,
    last_dispatched: HashMap<Subsystem, DateTime<Utc>>,
    aborted_turns: VecDeque<Uuid>,
    next_seq: u64,
}

impl PendingQueue {
    fn push(&mut self, command: ActionCommand) -> Admission {
        if let ActionTarget::SpeechAudio(chunk) = &command.target {
            if self.aborted_turns.contains(&chunk.turn_id) {
                return Admission::AbortedTurn;
            }
        }

        let subsystem = command.subsystem();
        let mut outcome = Admission::Queued;
        if subsystem.is_coalescible() {
            if self
                .last_dispatched
                .get(&subsystem)
                .is_some_and(|&t| command.timestamp < t)
            {
                return Admission::Stale;
            }
            if let Some(key) = self.slots.get(&subsystem).copied() {
                if command.timestamp < key.1 {
                    return Admission::Stale;
                }
                if let Some(old) = self.queue.remove(&key) {
                    outcome = Admission::Superseded(old.id);
                }
            }
        }

        self.next_seq += 1;
        let key = (Reverse(command.priority), command.timestamp, self.next_seq);
        if subsystem.is_coalescible() {
            self.slots.insert(subsystem, key);
        }
        self.queue.insert(key, command);
        outcome
    }

    fn pop(&mut self) -> Option<ActionCommand> {
        let (_, command) = self.queue.pop_first()?;
        let subsystem = command.subsystem();
        if subsystem.is_coalescible() {
            self.slots.remove(&subsystem);
            self.last_dispatched.insert(subsystem, command.timestamp);
        }
        Some(command)
    }

    /// Drop every pending speech chunk and remember `turn_id` as aborted.
    fn flush_speech(&mut self, turn_id: Uuid) -> usize {
        if !self.aborted_turns.contains(&turn_id) {
            if self.aborted_turns.len() == ABORTED_TURN_MEMORY {
                self.aborted_turns.pop_front();
            }
            self.aborted_turns.push_back(turn_id);
        }
        let before = self.queue.len();
        self.queue
            .retain(|_, c| !matches!(c.target, ActionTarget::SpeechAudio(_)));
        before - self.queue.len()
    }

    fn discard(&mut self, subsystem: Subsystem) -> usize {
        self.slots.remove(&subsystem);
        let before = self.queue.len();
        self.queue.retain(|_, c| c.subsystem() != subsystem);
        before - self.queue.len()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher task
// ─────────────────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    platform: Arc<dyn RobotPlatform>,
    verifier: CommandVerifier,
    bus: Option<EventBus>,
    rx: mpsc::UnboundedReceiver<DispatcherMsg>,
    pending: PendingQueue,
}

impl Dispatcher {
    pub fn new(
        platform: Arc<dyn RobotPlatform>,
        verifier: CommandVerifier,
        bus: Option<EventBus>,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                platform,
                verifier,
                bus,
                rx,
                pending: PendingQueue::default(),
            },
            DispatcherHandle { tx },
        )
    }

    /// Run until `cancel` fires or every handle is dropped.  Whatever is
    /// still pending at that point is discarded.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("dispatcher started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            while let Ok(msg) = self.rx.try_recv() {
                self.accept(msg).await;
            }
            if let Some(command) = self.pending.pop() {
                self.dispatch(command).await;
                continue;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.accept(msg).await,
                    None => break,
                },
            }
        }
        info!(discarded = self.pending.len(), "dispatcher stopped");
    }

    async fn accept(&mut self, msg: DispatcherMsg) {
        match msg {
            DispatcherMsg::Submit(command) => {
                let (id, issuer) = (command.id, command.issuer);
                match self.pending.push(command) {
                    Admission::Queued => {}
                    Admission::Superseded(old) => {
                        debug!(%id, superseded = %old, "command coalesced");
                    }
                    Admission::Stale => debug!(%id, %issuer, "stale command dropped"),
                    Admission::AbortedTurn => {
                        debug!(%id, "audio for aborted turn dropped");
                    }
                }
            }
            DispatcherMsg::BargeIn { turn_id } => {
                let flushed = self.pending.flush_speech(turn_id);
                info!(%turn_id, flushed, "barge-in: speech flushed");
                if let Err(e) = self.platform.stop(Subsystem::Speaker).await {
                    warn!(error = %e, "failed to stop speaker");
                }
            }
            DispatcherMsg::Stop(subsystem) => {
                let discarded = self.pending.discard(subsystem);
                debug!(subsystem = subsystem.as_str(), discarded, "stop requested");
                if let Err(e) = self.platform.stop(subsystem).await {
                    warn!(error = %e, subsystem = subsystem.as_str(), "failed to stop subsystem");
                }
            }
        }
    }

    async fn dispatch(&self, command: ActionCommand) {
        let outcome = match self.verifier.verify(&command) {
            Ok(()) => self.platform.execute(&command.target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            warn!(
                id = %command.id,
                issuer = %command.issuer,
                subsystem = command.subsystem().as_str(),
                error = %e,
                "dispatch failed"
            );
            if let Some(bus) = &self.bus {
                bus.emit(
                    Topic::Actions,
                    SOURCE,
                    EventPayload::DispatchFailed {
                        issuer: command.issuer,
                        command_id: command.id,
                        details: e.to_string(),
                    },
                );
            }
        }
    }
}
