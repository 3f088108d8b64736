//! Scripted collaborators for end-to-end session tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clawbody_hal::SimCamera;
use clawbody_middleware::{ClientCommand, PlatformCall, ProviderEvent, SimPlatform, SpeechTransport};
use clawbody_perception::BrightSpotDetector;
use clawbody_runtime::{AgentReply, Gateway, GatewayError, SessionConfig, SessionDeps, TurnContext};
use clawbody_types::{ActionTarget, BodyError};
use tokio::sync::mpsc;

pub const AUDIO_CHUNKS_PER_REPLY: usize = 3;

/// A speech provider that answers every `Speak` with a short scripted
/// response and lets the test inject user speech.
pub struct ScriptedTransport {
    inbox: mpsc::UnboundedReceiver<ProviderEvent>,
    queued: VecDeque<ProviderEvent>,
    sent: Arc<Mutex<Vec<ClientCommand>>>,
    refuse_connect: bool,
    /// Keep all but the first audio chunk of a response back until the
    /// response is cancelled.
    hold_audio: bool,
    held: Vec<ProviderEvent>,
}

#[derive(Clone)]
pub struct Script {
    tx: mpsc::UnboundedSender<ProviderEvent>,
    sent: Arc<Mutex<Vec<ClientCommand>>>,
}

impl Script {
    /// One complete user utterance.
    pub fn user_says(&self, text: &str) {
        for event in [
            ProviderEvent::SpeechStarted,
            ProviderEvent::UserTranscriptDelta(format!("{text} ")),
            ProviderEvent::SpeechStopped,
            ProviderEvent::UserTranscriptCompleted(text.to_string()),
        ] {
            let _ = self.tx.send(event);
        }
    }

    /// The user starts talking and keeps going.
    pub fn starts_speaking(&self) {
        let _ = self.tx.send(ProviderEvent::SpeechStarted);
    }

    pub fn cancelled(&self) -> bool {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, ClientCommand::CancelResponse))
    }

    pub fn spoken(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ClientCommand::Speak(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn scripted_transport() -> (ScriptedTransport, Script) {
    let (tx, inbox) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    (
        ScriptedTransport {
            inbox,
            queued: VecDeque::new(),
            sent: Arc::clone(&sent),
            refuse_connect: false,
            hold_audio: false,
            held: Vec::new(),
        },
        Script { tx, sent },
    )
}

impl ScriptedTransport {
    pub fn refusing(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Stream the first chunk of each response right away and the rest
    /// only once the response is cancelled, as a provider does when the
    /// cancel races audio already in flight.
    pub fn holding_audio(mut self) -> Self {
        self.hold_audio = true;
        self
    }
}

#[async_trait]
impl SpeechTransport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), BodyError> {
        if self.refuse_connect {
            return Err(BodyError::TransientIo {
                component: "scripted".into(),
                details: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn send(&mut self, command: ClientCommand) -> Result<(), BodyError> {
        match &command {
            ClientCommand::Speak(text) => {
                let mut response = vec![ProviderEvent::ResponseCreated];
                for _ in 0..AUDIO_CHUNKS_PER_REPLY {
                    response.push(ProviderEvent::AudioDelta(vec![6_000; 480]));
                }
                response.push(ProviderEvent::AgentTranscriptDone(text.clone()));
                response.push(ProviderEvent::ResponseDone);
                if self.hold_audio {
                    self.held = response.split_off(2);
                }
                self.queued.extend(response);
            }
            ClientCommand::CancelResponse => self.queued.extend(self.held.drain(..)),
            _ => {}
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ProviderEvent>, BodyError> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(event));
        }
        match self.inbox.recv().await {
            Some(event) => Ok(Some(event)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), BodyError> {
        Ok(())
    }
}

/// A gateway with canned replies keyed by user text.
#[derive(Default)]
pub struct MockGateway {
    pub replies: Mutex<HashMap<String, AgentReply>>,
    pub submitted: Mutex<Vec<String>>,
    pub synced: Mutex<Vec<(String, String)>>,
    pub down: bool,
    pub delay: Option<Duration>,
}

impl MockGateway {
    pub fn reply(self, user: &str, reply: AgentReply) -> Self {
        self.replies.lock().unwrap().insert(user.to_string(), reply);
        self
    }

    /// Every submission takes `delay` before it is answered.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn unreachable() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }
}

fn down() -> GatewayError {
    GatewayError::BadResponse("gateway offline".into())
}

#[async_trait]
impl Gateway for MockGateway {
    async fn submit(&self, text: &str, _context: &TurnContext) -> Result<AgentReply, GatewayError> {
        self.submitted.lock().unwrap().push(text.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.down {
            return Err(down());
        }
        Ok(self
            .replies
            .lock()
            .unwrap()
            .get(text)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_agent_context(&self) -> Result<String, GatewayError> {
        Ok("You are Clawd.".into())
    }

    async fn sync_conversation(&self, user: &str, assistant: &str) -> Result<(), GatewayError> {
        if self.down {
            return Err(down());
        }
        self.synced
            .lock()
            .unwrap()
            .push((user.to_string(), assistant.to_string()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        if self.down { Err(down()) } else { Ok(()) }
    }
}

/// Session dependencies over the simulated robot, with the camera target
/// hidden so head tracking stays quiet.
pub fn sim_session(
    gateway: Arc<MockGateway>,
    transport: ScriptedTransport,
) -> (SessionConfig, SessionDeps, Arc<SimPlatform>) {
    let platform = Arc::new(SimPlatform::with_demo_catalog());
    let (camera, control) = SimCamera::new(64, 48);
    control.set_visible(false);
    let mut config = SessionConfig::default();
    config.perception.scene_every_ticks = 0;
    config.speech.backoff_base = Duration::from_millis(10);
    config.speech.backoff_cap = Duration::from_millis(20);
    let deps = SessionDeps {
        platform: platform.clone(),
        store: platform.clone(),
        camera: Box::new(camera),
        detector: Box::new(BrightSpotDetector::default()),
        describer: None,
        transport: Box::new(transport),
        gateway,
    };
    (config, deps, platform)
}

pub fn speech_chunks(calls: &[PlatformCall]) -> usize {
    calls
        .iter()
        .filter(|c| matches!(c, PlatformCall::Executed(ActionTarget::SpeechAudio(_))))
        .count()
}

pub fn behaviors(calls: &[PlatformCall]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            PlatformCall::Executed(ActionTarget::Behavior { name }) => Some(name.clone()),
            _ => None,
        })
        .collect()
}
