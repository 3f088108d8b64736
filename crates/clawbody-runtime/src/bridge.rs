//! Intelligence Bridge – the body's line to the remote agent.
//!
//! [`GatewayClient`] speaks the gateway's OpenAI-compatible
//! `/v1/chat/completions` dialect.  Every request is addressed to the model
//! `openclaw:<agent_id>` and carries the `x-openclaw-session-key` header so
//! that conversations through the body share memory with the agent's other
//! channels.
//!
//! Physical actions are requested through a `robot_action` tool whose JSON
//! Schema is generated from [`AgentDirective`]; the tool-call arguments in the
//! reply are decoded straight back into directives.
//!
//! [`BridgeWorker`] runs submissions one at a time with a single pending
//! slot: a newer finalized turn replaces a queued one.  A failed or timed-out
//! request never leaves a turn hanging; it completes with a fallback line and
//! a degraded-mode alert.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clawbody_middleware::{EventBus, Topic};
use clawbody_perception::SceneDescriber;
use clawbody_types::{AgentDirective, BodyError, EventPayload};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SOURCE: &str = "clawbody-runtime::bridge";

const SESSION_HEADER: &str = "x-openclaw-session-key";

pub const ROBOT_ACTION_TOOL: &str = "robot_action";

/// Used when the agent cannot describe itself at startup.
pub const FALLBACK_IDENTITY: &str = "You are a friendly, curious robot companion. \
Speak naturally and briefly, and use your body to express yourself.";

const BODY_INSTRUCTIONS: &str = "The user is talking to you through your robot body. \
Keep replies short and conversational; they will be spoken aloud. \
Use the robot_action tool to move, play emotions, dance or look somewhere.";

const CONTEXT_PROMPT: &str = "You are being asked to provide your current context for your robot body.
Output a comprehensive context summary that another AI can use to embody you. Include:

1. YOUR IDENTITY: Who you are, your name, your personality traits, how you speak
2. USER CONTEXT: What you know about the user you're talking to
3. RECENT CONTEXT: Summary of recent conversations or important ongoing topics
4. MEMORIES: Key things you remember that are relevant to interactions
5. CURRENT STATE: Any relevant time/date awareness, ongoing tasks, or situational context

Be specific and personal. Output ONLY the context summary, no preamble.";

const SYNC_PREAMBLE: &str = "[ROBOT BODY SYNC] The following conversation happened through \
your robot body. Remember it as part of your ongoing conversation with the user.";

const DESCRIBE_PROMPT: &str =
    "Describe what the robot's camera sees in one or two short sentences. Mention people first.";

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    #[error("Tool schema: {0}")]
    Schema(#[from] serde_json::Error),
}

impl From<GatewayError> for BodyError {
    fn from(e: GatewayError) -> Self {
        BodyError::ExternalService {
            service: "gateway".to_string(),
            details: e.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway seam
// ─────────────────────────────────────────────────────────────────────────────

/// Context sent along with a finalized user turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnContext {
    /// Latest description of what the camera sees.
    pub scene: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub directives: Vec<AgentDirective>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn submit(&self, text: &str, context: &TurnContext) -> Result<AgentReply, GatewayError>;

    /// The agent's persona and memory summary, used as speech-provider
    /// instructions.
    async fn fetch_agent_context(&self) -> Result<String, GatewayError>;

    /// Post a completed exchange back for memory continuity.
    async fn sync_conversation(&self, user: &str, assistant: &str) -> Result<(), GatewayError>;

    async fn ping(&self) -> Result<(), GatewayError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Parts(Vec<Value>),
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: ChatRole,
    content: Content,
}

impl ChatMessage {
    fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(text.into()),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize, Default)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    /// JSON-encoded, per the chat-completions convention.
    arguments: String,
}

/// Arguments of the `robot_action` tool.
#[derive(Debug, Deserialize, JsonSchema)]
struct RobotActions {
    /// Actions to perform, in order.
    actions: Vec<AgentDirective>,
}

fn robot_action_tool() -> Result<Value, GatewayError> {
    let parameters = serde_json::to_value(schema_for!(RobotActions))?;
    Ok(json!({
        "type": "function",
        "function": {
            "name": ROBOT_ACTION_TOOL,
            "description": "Move the robot body: play a behavior or emotion, dance, look somewhere, or stop.",
            "parameters": parameters,
        }
    }))
}

fn parse_reply(response: ChatResponse) -> Result<AgentReply, GatewayError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| GatewayError::BadResponse("empty choices array".into()))?;

    let mut directives = Vec::new();
    for call in message.tool_calls {
        if call.function.name != ROBOT_ACTION_TOOL {
            debug!(tool = %call.function.name, "ignoring unknown tool call");
            continue;
        }
        match serde_json::from_str::<RobotActions>(&call.function.arguments) {
            Ok(args) => directives.extend(args.actions),
            Err(e) => warn!(error = %e, "malformed robot_action arguments"),
        }
    }
    Ok(AgentReply {
        text: message.content.unwrap_or_default().trim().to_string(),
        directives,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// GatewayClient
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GatewayConfig {
    /// e.g. `"http://localhost:18789"`.
    pub base_url: String,
    pub token: Option<String>,
    pub agent_id: String,
    pub session_key: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("agent_id", &self.agent_id)
            .field("session_key", &self.session_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:18789".to_string(),
            token: None,
            agent_id: "main".to_string(),
            session_key: "main".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct GatewayClient {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn model(&self) -> String {
        format!("openclaw:{}", self.config.agent_id)
    }

    fn session_key(&self) -> String {
        format!("agent:{}:{}", self.config.agent_id, self.config.session_key)
    }

    fn request(&self, messages: Vec<ChatMessage>, tools: Option<Vec<Value>>) -> ChatRequest {
        ChatRequest {
            model: self.model(),
            messages,
            stream: false,
            tools,
        }
    }

    async fn post(&self, body: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut request = self
            .client
            .post(&url)
            .header(SESSION_HEADER, self.session_key())
            .json(body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?.error_for_status()?.json().await?)
    }

    /// Ask the agent what a JPEG snapshot shows.
    pub async fn describe_scene(&self, jpeg: &[u8]) -> Result<String, GatewayError> {
        let url = format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg));
        let message = ChatMessage {
            role: ChatRole::User,
            content: Content::Parts(vec![
                json!({ "type": "text", "text": DESCRIBE_PROMPT }),
                json!({ "type": "image_url", "image_url": { "url": url } }),
            ]),
        };
        let reply = parse_reply(self.post(&self.request(vec![message], None)).await?)?;
        if reply.text.is_empty() {
            return Err(GatewayError::BadResponse("empty scene description".into()));
        }
        Ok(reply.text)
    }
}

fn submit_messages(text: &str, context: &TurnContext) -> Vec<ChatMessage> {
    let mut system = BODY_INSTRUCTIONS.to_string();
    if let Some(scene) = &context.scene {
        system.push_str("\n\nWhat your camera currently sees: ");
        system.push_str(scene);
    }
    vec![
        ChatMessage::text(ChatRole::System, system),
        ChatMessage::text(ChatRole::User, text),
    ]
}

#[async_trait]
impl Gateway for GatewayClient {
    async fn submit(&self, text: &str, context: &TurnContext) -> Result<AgentReply, GatewayError> {
        let body = self.request(submit_messages(text, context), Some(vec![robot_action_tool()?]));
        parse_reply(self.post(&body).await?)
    }

    async fn fetch_agent_context(&self) -> Result<String, GatewayError> {
        let body = self.request(
            vec![
                ChatMessage::text(ChatRole::System, CONTEXT_PROMPT),
                ChatMessage::text(
                    ChatRole::User,
                    "Provide your current context summary for the robot body.",
                ),
            ],
            None,
        );
        let reply = parse_reply(self.post(&body).await?)?;
        if reply.text.is_empty() {
            return Err(GatewayError::BadResponse("empty agent context".into()));
        }
        info!(chars = reply.text.len(), "retrieved agent context");
        Ok(reply.text)
    }

    async fn sync_conversation(&self, user: &str, assistant: &str) -> Result<(), GatewayError> {
        let body = self.request(
            vec![
                ChatMessage::text(ChatRole::System, SYNC_PREAMBLE),
                ChatMessage::text(ChatRole::User, user),
                ChatMessage::text(ChatRole::Assistant, assistant),
            ],
            None,
        );
        self.post(&body).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let body = self.request(vec![ChatMessage::text(ChatRole::User, "ping")], None);
        self.post(&body).await?;
        Ok(())
    }
}

/// [`SceneDescriber`] backed by the gateway's vision-capable agent.
pub struct GatewaySceneDescriber(pub Arc<GatewayClient>);

#[async_trait]
impl SceneDescriber for GatewaySceneDescriber {
    async fn describe(&self, jpeg: Vec<u8>) -> Result<String, BodyError> {
        Ok(self.0.describe_scene(&jpeg).await?)
    }
}

/// The agent's self-description for the speech provider, or
/// [`FALLBACK_IDENTITY`] when the gateway cannot provide one in time.
pub async fn agent_persona(gateway: &dyn Gateway, timeout: Duration) -> String {
    match tokio::time::timeout(timeout, gateway.fetch_agent_context()).await {
        Ok(Ok(context)) => context,
        Ok(Err(e)) => {
            warn!(error = %e, "agent context unavailable; using fallback identity");
            FALLBACK_IDENTITY.to_string()
        }
        Err(_) => {
            warn!("agent context timed out; using fallback identity");
            FALLBACK_IDENTITY.to_string()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BridgeWorker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRequest {
    pub turn_id: Uuid,
    pub text: String,
    pub context: TurnContext,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    Reply {
        turn_id: Uuid,
        user_text: String,
        reply: AgentReply,
    },
    /// The gateway failed; `fallback` should be spoken instead.
    Degraded {
        turn_id: Uuid,
        user_text: String,
        fallback: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub request_timeout: Duration,
    pub fallback_reply: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            fallback_reply: "Sorry, I can't reach my brain right now. Give me a moment."
                .to_string(),
        }
    }
}

/// Submits finalized turns to the [`BridgeWorker`].
#[derive(Clone)]
pub struct BridgeHandle {
    pending: Arc<Mutex<Option<BridgeRequest>>>,
    wake: Arc<Notify>,
}

impl BridgeHandle {
    /// Queue `request`, replacing any request still waiting.
    pub fn submit(&self, request: BridgeRequest) {
        let replaced = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(request);
        if let Some(old) = replaced {
            info!(turn = %old.turn_id, "pending submission superseded");
        }
        self.wake.notify_one();
    }
}

pub struct BridgeWorker {
    gateway: Arc<dyn Gateway>,
    config: BridgeConfig,
    bus: Option<EventBus>,
}

impl BridgeWorker {
    pub fn new(gateway: Arc<dyn Gateway>, config: BridgeConfig) -> Self {
        Self {
            gateway,
            config,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Start the submission task.  Outcomes arrive in completion order.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (
        BridgeHandle,
        mpsc::UnboundedReceiver<BridgeOutcome>,
        JoinHandle<()>,
    ) {
        let handle = BridgeHandle {
            pending: Arc::new(Mutex::new(None)),
            wake: Arc::new(Notify::new()),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::clone(&handle.pending);
        let wake = Arc::clone(&handle.wake);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = wake.notified() => {}
                }
                let next = pending.lock().unwrap_or_else(|p| p.into_inner()).take();
                let Some(request) = next else { continue };
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = self.run(request) => outcome,
                };
                if tx.send(outcome).is_err() {
                    break;
                }
            }
            debug!("bridge worker stopped");
        });
        (handle, rx, task)
    }

    async fn run(&self, request: BridgeRequest) -> BridgeOutcome {
        debug!(turn = %request.turn_id, "submitting turn to gateway");
        let result = tokio::time::timeout(
            self.config.request_timeout,
            self.gateway.submit(&request.text, &request.context),
        )
        .await;
        let reason = match result {
            Ok(Ok(reply)) => {
                info!(
                    turn = %request.turn_id,
                    directives = reply.directives.len(),
                    "agent replied"
                );
                return BridgeOutcome::Reply {
                    turn_id: request.turn_id,
                    user_text: request.text,
                    reply,
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no reply within {:?}", self.config.request_timeout),
        };

        warn!(turn = %request.turn_id, %reason, "gateway unavailable; answering with fallback");
        if let Some(bus) = &self.bus {
            bus.emit(
                Topic::SystemAlerts,
                SOURCE,
                EventPayload::Degraded {
                    component: "bridge".to_string(),
                    reason: reason.clone(),
                },
            );
        }
        BridgeOutcome::Degraded {
            turn_id: request.turn_id,
            user_text: request.text,
            fallback: self.config.fallback_reply.clone(),
            reason,
        }
    }
}
