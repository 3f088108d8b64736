//! Realtime speech provider transport.
//!
//! [`SpeechTransport`] is the seam between the speech duplex channel and a
//! streaming speech provider.  [`RealtimeWsTransport`] implements it over an
//! OpenAI-Realtime-compatible WebSocket: JSON events in both directions,
//! PCM16 audio at 24 kHz carried as base64.
//!
//! The transport only translates wire events into [`ProviderEvent`]s and
//! [`ClientCommand`]s into wire events.  Turn tracking, barge-in and
//! reconnection live in the channel that owns it.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clawbody_types::BodyError;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::daemon_platform::encode_pcm16;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─────────────────────────────────────────────────────────────────────────────
// Provider-neutral messages
// ─────────────────────────────────────────────────────────────────────────────

/// Something the provider told us.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Voice activity detected on the uplink.
    SpeechStarted,
    /// Voice activity ended on the uplink.
    SpeechStopped,
    /// Incremental user transcript fragment.
    UserTranscriptDelta(String),
    /// Complete user transcript for the current utterance.
    UserTranscriptCompleted(String),
    /// The provider started generating a response.
    ResponseCreated,
    /// Synthesized audio for the current response.
    AudioDelta(Vec<i16>),
    /// Transcript of what the provider said in the current response.
    AgentTranscriptDone(String),
    /// The current response is complete.
    ResponseDone,
    /// Provider-reported error; the connection is still usable.
    Error(String),
    /// Any event type the orchestrator does not act on.
    Other(String),
}

/// Something we ask the provider to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Append microphone audio to the input buffer.
    AppendAudio(Vec<i16>),
    /// Speak `text` verbatim as a new response.
    Speak(String),
    /// Cancel the response currently being generated.
    CancelResponse,
}

/// A bidirectional streaming connection to a speech provider.
///
/// # Contract
///
/// * `connect` may be called again after a failure to re-establish the
///   connection.
/// * `next_event` must be cancel-safe: the channel polls it inside
///   `tokio::select!`.  `Ok(None)` means the provider closed the connection.
#[async_trait]
pub trait SpeechTransport: Send {
    async fn connect(&mut self) -> Result<(), BodyError>;

    async fn send(&mut self, command: ClientCommand) -> Result<(), BodyError>;

    async fn next_event(&mut self) -> Result<Option<ProviderEvent>, BodyError>;

    async fn close(&mut self) -> Result<(), BodyError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Connection settings for [`RealtimeWsTransport`].
#[derive(Clone)]
pub struct RealtimeConfig {
    /// e.g. `"wss://api.openai.com/v1/realtime"`.
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// System instructions for the provider session.
    pub instructions: String,
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_ms: u32,
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("url", &self.url)
            .field("api_key", if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" })
            .field("model", &self.model)
            .field("voice", &self.voice)
            .finish_non_exhaustive()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "cedar".to_string(),
            instructions: String::new(),
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_ms: 600,
        }
    }
}

/// Realtime speech provider over a WebSocket.
pub struct RealtimeWsTransport {
    config: RealtimeConfig,
    ws: Option<WsStream>,
}

impl RealtimeWsTransport {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config, ws: None }
    }

    fn socket(&mut self) -> Result<&mut WsStream, BodyError> {
        self.ws
            .as_mut()
            .ok_or_else(|| BodyError::ResourceUnavailable("speech provider not connected".into()))
    }

    async fn send_json(&mut self, value: Value) -> Result<(), BodyError> {
        let text = value.to_string();
        self.socket()?
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| transient(format!("send: {e}")))
    }
}

fn transient(details: String) -> BodyError {
    BodyError::TransientIo {
        component: "speech-provider".to_string(),
        details,
    }
}

/// `session.update` payload: server-side VAD, transcription enabled, and no
/// automatic responses since replies come from the agent gateway.
pub fn session_update(config: &RealtimeConfig) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["text", "audio"],
            "instructions": config.instructions,
            "voice": config.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": "whisper-1" },
            "turn_detection": {
                "type": "server_vad",
                "threshold": config.vad_threshold,
                "prefix_padding_ms": config.vad_prefix_padding_ms,
                "silence_duration_ms": config.vad_silence_ms,
                "create_response": false,
            },
        }
    })
}

/// Encode a [`ClientCommand`] as a wire event.
pub fn encode_command(command: &ClientCommand) -> Value {
    match command {
        ClientCommand::AppendAudio(samples) => json!({
            "type": "input_audio_buffer.append",
            "audio": encode_pcm16(samples),
        }),
        ClientCommand::Speak(text) => json!({
            "type": "response.create",
            "response": {
                "modalities": ["text", "audio"],
                "instructions": format!("Say exactly the following, nothing more: {text}"),
            }
        }),
        ClientCommand::CancelResponse => json!({ "type": "response.cancel" }),
    }
}

/// Decode one wire event.
///
/// # Errors
///
/// Returns [`BodyError::Parsing`] for malformed JSON or audio payloads.
pub fn decode_event(raw: &str) -> Result<ProviderEvent, BodyError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| BodyError::Parsing(format!("provider event: {e}")))?;
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let text_field = |field: &str| {
        value
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let event = match kind {
        "input_audio_buffer.speech_started" => ProviderEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => ProviderEvent::SpeechStopped,
        "conversation.item.input_audio_transcription.delta" => {
            ProviderEvent::UserTranscriptDelta(text_field("delta"))
        }
        "conversation.item.input_audio_transcription.completed" => {
            ProviderEvent::UserTranscriptCompleted(text_field("transcript").trim().to_string())
        }
        "response.created" => ProviderEvent::ResponseCreated,
        "response.audio.delta" => {
            let bytes = STANDARD
                .decode(text_field("delta"))
                .map_err(|e| BodyError::Parsing(format!("audio delta: {e}")))?;
            ProviderEvent::AudioDelta(
                bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            )
        }
        "response.audio_transcript.done" => {
            ProviderEvent::AgentTranscriptDone(text_field("transcript"))
        }
        "response.done" => ProviderEvent::ResponseDone,
        "error" => ProviderEvent::Error(
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error")
                .to_string(),
        ),
        other => ProviderEvent::Other(other.to_string()),
    };
    Ok(event)
}

#[async_trait]
impl SpeechTransport for RealtimeWsTransport {
    async fn connect(&mut self) -> Result<(), BodyError> {
        if let Some(mut old) = self.ws.take() {
            let _ = old.close(None).await;
        }

        let url = format!("{}?model={}", self.config.url, self.config.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| BodyError::Config(format!("speech provider url: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|e| BodyError::Config(format!("speech provider key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| transient(format!("connect: {e}")))?;
        self.ws = Some(ws);
        self.send_json(session_update(&self.config)).await?;
        info!(model = %self.config.model, "connected to speech provider");
        Ok(())
    }

    async fn send(&mut self, command: ClientCommand) -> Result<(), BodyError> {
        self.send_json(encode_command(&command)).await
    }

    async fn next_event(&mut self) -> Result<Option<ProviderEvent>, BodyError> {
        loop {
            let ws = self.socket()?;
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match decode_event(text.as_str()) {
                    Ok(event) => return Ok(Some(event)),
                    Err(e) => warn!(error = %e, "dropping undecodable provider event"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "speech provider closed the connection");
                    self.ws = None;
                    return Ok(None);
                }
                None => {
                    debug!("speech provider closed the connection");
                    self.ws = None;
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.ws = None;
                    return Err(transient(format!("receive: {e}")));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), BodyError> {
        if let Some(mut ws) = self.ws.take() {
            ws.close(None)
                .await
                .map_err(|e| transient(format!("close: {e}")))?;
        }
        Ok(())
    }
}
