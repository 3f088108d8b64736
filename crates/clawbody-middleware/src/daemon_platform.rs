//! HTTP client for the on-robot behavior daemon.
//!
//! | Call | Endpoint |
//! |---|---|
//! | scan behaviors | `GET /api/behaviors` |
//! | head pose | `POST /api/move/head` |
//! | play behavior | `POST /api/move/play` |
//! | sway | `POST /api/move/sway` |
//! | speech audio | `POST /api/audio/play` |
//! | stop | `POST /api/move/stop` |
//! | microphone | `GET /api/audio/mic` |

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clawbody_types::{
    ActionTarget, BehaviorCategory, BehaviorDescriptor, BodyError, Subsystem,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::platform::{BehaviorStore, RobotPlatform};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct BehaviorEntry {
    name: String,
    category: BehaviorCategory,
    #[serde(default)]
    duration_ms: u64,
}

/// Robot backend that forwards actions to the behavior daemon.
pub struct DaemonPlatform {
    base_url: String,
    client: reqwest::Client,
}

impl DaemonPlatform {
    /// Create a client for the daemon at `base_url` (e.g.
    /// `"http://reachy-mini.local:8000"`).
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::Config`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, BodyError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| BodyError::Config(format!("daemon http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Pull the next block of microphone audio (PCM16 LE, 24 kHz mono).
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::TransientIo`] when the daemon is unreachable.
    pub async fn read_microphone(&self, block_ms: u32) -> Result<Vec<i16>, BodyError> {
        let url = format!("{}/api/audio/mic?ms={block_ms}", self.base_url);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify("microphone", e))?
            .bytes()
            .await
            .map_err(|e| classify("microphone", e))?;
        Ok(bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), BodyError> {
        let url = format!("{}{path}", self.base_url);
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify(path, e))?;
        Ok(())
    }
}

/// Encode PCM16 samples as base64 little-endian bytes.
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

/// Map a transport-level failure onto the error taxonomy.
fn classify(component: &str, e: reqwest::Error) -> BodyError {
    if e.is_timeout() || e.is_connect() {
        return BodyError::TransientIo {
            component: format!("daemon {component}"),
            details: e.to_string(),
        };
    }
    match e.status() {
        Some(status) if status == reqwest::StatusCode::NOT_FOUND => {
            BodyError::NotFound(format!("daemon {component}"))
        }
        Some(status) if status.is_server_error() => BodyError::TransientIo {
            component: format!("daemon {component}"),
            details: status.to_string(),
        },
        _ => BodyError::ExternalService {
            service: "behavior-daemon".to_string(),
            details: e.to_string(),
        },
    }
}

#[async_trait]
impl RobotPlatform for DaemonPlatform {
    async fn execute(&self, target: &ActionTarget) -> Result<(), BodyError> {
        match target {
            ActionTarget::Behavior { name } => {
                debug!(behavior = %name, "daemon: play");
                self.post("/api/move/play", json!({ "name": name })).await
            }
            ActionTarget::HeadPose(pose) => {
                self.post(
                    "/api/move/head",
                    json!({ "yaw_rad": pose.yaw_rad, "pitch_rad": pose.pitch_rad }),
                )
                .await
            }
            ActionTarget::SpeechAudio(chunk) => {
                self.post(
                    "/api/audio/play",
                    json!({
                        "sample_rate": chunk.sample_rate,
                        "pcm16": encode_pcm16(&chunk.samples),
                    }),
                )
                .await
            }
            ActionTarget::Sway { amplitude } => {
                self.post("/api/move/sway", json!({ "amplitude": amplitude }))
                    .await
            }
        }
    }

    async fn stop(&self, subsystem: Subsystem) -> Result<(), BodyError> {
        self.post("/api/move/stop", json!({ "subsystem": subsystem.as_str() }))
            .await
    }
}

#[async_trait]
impl BehaviorStore for DaemonPlatform {
    async fn scan(&self) -> Result<Vec<BehaviorDescriptor>, BodyError> {
        let url = format!("{}/api/behaviors", self.base_url);
        let entries: Vec<BehaviorEntry> = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify("behaviors", e))?
            .json()
            .await
            .map_err(|e| BodyError::Parsing(format!("behavior list: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| BehaviorDescriptor::recorded(e.name, e.category, e.duration_ms))
            .collect())
    }
}
