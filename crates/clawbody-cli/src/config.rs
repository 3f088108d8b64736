//! Configuration Vault – reads/writes `~/.clawbody/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use clawbody_perception::{MAX_RATE_HZ, valid_rate};
use zeroize::Zeroizing;

/// Which robot the session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Simulated body, console speech.
    #[default]
    Sim,
    /// The behavior daemon on a real robot plus the realtime speech provider.
    Hardware,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Sim => write!(f, "sim"),
            RunMode::Hardware => write!(f, "hardware"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" => Ok(RunMode::Sim),
            "hardware" => Ok(RunMode::Hardware),
            other => Err(format!("unknown run mode '{other}' (expected sim or hardware)")),
        }
    }
}

/// Persisted user configuration stored in `~/.clawbody/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: RunMode,

    /// Realtime speech provider endpoint.
    #[serde(default = "default_speech_url")]
    pub speech_url: String,

    #[serde(
        default,
        with = "secret",
        skip_serializing_if = "secret::is_blank"
    )]
    pub speech_api_key: Zeroizing<String>,

    #[serde(default = "default_speech_model")]
    pub speech_model: String,

    #[serde(default = "default_speech_voice")]
    pub speech_voice: String,

    /// Base URL of the agent gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    #[serde(
        default,
        with = "secret",
        skip_serializing_if = "secret::is_blank"
    )]
    pub gateway_token: Zeroizing<String>,

    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    #[serde(default = "default_session_key")]
    pub session_key: String,

    /// Base URL of the on-robot behavior daemon.
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,

    /// Camera device name on the daemon.
    #[serde(default = "default_camera")]
    pub camera: String,

    /// Face-detection service; the built-in bright-spot detector is used
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector_url: Option<String>,

    /// Perception tick rate, at most [`MAX_RATE_HZ`].
    #[serde(default = "default_perception_hz")]
    pub perception_hz: f32,

    #[serde(default = "default_registry_refresh_secs")]
    pub registry_refresh_secs: u64,
}

/// Serde glue for credentials kept in zeroizing buffers.
mod secret {
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(value: &Zeroizing<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Zeroizing<String>, D::Error> {
        String::deserialize(d).map(Zeroizing::new)
    }

    pub fn is_blank(value: &Zeroizing<String>) -> bool {
        value.is_empty()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() { "<not set>" } else { "<redacted>" }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("mode", &self.mode)
            .field("speech_url", &self.speech_url)
            .field("speech_api_key", &redacted(&self.speech_api_key))
            .field("speech_model", &self.speech_model)
            .field("speech_voice", &self.speech_voice)
            .field("gateway_url", &self.gateway_url)
            .field("gateway_token", &redacted(&self.gateway_token))
            .field("agent_id", &self.agent_id)
            .field("session_key", &self.session_key)
            .field("daemon_url", &self.daemon_url)
            .field("camera", &self.camera)
            .field("detector_url", &self.detector_url)
            .field("perception_hz", &self.perception_hz)
            .field("registry_refresh_secs", &self.registry_refresh_secs)
            .finish()
    }
}

fn default_speech_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}
fn default_speech_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}
fn default_speech_voice() -> String {
    "cedar".to_string()
}
fn default_gateway_url() -> String {
    "http://localhost:18789".to_string()
}
fn default_agent_id() -> String {
    "main".to_string()
}
fn default_session_key() -> String {
    "main".to_string()
}
fn default_daemon_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_camera() -> String {
    "head".to_string()
}
fn default_perception_hz() -> f32 {
    25.0
}
fn default_registry_refresh_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            speech_url: default_speech_url(),
            speech_api_key: Zeroizing::new(String::new()),
            speech_model: default_speech_model(),
            speech_voice: default_speech_voice(),
            gateway_url: default_gateway_url(),
            gateway_token: Zeroizing::new(String::new()),
            agent_id: default_agent_id(),
            session_key: default_session_key(),
            daemon_url: default_daemon_url(),
            camera: default_camera(),
            detector_url: None,
            perception_hz: default_perception_hz(),
            registry_refresh_secs: default_registry_refresh_secs(),
        }
    }
}

/// Return the path to `~/.clawbody/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".clawbody").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = Zeroizing::new(
        fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?,
    );
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    if !valid_rate(cfg.perception_hz) {
        return Err(format!(
            "perception_hz must be in (0, {}], got {}",
            MAX_RATE_HZ, cfg.perception_hz
        ));
    }
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `CLAWBODY_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CLAWBODY_MODE` | `mode` |
/// | `CLAWBODY_SPEECH_API_KEY` | `speech_api_key` |
/// | `CLAWBODY_GATEWAY_URL` | `gateway_url` |
/// | `CLAWBODY_GATEWAY_TOKEN` | `gateway_token` |
/// | `CLAWBODY_AGENT_ID` | `agent_id` |
/// | `CLAWBODY_DAEMON_URL` | `daemon_url` |
/// | `CLAWBODY_DETECTOR_URL` | `detector_url` |
/// | `CLAWBODY_PERCEPTION_HZ` | `perception_hz` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CLAWBODY_MODE")
        && let Ok(mode) = v.parse::<RunMode>()
    {
        cfg.mode = mode;
    }
    if let Ok(v) = std::env::var("CLAWBODY_SPEECH_API_KEY") {
        cfg.speech_api_key = Zeroizing::new(v);
    }
    if let Ok(v) = std::env::var("CLAWBODY_GATEWAY_URL") {
        cfg.gateway_url = v;
    }
    if let Ok(v) = std::env::var("CLAWBODY_GATEWAY_TOKEN") {
        cfg.gateway_token = Zeroizing::new(v);
    }
    if let Ok(v) = std::env::var("CLAWBODY_AGENT_ID") {
        cfg.agent_id = v;
    }
    if let Ok(v) = std::env::var("CLAWBODY_DAEMON_URL") {
        cfg.daemon_url = v;
    }
    if let Ok(v) = std::env::var("CLAWBODY_DETECTOR_URL") {
        cfg.detector_url = Some(v).filter(|u| !u.is_empty());
    }
    if let Ok(v) = std::env::var("CLAWBODY_PERCEPTION_HZ")
        && let Ok(hz) = v.parse::<f32>()
        && valid_rate(hz)
    {
        cfg.perception_hz = hz;
    }
}

/// Save the config to disk, creating `~/.clawbody/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = Zeroizing::new(
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?,
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw.as_bytes())
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
