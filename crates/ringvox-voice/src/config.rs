use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Model used for negotiation when the backend settings do not name one.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Label of the data channel the client opens for realtime events.
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "oai-events";

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_realtime_url() -> String {
    "https://api.openai.com/v1/realtime".to_string()
}

fn default_model() -> String {
    DEFAULT_REALTIME_MODEL.to_string()
}

fn default_data_channel_label() -> String {
    DEFAULT_DATA_CHANNEL_LABEL.to_string()
}

fn default_negotiation_timeout_ms() -> u64 {
    15_000
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
    ]
}

fn default_inactivity_timeout_ms() -> u64 {
    60_000
}

fn default_inactivity_check_interval_ms() -> u64 {
    1_000
}

fn default_disconnect_grace_ms() -> u64 {
    2_000
}

fn default_graceful_teardown_ms() -> u64 {
    600
}

fn default_mic_activity_threshold() -> f32 {
    0.01
}

fn default_render_interval_ms() -> u64 {
    16
}

/// Everything a [`VoiceSession`](crate::VoiceSession) needs to know about its
/// surroundings. Every field has a default, so an empty TOML table is valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub session: SessionTimings,
    #[serde(default)]
    pub transcript: TranscriptConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Location of the application backend that mints credentials and runs tools.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL; `/api/session`, `/api/settings` and `/api/execute_tool`
    /// are resolved against it.
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Timeout applied to every backend request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Remote realtime service and media transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Negotiation endpoint. The model is appended as `?model=<id>`.
    #[serde(default = "default_realtime_url")]
    pub base_url: String,

    /// Fallback model when `/api/settings` does not provide one.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,

    /// Timeout for the SDP offer/answer exchange.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// ICE (STUN/TURN) servers for NAT traversal.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: default_realtime_url(),
            default_model: default_model(),
            data_channel_label: default_data_channel_label(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            ice_servers: default_ice_servers(),
        }
    }
}

impl RealtimeConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

/// A single ICE server entry.
#[derive(Clone, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN server.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Timers and thresholds of a connected session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionTimings {
    /// Idle time before the session disconnects itself. `0` disables it.
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,

    #[serde(default = "default_inactivity_check_interval_ms")]
    pub inactivity_check_interval_ms: u64,

    /// Delay between acknowledging a `disconnect` tool call and tearing down,
    /// so the assistant can finish its goodbye.
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,

    /// Fade delay before a timeout or host-requested teardown runs.
    #[serde(default = "default_graceful_teardown_ms")]
    pub graceful_teardown_ms: u64,

    /// Raw microphone level above which the user counts as active.
    #[serde(default = "default_mic_activity_threshold")]
    pub mic_activity_threshold: f32,

    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            inactivity_check_interval_ms: default_inactivity_check_interval_ms(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            graceful_teardown_ms: default_graceful_teardown_ms(),
            mic_activity_threshold: default_mic_activity_threshold(),
            render_interval_ms: default_render_interval_ms(),
        }
    }
}

impl SessionTimings {
    /// `None` when the inactivity watchdog is disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_ms > 0).then(|| Duration::from_millis(self.inactivity_timeout_ms))
    }

    pub fn inactivity_check_interval(&self) -> Duration {
        Duration::from_millis(self.inactivity_check_interval_ms.max(1))
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn graceful_teardown(&self) -> Duration {
        Duration::from_millis(self.graceful_teardown_ms)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptConfig {
    /// Upper bound on retained messages. `0` keeps everything.
    #[serde(default)]
    pub max_messages: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    /// Tool name to the data collection it mutates. A successful call to a
    /// listed tool tells the host to refresh that collection.
    #[serde(default)]
    pub collections: HashMap<String, String>,
}
