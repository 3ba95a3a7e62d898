//! Client configuration loading from file and environment variables.

use ringvox_voice::VoiceConfig;
use serde::Deserialize;
use thiserror::Error;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Session settings: `[backend]`, `[realtime]`, `[session]`,
    /// `[transcript]` and `[tools]`.
    #[serde(flatten)]
    pub voice: VoiceConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local audio devices.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Substring of the input device name to capture from. The default
    /// input device when unset.
    #[serde(default)]
    pub input_device: Option<String>,

    /// Play the assistant's voice on the default output device.
    #[serde(default = "default_true")]
    pub playback: bool,
}

/// How host messages reach the embedding application.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Write outbound host messages to stdout as JSON lines.
    #[serde(default = "default_true")]
    pub stdio_json: bool,

    /// Open `open_url` targets with the platform opener.
    #[serde(default)]
    pub open_urls: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "ringvox_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            playback: true,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            stdio_json: true,
            open_urls: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_env_overrides`]).
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies overrides looked up through `var`:
/// - `RINGVOX_BACKEND_URL` overrides `backend.base_url`
/// - `RINGVOX_REALTIME_URL` overrides `realtime.base_url`
/// - `RINGVOX_INACTIVITY_TIMEOUT_MS` overrides `session.inactivity_timeout_ms`
/// - `RINGVOX_LOG_LEVEL` overrides `logging.level`
/// - `RINGVOX_LOG_JSON` overrides `logging.json` (set to "true" to enable)
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("RINGVOX_BACKEND_URL") {
        config.voice.backend.base_url = url;
    }
    if let Some(url) = var("RINGVOX_REALTIME_URL") {
        config.voice.realtime.base_url = url;
    }
    if let Some(timeout) = var("RINGVOX_INACTIVITY_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.voice.session.inactivity_timeout_ms = parsed;
        }
    }
    if let Some(level) = var("RINGVOX_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("RINGVOX_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
