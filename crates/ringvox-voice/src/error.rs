use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("negotiation failed: {message}")]
    Negotiation {
        /// HTTP status of the negotiation endpoint, if it answered at all.
        status: Option<u16>,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool execution error: {0}")]
    ToolExecution(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connect attempt cancelled")]
    Cancelled,
}

/// Coarse classification of a [`VoiceError`], used for user-facing notices
/// and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Credential,
    PermissionDenied,
    Media,
    Negotiation,
    TransportLost,
    ToolExecution,
    Config,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::PermissionDenied => "permission_denied",
            Self::Media => "media",
            Self::Negotiation => "negotiation",
            Self::TransportLost => "transport_lost",
            Self::ToolExecution => "tool_execution",
            Self::Config => "config",
            Self::Cancelled => "cancelled",
        }
    }
}

impl VoiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Credential(_) => ErrorKind::Credential,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Media(_) => ErrorKind::Media,
            Self::Negotiation { .. } => ErrorKind::Negotiation,
            Self::Transport(_) => ErrorKind::TransportLost,
            Self::ToolExecution(_) => ErrorKind::ToolExecution,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Text suitable for showing to the person using the widget.
    pub fn user_message(&self) -> String {
        match self {
            Self::Credential(msg) => format!("Could not start a voice session: {msg}"),
            Self::PermissionDenied(_) => {
                "Microphone access was denied. Allow microphone access and try again.".to_string()
            }
            Self::Media(msg) => format!("Could not use the microphone: {msg}"),
            Self::Negotiation {
                status: Some(status),
                ..
            } => format!("Could not connect to the voice service (HTTP {status})."),
            Self::Negotiation { status: None, .. } => {
                "Could not connect to the voice service.".to_string()
            }
            Self::Transport(_) => "Connection lost.".to_string(),
            Self::ToolExecution(msg) => msg.clone(),
            Self::Config(msg) => format!("Voice session is misconfigured: {msg}"),
            Self::Cancelled => "Connection cancelled.".to_string(),
        }
    }
}

impl From<webrtc::Error> for VoiceError {
    fn from(e: webrtc::Error) -> Self {
        VoiceError::Transport(e.to_string())
    }
}
