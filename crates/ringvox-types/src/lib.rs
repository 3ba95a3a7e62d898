//! Shared wire types for the ringvox workspace.
//!
//! This crate holds every JSON shape that crosses a process boundary:
//! events exchanged with the remote realtime service over the data channel,
//! request and response bodies of the backend HTTP API, and the messages a
//! voice widget exchanges with its embedding host.
//!
//! Nothing here performs I/O. The session core (`ringvox-voice`) and the
//! terminal host (`ringvox-client`) both depend on these definitions so the
//! two sides of every contract stay in one place.

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod host;
pub mod realtime;

pub use backend::{
    ClientSecret, SessionGrant, SettingsResponse, ToolExecutionRequest, ToolExecutionResponse,
};
pub use host::{HostInbound, HostMessage};
pub use realtime::{ClientEvent, ConversationItem, ServerEvent};

/// The party a transcript line is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// The person talking into the microphone.
    User,
    /// The remote speech model.
    Assistant,
}

impl Speaker {
    /// Returns the lowercase label used on the wire and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side-channel instruction embedded in a tool result.
///
/// The backend tags a successful tool response with at most one action that
/// the session must carry out after acknowledging the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemAction {
    /// Plain result, nothing else to do.
    #[default]
    None,
    /// End the voice session once the assistant has finished speaking.
    Disconnect,
    /// Ask the host to open a URL in a new browsing context.
    OpenUrl,
    /// Ask the host to navigate to an application module.
    OpenModule,
}

impl SystemAction {
    /// Returns the wire label for this action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Disconnect => "disconnect",
            Self::OpenUrl => "open_url",
            Self::OpenModule => "open_module",
        }
    }
}
