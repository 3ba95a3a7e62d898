//! Request and response bodies of the backend HTTP API.
//!
//! The backend is an external collaborator. It holds the long-lived
//! realtime API secret, mints ephemeral session credentials, exposes the
//! application settings, and executes tool calls on behalf of the model.

use crate::SystemAction;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `GET /api/session`.
///
/// A failing backend answers with a non-2xx status and only `error` set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionGrant {
    #[serde(default)]
    pub client_secret: Option<ClientSecret>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The ephemeral credential minted for one realtime session.
#[derive(Clone, Deserialize)]
pub struct ClientSecret {
    #[serde(default)]
    pub value: String,
    /// Expiry as a Unix timestamp in seconds, when the backend reports it.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl std::fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecret")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Body of `GET /api/settings`. Only the fields the session uses are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsResponse {
    #[serde(default)]
    pub realtime_model: Option<String>,
}

/// Body of `POST /api/execute_tool`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecutionRequest {
    pub tool_name: String,
    pub arguments: Value,
}

/// Response of `POST /api/execute_tool`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolExecutionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub system_action: Option<SystemAction>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
}

impl ToolExecutionResponse {
    /// The action to perform, treating an absent tag as [`SystemAction::None`].
    pub fn action(&self) -> SystemAction {
        self.system_action.unwrap_or_default()
    }
}
