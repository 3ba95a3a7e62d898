//! HTTP client for the application backend.

use crate::config::BackendConfig;
use crate::error::VoiceError;
use reqwest::StatusCode;
use ringvox_types::{SessionGrant, SettingsResponse, ToolExecutionRequest, ToolExecutionResponse};
use tracing::debug;

/// Thin wrapper over `reqwest` bound to one backend base URL.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self, VoiceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /api/session`. Returns the status and the (possibly empty) grant.
    ///
    /// A body that is not valid JSON yields a default grant so the caller can
    /// still report the status.
    pub async fn session(&self) -> Result<(StatusCode, SessionGrant), reqwest::Error> {
        let response = self.http.get(self.url("/api/session")).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        let grant = serde_json::from_slice(&body).unwrap_or_else(|e| {
            debug!(%status, error = %e, "session response is not a JSON grant");
            SessionGrant::default()
        });
        Ok((status, grant))
    }

    /// `GET /api/settings`.
    pub async fn settings(&self) -> Result<SettingsResponse, VoiceError> {
        let response = self
            .http
            .get(self.url("/api/settings"))
            .send()
            .await
            .map_err(|e| VoiceError::Config(format!("settings request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(VoiceError::Config(format!(
                "settings request returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<SettingsResponse>()
            .await
            .map_err(|e| VoiceError::Config(format!("invalid settings body: {e}")))
    }

    /// `POST /api/execute_tool`.
    ///
    /// The backend reports tool failures in the body, often alongside an
    /// error status, so the body is parsed regardless of status.
    pub async fn execute_tool(
        &self,
        request: &ToolExecutionRequest,
    ) -> Result<ToolExecutionResponse, VoiceError> {
        let response = self
            .http
            .post(self.url("/api/execute_tool"))
            .json(request)
            .send()
            .await
            .map_err(|e| VoiceError::ToolExecution(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| VoiceError::ToolExecution(format!("failed to read response: {e}")))?;
        serde_json::from_slice::<ToolExecutionResponse>(&body).map_err(|e| {
            if status.is_success() {
                VoiceError::ToolExecution(format!("invalid response body: {e}"))
            } else {
                VoiceError::ToolExecution(format!("HTTP {status}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = BackendClient::new(&BackendConfig {
            base_url: "http://localhost:8000/".into(),
            request_timeout_ms: 1_000,
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
        assert_eq!(
            client.url("/api/session"),
            "http://localhost:8000/api/session"
        );
    }
}
