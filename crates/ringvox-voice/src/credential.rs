//! Short-lived credentials for the realtime service.

use crate::backend::BackendClient;
use crate::config::RealtimeConfig;
use crate::error::VoiceError;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use tracing::{info, warn};

/// An ephemeral, single-use credential plus the negotiation target it is
/// valid for.
#[derive(Clone)]
pub struct Credential {
    secret: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub model: String,
    pub endpoint: String,
}

impl Credential {
    pub fn new(
        secret: impl Into<String>,
        model: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            secret: secret.into(),
            expires_at: None,
            model: model.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The negotiation URL with the model as a query parameter.
    pub fn negotiation_url(&self) -> Result<reqwest::Url, VoiceError> {
        let mut url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            VoiceError::Config(format!("invalid realtime URL '{}': {e}", self.endpoint))
        })?;
        url.query_pairs_mut().append_pair("model", &self.model);
        Ok(url)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Obtains credentials from the backend, which is the sole holder of the
/// long-lived API secret.
#[derive(Debug, Clone)]
pub struct CredentialFetcher {
    backend: BackendClient,
    realtime: RealtimeConfig,
}

impl CredentialFetcher {
    pub fn new(backend: BackendClient, realtime: RealtimeConfig) -> Self {
        Self { backend, realtime }
    }

    /// Fetches a fresh credential and resolves the negotiation model.
    ///
    /// Fails with [`VoiceError::Credential`] on a non-success status or a
    /// response without a secret. A failing settings lookup only falls back
    /// to the configured default model.
    pub async fn fetch(&self) -> Result<Credential, VoiceError> {
        let (status, grant) = self
            .backend
            .session()
            .await
            .map_err(|e| VoiceError::Credential(format!("session request failed: {e}")))?;

        if !status.is_success() {
            let reason = grant
                .error
                .unwrap_or_else(|| format!("backend returned HTTP {status}"));
            return Err(VoiceError::Credential(reason));
        }

        let secret = grant
            .client_secret
            .filter(|secret| !secret.value.is_empty())
            .ok_or_else(|| {
                VoiceError::Credential(
                    grant
                        .error
                        .clone()
                        .unwrap_or_else(|| "backend response did not include a credential".into()),
                )
            })?;

        let model = self.resolve_model().await;
        let expires_at = secret
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        info!(model = %model, expires_at = ?expires_at, "obtained realtime credential");

        Ok(Credential {
            secret: secret.value,
            expires_at,
            model,
            endpoint: self.realtime.base_url.clone(),
        })
    }

    async fn resolve_model(&self) -> String {
        match self.backend.settings().await {
            Ok(settings) => settings
                .realtime_model
                .filter(|model| !model.trim().is_empty())
                .unwrap_or_else(|| self.realtime.default_model.clone()),
            Err(e) => {
                warn!(error = %e, "could not read settings, using default model");
                self.realtime.default_model.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_url_carries_model() {
        let credential = Credential::new(
            "ek_1",
            "gpt-4o-realtime-preview-2024-12-17",
            "https://api.openai.com/v1/realtime",
        );
        let url = credential.negotiation_url().unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17"
        );
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let credential = Credential::new("ek_1", "m", "not a url");
        assert!(matches!(
            credential.negotiation_url(),
            Err(VoiceError::Config(_))
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let credential = Credential::new("ek_top_secret", "m", "https://x.test");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("ek_top_secret"));
    }

    #[test]
    fn expiry_check() {
        let mut credential = Credential::new("ek", "m", "https://x.test");
        let now = Utc::now();
        assert!(!credential.is_expired(now));
        credential.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(credential.is_expired(now));
    }
}
