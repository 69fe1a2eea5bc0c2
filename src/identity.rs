//! Identity Bootstrap
//!
//! ## Responsibilities
//!
//! - Resolve the process identity exactly once: anonymous sign-up, or
//!   custom-token exchange when a token is configured
//! - Cache the outcome for the process lifetime. A failed bootstrap is
//!   cached too: history stays disabled, nothing retries.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// A resolved identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    // 匿名サインインは localId、一部のトークン交換応答は userId を返す
    #[serde(rename = "localId", alias = "userId")]
    local_id: String,
}

/// IdentityBootstrap instance
pub struct IdentityBootstrap {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    token: Option<String>,
    cell: OnceCell<Option<Identity>>,
}

impl IdentityBootstrap {
    /// Create new IdentityBootstrap. Nothing is resolved until the first
    /// identity() call.
    pub fn new(base_url: &str, api_key: &str, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            token,
            cell: OnceCell::new(),
        }
    }

    /// Pre-resolved instance for tests
    #[cfg(test)]
    pub(crate) fn fixed(identity: Option<Identity>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: String::new(),
            api_key: String::new(),
            token: None,
            cell: OnceCell::new_with(Some(identity)),
        }
    }

    /// The process identity. Resolved on first call, cached afterwards.
    /// None means the bootstrap failed or is unconfigured; history stays
    /// disabled for the rest of the process.
    pub async fn identity(&self) -> Option<Identity> {
        self.cell
            .get_or_init(|| async {
                match self.bootstrap().await {
                    Ok(identity) => {
                        tracing::info!(uid = %identity.uid, "Identity established");
                        Some(identity)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Identity bootstrap failed, history disabled");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn bootstrap(&self) -> Result<Identity> {
        if self.base_url.is_empty() {
            return Err(Error::Config(
                "identity endpoint not configured".to_string(),
            ));
        }

        let (url, body) = match &self.token {
            Some(token) => (
                format!(
                    "{}/v1/accounts:signInWithCustomToken?key={}",
                    self.base_url, self.api_key
                ),
                serde_json::json!({ "token": token, "returnSecureToken": true }),
            ),
            None => (
                format!("{}/v1/accounts:signUp?key={}", self.base_url, self.api_key),
                serde_json::json!({ "returnSecureToken": true }),
            ),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::IdentityUnavailable(format!("sign-in request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Error::IdentityUnavailable(format!(
                "sign-in returned {}",
                status
            )));
        }

        let parsed: SignInResponse = serde_json::from_str(&text)
            .map_err(|e| Error::IdentityUnavailable(format!("malformed sign-in response: {}", e)))?;

        Ok(Identity {
            uid: parsed.local_id,
        })
    }
}
