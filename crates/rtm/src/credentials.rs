//! Credential exchange with the signing service.
//!
//! The backend will not accept a login from raw client credentials; they are
//! first exchanged for transport credentials by an external signer. Any
//! failure here is fatal to the current initialization attempt and never
//! leaves a session partially ready.

use std::time::Duration;

use {
    async_trait::async_trait,
    serde::Deserialize,
    tracing::{debug, warn},
};

use crate::error::SignatureError;

/// Transport credentials returned by the signer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCredentials {
    pub app_identity: String,
    pub session_signature: String,
    pub remote_user_id: String,
}

/// Exchanges an identity + auth token for transport credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn sign(&self, identity: &str, token: &str)
    -> Result<TransportCredentials, SignatureError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────────

/// Production provider: POST `{identity, token}` to the signer URL.
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpCredentialProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn sign(
        &self,
        identity: &str,
        token: &str,
    ) -> Result<TransportCredentials, SignatureError> {
        debug!(identity, url = %self.url, "requesting transport credentials");

        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "identity": identity, "token": token }))
            .send()
            .await
            .map_err(|e| SignatureError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(identity, status = status.as_u16(), "signer rejected request");
            return Err(SignatureError::Status(status.as_u16()));
        }

        // Missing fields fail deserialization and map to Malformed.
        resp.json::<TransportCredentials>()
            .await
            .map_err(|e| SignatureError::Malformed(e.to_string()))
    }
}
