/// Config schema types (gateway, signer, backend, liveness).

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TillerConfig {
    pub gateway: GatewayConfig,
    pub signer: SignerConfig,
    pub backend: BackendConfig,
    pub liveness: LivenessConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// Bearer token guarding the administrative surface.
    /// `${TILLER_ADMIN_TOKEN}` in the file resolves from the environment.
    pub admin_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
            admin_token: None,
        }
    }
}

/// Credential-signing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9280/sign".into(),
            timeout_secs: 10,
        }
    }
}

/// Real-time messaging backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    /// Bound on waiting for the backend "ready" signal during login.
    pub ready_timeout_secs: u64,
    /// Recipient tried after an explicit override but before the
    /// session-resolved identity. Typically the device's well-known id.
    pub fallback_recipient: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "wss://rtm.example.net/v1".into(),
            ready_timeout_secs: 15,
            fallback_recipient: None,
        }
    }
}

/// Connection liveness supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}
