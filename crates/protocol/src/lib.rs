//! Wire protocol between gateway clients and the tiller gateway.
//!
//! One JSON frame per WebSocket text message, internally tagged by `type`.
//! Clients issue control frames ([`ClientFrame`]); the gateway pushes
//! notifications ([`ServerFrame`]). There is no request/response pairing:
//! every `sendCommand` eventually produces a `commandResult` frame.

use serde::{Deserialize, Serialize};

// ── Protocol constants ───────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;

/// Bound on waiting for the backend "ready" signal during initialization.
pub const READY_TIMEOUT_MS: u64 = 15_000;

/// Interval between liveness probes against gateway connections.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Bound on waiting for the backend to acknowledge a single send.
pub const SEND_ACK_TIMEOUT_MS: u64 = 10_000;

// ── Command envelope ─────────────────────────────────────────────────────────

/// An application-level command addressed to the remote device.
///
/// Opaque beyond this shape: the gateway never interprets `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub code: u32,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

// ── Dispatch attempts ────────────────────────────────────────────────────────

/// Outcome of one delivery attempt against one recipient candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAttempt {
    pub recipient: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Client → gateway frames ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Authenticate this connection's backend session.
    #[serde(rename_all = "camelCase")]
    Login { identity: String, token: String },
    /// Tear down this connection's backend session.
    Logout,
    /// Deliver a command to the remote device.
    #[serde(rename_all = "camelCase")]
    SendCommand {
        payload: CommandEnvelope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_override: Option<String>,
    },
    /// Request a `status` frame.
    GetStatus,
    /// Liveness refresh. Carries no payload and produces no reply.
    Ping,
}

// ── Gateway → client frames ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Session readiness snapshot.
    #[serde(rename_all = "camelCase")]
    Status {
        ready: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },
    /// Operational log line surfaced to the client.
    #[serde(rename_all = "camelCase")]
    Log { level: LogLevel, message: String },
    /// Final outcome of a `sendCommand`, with one record per attempt.
    #[serde(rename_all = "camelCase")]
    CommandResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
        attempts: Vec<DispatchAttempt>,
    },
    /// A message from the backend addressed to this connection's identity.
    #[serde(rename_all = "camelCase")]
    IncomingMessage {
        from: String,
        to: String,
        text: String,
        time: u64,
    },
    /// A request-level failure (malformed frame, rejected login, ...).
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    /// Serialize to the on-wire JSON text. Infallible for these shapes.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"frame serialization failed"}"#.into()
        })
    }
}
