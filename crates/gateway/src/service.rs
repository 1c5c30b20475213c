//! Administrative ("service") surface.
//!
//! Request/response endpoints backed by one dedicated privileged session,
//! going through the same session and dispatcher path as per-connection
//! sessions. Guarded by a bearer token from config.

use std::sync::Arc;

use {
    axum::{
        extract::State,
        http::{HeaderMap, StatusCode, header::AUTHORIZATION},
        response::Json,
    },
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::{info, warn},
};

use tiller_protocol::CommandEnvelope;

use crate::{auth, state::GatewayState};

type ServiceResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn guard(state: &GatewayState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    auth::authorize_bearer(state.config.gateway.admin_token.as_deref(), header).map_err(|e| {
        let code = match e {
            auth::AuthError::Unconfigured => StatusCode::SERVICE_UNAVAILABLE,
            auth::AuthError::Missing | auth::AuthError::Mismatch => StatusCode::UNAUTHORIZED,
        };
        (code, Json(json!({ "error": e.as_str() })))
    })
}

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ServiceLogin {
    pub identity: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCommand {
    pub payload: CommandEnvelope,
    #[serde(default)]
    pub recipient_override: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────────────

pub async fn login(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(req): Json<ServiceLogin>,
) -> ServiceResult {
    guard(&state, &headers)?;
    let session = state.service_session().await;
    match session.login_with(&req.identity, &req.token).await {
        Ok(()) => {
            info!(identity = %req.identity, "service login succeeded");
            Ok(Json(json!({ "ok": true, "identity": req.identity })))
        },
        Err(e) => {
            warn!(identity = %req.identity, error = %e, "service login failed");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            ))
        },
    }
}

pub async fn logout(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> ServiceResult {
    guard(&state, &headers)?;
    let session = state.service_session().await;
    session.destroy().await;
    Ok(Json(json!({ "ok": true })))
}

pub async fn command(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(req): Json<ServiceCommand>,
) -> ServiceResult {
    guard(&state, &headers)?;
    let session = state.service_session().await;
    if !session.is_ready() {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "service session not ready" })),
        ));
    }

    match state
        .dispatcher
        .dispatch(&session, &req.payload, req.recipient_override.as_deref())
        .await
    {
        Ok(outcome) => Ok(Json(json!({
            "success": true,
            "recipient": outcome.recipient,
            "attempts": outcome.attempts,
        }))),
        Err(e) => Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "success": false,
                "attempts": e.attempts(),
            })),
        )),
    }
}

pub async fn status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> ServiceResult {
    guard(&state, &headers)?;
    let session = state.service_session().await;
    Ok(Json(json!({
        "ready": session.is_ready(),
        "state": session.state().as_str(),
        "identity": session.current_identity().await,
    })))
}
