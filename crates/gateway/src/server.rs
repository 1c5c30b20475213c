use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use {
    tiller_config::TillerConfig,
    tiller_rtm::{HttpCredentialProvider, WsConnector},
};

use crate::{
    liveness::spawn_liveness,
    service,
    state::GatewayState,
    ws::handle_connection,
};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/api/service/login", post(service::login))
        .route("/api/service/logout", post(service::logout))
        .route("/api/service/command", post(service::command))
        .route("/api/service/status", get(service::status))
        .layer(cors)
        .with_state(state)
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(config: TillerConfig) -> anyhow::Result<()> {
    let provider = Arc::new(HttpCredentialProvider::new(
        config.signer.url.clone(),
        Duration::from_secs(config.signer.timeout_secs),
    ));
    let connector = Arc::new(WsConnector::new(config.backend.url.clone()));
    let state = GatewayState::new(config, provider, connector);

    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.gateway.bind, state.config.gateway.port
    )
    .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let admin = if state.config.gateway.admin_token.is_some() {
        "enabled"
    } else {
        "disabled"
    };
    let lines = [
        format!("tiller gateway v{}", state.version),
        format!(
            "protocol v{}, listening on {}",
            tiller_protocol::PROTOCOL_VERSION,
            addr
        ),
        format!("backend: {}", state.config.backend.url),
        format!("admin surface: {admin}"),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    spawn_liveness(Arc::clone(&state));

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let count = state.client_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "protocol": tiller_protocol::PROTOCOL_VERSION,
        "connections": count,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}

#[cfg(test)]
mod tests {
    use {
        futures::{SinkExt, StreamExt},
        serde_json::{Value, json},
        tokio::net::TcpStream,
        tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message},
    };

    use tiller_rtm::{CredentialProvider, TransportConnector};

    use super::*;
    use crate::testing::{StubConnector, StubProvider};

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_app(
        config: TillerConfig,
        connector: Arc<StubConnector>,
    ) -> (SocketAddr, Arc<GatewayState>) {
        let state = GatewayState::new(
            config,
            StubProvider::new() as Arc<dyn CredentialProvider>,
            connector as Arc<dyn TransportConnector>,
        );
        let app = build_gateway_app(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (addr, state)
    }

    async fn ws_client(addr: SocketAddr) -> WsClient {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        ws
    }

    async fn send_json(ws: &mut WsClient, frame: Value) {
        ws.send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    /// Read frames until one of the wanted `type` arrives.
    async fn wait_for(ws: &mut WsClient, frame_type: &str) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                let v: Value = serde_json::from_str(text.as_str()).unwrap();
                if v["type"] == frame_type {
                    return v;
                }
            }
        }
    }

    #[tokio::test]
    async fn health_reports_connections() {
        let (addr, _state) = spawn_app(TillerConfig::default(), StubConnector::new()).await;
        let body: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn login_then_command_round_trip() {
        let connector = StubConnector::new();
        let (addr, _state) = spawn_app(TillerConfig::default(), Arc::clone(&connector)).await;
        let mut ws = ws_client(addr).await;

        send_json(&mut ws, json!({"type": "login", "identity": "u1", "token": "t1"})).await;
        let status = wait_for(&mut ws, "status").await;
        assert_eq!(status["ready"], true);
        assert_eq!(status["identity"], "u1");

        send_json(
            &mut ws,
            json!({"type": "sendCommand", "payload": {"code": 7, "data": {"power": "on"}}}),
        )
        .await;
        let result = wait_for(&mut ws, "commandResult").await;
        assert_eq!(result["success"], true);
        assert_eq!(result["recipient"], "ru-u1");
        assert_eq!(result["attempts"].as_array().unwrap().len(), 1);

        let transport = connector.transport().await.unwrap();
        assert_eq!(transport.sent().await, vec!["ru-u1"]);
    }

    #[tokio::test]
    async fn command_before_login_fails_without_network() {
        let connector = StubConnector::new();
        let (addr, _state) = spawn_app(TillerConfig::default(), Arc::clone(&connector)).await;
        let mut ws = ws_client(addr).await;

        send_json(&mut ws, json!({"type": "sendCommand", "payload": {"code": 1}})).await;
        let error = wait_for(&mut ws, "error").await;
        assert_eq!(error["message"], "not logged in");
        let result = wait_for(&mut ws, "commandResult").await;
        assert_eq!(result["success"], false);
        assert!(result["attempts"].as_array().unwrap().is_empty());
        assert!(connector.transport().await.is_none());
    }

    #[tokio::test]
    async fn failed_dispatch_reports_every_attempt() {
        let connector = StubConnector::new().failing_sends();
        let mut config = TillerConfig::default();
        config.backend.fallback_recipient = Some("device-main".into());
        let (addr, _state) = spawn_app(config, Arc::clone(&connector)).await;
        let mut ws = ws_client(addr).await;

        send_json(&mut ws, json!({"type": "login", "identity": "u1", "token": "t1"})).await;
        wait_for(&mut ws, "status").await;

        send_json(
            &mut ws,
            json!({"type": "sendCommand", "payload": {"code": 2}, "recipientOverride": "dev-9"}),
        )
        .await;
        let result = wait_for(&mut ws, "commandResult").await;
        assert_eq!(result["success"], false);
        // Override, fallback, resolved id, caller identity: all failed.
        let attempts = result["attempts"].as_array().unwrap();
        let tried: Vec<&str> = attempts
            .iter()
            .map(|a| a["recipient"].as_str().unwrap())
            .collect();
        assert_eq!(tried, vec!["dev-9", "device-main", "ru-u1", "u1"]);
        assert!(attempts.iter().all(|a| a["ok"] == false));
    }

    #[tokio::test]
    async fn logout_drops_session() {
        let (addr, state) = spawn_app(TillerConfig::default(), StubConnector::new()).await;
        let mut ws = ws_client(addr).await;

        send_json(&mut ws, json!({"type": "login", "identity": "u1", "token": "t1"})).await;
        wait_for(&mut ws, "status").await;

        send_json(&mut ws, json!({"type": "logout"})).await;
        let status = wait_for(&mut ws, "status").await;
        assert_eq!(status["ready"], false);

        send_json(&mut ws, json!({"type": "getStatus"})).await;
        let status = wait_for(&mut ws, "status").await;
        assert_eq!(status["ready"], false);

        // The registry entry survives; only the session is gone.
        assert_eq!(state.client_count().await, 1);
    }

    #[tokio::test]
    async fn rejected_login_surfaces_error() {
        let (addr, _state) = spawn_app(TillerConfig::default(), StubConnector::new()).await;
        let mut ws = ws_client(addr).await;

        send_json(&mut ws, json!({"type": "login", "identity": "u1", "token": "reject"})).await;
        let error = wait_for(&mut ws, "error").await;
        assert!(error["message"].as_str().unwrap().contains("login failed"));
        let status = wait_for(&mut ws, "status").await;
        assert_eq!(status["ready"], false);
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_not_disconnect() {
        let (addr, _state) = spawn_app(TillerConfig::default(), StubConnector::new()).await;
        let mut ws = ws_client(addr).await;

        send_json(&mut ws, json!({"type": "noSuchThing"})).await;
        let error = wait_for(&mut ws, "error").await;
        assert!(error["message"].as_str().unwrap().contains("malformed frame"));

        // Still connected and usable.
        send_json(&mut ws, json!({"type": "getStatus"})).await;
        wait_for(&mut ws, "status").await;
    }

    #[tokio::test]
    async fn disconnect_destroys_bound_session() {
        let (addr, state) = spawn_app(TillerConfig::default(), StubConnector::new()).await;
        let mut ws = ws_client(addr).await;

        send_json(&mut ws, json!({"type": "login", "identity": "u1", "token": "t1"})).await;
        wait_for(&mut ws, "status").await;
        assert_eq!(state.client_count().await, 1);

        let conn_id = state.clients.read().await.keys().next().unwrap().clone();
        let session = state.session_of(&conn_id).await.unwrap();

        ws.close(None).await.unwrap();
        // Teardown runs in the connection task; give it a moment.
        for _ in 0..50 {
            if state.client_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.client_count().await, 0);
        assert_eq!(session.state(), tiller_rtm::SessionState::Destroyed);
    }

    // ── Administrative surface ───────────────────────────────────────────

    fn admin_config() -> TillerConfig {
        let mut config = TillerConfig::default();
        config.gateway.admin_token = Some("adm1n".into());
        config
    }

    #[tokio::test]
    async fn service_endpoints_require_bearer_token() {
        let (addr, _state) = spawn_app(admin_config(), StubConnector::new()).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("http://{addr}/api/service/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(format!("http://{addr}/api/service/status"))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(format!("http://{addr}/api/service/status"))
            .bearer_auth("adm1n")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn service_surface_disabled_without_configured_token() {
        let (addr, _state) = spawn_app(TillerConfig::default(), StubConnector::new()).await;
        let resp = reqwest::Client::new()
            .get(format!("http://{addr}/api/service/status"))
            .bearer_auth("anything")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn service_login_and_command_flow() {
        let connector = StubConnector::new();
        let (addr, _state) = spawn_app(admin_config(), Arc::clone(&connector)).await;
        let client = reqwest::Client::new();

        // Command before login is refused without touching the backend.
        let resp = client
            .post(format!("http://{addr}/api/service/command"))
            .bearer_auth("adm1n")
            .json(&json!({"payload": {"code": 1}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);

        let resp = client
            .post(format!("http://{addr}/api/service/login"))
            .bearer_auth("adm1n")
            .json(&json!({"identity": "svc", "token": "t"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("http://{addr}/api/service/command"))
            .bearer_auth("adm1n")
            .json(&json!({"payload": {"code": 7, "data": {"power": "off"}}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["recipient"], "ru-svc");

        let resp = client
            .post(format!("http://{addr}/api/service/logout"))
            .bearer_auth("adm1n")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = client
            .get(format!("http://{addr}/api/service/status"))
            .bearer_auth("adm1n")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ready"], false);
        assert_eq!(body["state"], "destroyed");
    }
}
