use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use {
    tokio::{
        sync::{RwLock, mpsc},
        task::JoinHandle,
    },
    tracing::{debug, info},
    uuid::Uuid,
};

use {
    tiller_config::TillerConfig,
    tiller_protocol::ServerFrame,
    tiller_rtm::{
        CommandDispatcher, CredentialProvider, RemoteSession, SessionConfig, SessionEvent,
        TransportConnector,
    },
};

// ── Outbound frames ──────────────────────────────────────────────────────────

/// What the per-connection writer task can be asked to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized JSON protocol frame.
    Frame(String),
    /// A WebSocket-level liveness probe.
    Ping,
    /// Close the socket.
    Close,
}

// ── Bound session ────────────────────────────────────────────────────────────

/// A connection's backend session plus the task pumping its events out.
pub struct BoundSession {
    pub session: Arc<RemoteSession>,
    pump: JoinHandle<()>,
}

impl BoundSession {
    pub fn new(session: Arc<RemoteSession>, pump: JoinHandle<()>) -> Self {
        Self { session, pump }
    }

    /// Destroy the session and stop forwarding its events.
    pub async fn teardown(self) {
        self.pump.abort();
        self.session.destroy().await;
    }
}

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client currently connected to the gateway.
pub struct ConnectedClient {
    pub conn_id: String,
    pub remote_addr: SocketAddr,
    /// Channel into this client's write loop.
    pub sender: mpsc::UnboundedSender<Outbound>,
    pub connected_at: Instant,
    pub last_pong: Instant,
    /// Cleared by each liveness probe, restored by any inbound frame.
    pub alive: bool,
    /// Backend session bound to this connection, created on first use.
    pub session: Option<BoundSession>,
}

impl ConnectedClient {
    pub fn new(
        conn_id: String,
        remote_addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            remote_addr,
            sender,
            connected_at: now,
            last_pong: now,
            alive: true,
            session: None,
        }
    }

    /// Send a protocol frame to this client.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        self.sender.send(Outbound::Frame(frame.to_json())).is_ok()
    }

    /// Send a WebSocket-level liveness probe.
    pub fn ping(&self) -> bool {
        self.sender.send(Outbound::Ping).is_ok()
    }

    /// Touch the activity timestamp.
    pub fn touch(&mut self) {
        self.alive = true;
        self.last_pong = Instant::now();
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// The privileged administrative session, created on first use.
    service: RwLock<Option<BoundSession>>,
    pub config: TillerConfig,
    pub provider: Arc<dyn CredentialProvider>,
    pub connector: Arc<dyn TransportConnector>,
    pub dispatcher: CommandDispatcher,
    /// Server version string.
    pub version: String,
}

impl GatewayState {
    pub fn new(
        config: TillerConfig,
        provider: Arc<dyn CredentialProvider>,
        connector: Arc<dyn TransportConnector>,
    ) -> Arc<Self> {
        let dispatcher = CommandDispatcher::new(config.backend.fallback_recipient.clone());
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            service: RwLock::new(None),
            config,
            provider,
            connector,
            dispatcher,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub fn next_conn_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ready_timeout: std::time::Duration::from_secs(self.config.backend.ready_timeout_secs),
        }
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Remove a client and destroy its session, if it is still registered.
    pub async fn close_client(&self, conn_id: &str) {
        let removed = self.clients.write().await.remove(conn_id);
        if let Some(client) = removed {
            debug!(conn_id, "closing client connection");
            let _ = client.sender.send(Outbound::Close);
            if let Some(bound) = client.session {
                bound.teardown().await;
            }
        }
    }

    /// The session bound to a connection, if one exists yet.
    pub async fn session_of(&self, conn_id: &str) -> Option<Arc<RemoteSession>> {
        self.clients
            .read()
            .await
            .get(conn_id)
            .and_then(|c| c.session.as_ref())
            .map(|b| Arc::clone(&b.session))
    }

    /// The session bound to a connection, created on first use. The event
    /// pump forwards session events to the connection's write loop. Returns
    /// None when the connection is no longer registered.
    pub async fn bind_session(self: &Arc<Self>, conn_id: &str) -> Option<Arc<RemoteSession>> {
        let mut clients = self.clients.write().await;
        let client = clients.get_mut(conn_id)?;
        if let Some(bound) = &client.session {
            return Some(Arc::clone(&bound.session));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = RemoteSession::new(
            conn_id.to_string(),
            Arc::clone(&self.provider),
            Arc::clone(&self.connector),
            self.session_config(),
            event_tx,
        );
        let pump = tokio::spawn(pump_session_events(
            Arc::downgrade(&session),
            event_rx,
            client.sender.clone(),
        ));
        client.session = Some(BoundSession::new(Arc::clone(&session), pump));
        Some(session)
    }

    // ── Administrative slot ──────────────────────────────────────────────

    /// The privileged service session, created on first use. Its events are
    /// only logged: the administrative surface is request/response.
    pub async fn service_session(self: &Arc<Self>) -> Arc<RemoteSession> {
        if let Some(bound) = self.service.read().await.as_ref() {
            return Arc::clone(&bound.session);
        }

        let mut slot = self.service.write().await;
        // Lost the race between read and write lock: reuse the winner's.
        if let Some(bound) = slot.as_ref() {
            return Arc::clone(&bound.session);
        }
        info!("creating service session");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = RemoteSession::new(
            "service",
            Arc::clone(&self.provider),
            Arc::clone(&self.connector),
            self.session_config(),
            event_tx,
        );
        let pump = tokio::spawn(log_service_events(event_rx));
        *slot = Some(BoundSession::new(Arc::clone(&session), pump));
        session
    }
}

// ── Event pumps ──────────────────────────────────────────────────────────────

/// Forward one session's events to its owning connection as protocol frames.
async fn pump_session_events(
    session: std::sync::Weak<RemoteSession>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    sender: mpsc::UnboundedSender<Outbound>,
) {
    use tiller_protocol::LogLevel;

    while let Some(event) = events.recv().await {
        let frame = match event {
            SessionEvent::Ready => {
                let Some(session) = session.upgrade() else { return };
                ServerFrame::Status {
                    ready: true,
                    identity: session.current_identity().await,
                }
            },
            SessionEvent::Degraded { reason } => {
                ServerFrame::log(LogLevel::Warn, format!("backend degraded: {reason}"))
            },
            SessionEvent::ForcedLogout { reason } => {
                ServerFrame::error(format!("logged out by backend: {reason}"))
            },
            SessionEvent::NetworkChange { state } => {
                ServerFrame::log(LogLevel::Info, format!("backend network: {state}"))
            },
            SessionEvent::DeliveryError { reason } => {
                ServerFrame::log(LogLevel::Warn, format!("delivery error: {reason}"))
            },
            SessionEvent::Incoming {
                from,
                to,
                text,
                time,
            } => ServerFrame::IncomingMessage {
                from,
                to,
                text,
                time,
            },
        };
        if sender.send(Outbound::Frame(frame.to_json())).is_err() {
            return;
        }
    }
}

/// The service session has no duplex peer; surface its events in the log.
async fn log_service_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Ready => info!(session = "service", "session ready"),
            SessionEvent::Degraded { reason } => {
                tracing::warn!(session = "service", reason = %reason, "backend degraded");
            },
            SessionEvent::ForcedLogout { reason } => {
                tracing::warn!(session = "service", reason = %reason, "forced logout");
            },
            SessionEvent::NetworkChange { state } => {
                debug!(session = "service", state = %state, "network change");
            },
            SessionEvent::DeliveryError { reason } => {
                tracing::warn!(session = "service", reason = %reason, "delivery error");
            },
            SessionEvent::Incoming { from, text, .. } => {
                info!(session = "service", from = %from, text = %text, "incoming message");
            },
        }
    }
}
