//! Backend transport: the seam between a session and the messaging backend.
//!
//! [`Transport`] is what a live connection can do (login, send, logout);
//! [`TransportConnector`] is how one is dialed. The production
//! implementation speaks JSON frames over a WebSocket; sends are
//! acknowledged by id with a bounded wait, everything else arrives as
//! [`TransportEvent`]s on the receiver handed over at connect time.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    serde::{Deserialize, Serialize},
    tokio::{
        net::TcpStream,
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite},
    tracing::{debug, trace, warn},
};

use tiller_protocol::SEND_ACK_TIMEOUT_MS;

use crate::{credentials::TransportCredentials, error::SessionError};

// ── Events ───────────────────────────────────────────────────────────────────

/// Normalized backend events, one receiver per live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Ready,
    NotReady { reason: String },
    ForcedLogout { reason: String },
    NetworkChange { state: String },
    DeliveryError { reason: String },
    Message {
        from: String,
        to: String,
        text: String,
        time: u64,
    },
    /// The backend connection closed; no further events will arrive.
    Closed,
}

// ── Seam traits ──────────────────────────────────────────────────────────────

/// One live, exclusively owned backend connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the transport-level login. Readiness arrives as an event.
    async fn login(&self, creds: &TransportCredentials) -> Result<(), SessionError>;

    /// Deliver one payload to one recipient, waiting for the backend ack.
    async fn send_to(&self, recipient: &str, payload: serde_json::Value)
    -> Result<(), SessionError>;

    /// Best-effort logout and release of the connection.
    async fn logout(&self);
}

/// Dials the backend and hands over a transport plus its event receiver.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), SessionError>;
}

// ── Wire frames ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum WireFrame {
    #[serde(rename_all = "camelCase")]
    Login {
        app_identity: String,
        signature: String,
        uid: String,
    },
    #[serde(rename_all = "camelCase")]
    Send {
        id: u64,
        to: String,
        payload: serde_json::Value,
    },
    Logout,
    Ready,
    #[serde(rename_all = "camelCase")]
    NotReady { reason: Option<String> },
    #[serde(rename_all = "camelCase")]
    Kicked { reason: Option<String> },
    #[serde(rename_all = "camelCase")]
    Network { state: String },
    #[serde(rename_all = "camelCase")]
    Ack {
        id: u64,
        ok: bool,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeliveryError { id: Option<u64>, reason: String },
    #[serde(rename_all = "camelCase")]
    Message {
        from: String,
        to: String,
        text: String,
        time: u64,
    },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

// ── WebSocket implementation ─────────────────────────────────────────────────

/// Production connector for the backend WebSocket endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), SessionError> {
        debug!(url = %self.url, "dialing backend");
        let (stream, _resp) = connect_async(&self.url)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        let (sink, source) = stream.split();
        let (transport, events) = WsTransport::start(sink, source);
        Ok((transport, events))
    }
}

/// A live WebSocket connection to the backend.
pub struct WsTransport {
    sink: Mutex<WsSink>,
    pending: PendingAcks,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    fn start(sink: WsSink, source: WsSource) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(64);
        let handle = tokio::spawn(read_loop(source, Arc::clone(&pending), event_tx));

        let transport = Arc::new(Self {
            sink: Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(handle)),
        });

        (transport, event_rx)
    }

    async fn write(&self, frame: &WireFrame) -> Result<(), SessionError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| SessionError::TransportSend(e.to_string()))?;
        trace!(frame = %text, "gateway -> backend");
        let mut sink = self.sink.lock().await;
        sink.send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::TransportSend(e.to_string()))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn login(&self, creds: &TransportCredentials) -> Result<(), SessionError> {
        self.write(&WireFrame::Login {
            app_identity: creds.app_identity.clone(),
            signature: creds.session_signature.clone(),
            uid: creds.remote_user_id.clone(),
        })
        .await
    }

    async fn send_to(
        &self,
        recipient: &str,
        payload: serde_json::Value,
    ) -> Result<(), SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self
            .write(&WireFrame::Send {
                id,
                to: recipient.to_string(),
                payload,
            })
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let acked = tokio::time::timeout(Duration::from_millis(SEND_ACK_TIMEOUT_MS), rx).await;
        match acked {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(SessionError::TransportSend(reason)),
            // Reader went away before acking: the connection is gone.
            Ok(Err(_)) => Err(SessionError::TransportSend("transport closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SessionError::TransportSend("send ack timed out".into()))
            },
        }
    }

    async fn logout(&self) {
        let _ = self.write(&WireFrame::Logout).await;
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

// ── Reader loop ──────────────────────────────────────────────────────────────

async fn read_loop(
    mut source: WsSource,
    pending: PendingAcks,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(tungstenite::Message::Text(txt)) => {
                let frame: WireFrame = match serde_json::from_str(txt.as_str()) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(error = %e, "unparseable backend frame, dropping");
                        continue;
                    },
                };
                if let Some(event) = normalize(frame, &pending).await
                    && events.send(event).await.is_err()
                {
                    break;
                }
            },
            Ok(tungstenite::Message::Close(_)) => break,
            Ok(_) => {}, // ping/pong/binary — nothing to surface
            Err(e) => {
                // Transient timeout noise is expected on idle links and
                // would otherwise flood the log.
                if is_transient_timeout(&e) {
                    trace!(error = %e, "transient backend read timeout");
                } else {
                    warn!(error = %e, "backend read error");
                }
                break;
            },
        }
    }

    // Fail whatever is still waiting for an ack, then tell the session.
    pending.lock().await.clear();
    let _ = events.send(TransportEvent::Closed).await;
    debug!("backend reader finished");
}

async fn normalize(frame: WireFrame, pending: &PendingAcks) -> Option<TransportEvent> {
    match frame {
        WireFrame::Ready => Some(TransportEvent::Ready),
        WireFrame::NotReady { reason } => Some(TransportEvent::NotReady {
            reason: reason.unwrap_or_else(|| "backend not ready".into()),
        }),
        WireFrame::Kicked { reason } => Some(TransportEvent::ForcedLogout {
            reason: reason.unwrap_or_else(|| "kicked by backend".into()),
        }),
        WireFrame::Network { state } => Some(TransportEvent::NetworkChange { state }),
        WireFrame::Ack { id, ok, error } => {
            let Some(tx) = pending.lock().await.remove(&id) else {
                warn!(id, "ack for unknown send id");
                return None;
            };
            let result = if ok {
                Ok(())
            } else {
                Err(error.unwrap_or_else(|| "send rejected".into()))
            };
            let _ = tx.send(result);
            None
        },
        WireFrame::DeliveryError { id, reason } => {
            // An ack may already have resolved this id; report it either way.
            if let Some(id) = id
                && let Some(tx) = pending.lock().await.remove(&id)
            {
                let _ = tx.send(Err(reason.clone()));
            }
            Some(TransportEvent::DeliveryError { reason })
        },
        WireFrame::Message {
            from,
            to,
            text,
            time,
        } => Some(TransportEvent::Message {
            from,
            to,
            text,
            time,
        }),
        // Outbound-only frames echoed back are dropped.
        WireFrame::Login { .. } | WireFrame::Send { .. } | WireFrame::Logout => None,
    }
}

fn is_transient_timeout(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ),
        _ => false,
    }
}
