//! Shared test doubles for the session layer.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::sync::{Mutex, mpsc},
};

use crate::{
    credentials::{CredentialProvider, TransportCredentials},
    error::{SessionError, SignatureError},
    session::{RemoteSession, SessionConfig, SessionEvent},
    transport::{Transport, TransportConnector, TransportEvent},
};

// ── Credential provider ──────────────────────────────────────────────────────

pub(crate) struct StubProvider {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    pub fn failing(self: Arc<Self>) -> Arc<Self> {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StubProvider {
    async fn sign(
        &self,
        identity: &str,
        _token: &str,
    ) -> Result<TransportCredentials, SignatureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignatureError::Status(403));
        }
        Ok(TransportCredentials {
            app_identity: "app-test".into(),
            session_signature: "sig-test".into(),
            remote_user_id: format!("ru-{identity}"),
        })
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub(crate) struct MockTransport {
    logins: AtomicUsize,
    logouts: AtomicUsize,
    sent: Mutex<Vec<String>>,
    auto_ready: Arc<AtomicBool>,
    failing: Arc<Mutex<HashSet<String>>>,
    send_delay: Duration,
    events: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    /// Recipients in the order the transport observed them.
    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn login(&self, _creds: &TransportCredentials) -> Result<(), SessionError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.auto_ready.load(Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Ready).await;
        }
        Ok(())
    }

    async fn send_to(
        &self,
        recipient: &str,
        _payload: serde_json::Value,
    ) -> Result<(), SessionError> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        self.sent.lock().await.push(recipient.to_string());
        if self.failing.lock().await.contains(recipient) {
            return Err(SessionError::TransportSend(format!(
                "no route to {recipient}"
            )));
        }
        Ok(())
    }

    async fn logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Connector ────────────────────────────────────────────────────────────────

pub(crate) struct MockConnector {
    connects: AtomicUsize,
    auto_ready: Arc<AtomicBool>,
    failing: Arc<Mutex<HashSet<String>>>,
    send_delay: std::sync::Mutex<Duration>,
    current: Mutex<Option<Arc<MockTransport>>>,
    event_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            auto_ready: Arc::new(AtomicBool::new(true)),
            failing: Arc::new(Mutex::new(HashSet::new())),
            send_delay: std::sync::Mutex::new(Duration::ZERO),
            current: Mutex::new(None),
            event_tx: Mutex::new(None),
        })
    }

    /// Do not emit Ready on login; the test drives readiness via `emit`.
    pub fn manual_ready(self: Arc<Self>) -> Arc<Self> {
        self.auto_ready.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_auto_ready(&self, on: bool) {
        self.auto_ready.store(on, Ordering::SeqCst);
    }

    pub fn with_failing(self: Arc<Self>, recipients: &[&str]) -> Arc<Self> {
        // Nothing else can hold the lock before the first connect.
        if let Ok(mut guard) = self.failing.try_lock() {
            *guard = recipients.iter().map(|r| r.to_string()).collect();
        }
        self
    }

    pub fn with_send_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        if let Ok(mut guard) = self.send_delay.lock() {
            *guard = delay;
        }
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The most recently dialed transport.
    pub async fn transport(&self) -> Arc<MockTransport> {
        let guard = self.current.lock().await;
        match guard.as_ref() {
            Some(t) => Arc::clone(t),
            None => panic!("no transport dialed yet"),
        }
    }

    /// Inject a backend event into the most recent transport's stream.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self.event_tx.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let delay = self
            .send_delay
            .lock()
            .map(|d| *d)
            .unwrap_or(Duration::ZERO);
        let transport = Arc::new(MockTransport {
            logins: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            auto_ready: Arc::clone(&self.auto_ready),
            failing: Arc::clone(&self.failing),
            send_delay: delay,
            events: tx.clone(),
        });
        *self.current.lock().await = Some(Arc::clone(&transport));
        *self.event_tx.lock().await = Some(tx);
        Ok((transport, rx))
    }
}

// ── Session helper ───────────────────────────────────────────────────────────

pub(crate) fn test_session(
    connector: &Arc<MockConnector>,
    provider: &Arc<StubProvider>,
) -> (Arc<RemoteSession>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = RemoteSession::new(
        "test",
        Arc::clone(provider) as Arc<dyn CredentialProvider>,
        Arc::clone(connector) as Arc<dyn TransportConnector>,
        SessionConfig {
            ready_timeout: Duration::from_millis(500),
        },
        tx,
    );
    (session, rx)
}
