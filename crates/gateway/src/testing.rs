//! Test doubles for gateway tests: an in-process backend that logs in
//! instantly and acks every send.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    tokio::sync::{Mutex, mpsc},
};

use tiller_rtm::{
    CredentialProvider, SessionError, SignatureError, Transport, TransportConnector,
    TransportCredentials, TransportEvent,
};

pub(crate) struct StubProvider;

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CredentialProvider for StubProvider {
    async fn sign(
        &self,
        identity: &str,
        token: &str,
    ) -> Result<TransportCredentials, SignatureError> {
        if token == "reject" {
            return Err(SignatureError::Status(403));
        }
        Ok(TransportCredentials {
            app_identity: "app-test".into(),
            session_signature: "sig-test".into(),
            remote_user_id: format!("ru-{identity}"),
        })
    }
}

pub(crate) struct StubTransport {
    events: mpsc::Sender<TransportEvent>,
    sent: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
}

impl StubTransport {
    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn login(&self, _creds: &TransportCredentials) -> Result<(), SessionError> {
        let _ = self.events.send(TransportEvent::Ready).await;
        Ok(())
    }

    async fn send_to(
        &self,
        recipient: &str,
        _payload: serde_json::Value,
    ) -> Result<(), SessionError> {
        self.sent.lock().await.push(recipient.to_string());
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SessionError::TransportSend("stub send failure".into()));
        }
        Ok(())
    }

    async fn logout(&self) {}
}

pub(crate) struct StubConnector {
    fail_sends: AtomicBool,
    current: Mutex<Option<Arc<StubTransport>>>,
}

impl StubConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_sends: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    pub fn failing_sends(self: Arc<Self>) -> Arc<Self> {
        self.fail_sends.store(true, Ordering::SeqCst);
        self
    }

    pub async fn transport(&self) -> Option<Arc<StubTransport>> {
        self.current.lock().await.clone()
    }
}

#[async_trait]
impl TransportConnector for StubConnector {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), SessionError> {
        let (tx, rx) = mpsc::channel(16);
        let transport = Arc::new(StubTransport {
            events: tx,
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(self.fail_sends.load(Ordering::SeqCst)),
        });
        *self.current.lock().await = Some(Arc::clone(&transport));
        Ok((transport, rx))
    }
}
