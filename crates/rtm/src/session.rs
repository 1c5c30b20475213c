//! Remote session lifecycle and the serialized send pipeline.
//!
//! One `RemoteSession` owns one authenticated backend connection. Callers
//! interact through four operations: `ensure_ready`, `login_with`, `send`,
//! `destroy`. Initialization is coalesced by caching the in-flight init
//! future itself, so concurrent callers always join the same attempt; sends
//! are funneled through a single-consumer queue so they never interleave.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    futures::{
        FutureExt,
        future::{BoxFuture, Shared},
    },
    tokio::{
        sync::{Mutex, RwLock, mpsc, oneshot, watch},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use tiller_protocol::{CommandEnvelope, READY_TIMEOUT_MS};

use crate::{
    credentials::{CredentialProvider, TransportCredentials},
    error::SessionError,
    transport::{Transport, TransportConnector, TransportEvent},
};

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
    Destroyed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Normalized session events delivered to the owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ready,
    Degraded { reason: String },
    ForcedLogout { reason: String },
    NetworkChange { state: String },
    DeliveryError { reason: String },
    Incoming {
        from: String,
        to: String,
        text: String,
        time: u64,
    },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on waiting for the backend "ready" signal.
    pub ready_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_millis(READY_TIMEOUT_MS),
        }
    }
}

// ── Internals ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoginIdentity {
    identity: String,
    token: String,
}

struct SendJob {
    recipient: String,
    payload: serde_json::Value,
    reply: oneshot::Sender<Result<(), SessionError>>,
}

/// Resources of one live transport generation.
struct Live {
    transport: Arc<dyn Transport>,
    queue: mpsc::UnboundedSender<SendJob>,
    worker: JoinHandle<()>,
    bridge: JoinHandle<()>,
    credentials: TransportCredentials,
}

type InitFuture = Shared<BoxFuture<'static, Result<(), SessionError>>>;

#[derive(Default)]
struct Inner {
    /// The in-flight initialization, tagged with the generation that
    /// started it. Cached so concurrent callers await the same attempt.
    init: Option<(u64, InitFuture)>,
    live: Option<Live>,
}

// ── RemoteSession ────────────────────────────────────────────────────────────

/// One authenticated connection to the messaging backend, with its own
/// lifecycle and serialized send queue. Owned exclusively by one gateway
/// connection (or the administrative slot).
pub struct RemoteSession {
    label: String,
    provider: Arc<dyn CredentialProvider>,
    connector: Arc<dyn TransportConnector>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    login: RwLock<Option<LoginIdentity>>,
    inner: Mutex<Inner>,
    /// Serializes whole `login_with` flows; duplicate logins join the
    /// in-flight attempt instead of starting a second one.
    login_flow: Mutex<()>,
    /// Bumped on every teardown; stale initializations notice and bail.
    generation: AtomicU64,
    /// Reason the backend revoked us, when that is why we are Destroyed.
    kicked: std::sync::Mutex<Option<String>>,
    last_active: std::sync::Mutex<Instant>,
}

impl RemoteSession {
    pub fn new(
        label: impl Into<String>,
        provider: Arc<dyn CredentialProvider>,
        connector: Arc<dyn TransportConnector>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        Arc::new(Self {
            label: label.into(),
            provider,
            connector,
            config,
            events,
            state_tx,
            login: RwLock::new(None),
            inner: Mutex::new(Inner::default()),
            login_flow: Mutex::new(()),
            generation: AtomicU64::new(0),
            kicked: std::sync::Mutex::new(None),
            last_active: std::sync::Mutex::new(Instant::now()),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// The identity supplied at login, if any.
    pub async fn current_identity(&self) -> Option<String> {
        self.login.read().await.as_ref().map(|l| l.identity.clone())
    }

    /// The backend-resolved user id of the live transport, if any.
    pub async fn resolved_user_id(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .live
            .as_ref()
            .map(|l| l.credentials.remote_user_id.clone())
    }

    /// Time since the last queued send.
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    // ── ensure_ready ─────────────────────────────────────────────────────

    /// Bring the session to Ready, reusing any in-flight initialization.
    ///
    /// No-op when already Ready. Requires credentials stored by a prior
    /// `login_with`. A failed attempt leaves the session non-ready; a later
    /// call starts over.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<(), SessionError> {
        let fut = {
            let mut inner = self.inner.lock().await;
            match self.state() {
                SessionState::Ready => return Ok(()),
                SessionState::Destroyed => return Err(self.destroyed_error()),
                _ => {},
            }
            match &inner.init {
                Some((_, f)) => f.clone(),
                None => {
                    if self.login.read().await.is_none() {
                        return Err(SessionError::NotReady);
                    }
                    let generation = self.generation.load(Ordering::SeqCst);
                    let this = Arc::clone(self);
                    let fut: InitFuture =
                        async move { this.run_init(generation).await }.boxed().shared();
                    inner.init = Some((generation, fut.clone()));
                    self.state_tx.send_replace(SessionState::Initializing);
                    fut
                },
            }
        };
        fut.await
    }

    async fn run_init(self: Arc<Self>, generation: u64) -> Result<(), SessionError> {
        let result = self.initialize(generation).await;

        // Release the cached future, but only if it is still ours.
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.init, Some((g, _)) if g == generation) {
                inner.init = None;
            }
        }

        if let Err(e) = &result
            && self.state() != SessionState::Destroyed
        {
            warn!(session = %self.label, error = %e, "initialization failed");
            self.teardown_live().await;
            self.state_tx.send_replace(SessionState::Uninitialized);
        }
        result
    }

    async fn initialize(self: &Arc<Self>, generation: u64) -> Result<(), SessionError> {
        // Degraded: the transport is still up, re-await readiness instead
        // of dialing a second connection.
        let has_live = { self.inner.lock().await.live.is_some() };
        if has_live {
            debug!(session = %self.label, "waiting for backend to recover");
            return self.await_ready().await;
        }

        let login = self
            .login
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotReady)?;
        let creds = self.provider.sign(&login.identity, &login.token).await?;
        let (transport, events) = self.connector.connect().await?;

        {
            let mut inner = self.inner.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                // Torn down while we were dialing; release the fresh handle.
                drop(inner);
                transport.logout().await;
                return Err(self.destroyed_error());
            }
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let worker = tokio::spawn(send_worker(
                self.label.clone(),
                Arc::clone(&transport),
                queue_rx,
            ));
            let bridge = tokio::spawn(bridge_loop(Arc::downgrade(self), events));
            inner.live = Some(Live {
                transport: Arc::clone(&transport),
                queue: queue_tx,
                worker,
                bridge,
                credentials: creds.clone(),
            });
        }

        transport.login(&creds).await?;
        self.await_ready().await?;
        info!(session = %self.label, user = %creds.remote_user_id, "session ready");
        Ok(())
    }

    /// Wait for the Ready signal, bounded by the configured timeout.
    async fn await_ready(&self) -> Result<(), SessionError> {
        let bound = self.config.ready_timeout;
        let mut rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    SessionState::Ready => return Ok(()),
                    SessionState::Destroyed => return Err(self.destroyed_error()),
                    _ => {},
                }
                if rx.changed().await.is_err() {
                    return Err(SessionError::Destroyed);
                }
            }
        };
        tokio::time::timeout(bound, wait)
            .await
            .unwrap_or(Err(SessionError::ReadyTimeout(bound)))
    }

    // ── login_with ───────────────────────────────────────────────────────

    /// Authenticate with the given credentials.
    ///
    /// No-op when already Ready with identical credentials; a duplicate
    /// call during initialization joins the in-flight attempt. Differing
    /// credentials (or a revival after Destroyed) tear the current
    /// transport down first so no handle is orphaned.
    pub async fn login_with(
        self: &Arc<Self>,
        identity: &str,
        token: &str,
    ) -> Result<(), SessionError> {
        let _flow = self.login_flow.lock().await;

        let incoming = LoginIdentity {
            identity: identity.to_string(),
            token: token.to_string(),
        };
        let unchanged = self.login.read().await.as_ref() == Some(&incoming);
        if unchanged && self.state() != SessionState::Destroyed {
            return self.ensure_ready().await;
        }

        debug!(session = %self.label, identity, "logging in with new credentials");
        self.teardown_live().await;
        self.inner.lock().await.init = None;
        if let Ok(mut kicked) = self.kicked.lock() {
            *kicked = None;
        }
        *self.login.write().await = Some(incoming);
        self.state_tx.send_replace(SessionState::Uninitialized);
        self.ensure_ready().await
    }

    // ── send ─────────────────────────────────────────────────────────────

    /// Queue one envelope for delivery to one recipient and await its
    /// outcome. Fails fast when the session is not Ready; one send's
    /// failure never affects other queued sends.
    pub async fn send(
        &self,
        envelope: &CommandEnvelope,
        recipient: &str,
    ) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Ready => {},
            SessionState::Destroyed => return Err(self.destroyed_error()),
            _ => return Err(SessionError::NotReady),
        }
        let queue = self
            .inner
            .lock()
            .await
            .live
            .as_ref()
            .map(|l| l.queue.clone())
            .ok_or(SessionError::NotReady)?;

        let payload = serde_json::to_value(envelope)
            .map_err(|e| SessionError::TransportSend(e.to_string()))?;
        if let Ok(mut t) = self.last_active.lock() {
            *t = Instant::now();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        queue
            .send(SendJob {
                recipient: recipient.to_string(),
                payload,
                reply: reply_tx,
            })
            .map_err(|_| self.destroyed_error())?;
        // A dropped reply means the queue was torn down underneath us.
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.destroyed_error()),
        }
    }

    // ── destroy ──────────────────────────────────────────────────────────

    /// Tear the session down: log out, release the transport, fail pending
    /// sends, stop emitting events. Idempotent; terminal until a fresh
    /// `login_with`.
    pub async fn destroy(&self) {
        if self.state() == SessionState::Destroyed {
            return;
        }
        info!(session = %self.label, "destroying session");
        self.state_tx.send_replace(SessionState::Destroyed);
        self.inner.lock().await.init = None;
        self.teardown_live().await;
    }

    async fn teardown_live(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let live = self.inner.lock().await.live.take();
        if let Some(live) = live {
            live.worker.abort();
            live.bridge.abort();
            live.transport.logout().await;
        }
    }

    fn destroyed_error(&self) -> SessionError {
        self.kicked
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .map(SessionError::ForcedLogout)
            .unwrap_or(SessionError::Destroyed)
    }

    fn transition(&self, allow: impl Fn(SessionState) -> bool, to: SessionState) -> bool {
        let mut changed = false;
        self.state_tx.send_if_modified(|s| {
            if allow(*s) && *s != to {
                *s = to;
                changed = true;
                true
            } else {
                false
            }
        });
        changed
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

// ── Send worker ──────────────────────────────────────────────────────────────

/// Single consumer of one session's queue: at most one send in flight,
/// strictly in submission order.
async fn send_worker(
    label: String,
    transport: Arc<dyn Transport>,
    mut queue: mpsc::UnboundedReceiver<SendJob>,
) {
    while let Some(job) = queue.recv().await {
        debug!(session = %label, recipient = %job.recipient, "executing queued send");
        let result = transport.send_to(&job.recipient, job.payload).await;
        let _ = job.reply.send(result);
    }
}

// ── Event bridge ─────────────────────────────────────────────────────────────

/// Normalizes transport events into state changes and owner notifications.
async fn bridge_loop(this: Weak<RemoteSession>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(session) = this.upgrade() else { return };
        match event {
            TransportEvent::Ready => {
                session.transition(
                    |s| {
                        matches!(
                            s,
                            SessionState::Uninitialized
                                | SessionState::Initializing
                                | SessionState::Degraded
                        )
                    },
                    SessionState::Ready,
                );
                session.emit(SessionEvent::Ready);
            },
            TransportEvent::NotReady { reason } => {
                session.transition(|s| s == SessionState::Ready, SessionState::Degraded);
                session.emit(SessionEvent::Degraded { reason });
            },
            TransportEvent::ForcedLogout { reason } => {
                warn!(session = %session.label, reason = %reason, "backend forced logout");
                if let Ok(mut kicked) = session.kicked.lock() {
                    *kicked = Some(reason.clone());
                }
                session.emit(SessionEvent::ForcedLogout { reason });
                // destroy() aborts this loop; run it from a detached task.
                tokio::spawn(async move { session.destroy().await });
                return;
            },
            TransportEvent::NetworkChange { state } => {
                session.emit(SessionEvent::NetworkChange { state });
            },
            TransportEvent::DeliveryError { reason } => {
                session.emit(SessionEvent::DeliveryError { reason });
            },
            TransportEvent::Message {
                from,
                to,
                text,
                time,
            } => {
                session.emit(SessionEvent::Incoming {
                    from,
                    to,
                    text,
                    time,
                });
            },
            TransportEvent::Closed => {
                if session.transition(|s| s == SessionState::Ready, SessionState::Degraded) {
                    session.emit(SessionEvent::Degraded {
                        reason: "backend connection closed".into(),
                    });
                }
                return;
            },
        }
    }
}
