//! Session layer for the real-time messaging backend.
//!
//! One [`session::RemoteSession`] owns one authenticated backend connection:
//! its credential exchange, transport handle, lifecycle state, and serialized
//! send queue. [`dispatch::CommandDispatcher`] resolves recipient candidates
//! and attempts delivery with ordered fallback. The gateway crate owns the
//! mapping from client connections to sessions.

pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    credentials::{CredentialProvider, HttpCredentialProvider, TransportCredentials},
    dispatch::{CommandDispatcher, DispatchOutcome},
    error::{DispatchError, SessionError, SignatureError},
    session::{RemoteSession, SessionConfig, SessionEvent, SessionState},
    transport::{Transport, TransportConnector, TransportEvent, WsConnector},
};
