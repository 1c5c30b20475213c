//! Gateway: WebSocket/HTTP server, session registry, liveness supervision.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Build the credential provider and backend connector
//! 3. Start HTTP server (health, admin surface)
//! 4. Attach WebSocket upgrade handler
//! 5. Start the liveness sweep
//!
//! Backend session semantics (lifecycle, send queue, dispatch) live in
//! `tiller-rtm`; this crate owns the mapping from client connections to
//! sessions and the duplex protocol with clients.

pub mod auth;
pub mod liveness;
pub mod server;
pub mod service;
pub mod state;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
