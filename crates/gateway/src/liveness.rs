//! Connection liveness supervision.
//!
//! Every interval each connection is probed with a WebSocket ping and its
//! alive flag is cleared; any inbound frame restores it. A connection whose
//! previous probe went unanswered is closed and its session destroyed, so a
//! half-open connection is reaped within two intervals.

use std::{sync::Arc, time::Duration};

use {
    tokio::task::JoinHandle,
    tracing::{debug, warn},
};

use crate::state::GatewayState;

/// Start the fixed-interval sweep. The handle lives as long as the server.
pub fn spawn_liveness(state: Arc<GatewayState>) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.liveness.interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so fresh connections
        // get a full interval before their first probe.
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep(&state).await;
        }
    })
}

/// One probe pass over all connections.
pub(crate) async fn sweep(state: &GatewayState) {
    let mut stale = Vec::new();
    {
        let mut clients = state.clients.write().await;
        for (conn_id, client) in clients.iter_mut() {
            if client.alive {
                client.alive = false;
                client.ping();
            } else {
                stale.push(conn_id.clone());
            }
        }
    }

    if !stale.is_empty() {
        debug!(count = stale.len(), "reaping unresponsive connections");
    }
    for conn_id in stale {
        warn!(conn_id = %conn_id, "connection unresponsive, closing");
        state.close_client(&conn_id).await;
    }
}
