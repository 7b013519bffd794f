//! WebSocket connection registry: maps user id to live connections, supports snapshot broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;

use crate::connection::{Connection, Frame, UserId};
use crate::models::Envelope;

/// Outcome of one fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Connections present in the snapshot.
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of live WebSocket connections per user id. Thread-safe; shared via Arc.
///
/// One mutex guards the map. It is held for mutation and snapshotting only, never across a
/// write to a peer.
pub struct ConnectionRegistry {
    /// uid -> connections (multiple tabs/devices per user). Never holds an empty Vec.
    inner: Mutex<HashMap<UserId, Vec<Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection for the given user. The caller must call `remove` with the same
    /// connection when its session ends.
    pub fn add(&self, user_id: UserId, conn: Arc<Connection>) {
        self.inner.lock().entry(user_id).or_default().push(conn);
    }

    /// Remove a single connection. Swaps the last entry into its slot, so per-user order is not
    /// preserved. Returns false if the user or connection was not registered.
    pub fn remove(&self, user_id: UserId, conn: &Connection) -> bool {
        let mut inner = self.inner.lock();
        let Some(conns) = inner.get_mut(&user_id) else {
            return false;
        };
        let Some(pos) = conns.iter().position(|c| c.id() == conn.id()) else {
            return false;
        };
        let _ = conns.swap_remove(pos);
        if conns.is_empty() {
            inner.remove(&user_id);
        }
        true
    }

    /// Point-in-time copy of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().values().flatten().cloned().collect()
    }

    fn snapshot_users(&self, user_ids: &[UserId]) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        let mut seen = Vec::with_capacity(user_ids.len());
        let mut out = Vec::new();
        for uid in user_ids {
            if seen.contains(uid) {
                continue;
            }
            seen.push(*uid);
            if let Some(conns) = inner.get(uid) {
                out.extend(conns.iter().cloned());
            }
        }
        out
    }

    /// Send the envelope to every connection registered at the moment of the call. Connections
    /// added while delivery is in flight do not receive it. Write failures are logged and
    /// counted; they never remove a connection (liveness is the heartbeat's job).
    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let targets = self.snapshot();
        deliver(targets, envelope, "all").await
    }

    /// Same contract as `broadcast`, limited to the given user ids. Duplicate ids are sent once.
    pub async fn send_to_users(&self, user_ids: &[UserId], envelope: &Envelope) -> BroadcastReport {
        let targets = self.snapshot_users(user_ids);
        deliver(targets, envelope, "users").await
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }

    pub fn user_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn connections_for(&self, user_id: UserId) -> usize {
        self.inner.lock().get(&user_id).map_or(0, Vec::len)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(targets: Vec<Arc<Connection>>, envelope: &Envelope, label: &str) -> BroadcastReport {
    let mut report = BroadcastReport {
        recipients: targets.len(),
        ..BroadcastReport::default()
    };
    if targets.is_empty() {
        return report;
    }
    let text = match serde_json::to_string(envelope) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(kind = %envelope.kind, error = %e, "failed to serialize broadcast envelope");
            report.failed = report.recipients;
            return report;
        }
    };

    let results = join_all(targets.iter().map(|conn| {
        let frame = Frame::Text(text.clone());
        async move { (conn, conn.send(frame).await) }
    }))
    .await;

    for (conn, res) in results {
        match res {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    user_id = conn.user_id(),
                    conn_id = conn.id(),
                    error = %e,
                    "ws broadcast write failed"
                );
            }
        }
    }
    tracing::debug!(
        kind = %envelope.kind,
        label,
        recipients = report.recipients,
        delivered = report.delivered,
        failed = report.failed,
        "broadcast envelope"
    );
    report
}
