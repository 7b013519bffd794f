//! Prometheus metrics for the WebSocket hub and the `/metrics` text rendering.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::ws_registry::{BroadcastReport, ConnectionRegistry};

pub struct Metrics {
    registry: Registry,
    connections_active: IntGauge,
    users_active: IntGauge,
    pub sessions_opened: IntCounter,
    /// Labels: reason.
    pub sessions_closed: IntCounterVec,
    /// Labels: kind (`decode` or `dispatch`).
    pub frames_rejected: IntCounterVec,
    broadcast_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let connections_active = IntGauge::new("ws_connections_active", "Live WebSocket connections")?;
        let users_active = IntGauge::new("ws_users_active", "Users with at least one live connection")?;
        let sessions_opened = IntCounter::new("ws_sessions_opened_total", "Sessions started")?;
        let sessions_closed = IntCounterVec::new(
            Opts::new("ws_sessions_closed_total", "Sessions cleaned up, by close reason"),
            &["reason"],
        )?;
        let frames_rejected = IntCounterVec::new(
            Opts::new("ws_frames_rejected_total", "Inbound frames that failed to decode or dispatch"),
            &["kind"],
        )?;
        let broadcast_failures =
            IntCounter::new("ws_broadcast_failures_total", "Per-connection broadcast writes that failed")?;

        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(users_active.clone()))?;
        registry.register(Box::new(sessions_opened.clone()))?;
        registry.register(Box::new(sessions_closed.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(broadcast_failures.clone()))?;

        Ok(Self {
            registry,
            connections_active,
            users_active,
            sessions_opened,
            sessions_closed,
            frames_rejected,
            broadcast_failures,
        })
    }

    /// Count the failed writes of one fan-out. Every broadcast path reports through here.
    pub fn record_broadcast(&self, report: &BroadcastReport) {
        self.broadcast_failures.inc_by(report.failed as u64);
    }

    pub fn broadcast_failures(&self) -> u64 {
        self.broadcast_failures.get()
    }

    /// Refresh the gauges from the registry and encode everything in text format.
    pub fn render(&self, connections: &ConnectionRegistry) -> Result<String, prometheus::Error> {
        self.connections_active.set(connections.connection_count() as i64);
        self.users_active.set(connections.user_count() as i64);

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
