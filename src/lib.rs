//! WebSocket hub: tracks live connections per user, keeps them honest with a ping/read-deadline
//! heartbeat, and fans events out to all of them.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

pub mod commands;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod serde_u64_string;
pub mod session;
pub mod ws_registry;

#[cfg(test)]
mod test_support;

use crate::commands::{Dispatcher, MarketCommands};
use crate::config::{Config, SessionConfig};
use crate::metrics::Metrics;
use crate::ws_registry::ConnectionRegistry;

/// Process-wide services, created once in `main` and cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    pub session: SessionConfig,
    /// Cancelled on process shutdown; every session listens on a child token.
    pub shutdown: CancellationToken,
    /// Every upgraded socket task, so shutdown can wait for session cleanup.
    pub sessions: TaskTracker,
}

impl AppState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<Dispatcher>,
        session: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            metrics,
            session,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// Wire the default market command handler against a fresh registry.
    pub fn from_config(config: &Config) -> Result<Self, prometheus::Error> {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(Metrics::new()?);
        let handler = Arc::new(MarketCommands::new(
            registry.clone(),
            metrics.clone(),
            config.announce_subscriptions,
        ));
        Ok(Self::new(
            registry,
            Arc::new(Dispatcher::new(handler)),
            config.session,
            metrics,
        ))
    }

    /// Cancel every session and wait up to `limit` for their cleanup to finish. Returns false
    /// if some sessions were still closing when the limit ran out.
    pub async fn drain_sessions(&self, limit: Duration) -> bool {
        self.shutdown.cancel();
        self.sessions.close();
        tokio::time::timeout(limit, self.sessions.wait()).await.is_ok()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws::ws_handler))
        .route("/broadcast", post(handlers::admin::broadcast))
        .route("/metrics", get(handlers::admin::metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
