//! Per-connection session: registration, heartbeat, read loop with a rolling deadline, and
//! exactly-once teardown.
//!
//! ```text
//! Connecting --start--> Active --shutdown (first caller)--> Closing --> Closed
//! ```
//!
//! Teardown can be triggered by the read loop (deadline, peer close, transport error), by the
//! heartbeat (ping write failed), or from outside (`request_close`, process shutdown). Only the
//! caller that wins the Active -> Closing transition runs cleanup.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::commands::{decode_message, Dispatcher};
use crate::config::SessionConfig;
use crate::connection::{ConnId, Connection, Frame, TransportError, UserId};
use crate::metrics::Metrics;
use crate::ws_registry::ConnectionRegistry;
use crate::AppState;

const PING_PAYLOAD: &[u8] = b"ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No frame arrived within the read timeout.
    ReadTimeout,
    /// Close frame received or the stream ended.
    PeerClosed,
    TransportError,
    /// A heartbeat ping could not be written.
    HeartbeatFailed,
    /// Closed from outside the session (process shutdown or `request_close`).
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ReadTimeout => "read_timeout",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::HeartbeatFailed => "heartbeat_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

pub struct Session {
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    config: SessionConfig,
    state: AtomicU8,
    /// Reason recorded by the first `request_close`, read by the read loop when it wakes.
    requested_reason: Mutex<Option<CloseReason>>,
    /// Reason recorded by the cleanup winner.
    close_reason: Mutex<Option<CloseReason>>,
    /// Wakes the read loop. Child of the process shutdown token.
    close_requested: CancellationToken,
    heartbeat_stop: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl Session {
    /// Register the connection and start the heartbeat. Must be called inside a tokio runtime.
    pub fn start(conn: Arc<Connection>, state: &AppState) -> Arc<Self> {
        let session = Arc::new(Self {
            conn,
            registry: state.registry.clone(),
            dispatcher: state.dispatcher.clone(),
            metrics: state.metrics.clone(),
            config: state.session,
            state: AtomicU8::new(SessionState::Connecting as u8),
            requested_reason: Mutex::new(None),
            close_reason: Mutex::new(None),
            close_requested: state.shutdown.child_token(),
            heartbeat_stop: CancellationToken::new(),
            heartbeat: Mutex::new(None),
            closed: CancellationToken::new(),
        });

        session.registry.add(session.user_id(), session.conn.clone());
        session.state.store(SessionState::Active as u8, Ordering::Release);

        let handle = tokio::spawn(run_heartbeat(
            session.conn.clone(),
            session.config.ping_interval,
            session.heartbeat_stop.clone(),
            Arc::downgrade(&session),
        ));
        *session.heartbeat.lock() = Some(handle);

        session.metrics.sessions_opened.inc();
        info!(user_id = session.user_id(), conn_id = session.conn_id(), "client connected");
        session
    }

    pub fn user_id(&self) -> UserId {
        self.conn.user_id()
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn.id()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reason recorded by whichever trigger ran cleanup; `None` until then.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Ask the session to close. The first requested reason wins; cleanup itself runs on the
    /// read loop (or on the next `shutdown` call).
    pub fn request_close(&self, reason: CloseReason) {
        let _ = self.requested_reason.lock().get_or_insert(reason);
        self.close_requested.cancel();
    }

    /// Resolves once cleanup has finished.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Drive the read loop until the connection ends, then tear the session down. Returns the
    /// reason recorded by the cleanup winner.
    pub async fn run<S>(self: Arc<Self>, mut stream: S) -> CloseReason
    where
        S: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        let reason = self.read_loop(&mut stream).await;
        drop(stream);
        let _ = self.shutdown(reason).await;
        self.closed().await;
        self.close_reason().unwrap_or(reason)
    }

    async fn read_loop<S>(&self, stream: &mut S) -> CloseReason
    where
        S: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        let read_timeout = self.config.read_timeout;
        let deadline = time::sleep(read_timeout);
        tokio::pin!(deadline);

        loop {
            let next = tokio::select! {
                () = self.close_requested.cancelled() => {
                    return self.requested_reason.lock().unwrap_or(CloseReason::Shutdown);
                }
                () = &mut deadline => {
                    debug!(user_id = self.user_id(), conn_id = self.conn_id(), ?read_timeout, "read deadline expired");
                    return CloseReason::ReadTimeout;
                }
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(user_id = self.user_id(), conn_id = self.conn_id(), error = %e, "ws read error");
                    return CloseReason::TransportError;
                }
                None => return CloseReason::PeerClosed,
            };

            deadline.as_mut().reset(Instant::now() + read_timeout);
            match frame {
                Frame::Text(text) => self.handle_text(&text).await,
                Frame::Pong(_) => trace!(user_id = self.user_id(), conn_id = self.conn_id(), "ws pong received"),
                Frame::Ping(_) | Frame::Binary(_) => {}
                Frame::Close => return CloseReason::PeerClosed,
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match decode_message(text) {
            Ok(m) => m,
            Err(e) => {
                self.metrics.frames_rejected.with_label_values(&["decode"]).inc();
                warn!(user_id = self.user_id(), conn_id = self.conn_id(), error = %e, "malformed ws frame");
                return;
            }
        };
        if let Err(e) = self.dispatcher.dispatch(self.user_id(), message).await {
            self.metrics.frames_rejected.with_label_values(&["dispatch"]).inc();
            warn!(user_id = self.user_id(), conn_id = self.conn_id(), error = %e, "command batch aborted");
        }
    }

    /// Tear the session down: stop and join the heartbeat, deregister, close the connection.
    /// Runs at most once; returns false for every caller that lost the race.
    pub async fn shutdown(&self, reason: CloseReason) -> bool {
        if self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.request_close(reason);

        self.heartbeat_stop.cancel();
        let heartbeat = self.heartbeat.lock().take();
        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                warn!(conn_id = self.conn_id(), error = %e, "heartbeat task ended abnormally");
            }
        }

        let _ = self.registry.remove(self.user_id(), &self.conn);
        if let Err(e) = self.conn.close().await {
            debug!(conn_id = self.conn_id(), error = %e, "error closing websocket connection");
        }

        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.metrics.sessions_closed.with_label_values(&[reason.as_str()]).inc();
        info!(user_id = self.user_id(), conn_id = self.conn_id(), reason = reason.as_str(), "connection closed");
        self.closed.cancel();
        true
    }
}

/// Ping the peer every `interval` until stopped. A failed ping asks the session to close.
async fn run_heartbeat(conn: Arc<Connection>, interval: Duration, stop: CancellationToken, session: Weak<Session>) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let sent = tokio::select! {
            () = stop.cancelled() => return,
            res = conn.send(Frame::Ping(Bytes::from_static(PING_PAYLOAD))) => res,
        };
        if let Err(e) = sent {
            warn!(user_id = conn.user_id(), conn_id = conn.id(), error = %e, "ws ping failed");
            if let Some(session) = session.upgrade() {
                session.request_close(CloseReason::HeartbeatFailed);
            }
            return;
        }
        trace!(conn_id = conn.id(), "ws ping sent");
    }
}
