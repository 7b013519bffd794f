//! In-memory transport and handler doubles for unit tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::Sink;
use parking_lot::Mutex;

use crate::commands::{CommandHandler, Dispatcher};
use crate::config::SessionConfig;
use crate::connection::{Connection, Frame, TransportError, UserId};
use crate::metrics::Metrics;
use crate::ws_registry::ConnectionRegistry;
use crate::AppState;

/// Shared view of what a [`MockSink`] has seen.
#[derive(Clone, Default)]
pub struct SinkProbe {
    frames: Arc<Mutex<Vec<Frame>>>,
    closes: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl SinkProbe {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| match f {
                Frame::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|f| matches!(f, Frame::Ping(_)))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

pub struct MockSink {
    probe: SinkProbe,
    /// While present and unresolved, the sink is not ready.
    gate: Option<oneshot::Receiver<()>>,
}

impl Sink<Frame> for MockSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if let Some(gate) = this.gate.as_mut() {
            match Pin::new(gate).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(_) => this.gate = None,
            }
        }
        if this.probe.fail.load(Ordering::SeqCst) {
            return Poll::Ready(Err(TransportError::Closed));
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.probe.frames.lock().push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let _ = self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

pub fn probe_sink() -> (MockSink, SinkProbe) {
    let probe = SinkProbe::default();
    (
        MockSink {
            probe: probe.clone(),
            gate: None,
        },
        probe,
    )
}

/// Sink that stalls every write until the returned sender fires (or is dropped).
pub fn gated_sink() -> (MockSink, SinkProbe, oneshot::Sender<()>) {
    let probe = SinkProbe::default();
    let (tx, rx) = oneshot::channel();
    (
        MockSink {
            probe: probe.clone(),
            gate: Some(rx),
        },
        probe,
        tx,
    )
}

pub fn test_connection(user_id: UserId) -> (Arc<Connection>, SinkProbe) {
    let (sink, probe) = probe_sink();
    (Connection::new(user_id, sink, Duration::from_secs(10)), probe)
}

pub type FrameTx = mpsc::UnboundedSender<Result<Frame, TransportError>>;
pub type FrameRx = mpsc::UnboundedReceiver<Result<Frame, TransportError>>;

pub fn frame_channel() -> (FrameTx, FrameRx) {
    mpsc::unbounded()
}

/// Handler that records every call in order.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<(&'static str, UserId, Vec<String>)>>,
}

impl RecordingHandler {
    pub fn calls(&self) -> Vec<(&'static str, UserId, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn subscribe(&self, user_id: UserId, markets: Vec<String>) {
        self.calls.lock().push(("subscribe", user_id, markets));
    }

    async fn unsubscribe(&self, user_id: UserId, markets: Vec<String>) {
        self.calls.lock().push(("unsubscribe", user_id, markets));
    }
}

pub fn test_state(handler: Arc<dyn CommandHandler>) -> AppState {
    AppState::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(Dispatcher::new(handler)),
        SessionConfig::default(),
        Arc::new(Metrics::new().expect("metrics registry")),
    )
}
