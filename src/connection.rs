//! Write half of one duplex WebSocket stream, plus the frame type shared by sessions and the registry.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio::time;

/// Caller-supplied identity; not authenticated.
pub type UserId = u64;

/// Process-unique identity of a single connection.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Transport-level frame, decoupled from the concrete socket type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection already closed")]
    Closed,
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),
}

pub type BoxFrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Handle to the outbound side of one connection. The owning session is the only caller of
/// [`Connection::close`]; the registry and broadcasts only write.
pub struct Connection {
    id: ConnId,
    user_id: UserId,
    /// `None` once closed; every later write fails with [`TransportError::Closed`].
    sink: Mutex<Option<BoxFrameSink>>,
    write_timeout: Duration,
}

impl Connection {
    pub fn new<S>(user_id: UserId, sink: S, write_timeout: Duration) -> Arc<Self>
    where
        S: Sink<Frame, Error = TransportError> + Send + 'static,
    {
        Arc::new(Self {
            id: next_conn_id(),
            user_id,
            sink: Mutex::new(Some(Box::pin(sink))),
            write_timeout,
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Write one frame. Concurrent writers to the same connection are serialized; writers to
    /// different connections never wait on each other.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        match time::timeout(self.write_timeout, sink.send(frame)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
        }
    }

    /// Release the transport. Idempotent: closing twice only closes the sink once.
    pub(crate) async fn close(&self) -> Result<(), TransportError> {
        let sink = self.sink.lock().await.take();
        match sink {
            Some(mut sink) => match time::timeout(self.write_timeout, sink.close()).await {
                Ok(res) => res,
                Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
            },
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
