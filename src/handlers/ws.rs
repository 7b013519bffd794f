//! WebSocket handler: identity via `x-user-id` header, then one session per upgraded socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{future, SinkExt, StreamExt};
use tracing::debug;

use crate::connection::{Connection, Frame, TransportError, UserId};
use crate::session::Session;
use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Rejections raised before the upgrade; no session or registry entry exists yet.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("missing x-user-id header")]
    MissingUserId,
    #[error("x-user-id must be a non-negative integer, got {0:?}")]
    InvalidUserId(String),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

/// Caller identity taken from the `x-user-id` header. Not authenticated.
#[derive(Debug, Clone, Copy)]
pub struct UserIdHeader(pub UserId);

impl<S> FromRequestParts<S> for UserIdHeader
where
    S: Send + Sync,
{
    type Rejection = HandshakeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parse_user_id(parts.headers.get(USER_ID_HEADER)).map(UserIdHeader)
    }
}

pub fn parse_user_id(value: Option<&HeaderValue>) -> Result<UserId, HandshakeError> {
    let raw = value.ok_or(HandshakeError::MissingUserId)?;
    let invalid = || HandshakeError::InvalidUserId(String::from_utf8_lossy(raw.as_bytes()).into_owned());
    let s = raw.to_str().map_err(|_| invalid())?.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    s.parse().map_err(|_| invalid())
}

/// Upgrades the connection after validating the user id header, then runs the session until
/// the peer goes away or stops answering.
pub async fn ws_handler(
    State(state): State<AppState>,
    UserIdHeader(user_id): UserIdHeader,
    ws: WebSocketUpgrade,
) -> Response {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track_future(handle_socket(socket, user_id, state)))
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(TransportError::from)
        .with(|frame: Frame| future::ready(Ok::<Message, TransportError>(frame.into())));
    let stream = stream.map(|res| res.map(Frame::from).map_err(TransportError::from));

    let conn = Connection::new(user_id, sink, state.session.write_timeout);
    let session = Session::start(conn, &state);
    let conn_id = session.conn_id();
    let reason = session.run(stream).await;
    debug!(user_id, conn_id, reason = reason.as_str(), "ws session finished");
}
