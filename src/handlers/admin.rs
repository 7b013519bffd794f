use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::BroadcastRequest;
use crate::ws_registry::BroadcastReport;
use crate::AppState;

/// `POST /broadcast`: fan an envelope out to every live connection, or only to `user_ids`.
pub async fn broadcast(State(state): State<AppState>, Json(req): Json<BroadcastRequest>) -> Json<BroadcastReport> {
    let (envelope, user_ids) = req.into_parts();
    let report = if user_ids.is_empty() {
        state.registry.broadcast(&envelope).await
    } else {
        state.registry.send_to_users(&user_ids, &envelope).await
    };
    state.metrics.record_broadcast(&report);
    tracing::info!(
        kind = %envelope.kind,
        recipients = report.recipients,
        failed = report.failed,
        "operator broadcast"
    );
    Json(report)
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render(&state.registry) {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            tracing::error!("render metrics: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Metrics unavailable").into_response()
        }
    }
}
