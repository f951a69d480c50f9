//! Route handlers. Identical on both listeners; the transport only shows up
//! as the peer address in [`ConnectInfo`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::subsystems::comms::CommsState;

fn json_error(code: &str, message: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "error": code, "message": message.to_string() }))
}

/// GET / and /index.html
pub(super) async fn page(State(state): State<Arc<CommsState>>) -> Response {
    state.ui.page().into_response()
}

/// GET /static/{*path}
pub(super) async fn asset(State(state): State<Arc<CommsState>>, Path(path): Path<String>) -> Response {
    match state.ui.asset(&path).await {
        Some(resp) => resp.into_response(),
        None => {
            debug!(%path, "static asset not served");
            not_found().await.into_response()
        }
    }
}

/// POST /collect
///
/// Malformed JSON → 400 with no write. Append failure → 500; the record is
/// dropped.
pub(super) async fn collect(
    State(state): State<Arc<CommsState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!(%peer, "collect: invalid JSON: {e}");
            return (StatusCode::BAD_REQUEST, json_error("bad_request", format!("invalid JSON: {e}"))).into_response();
        }
    };

    match state.sink.append(peer.ip(), &payload).await {
        Ok(receipt) => Json(json!({
            "status": "ok",
            "saved_to": receipt.saved_to.display().to_string(),
            "timestamp": receipt.timestamp,
        }))
        .into_response(),
        Err(e) => {
            warn!(%peer, "collect: record dropped: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, json_error("internal", "could not save record")).into_response()
        }
    }
}

pub(super) async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found\n")
}
