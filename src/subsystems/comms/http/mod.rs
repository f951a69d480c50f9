//! HTTP surface shared by both listeners.
//!
//! ## URL layout
//!
//! ```text
//! GET  /, /index.html   → demo page
//! GET  /static/{*path}  → static asset or 404
//! POST /collect         → ingestion into the record sink
//! *    anything else    → 404 (including a known path with the wrong method)
//! ```
//!
//! Every response, errors included, carries the no-cache headers. Bodies
//! above `max_body_bytes` get 413 and requests that outlive the read timeout
//! get 408.

mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;

use super::CommsState;
use crate::subsystems::ui::ServeResponse;

const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

/// Build the router both listeners serve. The caller supplies the peer
/// address as [`ConnectInfo`](axum::extract::ConnectInfo).
pub fn router(state: Arc<CommsState>) -> Router {
    let limits = state.limits;

    Router::new()
        .route("/",               get(handlers::page).fallback(handlers::not_found))
        .route("/index.html",     get(handlers::page).fallback(handlers::not_found))
        .route("/static/{*path}", get(handlers::asset).fallback(handlers::not_found))
        .route("/collect",        post(handlers::collect).fallback(handlers::not_found))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(limits.max_body_bytes))
        .layer(TimeoutLayer::new(limits.read_timeout))
        .layer(SetResponseHeaderLayer::overriding(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE)))
        .layer(SetResponseHeaderLayer::overriding(header::PRAGMA, HeaderValue::from_static("no-cache")))
        .layer(SetResponseHeaderLayer::overriding(header::EXPIRES, HeaderValue::from_static("0")))
}

impl IntoResponse for ServeResponse {
    fn into_response(self) -> Response {
        (self.status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}
