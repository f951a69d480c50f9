//! Comms subsystem: the two network listeners and the HTTP surface they
//! share.
//!
//! # Architecture
//!
//! Each [`listener::Listener`] implements [`Component`](crate::subsystems::runtime::Component)
//! and is spawned as an independent task by the supervisor. Both capture
//! the same [`Arc<CommsState>`] at construction time, so a request is
//! handled identically whichever transport it arrived on.
//!
//! - **http**: the axum router, its layers and handlers.
//! - **tls**: rustls server configuration from PEM material.
//! - **listener**: per-transport state machine and accept loop.

pub mod http;
pub mod listener;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::sink::RecordSink;
use crate::subsystems::ui::UiServeHandle;

/// Per-request bounds applied by every listener.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    /// Upper bound for one request, and for a TLS handshake.
    pub read_timeout: Duration,
    pub max_body_bytes: usize,
}

impl From<&ServerConfig> for RequestLimits {
    fn from(server: &ServerConfig) -> Self {
        Self { read_timeout: server.request_timeout, max_body_bytes: server.max_body_bytes }
    }
}

/// State shared by every connection on every listener.
pub struct CommsState {
    pub ui: UiServeHandle,
    pub sink: Arc<RecordSink>,
    pub limits: RequestLimits,
}

impl CommsState {
    pub fn new(ui: UiServeHandle, sink: Arc<RecordSink>, limits: RequestLimits) -> Self {
        Self { ui, sink, limits }
    }
}
