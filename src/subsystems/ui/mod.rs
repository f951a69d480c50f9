//! UI subsystem: the demonstration page and its static assets.
//!
//! # Architecture
//!
//! The UI subsystem does **not** run independent tasks. It constructs a
//! [`UiServeHandle`]: a trait object that the HTTP handlers call to obtain
//! the page or a static asset. The page content is opaque to them.
//!
//! [`start`] builds the [`site::DemoSite`] backend from config.

pub mod site;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::StatusCode;
use tracing::info;

use crate::config::SiteConfig;

// ── UiServe trait ─────────────────────────────────────────────────────────────

/// Response returned by a [`UiServe`] backend.
#[derive(Debug)]
pub struct ServeResponse {
    pub status: StatusCode,
    /// MIME content type, e.g. `"text/html; charset=utf-8"`.
    pub content_type: &'static str,
    /// Response body bytes.
    pub body: Vec<u8>,
}

/// Boxed future returned by [`UiServe::asset`].
pub type AssetFuture<'a> = Pin<Box<dyn Future<Output = Option<ServeResponse>> + Send + 'a>>;

/// A UI backend that serves the page and static assets.
///
/// Implementations capture their configuration at construction time and
/// must be cheap to call per request.
pub trait UiServe: Send + Sync {
    /// The demonstration page.
    fn page(&self) -> ServeResponse;

    /// A static asset at `relative` (the part after `/static/`).
    ///
    /// Returns `None` when no regular file exists there or the path would
    /// leave the asset root; the caller answers 404.
    fn asset<'a>(&'a self, relative: &'a str) -> AssetFuture<'a>;
}

/// Shared handle held by the HTTP handlers.
pub type UiServeHandle = Arc<dyn UiServe>;

// ── start ─────────────────────────────────────────────────────────────────────

/// Build the UI backend and return its serve handle.
pub fn start(config: &SiteConfig) -> UiServeHandle {
    let site = site::DemoSite::new(config.static_root(), config.maps_api_key.as_deref());
    info!(
        static_root = %config.static_root().display(),
        maps_key = config.maps_api_key.is_some(),
        "ui: demo site loaded"
    );
    Arc::new(site)
}
