//! Demo site backend: the embedded page plus files under the static root.
//!
//! The page is rendered once at construction: its `{{MAPS_API_KEY}}`
//! placeholder is replaced with the configured key (or left empty).
//!
//! Asset lookups only ever resolve to regular files *inside* the static
//! root. Any `..`, absolute or prefixed component is refused outright, and
//! the resolved path is canonicalised and checked again so symlinks cannot
//! point outside either. All filesystem access goes through `tokio::fs`.

use std::path::{Component, Path, PathBuf};

use axum::http::StatusCode;
use tracing::{debug, warn};

use super::{AssetFuture, ServeResponse, UiServe};

const PAGE_TEMPLATE: &str = include_str!("../../../assets/index.html");
const MAPS_KEY_PLACEHOLDER: &str = "{{MAPS_API_KEY}}";

const HTML: &str = "text/html; charset=utf-8";
const BINARY: &str = "application/octet-stream";

pub struct DemoSite {
    page: Vec<u8>,
    static_root: PathBuf,
}

impl DemoSite {
    pub fn new(static_root: PathBuf, maps_api_key: Option<&str>) -> Self {
        let page = render_page(maps_api_key).into_bytes();
        Self { page, static_root }
    }
}

impl UiServe for DemoSite {
    fn page(&self) -> ServeResponse {
        ServeResponse { status: StatusCode::OK, content_type: HTML, body: self.page.clone() }
    }

    fn asset<'a>(&'a self, relative: &'a str) -> AssetFuture<'a> {
        Box::pin(async move {
            let path = resolve_asset(&self.static_root, relative).await?;
            match tokio::fs::read(&path).await {
                Ok(body) => Some(ServeResponse { status: StatusCode::OK, content_type: BINARY, body }),
                Err(e) => {
                    warn!(path = %path.display(), "static asset unreadable: {e}");
                    None
                }
            }
        })
    }
}

/// Substitute the maps key into the page. Only characters that can appear
/// in an API key survive, so the value cannot break out of its JS string.
fn render_page(maps_api_key: Option<&str>) -> String {
    let key: String = maps_api_key
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    PAGE_TEMPLATE.replace(MAPS_KEY_PLACEHOLDER, &key)
}

/// Map `relative` to a regular file under `root`, or `None`.
pub async fn resolve_asset(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty()
        || !relative.components().all(|c| matches!(c, Component::Normal(_)))
    {
        debug!(path = %relative.display(), "static path rejected");
        return None;
    }

    let root = tokio::fs::canonicalize(root).await.ok()?;
    let candidate = tokio::fs::canonicalize(root.join(relative)).await.ok()?;
    if !candidate.starts_with(&root) {
        debug!(path = %candidate.display(), "static path escapes root");
        return None;
    }
    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    metadata.is_file().then_some(candidate)
}
