//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory
//! (or the path given with `-f`), then applies `DEVPROBE_HOST` and
//! `DEVPROBE_LOG_LEVEL` env overrides. A missing *default* file is not an
//! error; built-in defaults apply.

use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::AppError;

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Listener settings shared by both transports.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface both listeners bind to.
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,
    /// Upper bound on reading one request (headers + body).
    pub request_timeout: Duration,
    /// Bodies declaring a larger `Content-Length` are refused with 413.
    pub max_body_bytes: usize,
    /// How long in-flight connections may run after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn http_addr(&self) -> Result<SocketAddr, AppError> {
        socket_addr(&self.host, self.http_port)
    }

    pub fn https_addr(&self) -> Result<SocketAddr, AppError> {
        socket_addr(&self.host, self.https_port)
    }
}

/// TLS identity locations.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// `false` skips certificate bootstrap and the TLS listener.
    pub enabled: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Record log location.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub log_dir: PathBuf,
    pub log_file: String,
}

impl StorageConfig {
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.log_file)
    }
}

/// Static site settings.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Directory that contains the `static/` asset root.
    pub static_dir: PathBuf,
    /// Mapping-service key injected into the page. Sourced from
    /// `MAPS_API_KEY` (or `SECRET_KEY`) from the environment: never from TOML.
    pub maps_api_key: Option<String>,
}

impl SiteConfig {
    /// Root under which `/static/<path>` requests are resolved.
    pub fn static_root(&self) -> PathBuf {
        self.static_dir.join("static")
    }
}

/// Fully-resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Optional file that receives tracing output instead of stderr.
    pub log_file: Option<PathBuf>,
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub storage: StorageConfig,
    pub site: SiteConfig,
}

/// Raw TOML shape: `serde` target before resolution.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    tls: RawTls,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    site: RawSite,
    #[serde(default)]
    logging: RawLogging,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_http_port")]
    http_port: u16,
    #[serde(default = "default_https_port")]
    https_port: u16,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    max_body_bytes: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    shutdown_grace_ms: u64,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawTls {
    /// Defaults to `true`: the TLS listener starts whenever material exists.
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_cert_file")]
    cert_file: String,
    #[serde(default = "default_key_file")]
    key_file: String,
}

impl Default for RawTls {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_file: default_cert_file(),
            key_file: default_key_file(),
        }
    }
}

#[derive(Deserialize)]
struct RawStorage {
    #[serde(default = "default_log_dir")]
    log_dir: String,
    #[serde(default = "default_log_file")]
    log_file: String,
}

impl Default for RawStorage {
    fn default() -> Self {
        Self { log_dir: default_log_dir(), log_file: default_log_file() }
    }
}

#[derive(Deserialize)]
struct RawSite {
    #[serde(default = "default_static_dir")]
    static_dir: String,
}

impl Default for RawSite {
    fn default() -> Self {
        Self { static_dir: default_static_dir() }
    }
}

#[derive(Deserialize)]
struct RawLogging {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default)]
    file: Option<String>,
}

impl Default for RawLogging {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_http_port() -> u16 { 8000 }
fn default_https_port() -> u16 { 8443 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_max_body_bytes() -> usize { 1024 * 1024 }
fn default_shutdown_grace_ms() -> u64 { 2000 }
fn default_cert_file() -> String { "cert.pem".to_string() }
fn default_key_file() -> String { "key.pem".to_string() }
fn default_log_dir() -> String { "collected_data".to_string() }
fn default_log_file() -> String { "collected.jsonl".to_string() }
fn default_static_dir() -> String { ".".to_string() }
fn default_log_level() -> String { "info".to_string() }

fn default_true() -> bool {
    true
}

/// Load config from `explicit_path` (or `config/default.toml`), then apply
/// env-var overrides.
pub fn load(explicit_path: Option<&str>) -> Result<Config, AppError> {
    let host_override = env::var("DEVPROBE_HOST").ok();
    let log_level_override = env::var("DEVPROBE_LOG_LEVEL").ok();
    let maps_api_key = maps_key_from(|name| env::var(name).ok());

    let mut config = match explicit_path {
        Some(path) => load_from(Path::new(path), host_override.as_deref(), log_level_override.as_deref())?,
        None => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            if path.is_file() {
                load_from(path, host_override.as_deref(), log_level_override.as_deref())?
            } else {
                resolve(RawConfig::default(), host_override.as_deref(), log_level_override.as_deref())
            }
        }
    };
    config.site.maps_api_key = maps_api_key;
    Ok(config)
}

/// The maps key: `MAPS_API_KEY`, falling back to `SECRET_KEY` for older
/// `.env` files. Blank values count as unset.
fn maps_key_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    ["MAPS_API_KEY", "SECRET_KEY"]
        .into_iter()
        .find_map(|name| lookup(name).filter(|k| !k.trim().is_empty()))
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    host_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    Ok(resolve(parsed, host_override, log_level_override))
}

fn resolve(raw: RawConfig, host_override: Option<&str>, log_level_override: Option<&str>) -> Config {
    let s = raw.server;
    Config {
        log_level: log_level_override.unwrap_or(&raw.logging.level).to_string(),
        log_file: raw.logging.file.as_deref().map(expand_home),
        server: ServerConfig {
            host: host_override.unwrap_or(&s.host).to_string(),
            http_port: s.http_port,
            https_port: s.https_port,
            request_timeout: Duration::from_secs(s.request_timeout_secs),
            max_body_bytes: s.max_body_bytes,
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
        },
        tls: TlsConfig {
            enabled: raw.tls.enabled,
            cert_file: expand_home(&raw.tls.cert_file),
            key_file: expand_home(&raw.tls.key_file),
        },
        storage: StorageConfig {
            log_dir: expand_home(&raw.storage.log_dir),
            log_file: raw.storage.log_file,
        },
        site: SiteConfig {
            static_dir: expand_home(&raw.site.static_dir),
            maps_api_key: None,
        },
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, AppError> {
    let ip = host
        .parse::<std::net::IpAddr>()
        .map_err(|e| AppError::Config(format!("invalid bind host '{host}': {e}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl Config {
    /// Loopback config rooted at `work_dir` with ephemeral ports: used by
    /// unit and integration tests.
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            log_level: "info".into(),
            log_file: None,
            server: ServerConfig {
                host: "127.0.0.1".into(),
                http_port: 0,
                https_port: 0,
                request_timeout: Duration::from_secs(5),
                max_body_bytes: default_max_body_bytes(),
                shutdown_grace: Duration::from_millis(200),
            },
            tls: TlsConfig {
                enabled: true,
                cert_file: work_dir.join("cert.pem"),
                key_file: work_dir.join("key.pem"),
            },
            storage: StorageConfig {
                log_dir: work_dir.join("collected_data"),
                log_file: default_log_file(),
            },
            site: SiteConfig {
                static_dir: work_dir.to_path_buf(),
                maps_api_key: None,
            },
        }
    }
}
