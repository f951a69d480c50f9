//! One network listener per transport.
//!
//! Each listener walks `Starting -> Serving -> Stopped` and publishes every
//! transition on a `watch` channel so the supervisor (and tests) can observe
//! it. A listener that never binds goes straight from `Starting` to
//! `Stopped`; that is reported, not returned as an error, so the other
//! transport keeps running.
//!
//! The plaintext listener hands its socket to `axum::serve`. The TLS
//! listener keeps its own accept loop: each stream is handshaken and then
//! driven by a hyper HTTP/1.1 connection over the same router.

use std::fmt;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};

use super::CommsState;
use super::http;
use crate::error::AppError;
use crate::subsystems::runtime::{Component, ComponentFuture};

/// Back-off after a failed `accept` (e.g. fd exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Plain,
    Tls,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerKind::Plain => "http",
            ListenerKind::Tls => "https",
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a listener is not serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped by the shutdown signal after serving.
    Shutdown,
    BindFailed(String),
    /// Certificate bootstrap reported the identity absent.
    NoIdentity(String),
    /// Identity present but unusable as a rustls server config.
    TlsConfig(String),
    /// Turned off in config.
    Disabled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => f.write_str("shut down"),
            StopReason::BindFailed(e) => write!(f, "bind failed: {e}"),
            StopReason::NoIdentity(e) => write!(f, "no TLS identity: {e}"),
            StopReason::TlsConfig(e) => write!(f, "TLS config rejected: {e}"),
            StopReason::Disabled => f.write_str("disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Serving { local_addr: SocketAddr },
    Stopped { reason: StopReason },
}

impl ListenerState {
    /// `Stopped` is terminal; `Serving` can only be entered from `Starting`.
    pub fn can_transition_to(&self, next: &ListenerState) -> bool {
        use ListenerState::*;
        matches!(
            (self, next),
            (Starting, Serving { .. }) | (Starting, Stopped { .. }) | (Serving { .. }, Stopped { .. })
        )
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenerState::Serving { local_addr } => Some(*local_addr),
            _ => None,
        }
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, ListenerState::Serving { .. })
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, ListenerState::Starting)
    }
}

// ── ListenerStatus ────────────────────────────────────────────────────────────

/// Publisher side of a listener's state.
#[derive(Clone)]
pub struct ListenerStatus {
    kind: ListenerKind,
    tx: Arc<watch::Sender<ListenerState>>,
}

impl ListenerStatus {
    pub fn new(kind: ListenerKind) -> Self {
        let (tx, _rx) = watch::channel(ListenerState::Starting);
        Self { kind, tx: Arc::new(tx) }
    }

    /// A status for a listener that will never start.
    pub fn stopped(kind: ListenerKind, reason: StopReason) -> Self {
        let status = Self::new(kind);
        status.transition(ListenerState::Stopped { reason });
        status
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn current(&self) -> ListenerState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.tx.subscribe()
    }

    /// Apply `next` if the state machine allows it. Returns whether the
    /// state changed.
    pub fn transition(&self, next: ListenerState) -> bool {
        let kind = self.kind;
        self.tx.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                warn!(listener = %kind, from = ?current, to = ?next, "ignoring invalid listener transition");
                return false;
            }
            match &next {
                ListenerState::Serving { local_addr } => info!(listener = %kind, addr = %local_addr, "listener serving"),
                ListenerState::Stopped { reason: StopReason::Shutdown } => info!(listener = %kind, "listener stopped"),
                ListenerState::Stopped { reason } => warn!(listener = %kind, %reason, "listener not serving"),
                ListenerState::Starting => {}
            }
            *current = next;
            true
        })
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// A bound-on-start TCP listener, optionally wrapping every connection in
/// a TLS handshake, serving the shared router.
pub struct Listener {
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    state: Arc<CommsState>,
    status: ListenerStatus,
    shutdown_grace: Duration,
}

impl Listener {
    pub fn plain(addr: SocketAddr, state: Arc<CommsState>, status: ListenerStatus, shutdown_grace: Duration) -> Self {
        Self { addr, acceptor: None, state, status, shutdown_grace }
    }

    pub fn tls(
        addr: SocketAddr,
        acceptor: TlsAcceptor,
        state: Arc<CommsState>,
        status: ListenerStatus,
        shutdown_grace: Duration,
    ) -> Self {
        Self { addr, acceptor: Some(acceptor), state, status, shutdown_grace }
    }

    async fn serve(self, shutdown: CancellationToken) -> Result<(), AppError> {
        let kind = self.status.kind();

        let listener = match TcpListener::bind(self.addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(listener = %kind, addr = %self.addr, "bind failed: {e}");
                self.status.transition(ListenerState::Stopped { reason: StopReason::BindFailed(e.to_string()) });
                return Ok(());
            }
        };
        let local_addr = listener.local_addr().unwrap_or(self.addr);
        self.status.transition(ListenerState::Serving { local_addr });

        let app = http::router(self.state.clone());
        match &self.acceptor {
            None => self.serve_plain(listener, app, &shutdown).await,
            Some(acceptor) => self.serve_tls(listener, acceptor, app, &shutdown).await,
        }

        self.status.transition(ListenerState::Stopped { reason: StopReason::Shutdown });
        Ok(())
    }

    async fn serve_plain(&self, listener: TcpListener, app: Router, shutdown: &CancellationToken) {
        let kind = self.status.kind();
        let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let grace_expired = async {
            shutdown.cancelled().await;
            tokio::time::sleep(self.shutdown_grace).await;
        };

        tokio::select! {
            result = server.into_future() => {
                if let Err(e) = result {
                    error!(listener = %kind, "server error: {e}");
                }
            }
            () = grace_expired => warn!(listener = %kind, "shutdown grace expired; abandoning connections"),
        }
    }

    async fn serve_tls(&self, listener: TcpListener, acceptor: &TlsAcceptor, app: Router, shutdown: &CancellationToken) {
        let kind = self.status.kind();
        let handshake_timeout = self.state.limits.read_timeout;

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                // Reap finished connection tasks.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(listener = %kind, %peer, "connection accepted");
                        let acceptor = acceptor.clone();
                        let app = app.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = serve_tls_connection(acceptor, app, stream, peer, handshake_timeout, shutdown).await {
                                debug!(listener = %kind, %peer, "connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(listener = %kind, "accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(listener = %kind, in_flight = connections.len(), "shutdown grace expired; abandoning connections");
        }
    }
}

impl Component for Listener {
    fn id(&self) -> &str {
        self.status.kind().as_str()
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin((*self).serve(shutdown))
    }
}

/// Handshake, then serve HTTP/1.1 on the TLS stream until the peer is done
/// or shutdown asks the connection to wind down.
async fn serve_tls_connection(
    acceptor: TlsAcceptor,
    app: Router,
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let tls = match tokio::time::timeout(read_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!(%peer, "tls handshake failed: {e}");
            return Ok(());
        }
        Err(_) => {
            debug!(%peer, "tls handshake timed out");
            return Ok(());
        }
    };

    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        app.clone().call(request)
    });
    let mut connection = pin!(
        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(read_timeout)
            .serve_connection(TokioIo::new(tls), service)
    );

    let mut winding_down = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                return result.map_err(|e| AppError::Comms(format!("https connection from {peer}: {e}")));
            }
            _ = shutdown.cancelled(), if !winding_down => {
                winding_down = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordSink;
    use crate::subsystems::comms::RequestLimits;
    use crate::subsystems::runtime::ComponentSet;
    use crate::subsystems::ui::site::DemoSite;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn comms_state(dir: &TempDir) -> Arc<CommsState> {
        let sink = RecordSink::open(dir.path(), "collected.jsonl").await.unwrap();
        let ui = Arc::new(DemoSite::new(dir.path().join("static"), None));
        let limits = RequestLimits { read_timeout: Duration::from_secs(2), max_body_bytes: 1024 };
        Arc::new(CommsState::new(ui, Arc::new(sink), limits))
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn state_machine_transitions() {
        let addr = loopback();
        let serving = ListenerState::Serving { local_addr: addr };
        let stopped = ListenerState::Stopped { reason: StopReason::Shutdown };

        assert!(ListenerState::Starting.can_transition_to(&serving));
        assert!(ListenerState::Starting.can_transition_to(&stopped));
        assert!(serving.can_transition_to(&stopped));

        assert!(!serving.can_transition_to(&ListenerState::Starting));
        assert!(!serving.can_transition_to(&serving));
        assert!(!stopped.can_transition_to(&serving));
        assert!(!stopped.can_transition_to(&ListenerState::Starting));
    }

    #[test]
    fn status_ignores_invalid_transitions() {
        let status = ListenerStatus::stopped(ListenerKind::Tls, StopReason::Disabled);
        assert!(!status.transition(ListenerState::Serving { local_addr: loopback() }));
        assert_eq!(status.current(), ListenerState::Stopped { reason: StopReason::Disabled });
    }

    #[tokio::test]
    async fn serves_then_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let status = ListenerStatus::new(ListenerKind::Plain);
        let mut rx = status.subscribe();
        let shutdown = CancellationToken::new();

        let mut set = ComponentSet::new(shutdown.clone());
        set.spawn(Box::new(Listener::plain(
            loopback(),
            comms_state(&dir).await,
            status.clone(),
            Duration::from_millis(200),
        )));
        let handle = set.into_handle();

        let addr = rx.wait_for(|s| s.is_settled()).await.unwrap().local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 404 Not Found"));

        shutdown.cancel();
        handle.join().await.unwrap();
        assert_eq!(status.current(), ListenerState::Stopped { reason: StopReason::Shutdown });
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_stops_without_error() {
        let dir = TempDir::new().unwrap();
        let taken = TcpListener::bind(loopback()).await.unwrap();
        let addr = taken.local_addr().unwrap();

        let status = ListenerStatus::new(ListenerKind::Plain);
        let listener = Listener::plain(addr, comms_state(&dir).await, status.clone(), Duration::from_millis(50));
        Box::new(listener).run(CancellationToken::new()).await.unwrap();

        assert!(matches!(status.current(), ListenerState::Stopped { reason: StopReason::BindFailed(_) }));
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let status = ListenerStatus::new(ListenerKind::Plain);
        let mut rx = status.subscribe();
        let shutdown = CancellationToken::new();
        let listener = Listener::plain(loopback(), comms_state(&dir).await, status, Duration::from_millis(50));
        let task = tokio::spawn(Box::new(listener).run(shutdown.clone()));

        let addr = rx.wait_for(|s| s.is_settled()).await.unwrap().local_addr().unwrap();

        let _stalled = TcpStream::connect(addr).await.unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
