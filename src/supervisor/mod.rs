//! Supervisor: brings up both listeners and reports what came up.
//!
//! Start order:
//! 1. plaintext listener, unconditionally;
//! 2. certificate bootstrap on the blocking pool (skipped when TLS is
//!    disabled);
//! 3. TLS listener, only if bootstrap returned [`TlsIdentity::Ready`] and
//!    the material builds a valid rustls config.
//!
//! Neither listener's failure is fatal. If neither ends up serving the
//! process keeps running and logs that it is unreachable.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::identity::{self, IdentityPaths, TlsIdentity};
use crate::subsystems::comms::listener::{Listener, ListenerKind, ListenerState, ListenerStatus, StopReason};
use crate::subsystems::comms::{CommsState, tls};
use crate::subsystems::runtime::{ComponentSet, SubsystemHandle};

/// Handle to the running listeners.
pub struct Running {
    pub http: ListenerStatus,
    pub https: ListenerStatus,
    handle: SubsystemHandle,
}

/// Settled state of both listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub http: ListenerState,
    pub https: ListenerState,
}

impl Availability {
    /// At least one listener is serving.
    pub fn is_reachable(&self) -> bool {
        self.http.is_serving() || self.https.is_serving()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.local_addr()
    }
}

/// Start the listeners. Returns once both have been spawned (or marked
/// stopped); use [`Running::settled`] to wait for their bind outcome.
///
/// Errors only on an unusable listen address in config.
pub async fn start(config: &Config, state: Arc<CommsState>, shutdown: CancellationToken) -> Result<Running, AppError> {
    let grace = config.server.shutdown_grace;
    let mut components = ComponentSet::new(shutdown);

    let http = ListenerStatus::new(ListenerKind::Plain);
    components.spawn(Box::new(Listener::plain(
        config.server.http_addr()?,
        state.clone(),
        http.clone(),
        grace,
    )));

    let https = if config.tls.enabled {
        let https_addr = config.server.https_addr()?;
        let paths = IdentityPaths::new(&config.tls.key_file, &config.tls.cert_file);
        let identity = tokio::task::spawn_blocking(move || identity::ensure(&paths))
            .await
            .unwrap_or_else(|e| TlsIdentity::Absent { reason: format!("bootstrap task failed: {e}") });

        match identity {
            TlsIdentity::Ready(material) => match tls::acceptor(&material) {
                Ok(acceptor) => {
                    let status = ListenerStatus::new(ListenerKind::Tls);
                    components.spawn(Box::new(Listener::tls(https_addr, acceptor, state, status.clone(), grace)));
                    status
                }
                Err(e) => {
                    warn!("TLS listener not started: {e}");
                    ListenerStatus::stopped(ListenerKind::Tls, StopReason::TlsConfig(e.to_string()))
                }
            },
            TlsIdentity::Absent { reason } => ListenerStatus::stopped(ListenerKind::Tls, StopReason::NoIdentity(reason)),
        }
    } else {
        info!("TLS disabled in config");
        ListenerStatus::stopped(ListenerKind::Tls, StopReason::Disabled)
    };

    Ok(Running { http, https, handle: components.into_handle() })
}

impl Running {
    /// Wait until neither listener is `Starting` and report the result.
    pub async fn settled(&self) -> Availability {
        let availability = Availability { http: settle(&self.http).await, https: settle(&self.https).await };
        if !availability.is_reachable() {
            error!(
                http = ?availability.http,
                https = ?availability.https,
                "no listener reachable; process stays up but serves nothing"
            );
        }
        availability
    }

    /// Wait for every listener task to finish (after shutdown).
    pub async fn join(self) -> Result<(), AppError> {
        self.handle.join().await
    }
}

async fn settle(status: &ListenerStatus) -> ListenerState {
    let mut rx = status.subscribe();
    let state = match rx.wait_for(ListenerState::is_settled).await {
        Ok(state) => state.clone(),
        // Sender lives in `status`; unreachable while we hold it.
        Err(_) => status.current(),
    };
    state
}
