//! Generic component runtime: shared scaffolding for long-running tasks.
//!
//! # Component model
//!
//! A [`Component`] is any independently-runnable unit, here a network
//! listener. The owner constructs components with their shared state
//! already captured inside them, then spawns them into a [`ComponentSet`].
//!
//! Components can be added one at a time: the supervisor spawns the
//! plaintext listener first and the TLS listener only after the certificate
//! bootstrap has finished.
//!
//! # SubsystemHandle
//!
//! [`ComponentSet::into_handle`] returns a [`SubsystemHandle`] that the
//! caller can `.await` (blocking until all components finish). A component
//! that panics or returns `Err` cancels the shared [`CancellationToken`] so
//! its siblings stop too.

use std::future::Future;
use std::pin::Pin;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::AppError;

// ── Component ─────────────────────────────────────────────────────────────────

/// A boxed, owned future returned by [`Component::run`].
pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'static>>;

/// A self-contained, concurrently-runnable unit.
///
/// Implementors capture all shared state at construction time.
/// [`Component::run`] is called once and should run until `shutdown` is
/// cancelled or the component's own work is done.
pub trait Component: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    /// Consume the component and return its async run-loop as a boxed future.
    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

// ── ComponentSet ──────────────────────────────────────────────────────────────

/// Components spawned so far, sharing one shutdown token.
pub struct ComponentSet {
    set: JoinSet<Result<(), AppError>>,
    shutdown: CancellationToken,
}

impl ComponentSet {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { set: JoinSet::new(), shutdown }
    }

    /// Spawn `component` as an independent Tokio task.
    pub fn spawn(&mut self, component: Box<dyn Component>) {
        let id = component.id().to_string();
        debug!(component = %id, "spawning component");
        self.set.spawn(component.run(self.shutdown.clone()));
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Hand the running set to a manager task.
    ///
    /// Behaviour on error:
    /// - If any component returns `Err` or panics, `shutdown` is cancelled so
    ///   all siblings receive the cancellation signal and stop cooperatively.
    /// - The manager then drains the remaining components and returns the
    ///   first error encountered.
    pub fn into_handle(self) -> SubsystemHandle {
        let Self { mut set, shutdown } = self;
        let handle = tokio::spawn(async move {
            let mut first_err: Option<AppError> = None;

            while let Some(res) = set.join_next().await {
                match res {
                    Err(e) => {
                        error!("component panicked: {e}");
                        shutdown.cancel();
                        first_err.get_or_insert_with(|| {
                            AppError::Comms(format!("component panicked: {e}"))
                        });
                    }
                    Ok(Err(e)) => {
                        error!("component error: {e}");
                        shutdown.cancel();
                        first_err.get_or_insert(e);
                    }
                    Ok(Ok(())) => {}
                }
            }

            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        });

        SubsystemHandle { inner: handle }
    }
}

// ── SubsystemHandle ───────────────────────────────────────────────────────────

/// An opaque handle to a running component set.
pub struct SubsystemHandle {
    inner: JoinHandle<Result<(), AppError>>,
}

impl SubsystemHandle {
    /// Await all components and return the first error, if any.
    pub async fn join(self) -> Result<(), AppError> {
        match self.inner.await {
            Ok(r) => r,
            Err(e) => Err(AppError::Comms(format!("subsystem task panicked: {e}"))),
        }
    }
}
