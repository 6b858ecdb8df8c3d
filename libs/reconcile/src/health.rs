//! Health probing and out-of-band watching.

use async_trait::async_trait;
use thiserror::Error;

use crate::status::ReconcileResult;

/// Probe failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The endpoint answered with a non-success status.
    #[error("unhealthy: HTTP {status}")]
    Unhealthy { status: u16 },

    /// The endpoint could not be reached or timed out.
    #[error("probe transport error: {0}")]
    Transport(String),
}

/// One-shot health probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Succeeds only on a success status within the probe timeout.
    async fn probe(&self, url: &str) -> Result<(), ProbeError>;
}

/// Errors arming a watcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to arm health watcher: {0}")]
pub struct WatchError(pub String);

/// Keeps watching the platform after an invocation gave up polling, and
/// triggers a fresh reconcile once it turns healthy.
#[async_trait]
pub trait HealthWatcher: Send + Sync {
    async fn arm(&self, url: &str) -> Result<(), WatchError>;
}

/// Receives interim status while an invocation is still running.
pub trait StatusSink: Send + Sync {
    fn interim(&self, status: &ReconcileResult);
}

/// Sink that drops interim status.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn interim(&self, _status: &ReconcileResult) {}
}
