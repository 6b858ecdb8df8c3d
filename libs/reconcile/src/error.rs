//! Controller error taxonomy.
//!
//! Every condition the pipeline can raise carries the exact human-readable
//! reason that ends up in the reported status, so operators can act on the
//! status alone.

use octi_secrets::SecretStoreError;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::peer::PeerStoreError;
use crate::supervisor::SupervisorError;

/// How a raised condition is surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Operator action is required.
    Blocked,
    /// Expected to resolve on its own; the next invocation retries.
    Waiting,
    /// The invocation itself malfunctioned; no status is set.
    Fatal,
}

/// Reconciliation errors.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// A mandatory configuration option is unset.
    #[error("{0}")]
    MissingConfig(String),

    /// A configuration option is malformed or references an unusable secret.
    #[error("{0}")]
    InvalidConfig(String),

    /// One or more required relations are absent.
    #[error("{0}")]
    MissingIntegration(String),

    /// A relation is present but its data is malformed or inaccessible.
    #[error("{0}")]
    InvalidIntegration(String),

    /// The process supervisor cannot be reached.
    #[error("{0}")]
    ContainerNotReady(String),

    /// A relation is present but has not published everything yet.
    #[error("{0}")]
    IntegrationNotReady(String),

    /// The platform has not passed its health check yet.
    #[error("{0}")]
    PlatformNotReady(String),

    /// Process supervisor API failure.
    #[error("supervisor error: {0}")]
    Supervisor(SupervisorError),

    /// Secret store failure.
    #[error("secret store error: {0}")]
    SecretStore(#[from] SecretStoreError),

    /// Peer storage failure.
    #[error("peer store error: {0}")]
    PeerStore(#[from] PeerStoreError),

    /// User directory failure.
    #[error("user directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Classify the error for status projection.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::MissingConfig(_)
            | Self::InvalidConfig(_)
            | Self::MissingIntegration(_)
            | Self::InvalidIntegration(_) => Disposition::Blocked,
            Self::ContainerNotReady(_)
            | Self::IntegrationNotReady(_)
            | Self::PlatformNotReady(_) => Disposition::Waiting,
            Self::Supervisor(_)
            | Self::SecretStore(_)
            | Self::PeerStore(_)
            | Self::Directory(_)
            | Self::Internal(_) => Disposition::Fatal,
        }
    }

    /// Short machine-readable code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MissingConfig(_) => "missing_config",
            Self::InvalidConfig(_) => "invalid_config",
            Self::MissingIntegration(_) => "missing_integration",
            Self::InvalidIntegration(_) => "invalid_integration",
            Self::ContainerNotReady(_) => "container_not_ready",
            Self::IntegrationNotReady(_) => "integration_not_ready",
            Self::PlatformNotReady(_) => "platform_not_ready",
            Self::Supervisor(_) => "supervisor_error",
            Self::SecretStore(_) => "secret_store_error",
            Self::PeerStore(_) => "peer_store_error",
            Self::Directory(_) => "directory_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Reason reported while the supervisor is unreachable.
pub const CONTAINER_NOT_READY: &str = "waiting for opencti container";

impl From<SupervisorError> for ReconcileError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Unreachable(_) => Self::ContainerNotReady(CONTAINER_NOT_READY.into()),
            other => Self::Supervisor(other),
        }
    }
}
