//! Status projection.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{Disposition, ReconcileError};

/// Terminal status of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum ReconcileResult {
    Active,
    Waiting(String),
    Blocked(String),
}

impl ReconcileResult {
    pub fn waiting(reason: impl Into<String>) -> Self {
        Self::Waiting(reason.into())
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Human-readable reason; empty when active.
    pub fn message(&self) -> &str {
        match self {
            Self::Active => "",
            Self::Waiting(m) | Self::Blocked(m) => m,
        }
    }
}

impl fmt::Display for ReconcileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Waiting(m) => write!(f, "waiting: {m}"),
            Self::Blocked(m) => write!(f, "blocked: {m}"),
        }
    }
}

/// Maps the pipeline outcome onto a status.
pub struct StatusProjector;

impl StatusProjector {
    /// Fatal errors pass through untouched so the host records the
    /// invocation as failed.
    pub fn project(outcome: Result<(), ReconcileError>) -> Result<ReconcileResult, ReconcileError> {
        let err = match outcome {
            Ok(()) => return Ok(ReconcileResult::Active),
            Err(err) => err,
        };
        match err.disposition() {
            Disposition::Blocked => {
                info!(reason_code = err.reason_code(), reason = %err, "reconcile blocked");
                Ok(ReconcileResult::Blocked(err.to_string()))
            }
            Disposition::Waiting => {
                info!(reason_code = err.reason_code(), reason = %err, "reconcile waiting");
                Ok(ReconcileResult::Waiting(err.to_string()))
            }
            Disposition::Fatal => {
                error!(reason_code = err.reason_code(), error = %err, "reconcile failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryError;

    #[test]
    fn test_projection() {
        assert_eq!(StatusProjector::project(Ok(())).unwrap(), ReconcileResult::Active);
        assert_eq!(
            StatusProjector::project(Err(ReconcileError::MissingIntegration(
                "missing integration(s): s3".into()
            )))
            .unwrap(),
            ReconcileResult::Blocked("missing integration(s): s3".into())
        );
        assert_eq!(
            StatusProjector::project(Err(ReconcileError::ContainerNotReady(
                "waiting for opencti container".into()
            )))
            .unwrap()
            .to_string(),
            "waiting: waiting for opencti container"
        );
        assert!(StatusProjector::project(Err(ReconcileError::Directory(
            DirectoryError::Transport("connection reset".into())
        )))
        .is_err());
    }

    #[test]
    fn test_serialized_form() {
        let json = serde_json::to_value(ReconcileResult::Blocked("x".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "blocked", "message": "x"}));
        let json = serde_json::to_value(ReconcileResult::Active).unwrap();
        assert_eq!(json, serde_json::json!({"status": "active"}));
    }
}
