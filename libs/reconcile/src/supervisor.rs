//! Process supervisor collaborator.

use async_trait::async_trait;
use thiserror::Error;

use crate::plan::DesiredPlan;

/// Supervisor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The supervisor socket cannot be reached.
    #[error("supervisor unreachable: {0}")]
    Unreachable(String),

    /// The supervisor rejected a request.
    #[error("supervisor API error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Supervisor interface.
///
/// Layer application merges entries by name; replanning restarts services
/// whose definition changed.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn can_connect(&self) -> bool;

    async fn add_layer(
        &self,
        label: &str,
        plan: &DesiredPlan,
        combine: bool,
    ) -> Result<(), SupervisorError>;

    async fn replan(&self) -> Result<(), SupervisorError>;

    async fn start(&self, service: &str) -> Result<(), SupervisorError>;

    async fn stop(&self, service: &str) -> Result<(), SupervisorError>;

    /// Write a file into the workload, creating parent directories.
    async fn push_file(&self, path: &str, content: &str) -> Result<(), SupervisorError>;
}
