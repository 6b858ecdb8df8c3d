//! Reconciliation controller for the OpenCTI platform workload.
//!
//! One invocation converges the workload onto a desired plan derived from
//! the current relations, configuration and secrets. Key pieces:
//!
//! - **Dependency aggregation**: classifies each required relation as
//!   ready, not ready or invalid.
//! - **Secret manager**: owns the peer secret bundle (admin token, health
//!   access key).
//! - **Plan builder**: pure derivation of the supervisor plan.
//! - **Rollout**: applies the plan, starts the platform, gates workers on
//!   its health check.
//! - **Access reconciler**: per-connector accounts and token secrets.
//! - **Status projection**: maps the outcome onto active, waiting or
//!   blocked.
//!
//! # Invariants
//!
//! - All operations are idempotent; a repeated invocation with unchanged
//!   inputs makes no further changes
//! - The plan is deterministic given the same inputs
//! - Workers are never started before the platform health check passes
//! - Connector accounts are deactivated, never deleted

mod error;

pub mod access;
pub mod bundle;
pub mod config;
pub mod connector;
pub mod controller;
pub mod dependency;
pub mod directory;
pub mod hash;
pub mod health;
pub mod peer;
pub mod plan;
pub mod rollout;
pub mod snapshot;
pub mod status;
pub mod supervisor;

pub use access::{AccessReconciler, AccessReport, IntegrationRecord};
pub use bundle::{EnsureOutcome, PeerSecretBundle, SecretManager};
pub use config::ControllerConfig;
pub use connector::{ConnectorKind, ConnectorOutcome, ConnectorReconciler, ConnectorSettings};
pub use controller::{Collaborators, Controller, ReconcileOutcome};
pub use dependency::{Aggregation, Dependency, DependencyAggregator, DependencyState, EnvFragment};
pub use directory::{
    AccountStatus, CachedDirectory, DirectoryError, DirectoryProvider, Group, UserAccount,
    UserDirectoryClient,
};
pub use error::{Disposition, ReconcileError, CONTAINER_NOT_READY};
pub use hash::SpecHash;
pub use health::{HealthProbe, HealthWatcher, NoopStatusSink, ProbeError, StatusSink, WatchError};
pub use peer::{InMemoryPeerStore, PeerStore, PeerStoreError, RelationPeerStore, PEER_ENDPOINT};
pub use plan::{DesiredPlan, PlanBuilder, ServiceSpec};
pub use rollout::{RolloutController, RolloutPhase, RolloutSettings};
pub use snapshot::{DataBag, RelationData, Role, Snapshot};
pub use status::{ReconcileResult, StatusProjector};
pub use supervisor::{Supervisor, SupervisorError};
