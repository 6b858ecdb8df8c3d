//! The reconcile pipeline.
//!
//! One invocation reads a [`Snapshot`], converges the supervisor onto the
//! desired plan and provisions connector access. It is level-triggered:
//! every host event leads to the same call, and repeating it with an
//! unchanged snapshot changes nothing.

use std::collections::BTreeMap;

use octi_id::RelationId;
use octi_secrets::SecretStore;
use tracing::{debug, info, info_span, Instrument};

use crate::access::{AccessReconciler, IntegrationRecord};
use crate::bundle::{EnsureOutcome, SecretManager};
use crate::config::ControllerConfig;
use crate::dependency::{Dependency, DependencyAggregator};
use crate::directory::DirectoryProvider;
use crate::error::CONTAINER_NOT_READY;
use crate::hash::SpecHash;
use crate::health::{HealthProbe, HealthWatcher, StatusSink};
use crate::peer::PeerStore;
use crate::plan::{DesiredPlan, PlanBuilder};
use crate::rollout::{RolloutController, RolloutPhase, RolloutSettings};
use crate::snapshot::{DataBag, Snapshot};
use crate::status::{ReconcileResult, StatusProjector};
use crate::supervisor::Supervisor;
use crate::ReconcileError;

/// Local field asking the broker for management access.
pub const BROKER_ADMIN_FIELD: &str = "admin";

/// External systems one invocation talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub supervisor: &'a dyn Supervisor,
    pub probe: &'a dyn HealthProbe,
    pub secrets: &'a dyn SecretStore,
    pub peer: &'a dyn PeerStore,
    pub directory: &'a dyn DirectoryProvider,
    pub sink: &'a dyn StatusSink,
    pub watcher: Option<&'a dyn HealthWatcher>,
}

/// Everything an invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub result: ReconcileResult,
    /// Plan handed to the supervisor, if the pipeline got that far.
    pub plan: Option<DesiredPlan>,
    pub spec_hash: Option<SpecHash>,
    /// Furthest rollout stage reached.
    pub phase: RolloutPhase,
    /// Local relation data the host must publish, per relation.
    pub relation_writes: BTreeMap<RelationId, DataBag>,
    /// Account assigned to each connector integration.
    pub accounts: BTreeMap<RelationId, Option<String>>,
    /// Connector integrations as provisioned; filled on the leader only.
    pub integrations: Vec<IntegrationRecord>,
}

impl ReconcileOutcome {
    fn new() -> Self {
        Self {
            result: ReconcileResult::Active,
            plan: None,
            spec_hash: None,
            phase: RolloutPhase::Idle,
            relation_writes: BTreeMap::new(),
            accounts: BTreeMap::new(),
            integrations: Vec::new(),
        }
    }

    fn write(&mut self, relation: RelationId, data: DataBag) {
        self.relation_writes.entry(relation).or_default().extend(data);
    }
}

/// The platform reconciliation controller.
pub struct Controller<'a> {
    config: &'a ControllerConfig,
    deps: Collaborators<'a>,
}

impl<'a> Controller<'a> {
    pub fn new(config: &'a ControllerConfig, deps: Collaborators<'a>) -> Self {
        Self { config, deps }
    }

    /// Run one invocation.
    ///
    /// Blocked and waiting conditions become the outcome's status; only
    /// fatal failures are returned as errors.
    pub async fn reconcile(&self, snapshot: &Snapshot) -> Result<ReconcileOutcome, ReconcileError> {
        let span = info_span!("reconcile", app = %self.config.app_name, role = ?snapshot.role);
        let mut outcome = ReconcileOutcome::new();
        let run = self.run(snapshot, &mut outcome).instrument(span).await;
        outcome.result = StatusProjector::project(run)?;
        info!(status = %outcome.result, phase = ?outcome.phase, "reconcile finished");
        Ok(outcome)
    }

    async fn run(
        &self,
        snapshot: &Snapshot,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ReconcileError> {
        let deps = self.deps;
        let role = snapshot.role;
        self.config.validate()?;

        let manager = SecretManager::new(deps.secrets, deps.peer);
        match manager.ensure_bundle(role).await? {
            EnsureOutcome::NotReady(reason) => debug!(%reason, "peer secret bundle not ensured"),
            EnsureOutcome::Created(id) | EnsureOutcome::Existing(id) => {
                debug!(secret_id = %id, "peer secret bundle ensured")
            }
        }
        self.request_broker_admin(snapshot, outcome);

        if !deps.supervisor.can_connect().await {
            return Err(ReconcileError::ContainerNotReady(CONTAINER_NOT_READY.to_string()));
        }

        let aggregation = DependencyAggregator::new(deps.secrets, &self.config.app_name)
            .aggregate(snapshot, self.config.admin_user.as_deref())
            .await;
        aggregation.ensure_present()?;
        let bundle = manager.resolve_bundle().await?;
        let plan = PlanBuilder::new(self.config).build(&bundle, &aggregation)?;
        let spec_hash = plan.spec_hash()?;
        info!(spec_hash = %spec_hash, services = plan.services.len(), "desired plan built");
        outcome.plan = Some(plan.clone());
        outcome.spec_hash = Some(spec_hash);

        let settings = RolloutSettings {
            budget: self.config.health_budget,
            interval: self.config.health_interval,
        };
        let mut rollout = RolloutController::new(deps.supervisor, deps.probe, deps.sink, settings);
        if let Some(watcher) = deps.watcher {
            rollout = rollout.with_watcher(watcher);
        }

        let applied = rollout.apply(&plan).await?;
        outcome.phase = applied.phase();
        let started = applied.start_primary().await?;
        outcome.phase = started.phase();
        let healthy = match started.poll_health().await {
            Ok(healthy) => healthy,
            Err(e) => {
                if matches!(e, ReconcileError::PlatformNotReady(_)) {
                    outcome.phase = RolloutPhase::TimedOut;
                }
                return Err(e);
            }
        };
        outcome.phase = healthy.phase();
        let converged = healthy.start_workers().await?;
        outcome.phase = converged.phase();

        if !role.is_leader() {
            return Ok(());
        }

        let public_url = aggregation
            .fragment(Dependency::Ingress)?
            .env
            .get("APP__BASE_URL")
            .cloned()
            .unwrap_or_default();
        let client = deps
            .directory
            .connect(&self.config.platform_url(), &bundle.admin_token)?;
        let records: Vec<IntegrationRecord> = snapshot
            .connectors
            .iter()
            .map(IntegrationRecord::from_relation)
            .collect();
        let report = AccessReconciler::new(
            deps.secrets,
            &self.config.account_prefix,
            &self.config.elevated_group,
            &self.config.restricted_group,
            &public_url,
        )
        .reconcile(role, &records, client.as_ref())
        .await?;

        outcome.accounts = report.accounts;
        outcome.integrations = report.integrations;
        for (relation, data) in report.writes {
            outcome.write(relation, data);
        }
        Ok(())
    }

    /// The broker only grants management access on request.
    fn request_broker_admin(&self, snapshot: &Snapshot, outcome: &mut ReconcileOutcome) {
        if !snapshot.role.is_leader() {
            return;
        }
        let Some(relation) = snapshot.relation(Dependency::Amqp.endpoint()) else {
            return;
        };
        if relation.local_app_data.get(BROKER_ADMIN_FIELD).map(String::as_str) == Some("true") {
            return;
        }
        outcome.write(
            relation.id,
            DataBag::from([(BROKER_ADMIN_FIELD.to_string(), "true".to_string())]),
        );
    }
}
