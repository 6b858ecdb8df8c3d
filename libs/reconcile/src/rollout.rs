//! Rollout of a desired plan onto the supervisor.
//!
//! The rollout is a chain of typed stages. Workers can only be started from
//! [`PrimaryHealthy`], which only a successful health poll produces, so a
//! failed or timed-out poll cannot lead to worker start-up.
//!
//! ```text
//! apply ──► PlanApplied ──► PrimaryStarted ──► PrimaryHealthy ──► Converged
//!                                  │
//!                                  └── budget exhausted ──► PlatformNotReady
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::health::{HealthProbe, HealthWatcher, StatusSink};
use crate::plan::{DesiredPlan, PRIMARY_SERVICE};
use crate::status::ReconcileResult;
use crate::supervisor::Supervisor;
use crate::ReconcileError;

/// Supervisor layer label the plan is merged under.
pub const LAYER_LABEL: &str = "opencti";

/// Reason reported when the health budget runs out.
pub const STARTUP_FAILED: &str = "opencti platform start-up failed";

/// Observable stage of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutPhase {
    Idle,
    PlanApplied,
    PrimaryStarting,
    PrimaryHealthy,
    Converged,
    TimedOut,
}

/// Health polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct RolloutSettings {
    pub budget: Duration,
    pub interval: Duration,
}

/// Drives a plan through the supervisor.
pub struct RolloutController<'a> {
    supervisor: &'a dyn Supervisor,
    probe: &'a dyn HealthProbe,
    sink: &'a dyn StatusSink,
    watcher: Option<&'a dyn HealthWatcher>,
    settings: RolloutSettings,
}

impl<'a> RolloutController<'a> {
    pub fn new(
        supervisor: &'a dyn Supervisor,
        probe: &'a dyn HealthProbe,
        sink: &'a dyn StatusSink,
        settings: RolloutSettings,
    ) -> Self {
        Self {
            supervisor,
            probe,
            sink,
            watcher: None,
            settings,
        }
    }

    /// Arm `watcher` whenever health polling gives up.
    pub fn with_watcher(mut self, watcher: &'a dyn HealthWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Push plan files, merge the plan as a layer and replan.
    ///
    /// Safe to repeat with the same plan.
    pub async fn apply<'c>(
        &'c self,
        plan: &'c DesiredPlan,
    ) -> Result<PlanApplied<'c, 'a>, ReconcileError> {
        for (path, content) in &plan.files {
            self.supervisor.push_file(path, content).await?;
        }
        self.supervisor.add_layer(LAYER_LABEL, plan, true).await?;
        self.supervisor.replan().await?;
        debug!(services = plan.services.len(), "plan applied");
        Ok(PlanApplied {
            rollout: self,
            plan,
        })
    }

    /// Run every stage to convergence.
    pub async fn run(&self, plan: &DesiredPlan) -> Result<Converged, ReconcileError> {
        self.apply(plan)
            .await?
            .start_primary()
            .await?
            .poll_health()
            .await?
            .start_workers()
            .await
    }
}

/// The plan is merged; nothing has been started by this rollout yet.
pub struct PlanApplied<'c, 'a> {
    rollout: &'c RolloutController<'a>,
    plan: &'c DesiredPlan,
}

impl<'c, 'a> PlanApplied<'c, 'a> {
    pub fn phase(&self) -> RolloutPhase {
        RolloutPhase::PlanApplied
    }

    pub async fn start_primary(self) -> Result<PrimaryStarted<'c, 'a>, ReconcileError> {
        self.rollout.supervisor.start(PRIMARY_SERVICE).await?;
        info!(service = PRIMARY_SERVICE, "started primary service");
        Ok(PrimaryStarted {
            rollout: self.rollout,
            plan: self.plan,
        })
    }
}

/// The primary was asked to start; health is unknown.
pub struct PrimaryStarted<'c, 'a> {
    rollout: &'c RolloutController<'a>,
    plan: &'c DesiredPlan,
}

impl<'c, 'a> PrimaryStarted<'c, 'a> {
    pub fn phase(&self) -> RolloutPhase {
        RolloutPhase::PrimaryStarting
    }

    /// Probe until healthy or until the budget is spent.
    ///
    /// Every failed probe publishes an interim waiting status with the
    /// elapsed seconds.
    pub async fn poll_health(self) -> Result<PrimaryHealthy<'c, 'a>, ReconcileError> {
        let rollout = self.rollout;
        let Some(url) = self.plan.primary_health_url() else {
            return Err(ReconcileError::Internal(
                "plan has no primary health check".to_string(),
            ));
        };

        let started = Instant::now();
        let deadline = started + rollout.settings.budget;
        let mut attempts = 0u32;
        while Instant::now() < deadline {
            attempts += 1;
            match rollout.probe.probe(url).await {
                Ok(()) => {
                    info!(attempts, elapsed_secs = started.elapsed().as_secs(), "platform healthy");
                    return Ok(PrimaryHealthy {
                        rollout,
                        plan: self.plan,
                    });
                }
                Err(e) => {
                    debug!(attempts, error = %e, "platform health probe failed");
                }
            }
            rollout.sink.interim(&ReconcileResult::waiting(format!(
                "waiting for opencti platform to start ({}s)",
                started.elapsed().as_secs()
            )));
            tokio::time::sleep(rollout.settings.interval).await;
        }

        warn!(
            attempts,
            budget_secs = rollout.settings.budget.as_secs(),
            phase = ?RolloutPhase::TimedOut,
            "platform did not become healthy"
        );
        if let Some(watcher) = rollout.watcher {
            if let Err(e) = watcher.arm(url).await {
                warn!(error = %e, "could not arm health watcher");
            }
        }
        Err(ReconcileError::PlatformNotReady(STARTUP_FAILED.to_string()))
    }
}

/// The primary passed its health check.
pub struct PrimaryHealthy<'c, 'a> {
    rollout: &'c RolloutController<'a>,
    plan: &'c DesiredPlan,
}

impl<'c, 'a> PrimaryHealthy<'c, 'a> {
    pub fn phase(&self) -> RolloutPhase {
        RolloutPhase::PrimaryHealthy
    }

    pub async fn start_workers(self) -> Result<Converged, ReconcileError> {
        let workers = self.plan.workers();
        for worker in &workers {
            self.rollout.supervisor.start(worker).await?;
        }
        info!(workers = workers.len(), "started workers");
        Ok(Converged {
            workers: workers.into_iter().map(str::to_string).collect(),
        })
    }
}

/// Every service of the plan has been started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converged {
    pub workers: Vec<String>,
}

impl Converged {
    pub fn phase(&self) -> RolloutPhase {
        RolloutPhase::Converged
    }
}
