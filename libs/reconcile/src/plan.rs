//! Desired supervisor plan and the pure builder that derives it.
//!
//! The plan is a pure function of its inputs: maps are ordered and no
//! timestamps or random values are introduced, so the same inputs always
//! serialize to the same bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bundle::PeerSecretBundle;
use crate::config::ControllerConfig;
use crate::dependency::{Aggregation, Dependency};
use crate::hash::SpecHash;
use crate::ReconcileError;

/// Name of the primary platform service.
pub const PRIMARY_SERVICE: &str = "platform";

/// Name of the platform readiness check.
pub const PRIMARY_CHECK: &str = "platform";

/// How a layer entry merges with an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Override {
    Merge,
    Replace,
}

/// Whether the supervisor starts a service on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Startup {
    Enabled,
    Disabled,
}

/// What the supervisor does when a service exits with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    Restart,
    Shutdown,
    Ignore,
}

/// One supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceSpec {
    #[serde(rename = "override")]
    pub override_: Override,
    pub summary: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Startup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<OnFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Start ordering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

/// HTTP probe target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheck {
    pub url: String,
}

/// One supervisor health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    #[serde(rename = "override")]
    pub override_: Override,
    pub level: String,
    pub http: HttpCheck,
    pub period: String,
    pub timeout: String,
    pub threshold: u32,
}

/// Everything the supervisor should run, plus files to push first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredPlan {
    pub summary: String,
    pub description: String,
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, CheckSpec>,
    /// Workload path to file content.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

impl DesiredPlan {
    /// Canonical serialized form.
    pub fn to_canonical_json(&self) -> Result<String, ReconcileError> {
        crate::hash::canonical_json(self).map_err(|e| ReconcileError::Internal(e.to_string()))
    }

    pub fn spec_hash(&self) -> Result<SpecHash, ReconcileError> {
        SpecHash::of(self).map_err(|e| ReconcileError::Internal(e.to_string()))
    }

    /// URL of the readiness check gating worker start-up.
    pub fn primary_health_url(&self) -> Option<&str> {
        self.checks.get(PRIMARY_CHECK).map(|c| c.http.url.as_str())
    }

    /// Services that require the primary, in name order.
    pub fn workers(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, spec)| spec.requires.iter().any(|r| r == PRIMARY_SERVICE))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

const PLATFORM_ENV: [(&str, &str); 6] = [
    ("NODE_OPTIONS", "--max-old-space-size=8096"),
    ("NODE_ENV", "production"),
    ("PYTHONUNBUFFERED", "1"),
    ("APP__APP_LOGS__LOGS_LEVEL", "info"),
    ("PROVIDERS__LOCAL__STRATEGY", "LocalStrategy"),
    ("APP__TELEMETRY__METRICS__ENABLED", "true"),
];

/// Derives the [`DesiredPlan`] from resolved inputs.
pub struct PlanBuilder<'a> {
    config: &'a ControllerConfig,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// Build the plan, failing with the first unmet prerequisite.
    ///
    /// Prerequisites are checked in a fixed order: relation presence, the
    /// admin-user option, then each dependency.
    pub fn build(
        &self,
        bundle: &PeerSecretBundle,
        aggregation: &Aggregation,
    ) -> Result<DesiredPlan, ReconcileError> {
        aggregation.ensure_present()?;
        let admin = aggregation.admin.clone()?;

        let mut environment: BTreeMap<String, String> = PLATFORM_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment.insert("APP__PORT".into(), self.config.platform_port.to_string());
        environment.insert("APP__ADMIN__EMAIL".into(), admin.email);
        environment.insert("APP__ADMIN__PASSWORD".into(), admin.password);
        environment.insert("APP__ADMIN__TOKEN".into(), bundle.admin_token.clone());
        environment.insert(
            "APP__HEALTH_ACCESS_KEY".into(),
            bundle.health_access_key.clone(),
        );

        let mut files = BTreeMap::new();
        for dependency in [
            Dependency::OpenSearch,
            Dependency::Amqp,
            Dependency::Redis,
            Dependency::S3,
            Dependency::Ingress,
        ] {
            let fragment = aggregation.fragment(dependency)?;
            environment.extend(fragment.env.clone());
            files.extend(fragment.files.clone());
        }

        let mut services = BTreeMap::new();
        services.insert(
            PRIMARY_SERVICE.to_string(),
            ServiceSpec {
                override_: Override::Replace,
                summary: "OpenCTI platform service".to_string(),
                command: "node build/back.js".to_string(),
                startup: None,
                on_failure: None,
                working_dir: Some("/opt/opencti".to_string()),
                environment,
                after: Vec::new(),
                requires: Vec::new(),
            },
        );
        for i in 0..self.config.worker_count {
            services.insert(format!("worker-{i}"), self.worker(bundle));
        }

        let mut checks = BTreeMap::new();
        checks.insert(
            PRIMARY_CHECK.to_string(),
            CheckSpec {
                override_: Override::Replace,
                level: "ready".to_string(),
                http: HttpCheck {
                    url: format!(
                        "{}/health?health_access_key={}",
                        self.config.platform_url(),
                        bundle.health_access_key
                    ),
                },
                period: "1m".to_string(),
                timeout: "5s".to_string(),
                threshold: 5,
            },
        );

        Ok(DesiredPlan {
            summary: "OpenCTI platform".to_string(),
            description: "OpenCTI platform and workers".to_string(),
            services,
            checks,
            files,
        })
    }

    fn worker(&self, bundle: &PeerSecretBundle) -> ServiceSpec {
        let environment = BTreeMap::from([
            ("OPENCTI_URL".to_string(), self.config.platform_url()),
            ("OPENCTI_TOKEN".to_string(), bundle.admin_token.clone()),
            ("WORKER_LOG_LEVEL".to_string(), "info".to_string()),
        ]);
        ServiceSpec {
            override_: Override::Replace,
            summary: "OpenCTI platform worker".to_string(),
            command: "python3 worker.py".to_string(),
            startup: None,
            on_failure: None,
            working_dir: Some("/opt/opencti-worker".to_string()),
            environment,
            after: vec![PRIMARY_SERVICE.to_string()],
            requires: vec![PRIMARY_SERVICE.to_string()],
        }
    }
}
