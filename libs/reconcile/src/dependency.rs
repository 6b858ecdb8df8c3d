//! Dependency aggregation.
//!
//! Each required relation is classified into a [`DependencyState`]. A ready
//! dependency contributes an environment fragment (and possibly files) to
//! the platform service; the plan builder turns the first non-ready state
//! into the reported reason.

use std::collections::BTreeMap;
use std::fmt;

use octi_id::SecretId;
use octi_secrets::{SecretStore, SecretStoreError};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::snapshot::{DataBag, RelationData, Snapshot};
use crate::ReconcileError;

/// Where the search cluster CA bundle is written inside the workload.
pub const OPENSEARCH_CA_PATH: &str = "/opt/opencti/config/opensearch.pem";

const REDIS_DEFAULT_PORT: u16 = 6379;

/// Required relations, in the order their readiness is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    OpenSearch,
    Redis,
    Amqp,
    S3,
    Ingress,
}

impl Dependency {
    pub const ALL: [Self; 5] = [
        Self::OpenSearch,
        Self::Redis,
        Self::Amqp,
        Self::S3,
        Self::Ingress,
    ];

    /// Relation endpoint name.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::OpenSearch => "opensearch-client",
            Self::Redis => "redis",
            Self::Amqp => "amqp",
            Self::S3 => "s3",
            Self::Ingress => "ingress",
        }
    }

    fn waiting(self) -> String {
        format!("waiting for {} integration", self.endpoint())
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// Environment variables and workload files contributed by one dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFragment {
    pub env: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
}

impl EnvFragment {
    fn with_env<const N: usize>(pairs: [(&str, String); N]) -> Self {
        Self {
            env: pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            files: BTreeMap::new(),
        }
    }
}

/// Classification of one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    Ready(EnvFragment),
    /// `absent` is set when the relation itself is missing rather than
    /// incomplete.
    NotReady { reason: String, absent: bool },
    Invalid { reason: String },
}

impl DependencyState {
    fn absent(dependency: Dependency) -> Self {
        Self::NotReady {
            reason: dependency.waiting(),
            absent: true,
        }
    }

    fn waiting(dependency: Dependency) -> Self {
        Self::NotReady {
            reason: dependency.waiting(),
            absent: false,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotReady { absent: true, .. })
    }

    /// The fragment, or the error this state reports.
    pub fn fragment(&self) -> Result<&EnvFragment, ReconcileError> {
        match self {
            Self::Ready(fragment) => Ok(fragment),
            Self::NotReady { reason, .. } => {
                Err(ReconcileError::IntegrationNotReady(reason.clone()))
            }
            Self::Invalid { reason } => Err(ReconcileError::InvalidIntegration(reason.clone())),
        }
    }
}

/// Initial platform administrator, read from the `admin-user` option.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Result of one aggregation pass.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub states: BTreeMap<Dependency, DependencyState>,
    pub admin: Result<AdminCredentials, ReconcileError>,
}

impl Aggregation {
    /// Dependencies whose relation is absent, in reporting order.
    pub fn missing(&self) -> Vec<Dependency> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_absent())
            .map(|(dependency, _)| *dependency)
            .collect()
    }

    /// Fail with every absent relation named at once.
    pub fn ensure_present(&self) -> Result<(), ReconcileError> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|d| d.endpoint()).collect();
        Err(ReconcileError::MissingIntegration(format!(
            "missing integration(s): {}",
            names.join(", ")
        )))
    }

    pub fn state(&self, dependency: Dependency) -> Option<&DependencyState> {
        self.states.get(&dependency)
    }

    /// Fragment of a ready dependency, or the reason it is not ready.
    pub fn fragment(&self, dependency: Dependency) -> Result<&EnvFragment, ReconcileError> {
        match self.states.get(&dependency) {
            Some(state) => state.fragment(),
            None => Err(ReconcileError::IntegrationNotReady(dependency.waiting())),
        }
    }
}

/// Classifies dependency relations into [`DependencyState`]s.
pub struct DependencyAggregator<'a> {
    secrets: &'a dyn SecretStore,
    app_name: &'a str,
}

impl<'a> DependencyAggregator<'a> {
    pub fn new(secrets: &'a dyn SecretStore, app_name: &'a str) -> Self {
        Self { secrets, app_name }
    }

    /// Classify every dependency and resolve the admin credentials.
    pub async fn aggregate(&self, snapshot: &Snapshot, admin_user: Option<&str>) -> Aggregation {
        let mut states = BTreeMap::new();
        for dependency in Dependency::ALL {
            let state = self
                .classify(dependency, snapshot.relation(dependency.endpoint()))
                .await;
            debug!(dependency = %dependency, state = ?state_name(&state), "classified dependency");
            states.insert(dependency, state);
        }
        Aggregation {
            states,
            admin: self.resolve_admin(admin_user).await,
        }
    }

    /// Classify one dependency relation.
    pub async fn classify(
        &self,
        dependency: Dependency,
        relation: Option<&RelationData>,
    ) -> DependencyState {
        let Some(relation) = relation.filter(|r| r.is_established()) else {
            return DependencyState::absent(dependency);
        };
        let state = match dependency {
            Dependency::OpenSearch => self.opensearch(relation).await,
            Dependency::Redis => redis(relation),
            Dependency::Amqp => self.amqp(relation),
            Dependency::S3 => s3(relation),
            Dependency::Ingress => ingress(relation),
        };
        if let DependencyState::Invalid { reason } = &state {
            error!(dependency = %dependency, relation = %relation.describe(), "{reason}");
        }
        state
    }

    /// Read the initial administrator from the secret the `admin-user`
    /// option points at.
    pub async fn resolve_admin(
        &self,
        admin_user: Option<&str>,
    ) -> Result<AdminCredentials, ReconcileError> {
        let not_a_secret = || ReconcileError::InvalidConfig("admin-user config is not a secret".into());

        let Some(raw) = admin_user.filter(|v| !v.trim().is_empty()) else {
            return Err(ReconcileError::MissingConfig(
                "missing charm config: admin-user".into(),
            ));
        };
        let id = SecretId::parse(raw.trim()).map_err(|_| not_a_secret())?;
        let content = match self.secrets.get(&id, true).await {
            Ok(content) => content,
            Err(SecretStoreError::NotFound(_)) => return Err(not_a_secret()),
            Err(SecretStoreError::PermissionDenied(_)) => {
                return Err(ReconcileError::InvalidConfig(
                    "charm doesn't have access to the admin-user secret, \
                     grant the secret to the application"
                        .into(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let invalid = |_| {
            ReconcileError::InvalidConfig("invalid secret content in admin-user config".into())
        };
        Ok(AdminCredentials {
            email: content.require("email").map_err(invalid)?.to_string(),
            password: content.require("password").map_err(invalid)?.to_string(),
        })
    }

    async fn opensearch(&self, relation: &RelationData) -> DependencyState {
        let dependency = Dependency::OpenSearch;
        let mut data = relation.remote_app_data.clone();

        // Credentials may be published inline or behind secret references.
        for field in ["secret-user", "secret-tls"] {
            let Some(raw) = relation.remote_app_data.get(field) else {
                continue;
            };
            let Ok(id) = SecretId::parse(raw) else {
                return DependencyState::invalid(format!(
                    "invalid opensearch integration: {field} is not a secret"
                ));
            };
            match self.secrets.get(&id, true).await {
                Ok(content) => {
                    for (key, value) in content.iter() {
                        data.insert(key.to_string(), value.to_string());
                    }
                }
                Err(SecretStoreError::NotFound(_)) => {
                    return DependencyState::invalid(format!(
                        "invalid opensearch integration: {field} secret not found"
                    ))
                }
                Err(SecretStoreError::PermissionDenied(_)) => {
                    return DependencyState::invalid(format!(
                        "invalid opensearch integration: access to {field} secret denied"
                    ))
                }
                Err(SecretStoreError::Backend(e)) => {
                    return DependencyState::invalid(format!(
                        "invalid opensearch integration: {e}"
                    ))
                }
            }
        }

        let Some(endpoints) = non_empty(&data, "endpoints") else {
            return DependencyState::waiting(dependency);
        };
        let ca = non_empty(&data, "tls-ca");
        let scheme = if ca.is_some() || non_empty(&data, "tls").is_some() {
            "https"
        } else {
            "http"
        };
        let uris: Vec<String> = endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|e| format!("{scheme}://{e}"))
            .collect();
        if uris.is_empty() {
            return DependencyState::waiting(dependency);
        }
        let Ok(url_list) = serde_json::to_string(&uris) else {
            return DependencyState::invalid("invalid opensearch integration");
        };

        let mut fragment = EnvFragment::with_env([
            ("ELASTICSEARCH__URL", url_list),
            ("ELASTICSEARCH__INDEX_PREFIX", self.app_name.to_string()),
        ]);
        if let Some(ca) = ca {
            fragment
                .files
                .insert(OPENSEARCH_CA_PATH.to_string(), ca.to_string());
            fragment
                .env
                .insert("ELASTICSEARCH__SSL__CA".into(), OPENSEARCH_CA_PATH.into());
        }
        if let Some(username) = non_empty(&data, "username") {
            let Some(password) = data.get("password") else {
                return DependencyState::waiting(dependency);
            };
            fragment
                .env
                .insert("ELASTICSEARCH__USERNAME".into(), username.to_string());
            fragment
                .env
                .insert("ELASTICSEARCH__PASSWORD".into(), password.clone());
        }
        DependencyState::Ready(fragment)
    }

    fn amqp(&self, relation: &RelationData) -> DependencyState {
        let unit = relation.first_unit();
        let hostname = unit.and_then(|d| non_empty(d, "hostname"));
        let password = unit.and_then(|d| non_empty(d, "password"));
        let (Some(hostname), Some(password)) = (hostname, password) else {
            return DependencyState::waiting(Dependency::Amqp);
        };
        DependencyState::Ready(EnvFragment::with_env([
            ("RABBITMQ__HOSTNAME", hostname.to_string()),
            ("RABBITMQ__PORT", "5672".to_string()),
            // The management port is not announced over the relation.
            ("RABBITMQ__PORT_MANAGEMENT", "15672".to_string()),
            ("RABBITMQ__MANAGEMENT_SSL", "false".to_string()),
            ("RABBITMQ__USERNAME", self.app_name.to_string()),
            ("RABBITMQ__PASSWORD", password.to_string()),
        ]))
    }
}

fn redis(relation: &RelationData) -> DependencyState {
    let unit = relation.first_unit();
    let host = non_empty(&relation.remote_app_data, "leader-host")
        .or_else(|| unit.and_then(|d| non_empty(d, "hostname")));
    let port = unit.and_then(|d| non_empty(d, "port"));

    // The provider publishes its address piecemeal; until the host is known
    // the assembled URL degenerates to `redis://None:None`.
    let url = format!(
        "redis://{}:{}",
        host.unwrap_or("None"),
        port.unwrap_or("None")
    );
    if host.is_none() || url == "redis://None:None" {
        return DependencyState::waiting(Dependency::Redis);
    }
    let parsed = match Url::parse(&url) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "unparsable redis address");
            return DependencyState::invalid("invalid redis integration");
        }
    };
    let Some(hostname) = parsed.host_str() else {
        return DependencyState::invalid("invalid redis integration");
    };
    DependencyState::Ready(EnvFragment::with_env([
        ("REDIS__HOSTNAME", hostname.to_string()),
        (
            "REDIS__PORT",
            parsed.port().unwrap_or(REDIS_DEFAULT_PORT).to_string(),
        ),
    ]))
}

fn s3(relation: &RelationData) -> DependencyState {
    let data = &relation.remote_app_data;
    let (Some(access_key), Some(secret_key), Some(endpoint)) = (
        non_empty(data, "access-key"),
        non_empty(data, "secret-key"),
        non_empty(data, "endpoint"),
    ) else {
        return DependencyState::waiting(Dependency::S3);
    };
    let Ok(url) = Url::parse(endpoint) else {
        return DependencyState::invalid("invalid s3 integration");
    };
    let Some(host) = url.host_str().map(str::to_string) else {
        return DependencyState::invalid("invalid s3 integration");
    };
    let tls = url.scheme() == "https";
    let port = url.port().unwrap_or(if tls { 443 } else { 80 });
    DependencyState::Ready(EnvFragment::with_env([
        ("MINIO__ENDPOINT", host),
        ("MINIO__PORT", port.to_string()),
        ("MINIO__USE_SSL", tls.to_string()),
        ("MINIO__ACCESS_KEY", access_key.to_string()),
        ("MINIO__SECRET_KEY", secret_key.to_string()),
    ]))
}

#[derive(Deserialize)]
struct IngressPayload {
    url: String,
}

fn ingress(relation: &RelationData) -> DependencyState {
    let Some(raw) = non_empty(&relation.remote_app_data, "ingress") else {
        return DependencyState::waiting(Dependency::Ingress);
    };
    let Ok(payload) = serde_json::from_str::<IngressPayload>(raw) else {
        return DependencyState::invalid("invalid ingress integration");
    };
    match Url::parse(&payload.url) {
        Ok(url) => DependencyState::Ready(EnvFragment::with_env([(
            "APP__BASE_URL",
            url.to_string(),
        )])),
        Err(_) => DependencyState::invalid("invalid ingress integration"),
    }
}

fn non_empty<'d>(data: &'d DataBag, key: &str) -> Option<&'d str> {
    data.get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn state_name(state: &DependencyState) -> &'static str {
    match state {
        DependencyState::Ready(_) => "ready",
        DependencyState::NotReady { absent: true, .. } => "absent",
        DependencyState::NotReady { .. } => "not_ready",
        DependencyState::Invalid { .. } => "invalid",
    }
}
