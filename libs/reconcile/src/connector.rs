//! Connector-side reconciler.
//!
//! A connector workload announces itself over its `opencti-connector`
//! relation, waits for the platform to publish a URL and a token secret,
//! then runs a single supervised `connector` service. Every unmet
//! prerequisite is reported as waiting, except running more than one unit,
//! which blocks.

use std::collections::BTreeMap;

use octi_id::{ConnectorId, SecretId};
use octi_secrets::{SecretStore, SecretStoreError};
use tracing::{debug, info};

use crate::access::{
    CONNECTOR_NAME_FIELD, CONNECTOR_TYPE_FIELD, TOKEN_FIELD, TOKEN_SECRET_KEY, URL_FIELD,
};
use crate::plan::{DesiredPlan, OnFailure, Override, ServiceSpec, Startup};
use crate::snapshot::{DataBag, RelationData, Role};
use crate::status::{ReconcileResult, StatusProjector};
use crate::supervisor::Supervisor;
use crate::ReconcileError;

/// Relation endpoint shared with the platform.
pub const CONNECTOR_ENDPOINT: &str = "opencti-connector";

/// Local relation field with the connector's own id.
pub const CONNECTOR_ID_FIELD: &str = "connector_id";

/// Supervisor layer label and service name.
pub const CONNECTOR_SERVICE: &str = "connector";

/// Reported when the connector application is scaled beyond one unit.
pub const SINGLE_UNIT_ONLY: &str =
    "connector charm cannot have multiple units, scale down using the `juju scale` command";

/// Reported while the connector container cannot be reached.
pub const CONNECTOR_CONTAINER_NOT_READY: &str = "waiting for container ready";

/// How boolean option values are written into the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanStyle {
    /// `true` / `false`
    Json,
    /// `True` / `False`
    Python,
}

/// A known connector and what it declares to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorKind {
    pub charm_name: &'static str,
    pub connector_type: &'static str,
    /// Fixed `CONNECTOR_SCOPE` for connectors that need one.
    pub scope: Option<&'static str>,
    pub boolean_style: BooleanStyle,
}

const fn kind(
    charm_name: &'static str,
    connector_type: &'static str,
    scope: Option<&'static str>,
) -> ConnectorKind {
    ConnectorKind {
        charm_name,
        connector_type,
        scope,
        boolean_style: BooleanStyle::Json,
    }
}

const fn python_booleans(kind: ConnectorKind) -> ConnectorKind {
    ConnectorKind {
        boolean_style: BooleanStyle::Python,
        ..kind
    }
}

/// Known connectors.
pub const CATALOG: &[ConnectorKind] = &[
    kind("alienvault", "EXTERNAL_IMPORT", None),
    kind("crowdstrike", "EXTERNAL_IMPORT", Some("crowdstrike")),
    kind("cyber-campaign", "EXTERNAL_IMPORT", None),
    kind("export-file-csv", "INTERNAL_EXPORT_FILE", None),
    kind("export-file-stix", "INTERNAL_EXPORT_FILE", None),
    kind("export-file-txt", "INTERNAL_EXPORT_FILE", None),
    kind("import-document", "INTERNAL_IMPORT_FILE", None),
    kind("import-file-stix", "INTERNAL_IMPORT_FILE", None),
    kind("ipinfo", "INTERNAL_ENRICHMENT", None),
    kind("misp-feed", "EXTERNAL_IMPORT", None),
    kind("mitre", "EXTERNAL_IMPORT", None),
    kind("nti", "EXTERNAL_IMPORT", Some("nti")),
    kind("urlhaus", "EXTERNAL_IMPORT", None),
    kind("urlscan", "EXTERNAL_IMPORT", Some("threatmatch")),
    kind("urlscan-enrichment", "INTERNAL_ENRICHMENT", None),
    python_booleans(kind("virustotal-livehunt", "EXTERNAL_IMPORT", None)),
    python_booleans(kind("virustotal-livehunt-notifications", "EXTERNAL_IMPORT", None)),
    kind("woap", "EXTERNAL_IMPORT", Some("woap")),
];

/// Look up a catalog entry by connector name.
pub fn lookup(charm_name: &str) -> Option<&'static ConnectorKind> {
    CATALOG.iter().find(|k| k.charm_name == charm_name)
}

/// `kebab-case` option name to the `CONSTANT_CASE` variable name.
pub fn kebab_to_constant(name: &str) -> String {
    name.replace('-', "_").to_uppercase()
}

/// A declared configuration option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOption {
    pub name: String,
    pub optional: bool,
}

/// A configured option value. Unset options have no value at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Text(String),
}

impl OptionValue {
    pub fn render(&self, style: BooleanStyle) -> String {
        match (self, style) {
            (Self::Bool(true), BooleanStyle::Json) => "true".to_string(),
            (Self::Bool(false), BooleanStyle::Json) => "false".to_string(),
            (Self::Bool(true), BooleanStyle::Python) => "True".to_string(),
            (Self::Bool(false), BooleanStyle::Python) => "False".to_string(),
            (Self::Text(text), _) => text.clone(),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Outbound proxy configuration of the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
    /// Comma-separated exemptions.
    pub no_proxy: Option<String>,
}

impl ProxySettings {
    /// Proxy variables for the workload, in both letter cases. Whenever a
    /// proxy is set, the platform host is added to the exemptions.
    pub fn environment(&self, platform_url: &str) -> BTreeMap<String, String> {
        let set = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
        let mut environment = BTreeMap::new();
        let http = set(&self.http);
        let https = set(&self.https);
        if let Some(proxy) = &http {
            environment.insert("HTTP_PROXY".to_string(), proxy.clone());
            environment.insert("http_proxy".to_string(), proxy.clone());
        }
        if let Some(proxy) = &https {
            environment.insert("HTTPS_PROXY".to_string(), proxy.clone());
            environment.insert("https_proxy".to_string(), proxy.clone());
        }
        if http.is_none() && https.is_none() {
            return environment;
        }

        let mut exempt: Vec<String> = set(&self.no_proxy)
            .map(|list| list.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(host) = url::Url::parse(platform_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
        {
            exempt.push(host);
        }
        let exempt = exempt.join(",");
        environment.insert("NO_PROXY".to_string(), exempt.clone());
        environment.insert("no_proxy".to_string(), exempt);
        environment
    }
}

/// Options declared by the connector and the values currently set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSettings {
    pub app_name: String,
    /// Units the host plans for this application.
    pub planned_units: u32,
    pub options: Vec<ConfigOption>,
    pub values: BTreeMap<String, OptionValue>,
    pub proxy: ProxySettings,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            planned_units: 1,
            options: Vec::new(),
            values: BTreeMap::new(),
            proxy: ProxySettings::default(),
        }
    }
}

impl ConnectorSettings {
    fn missing(&self) -> Vec<&str> {
        self.options
            .iter()
            .filter(|o| !o.optional && !self.values.contains_key(&o.name))
            .map(|o| o.name.as_str())
            .collect()
    }
}

/// Result of one connector invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorOutcome {
    pub result: ReconcileResult,
    /// Local relation data to publish; empty for followers.
    pub relation_writes: DataBag,
    pub plan: Option<DesiredPlan>,
}

/// Reconciles one connector workload.
pub struct ConnectorReconciler<'a> {
    kind: &'a ConnectorKind,
    secrets: &'a dyn SecretStore,
    supervisor: &'a dyn Supervisor,
}

impl<'a> ConnectorReconciler<'a> {
    pub fn new(
        kind: &'a ConnectorKind,
        secrets: &'a dyn SecretStore,
        supervisor: &'a dyn Supervisor,
    ) -> Self {
        Self {
            kind,
            secrets,
            supervisor,
        }
    }

    pub async fn reconcile(
        &self,
        role: Role,
        relation: Option<&RelationData>,
        settings: &ConnectorSettings,
    ) -> Result<ConnectorOutcome, ReconcileError> {
        let mut outcome = ConnectorOutcome {
            result: ReconcileResult::Active,
            relation_writes: DataBag::new(),
            plan: None,
        };
        let run = self.run(role, relation, settings, &mut outcome).await;
        outcome.result = StatusProjector::project(run)?;
        Ok(outcome)
    }

    async fn run(
        &self,
        role: Role,
        relation: Option<&RelationData>,
        settings: &ConnectorSettings,
        outcome: &mut ConnectorOutcome,
    ) -> Result<(), ReconcileError> {
        if settings.planned_units != 1 {
            return Err(ReconcileError::InvalidConfig(SINGLE_UNIT_ONLY.to_string()));
        }
        let missing = settings.missing();
        if !missing.is_empty() {
            return Err(ReconcileError::IntegrationNotReady(format!(
                "missing configurations: {}",
                missing.join(", ")
            )));
        }
        let Some(relation) = relation else {
            return Err(ReconcileError::IntegrationNotReady(format!(
                "missing {CONNECTOR_ENDPOINT} integration"
            )));
        };

        let mut connector_id = relation.local_app_data.get(CONNECTOR_ID_FIELD).cloned();
        if role.is_leader() {
            let id = connector_id.get_or_insert_with(|| ConnectorId::new().to_string());
            outcome.relation_writes = DataBag::from([
                (CONNECTOR_NAME_FIELD.to_string(), self.kind.charm_name.to_string()),
                (CONNECTOR_TYPE_FIELD.to_string(), self.kind.connector_type.to_string()),
                (CONNECTOR_ID_FIELD.to_string(), id.clone()),
            ]);
        }

        if !self.supervisor.can_connect().await {
            return Err(ReconcileError::ContainerNotReady(
                CONNECTOR_CONTAINER_NOT_READY.to_string(),
            ));
        }

        let waiting =
            || ReconcileError::IntegrationNotReady(format!("waiting for {CONNECTOR_ENDPOINT} integration"));
        let Some(connector_id) = connector_id else {
            return Err(waiting());
        };
        let published = |key: &str| {
            relation
                .remote_app_data
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
        };
        let (Some(url), Some(token_ref)) = (published(URL_FIELD), published(TOKEN_FIELD)) else {
            return Err(waiting());
        };
        let token_id = SecretId::parse(&token_ref).map_err(|_| waiting())?;
        let token = match self.secrets.get(&token_id, true).await {
            Ok(content) => content
                .get(TOKEN_SECRET_KEY)
                .map(str::to_string)
                .ok_or_else(waiting)?,
            Err(SecretStoreError::NotFound(_) | SecretStoreError::PermissionDenied(_)) => {
                debug!(secret_id = %token_id, "connector token not readable yet");
                return Err(waiting());
            }
            Err(e) => return Err(e.into()),
        };

        let proxy = settings.proxy.environment(&url);
        let mut environment = BTreeMap::from([
            ("OPENCTI_URL".to_string(), url),
            ("OPENCTI_TOKEN".to_string(), token),
            ("CONNECTOR_ID".to_string(), connector_id),
            ("CONNECTOR_NAME".to_string(), settings.app_name.clone()),
            ("CONNECTOR_TYPE".to_string(), self.kind.connector_type.to_string()),
        ]);
        for (name, value) in &settings.values {
            environment.insert(kebab_to_constant(name), value.render(self.kind.boolean_style));
        }
        environment.extend(proxy);
        if let Some(scope) = self.kind.scope {
            environment.insert("CONNECTOR_SCOPE".to_string(), scope.to_string());
        }

        let plan = DesiredPlan {
            summary: self.kind.charm_name.to_string(),
            description: self.kind.charm_name.to_string(),
            services: BTreeMap::from([(
                CONNECTOR_SERVICE.to_string(),
                ServiceSpec {
                    override_: Override::Replace,
                    summary: self.kind.charm_name.to_string(),
                    command: "bash /entrypoint.sh".to_string(),
                    startup: Some(Startup::Enabled),
                    on_failure: Some(OnFailure::Restart),
                    working_dir: None,
                    environment,
                    after: Vec::new(),
                    requires: Vec::new(),
                },
            )]),
            checks: BTreeMap::new(),
            files: BTreeMap::new(),
        };
        self.supervisor
            .add_layer(CONNECTOR_SERVICE, &plan, true)
            .await?;
        self.supervisor.replan().await?;
        info!(connector = self.kind.charm_name, "connector service planned");
        outcome.plan = Some(plan);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog() {
        assert_eq!(
            lookup("export-file-stix").map(|k| k.connector_type),
            Some("INTERNAL_EXPORT_FILE")
        );
        assert_eq!(lookup("crowdstrike").and_then(|k| k.scope), Some("crowdstrike"));
        assert!(lookup("unknown").is_none());
    }

    #[test]
    fn test_kebab_to_constant() {
        assert_eq!(kebab_to_constant("crowdstrike-client-id"), "CROWDSTRIKE_CLIENT_ID");
        assert_eq!(kebab_to_constant("connector-log-level"), "CONNECTOR_LOG_LEVEL");
    }

    #[test]
    fn test_missing_options_in_declared_order() {
        let settings = ConnectorSettings {
            app_name: "crowdstrike".into(),
            options: vec![
                ConfigOption { name: "client-secret".into(), optional: false },
                ConfigOption { name: "interval".into(), optional: true },
                ConfigOption { name: "client-id".into(), optional: false },
            ],
            ..Default::default()
        };
        assert_eq!(settings.missing(), ["client-secret", "client-id"]);
    }

    #[test]
    fn test_boolean_styles() {
        assert_eq!(OptionValue::Bool(true).render(BooleanStyle::Json), "true");
        assert_eq!(OptionValue::Bool(false).render(BooleanStyle::Python), "False");
        assert_eq!(OptionValue::from("True").render(BooleanStyle::Json), "True");
        assert_eq!(
            lookup("virustotal-livehunt").map(|k| k.boolean_style),
            Some(BooleanStyle::Python)
        );
        assert_eq!(lookup("urlhaus").map(|k| k.boolean_style), Some(BooleanStyle::Json));
    }

    #[test]
    fn test_proxy_environment() {
        let proxy = ProxySettings {
            http: Some("http://squid.internal:3128".into()),
            https: None,
            no_proxy: Some("10.0.0.0/8,.svc".into()),
        };
        let env = proxy.environment("http://opencti.example.com:8080/");
        assert_eq!(env["HTTP_PROXY"], "http://squid.internal:3128");
        assert_eq!(env["http_proxy"], "http://squid.internal:3128");
        assert!(!env.contains_key("HTTPS_PROXY"));
        assert_eq!(env["NO_PROXY"], "10.0.0.0/8,.svc,opencti.example.com");
        assert_eq!(env["no_proxy"], env["NO_PROXY"]);

        let unset = ProxySettings {
            no_proxy: Some(".svc".into()),
            ..Default::default()
        };
        assert!(unset.environment("http://opencti.example.com/").is_empty());
    }
}
