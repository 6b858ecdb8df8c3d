//! Host integration.
//!
//! The host invokes the operator once per event. Every event leads to the
//! same level-triggered reconcile call; the only event with extra work is
//! the loss of the peer relation, which tears down the peer secret bundle
//! first.
//!
//! State shared between units travels through the host: peer data changes
//! come back as writes on the peer relation, and changes to owned secrets
//! come back as journaled operations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use octi_id::{RelationId, SecretId};
use octi_reconcile::connector::{ConfigOption, OptionValue, ProxySettings};
use octi_reconcile::{
    Collaborators, ConnectorOutcome, ConnectorSettings, Controller, ControllerConfig, DataBag,
    ReconcileError, ReconcileOutcome, ReconcileResult, RelationData, RelationPeerStore, Role,
    SecretManager, Snapshot, PEER_ENDPOINT,
};
use octi_secrets::SecretContent;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::{JournalEntry, SecretOp};

const RELATION_HOOKS: [&str; 4] = ["created", "joined", "changed", "departed"];

/// An event delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Install,
    ConfigChanged,
    LeaderElected,
    UpgradeCharm,
    UpdateStatus,
    WorkloadReady,
    SecretChanged,
    /// The degraded health watcher saw the platform come up.
    HealthRestored,
    RelationChanged(String),
    RelationBroken(String),
    PeerBroken,
    Other(String),
}

/// What an event requires besides reconciling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    Reconcile,
    TeardownThenReconcile,
}

impl HostEvent {
    pub fn action(&self) -> HostAction {
        match self {
            Self::PeerBroken => HostAction::TeardownThenReconcile,
            _ => HostAction::Reconcile,
        }
    }
}

impl FromStr for HostEvent {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event = match s {
            "install" => Self::Install,
            "config-changed" => Self::ConfigChanged,
            "leader-elected" => Self::LeaderElected,
            "upgrade-charm" => Self::UpgradeCharm,
            "update-status" => Self::UpdateStatus,
            "opencti-pebble-ready" => Self::WorkloadReady,
            "secret-changed" => Self::SecretChanged,
            "health-restored" => Self::HealthRestored,
            other => match other.rsplit_once("-relation-") {
                Some((endpoint, "broken")) if endpoint == PEER_ENDPOINT => Self::PeerBroken,
                Some((endpoint, "broken")) => Self::RelationBroken(endpoint.to_string()),
                Some((endpoint, hook)) if RELATION_HOOKS.contains(&hook) => {
                    Self::RelationChanged(endpoint.to_string())
                }
                _ => Self::Other(other.to_string()),
            },
        };
        Ok(event)
    }
}

impl fmt::Display for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => f.write_str("install"),
            Self::ConfigChanged => f.write_str("config-changed"),
            Self::LeaderElected => f.write_str("leader-elected"),
            Self::UpgradeCharm => f.write_str("upgrade-charm"),
            Self::UpdateStatus => f.write_str("update-status"),
            Self::WorkloadReady => f.write_str("opencti-pebble-ready"),
            Self::SecretChanged => f.write_str("secret-changed"),
            Self::HealthRestored => f.write_str("health-restored"),
            Self::RelationChanged(endpoint) => write!(f, "{endpoint}-relation-changed"),
            Self::RelationBroken(endpoint) => write!(f, "{endpoint}-relation-broken"),
            Self::PeerBroken => write!(f, "{PEER_ENDPOINT}-relation-broken"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// What the host hands over for one platform invocation.
///
/// The peer relation, when it exists, is one of the snapshot's relations
/// under [`PEER_ENDPOINT`].
#[derive(Debug, Clone, Deserialize)]
pub struct HostInput {
    #[serde(flatten)]
    pub snapshot: Snapshot,

    /// Every secret this unit can read, owned ones included.
    #[serde(default)]
    pub secrets: BTreeMap<SecretId, SecretContent>,
}

/// What the operator hands back after one platform invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostReport {
    pub event: String,
    pub status: ReconcileResult,
    pub spec_hash: Option<String>,
    /// Local relation data to publish, peer relation included. An empty
    /// value deletes the key.
    pub relation_writes: BTreeMap<RelationId, DataBag>,
    pub accounts: BTreeMap<RelationId, Option<String>>,
    /// Owned-secret changes the host must apply, oldest first.
    pub secret_ops: Vec<SecretOp>,
    #[serde(skip)]
    journal_seq: Option<i64>,
}

impl HostReport {
    pub fn new(
        event: &HostEvent,
        outcome: &ReconcileOutcome,
        peer: &RelationPeerStore,
        journal: Vec<JournalEntry>,
    ) -> Self {
        let mut relation_writes = outcome.relation_writes.clone();
        let peer_writes = peer.writes();
        if let (Some(id), false) = (peer.relation_id(), peer_writes.is_empty()) {
            relation_writes.entry(id).or_default().extend(peer_writes);
        }
        Self {
            event: event.to_string(),
            status: outcome.result.clone(),
            spec_hash: outcome.spec_hash.as_ref().map(ToString::to_string),
            relation_writes,
            accounts: outcome.accounts.clone(),
            journal_seq: journal.last().map(|entry| entry.seq),
            secret_ops: journal.into_iter().map(|entry| entry.op).collect(),
        }
    }

    /// Last journal sequence carried by this report; acknowledge it once
    /// the report has been handed over.
    pub fn journal_seq(&self) -> Option<i64> {
        self.journal_seq
    }
}

fn default_true() -> bool {
    true
}

fn default_units() -> u32 {
    1
}

/// A declared option. Only options explicitly marked `optional: false`
/// are required.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionInput {
    pub name: String,
    #[serde(default = "default_true")]
    pub optional: bool,
}

/// What the host hands over for one connector invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorInput {
    pub role: Role,
    #[serde(default)]
    pub relation: Option<RelationData>,
    pub app_name: String,
    #[serde(default = "default_units")]
    pub planned_units: u32,
    #[serde(default)]
    pub options: Vec<OptionInput>,
    /// Option values as typed by the host; `null` means unset.
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub secrets: BTreeMap<SecretId, SecretContent>,
}

fn option_value(value: &serde_json::Value) -> Option<OptionValue> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(flag) => Some(OptionValue::Bool(*flag)),
        serde_json::Value::String(text) => Some(OptionValue::Text(text.clone())),
        other => Some(OptionValue::Text(other.to_string())),
    }
}

impl ConnectorInput {
    pub fn settings(&self, proxy: &ProxySettings) -> ConnectorSettings {
        ConnectorSettings {
            app_name: self.app_name.clone(),
            planned_units: self.planned_units,
            options: self
                .options
                .iter()
                .map(|o| ConfigOption {
                    name: o.name.clone(),
                    optional: o.optional,
                })
                .collect(),
            values: self
                .values
                .iter()
                .filter_map(|(name, value)| Some((name.clone(), option_value(value)?)))
                .collect(),
            proxy: proxy.clone(),
        }
    }
}

/// What the operator hands back after one connector invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorReport {
    pub status: ReconcileResult,
    pub relation_writes: DataBag,
}

impl From<&ConnectorOutcome> for ConnectorReport {
    fn from(outcome: &ConnectorOutcome) -> Self {
        Self {
            status: outcome.result.clone(),
            relation_writes: outcome.relation_writes.clone(),
        }
    }
}

/// Read a JSON document written by the host.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write a JSON document for the host.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Handle one platform event.
pub async fn handle_event(
    config: &ControllerConfig,
    deps: Collaborators<'_>,
    event: &HostEvent,
    snapshot: &Snapshot,
) -> Result<ReconcileOutcome, ReconcileError> {
    info!(event = %event, "handling host event");
    if event.action() == HostAction::TeardownThenReconcile {
        SecretManager::new(deps.secrets, deps.peer)
            .teardown(snapshot.role)
            .await?;
    }
    Controller::new(config, deps).reconcile(snapshot).await
}
