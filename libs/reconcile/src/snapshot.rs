//! Point-in-time view of the host that one reconcile invocation works from.
//!
//! The host adapter builds a [`Snapshot`] before every invocation; the
//! controller never reads host state any other way.

use std::collections::BTreeMap;

use octi_id::RelationId;
use serde::{Deserialize, Serialize};

/// Flat string map published on one side of a relation.
pub type DataBag = BTreeMap<String, String>;

/// Whether this unit may mutate application-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn is_leader(self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// One relation as seen from this application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationData {
    /// Host-assigned relation id.
    pub id: RelationId,

    /// Name of the application on the other side, once known.
    #[serde(default)]
    pub remote_app: Option<String>,

    /// Application-level data published by the remote side.
    #[serde(default)]
    pub remote_app_data: DataBag,

    /// Per-unit data published by remote units, keyed by unit name
    /// (`<app>/<n>`).
    #[serde(default)]
    pub remote_units: BTreeMap<String, DataBag>,

    /// Application-level data this application published.
    #[serde(default)]
    pub local_app_data: DataBag,
}

impl RelationData {
    pub fn new(id: RelationId) -> Self {
        Self {
            id,
            remote_app: None,
            remote_app_data: DataBag::new(),
            remote_units: BTreeMap::new(),
            local_app_data: DataBag::new(),
        }
    }

    /// A relation counts as present only once the remote application and
    /// at least one remote unit have joined.
    pub fn is_established(&self) -> bool {
        self.remote_app.is_some() && !self.remote_units.is_empty()
    }

    /// Remote units ordered by unit number rather than lexically, so that
    /// `app/10` sorts after `app/9`.
    pub fn units_in_order(&self) -> Vec<(&str, &DataBag)> {
        let mut units: Vec<_> = self
            .remote_units
            .iter()
            .map(|(name, data)| (name.as_str(), data))
            .collect();
        units.sort_by_key(|(name, _)| unit_number(name));
        units
    }

    /// Data of the lowest-numbered remote unit.
    pub fn first_unit(&self) -> Option<&DataBag> {
        self.units_in_order().first().map(|(_, data)| *data)
    }

    /// Key-only rendering for logs; values may be credentials.
    pub fn describe(&self) -> String {
        let units: Vec<String> = self
            .units_in_order()
            .iter()
            .map(|(name, data)| format!("{name}{:?}", data.keys().collect::<Vec<_>>()))
            .collect();
        format!(
            "relation {} remote_app={:?} app_keys={:?} units=[{}]",
            self.id,
            self.remote_app,
            self.remote_app_data.keys().collect::<Vec<_>>(),
            units.join(", ")
        )
    }
}

fn unit_number(name: &str) -> (u64, String) {
    let number = name
        .rsplit_once('/')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(u64::MAX);
    (number, name.to_string())
}

/// Everything one invocation may observe about its surroundings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub role: Role,

    /// Single-instance dependency relations keyed by endpoint name.
    #[serde(default)]
    pub relations: BTreeMap<String, RelationData>,

    /// Every connector integration currently related.
    #[serde(default)]
    pub connectors: Vec<RelationData>,
}

impl Snapshot {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            relations: BTreeMap::new(),
            connectors: Vec::new(),
        }
    }

    /// Look up a dependency relation by endpoint name.
    pub fn relation(&self, endpoint: &str) -> Option<&RelationData> {
        self.relations.get(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_ordered_numerically() {
        let mut relation = RelationData::new(RelationId::new(1));
        for unit in ["rabbitmq/10", "rabbitmq/2", "rabbitmq/9"] {
            relation
                .remote_units
                .insert(unit.to_string(), DataBag::from([("hostname".into(), unit.into())]));
        }
        let names: Vec<_> = relation.units_in_order().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["rabbitmq/2", "rabbitmq/9", "rabbitmq/10"]);
        assert_eq!(
            relation.first_unit().and_then(|d| d.get("hostname")).map(String::as_str),
            Some("rabbitmq/2")
        );
    }

    #[test]
    fn test_established_requires_remote_units() {
        let mut relation = RelationData::new(RelationId::new(1));
        relation.remote_app = Some("redis-k8s".into());
        assert!(!relation.is_established());
        relation.remote_units.insert("redis-k8s/0".into(), DataBag::new());
        assert!(relation.is_established());
    }

    #[test]
    fn test_describe_hides_values() {
        let mut relation = RelationData::new(RelationId::new(3));
        relation
            .remote_app_data
            .insert("secret-key".into(), "hunter2".into());
        let text = relation.describe();
        assert!(text.contains("secret-key"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_snapshot_from_json() {
        let snapshot: Snapshot = serde_json::from_str(
            r#"{"role": "leader", "relations": {"redis": {"id": 4, "remote_app": "redis-k8s"}}}"#,
        )
        .unwrap();
        assert!(snapshot.role.is_leader());
        assert_eq!(snapshot.relation("redis").unwrap().id, RelationId::new(4));
        assert!(snapshot.connectors.is_empty());
    }
}
