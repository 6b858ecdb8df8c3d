use std::collections::BTreeMap;

use octi_id::{RelationId, SecretId};
use octi_reconcile::{DataBag, RelationData, Role, Snapshot, PEER_ENDPOINT};

/// Builds snapshots with realistic relation data for every dependency.
///
/// Relation ids are assigned in call order starting at 1.
#[derive(Debug)]
pub struct SnapshotBuilder {
    snapshot: Snapshot,
    next_id: u64,
}

impl SnapshotBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            snapshot: Snapshot::new(role),
            next_id: 1,
        }
    }

    pub fn leader() -> Self {
        Self::new(Role::Leader)
    }

    pub fn follower() -> Self {
        Self::new(Role::Follower)
    }

    /// Every dependency related and fully published.
    pub fn with_all_dependencies(self) -> Self {
        self.with_opensearch()
            .with_redis()
            .with_amqp()
            .with_s3()
            .with_ingress("http://opencti.example.com")
    }

    fn next_relation(&mut self, remote_app: &str) -> RelationData {
        let mut relation = RelationData::new(RelationId::new(self.next_id));
        self.next_id += 1;
        relation.remote_app = Some(remote_app.to_string());
        relation
    }

    /// Add or replace a dependency relation.
    pub fn with_relation(mut self, endpoint: &str, relation: RelationData) -> Self {
        self.snapshot
            .relations
            .insert(endpoint.to_string(), relation);
        self
    }

    /// A related application whose units have not published anything.
    pub fn with_empty_relation(mut self, endpoint: &str, remote_app: &str) -> Self {
        let mut relation = self.next_relation(remote_app);
        relation
            .remote_units
            .insert(format!("{remote_app}/0"), DataBag::new());
        self.with_relation(endpoint, relation)
    }

    pub fn with_opensearch(mut self) -> Self {
        let mut relation = self.next_relation("opensearch");
        relation.remote_app_data = bag(&[
            ("endpoints", "10.1.0.10:9200,10.1.0.11:9200"),
            ("username", "opencti"),
            ("password", "opensearch-password"),
            ("tls-ca", "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----"),
        ]);
        relation
            .remote_units
            .insert("opensearch/0".into(), DataBag::new());
        self.with_relation("opensearch-client", relation)
    }

    /// Credentials published behind a secret reference.
    pub fn with_opensearch_secret(mut self, secret: &SecretId) -> Self {
        let mut relation = self.next_relation("opensearch");
        relation.remote_app_data = bag(&[
            ("endpoints", "10.1.0.10:9200"),
            ("secret-user", secret.as_str()),
        ]);
        relation
            .remote_units
            .insert("opensearch/0".into(), DataBag::new());
        self.with_relation("opensearch-client", relation)
    }

    pub fn with_redis(mut self) -> Self {
        let mut relation = self.next_relation("redis-k8s");
        relation.remote_app_data = bag(&[("leader-host", "redis-k8s-0.redis-k8s-endpoints")]);
        relation.remote_units.insert(
            "redis-k8s/0".into(),
            bag(&[("hostname", "redis-k8s-0.redis-k8s-endpoints"), ("port", "6379")]),
        );
        self.with_relation("redis", relation)
    }

    pub fn with_amqp(mut self) -> Self {
        let mut relation = self.next_relation("rabbitmq-k8s");
        relation.remote_units.insert(
            "rabbitmq-k8s/0".into(),
            bag(&[("hostname", "rabbitmq-k8s-0"), ("password", "amqp-password")]),
        );
        relation.remote_units.insert(
            "rabbitmq-k8s/1".into(),
            bag(&[("hostname", "rabbitmq-k8s-1"), ("password", "amqp-password")]),
        );
        self.with_relation("amqp", relation)
    }

    pub fn with_s3(mut self) -> Self {
        let mut relation = self.next_relation("s3-integrator");
        relation.remote_app_data = bag(&[
            ("access-key", "s3-access-key"),
            ("secret-key", "s3-secret-key"),
            ("endpoint", "http://minio.example.com:9000"),
            ("bucket", "opencti"),
        ]);
        relation
            .remote_units
            .insert("s3-integrator/0".into(), DataBag::new());
        self.with_relation("s3", relation)
    }

    pub fn with_ingress(mut self, url: &str) -> Self {
        let mut relation = self.next_relation("traefik-k8s");
        let payload = serde_json::json!({ "url": url }).to_string();
        relation.remote_app_data = DataBag::from([("ingress".to_string(), payload)]);
        relation
            .remote_units
            .insert("traefik-k8s/0".into(), DataBag::new());
        self.with_relation("ingress", relation)
    }

    /// The peer relation, with `published` as its application data.
    pub fn with_peer(mut self, published: DataBag) -> Self {
        let mut relation = self.next_relation("opencti");
        relation.local_app_data = published;
        self.with_relation(PEER_ENDPOINT, relation)
    }

    pub fn without(mut self, endpoint: &str) -> Self {
        self.snapshot.relations.remove(endpoint);
        self
    }

    /// Add a connector integration that declared its name and type.
    pub fn with_connector(mut self, id: u64, name: &str, connector_type: &str) -> Self {
        let mut relation = RelationData::new(RelationId::new(id));
        relation.remote_app = Some(format!("opencti-{name}-connector"));
        relation.remote_app_data = bag(&[
            ("connector_charm_name", name),
            ("connector_type", connector_type),
        ]);
        relation
            .remote_units
            .insert(format!("opencti-{name}-connector/0"), DataBag::new());
        self.snapshot.connectors.push(relation);
        self
    }

    /// Add a connector integration that has not declared anything yet.
    pub fn with_undeclared_connector(mut self, id: u64) -> Self {
        let mut relation = RelationData::new(RelationId::new(id));
        relation.remote_app = Some("opencti-pending-connector".into());
        self.snapshot.connectors.push(relation);
        self
    }

    /// Apply previously returned write-backs to the local side of every
    /// matching relation, as the host would. Empty values delete the key.
    pub fn with_writes(mut self, writes: &BTreeMap<RelationId, DataBag>) -> Self {
        let relations = self
            .snapshot
            .relations
            .values_mut()
            .chain(self.snapshot.connectors.iter_mut());
        for relation in relations {
            let Some(data) = writes.get(&relation.id) else {
                continue;
            };
            for (key, value) in data {
                if value.is_empty() {
                    relation.local_app_data.remove(key);
                } else {
                    relation.local_app_data.insert(key.clone(), value.clone());
                }
            }
        }
        self
    }

    pub fn build(self) -> Snapshot {
        self.snapshot
    }
}

fn bag(pairs: &[(&str, &str)]) -> DataBag {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
