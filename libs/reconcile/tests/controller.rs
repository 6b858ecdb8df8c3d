use octi_id::{RelationId, SecretId};
use octi_reconcile::access::{TOKEN_FIELD, URL_FIELD};
use octi_reconcile::plan::PRIMARY_SERVICE;
use octi_reconcile::{
    AccountStatus, Collaborators, Controller, ControllerConfig, InMemoryPeerStore,
    ReconcileError, ReconcileOutcome, ReconcileResult, RolloutPhase, Snapshot,
};
use octi_secrets::{GrantScope, InMemorySecretStore, SecretContent, SecretStore};
use octi_testing::{
    FakeDirectory, FakeDirectoryProvider, FakeSupervisor, RecordingSink, RecordingWatcher,
    ScriptedProbe, SnapshotBuilder, SupervisorCall,
};
use rstest::rstest;

const ADMIN_SECRET: &str = "secret:admin-user";

struct Harness {
    config: ControllerConfig,
    supervisor: FakeSupervisor,
    probe: ScriptedProbe,
    secrets: InMemorySecretStore,
    peer: InMemoryPeerStore,
    directory: FakeDirectory,
    provider: FakeDirectoryProvider,
    sink: RecordingSink,
    watcher: RecordingWatcher,
}

impl Harness {
    async fn new() -> Self {
        Self::with_probe(ScriptedProbe::healthy()).await
    }

    async fn with_probe(probe: ScriptedProbe) -> Self {
        let secrets = InMemorySecretStore::new();
        secrets
            .insert(
                SecretId::parse(ADMIN_SECRET).unwrap(),
                SecretContent::try_from_iter([
                    ("email", "admin@example.com"),
                    ("password", "admin-password"),
                ])
                .unwrap(),
            )
            .await;
        let directory = FakeDirectory::new();
        Self {
            config: ControllerConfig {
                admin_user: Some(ADMIN_SECRET.to_string()),
                ..Default::default()
            },
            supervisor: FakeSupervisor::new(),
            probe,
            secrets,
            peer: InMemoryPeerStore::new(),
            provider: FakeDirectoryProvider::new(directory.clone()),
            directory,
            sink: RecordingSink::new(),
            watcher: RecordingWatcher::new(),
        }
    }

    async fn reconcile(&self, snapshot: &Snapshot) -> Result<ReconcileOutcome, ReconcileError> {
        let deps = Collaborators {
            supervisor: &self.supervisor,
            probe: &self.probe,
            secrets: &self.secrets,
            peer: &self.peer,
            directory: &self.provider,
            sink: &self.sink,
            watcher: Some(&self.watcher),
        };
        Controller::new(&self.config, deps).reconcile(snapshot).await
    }
}

#[tokio::test]
async fn test_full_rollout_reaches_active() {
    let harness = Harness::new().await;
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "export-file-csv", "INTERNAL_EXPORT_FILE")
        .build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(outcome.result, ReconcileResult::Active);
    assert_eq!(outcome.phase, RolloutPhase::Converged);
    assert_eq!(
        harness.supervisor.started(),
        [PRIMARY_SERVICE, "worker-0", "worker-1", "worker-2"]
    );

    let plan = outcome.plan.as_ref().unwrap();
    assert_eq!(plan.services.len(), 4);
    for worker in plan.workers() {
        assert_eq!(plan.services[worker].requires, [PRIMARY_SERVICE]);
    }
    let env = &plan.services[PRIMARY_SERVICE].environment;
    assert_eq!(env["APP__ADMIN__EMAIL"], "admin@example.com");
    assert_eq!(env["APP__BASE_URL"], "http://opencti.example.com/");
    assert_eq!(env["REDIS__HOSTNAME"], "redis-k8s-0.redis-k8s-endpoints");
    assert_eq!(env["RABBITMQ__HOSTNAME"], "rabbitmq-k8s-0");
    assert_eq!(env["MINIO__PORT"], "9000");
    assert!(harness
        .supervisor
        .files()
        .contains_key("/opt/opencti/config/opensearch.pem"));
    assert!(harness.supervisor.layer("opencti").is_some());
}

#[tokio::test]
async fn test_connector_access_write_back() {
    let harness = Harness::new().await;
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "export-file-csv", "INTERNAL_EXPORT_FILE")
        .with_connector(101, "crowdstrike", "EXTERNAL_IMPORT")
        .build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    let connector = RelationId::new(100);
    let write = &outcome.relation_writes[&connector];
    assert_eq!(write[URL_FIELD], "http://opencti.example.com/");
    let token_secret = SecretId::parse(&write[TOKEN_FIELD]).unwrap();
    assert_eq!(
        harness.secrets.grants(&token_secret).await,
        [GrantScope::Relation(connector)]
    );

    let account = harness.directory.user("connector-export-file-csv").unwrap();
    let content = harness.secrets.get(&token_secret, true).await.unwrap();
    assert_eq!(content.get("token"), Some(account.api_token.as_str()));

    assert_eq!(
        harness.directory.groups_of("connector-export-file-csv"),
        [harness.directory.group_id("Administrators").unwrap()]
    );
    assert_eq!(
        harness.directory.groups_of("connector-crowdstrike"),
        [harness.directory.group_id("Connectors").unwrap()]
    );
    assert_eq!(
        outcome.accounts[&RelationId::new(101)].as_deref(),
        Some("connector-crowdstrike")
    );
}

#[tokio::test]
async fn test_broker_admin_requested_by_leader_only() {
    let harness = Harness::new().await;
    let snapshot = SnapshotBuilder::leader().with_all_dependencies().build();
    let amqp = snapshot.relation("amqp").unwrap().id;

    let outcome = harness.reconcile(&snapshot).await.unwrap();
    assert_eq!(outcome.relation_writes[&amqp]["admin"], "true");

    let follower = Harness::new().await;
    let snapshot = SnapshotBuilder::follower().with_all_dependencies().build();
    let outcome = follower.reconcile(&snapshot).await.unwrap();
    assert!(outcome.relation_writes.is_empty());
}

#[tokio::test]
async fn test_repeat_invocation_is_stable() {
    let harness = Harness::new().await;
    let first_snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .build();
    let first = harness.reconcile(&first_snapshot).await.unwrap();
    let secrets_after_first = harness.secrets.len().await;
    let users_after_first = harness.directory.users().len();

    let second_snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .with_writes(&first.relation_writes)
        .build();
    let second = harness.reconcile(&second_snapshot).await.unwrap();

    assert_eq!(second.result, ReconcileResult::Active);
    assert_eq!(
        first.plan.unwrap().to_canonical_json().unwrap(),
        second.plan.unwrap().to_canonical_json().unwrap()
    );
    assert_eq!(first.spec_hash, second.spec_hash);
    assert_eq!(harness.secrets.len().await, secrets_after_first);
    assert_eq!(harness.directory.users().len(), users_after_first);
    assert_eq!(
        first.relation_writes[&RelationId::new(100)],
        second.relation_writes[&RelationId::new(100)]
    );
    // The broker admin request is already published.
    assert_eq!(second.relation_writes.len(), 1);
}

#[rstest]
#[case::one(&["s3"], "missing integration(s): s3")]
#[case::several(&["redis", "ingress"], "missing integration(s): redis, ingress")]
#[case::all(
    &["opensearch-client", "redis", "amqp", "s3", "ingress"],
    "missing integration(s): opensearch-client, redis, amqp, s3, ingress"
)]
#[tokio::test]
async fn test_missing_integrations_block(#[case] absent: &[&str], #[case] expected: &str) {
    let harness = Harness::new().await;
    let mut builder = SnapshotBuilder::leader().with_all_dependencies();
    for endpoint in absent {
        builder = builder.without(endpoint);
    }

    let outcome = harness.reconcile(&builder.build()).await.unwrap();

    assert_eq!(outcome.result, ReconcileResult::Blocked(expected.to_string()));
    assert!(outcome.plan.is_none());
    assert!(!harness
        .supervisor
        .calls()
        .iter()
        .any(|c| matches!(c, SupervisorCall::AddLayer { .. })));
}

#[rstest]
#[case::not_a_secret(Some("foobar"), "admin-user config is not a secret")]
#[case::unknown_secret(Some("secret:unknown"), "admin-user config is not a secret")]
#[case::unset(None, "missing charm config: admin-user")]
#[tokio::test]
async fn test_admin_user_config_blocks(#[case] admin_user: Option<&str>, #[case] expected: &str) {
    let mut harness = Harness::new().await;
    harness.config.admin_user = admin_user.map(str::to_string);
    let snapshot = SnapshotBuilder::leader().with_all_dependencies().build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(outcome.result, ReconcileResult::Blocked(expected.to_string()));
    assert!(harness.supervisor.started().is_empty());
}

#[tokio::test]
async fn test_admin_user_without_grant() {
    let harness = Harness::new().await;
    harness
        .secrets
        .deny(&SecretId::parse(ADMIN_SECRET).unwrap())
        .await;
    let snapshot = SnapshotBuilder::leader().with_all_dependencies().build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    let ReconcileResult::Blocked(reason) = outcome.result else {
        panic!("expected blocked, got {:?}", outcome.result);
    };
    assert!(reason.contains("doesn't have access to the admin-user secret"));
}

#[tokio::test]
async fn test_reserved_app_name_blocks() {
    let mut harness = Harness::new().await;
    harness.config.app_name = "x-opencti".to_string();
    let snapshot = SnapshotBuilder::leader().with_all_dependencies().build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();
    assert!(matches!(outcome.result, ReconcileResult::Blocked(_)));
    assert!(harness.secrets.len().await == 1);
}

#[tokio::test]
async fn test_unreachable_container_waits() {
    let harness = Harness::new().await;
    harness.supervisor.set_connectable(false);
    let snapshot = SnapshotBuilder::leader().with_all_dependencies().build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(
        outcome.result,
        ReconcileResult::Waiting("waiting for opencti container".into())
    );
    // The bundle does not depend on the container.
    assert_eq!(harness.secrets.len().await, 2);
}

#[tokio::test]
async fn test_follower_waits_for_peer_bundle() {
    let harness = Harness::new().await;
    let snapshot = SnapshotBuilder::follower().with_all_dependencies().build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(
        outcome.result,
        ReconcileResult::Waiting("waiting for peer integration".into())
    );
    assert_eq!(harness.secrets.len().await, 1);
}

#[tokio::test]
async fn test_follower_converges_without_touching_directory() {
    let harness = Harness::new().await;
    let leader_snapshot = SnapshotBuilder::leader().with_all_dependencies().build();
    harness.reconcile(&leader_snapshot).await.unwrap();
    let connections = harness.provider.connections().len();

    let snapshot = SnapshotBuilder::follower()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .build();
    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(outcome.result, ReconcileResult::Active);
    assert!(outcome.accounts.is_empty());
    assert_eq!(harness.provider.connections().len(), connections);
}

#[tokio::test]
async fn test_incomplete_dependency_waits() {
    let harness = Harness::new().await;
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_empty_relation("amqp", "rabbitmq-k8s")
        .build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();
    assert_eq!(
        outcome.result,
        ReconcileResult::Waiting("waiting for amqp integration".into())
    );
}

#[tokio::test]
async fn test_invalid_redis_blocks() {
    let harness = Harness::new().await;
    let mut redis = SnapshotBuilder::leader()
        .with_redis()
        .build()
        .relations
        .remove("redis")
        .unwrap();
    redis
        .remote_units
        .get_mut("redis-k8s/0")
        .unwrap()
        .insert("port".into(), "not-a-port".into());
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_relation("redis", redis)
        .build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();
    assert_eq!(
        outcome.result,
        ReconcileResult::Blocked("invalid redis integration".into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_platform_never_starts_workers() {
    let harness = Harness::with_probe(ScriptedProbe::unhealthy()).await;
    let snapshot = SnapshotBuilder::leader().with_all_dependencies().build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(
        outcome.result,
        ReconcileResult::Waiting("opencti platform start-up failed".into())
    );
    assert_eq!(outcome.phase, RolloutPhase::TimedOut);
    assert_eq!(harness.supervisor.started(), [PRIMARY_SERVICE]);
    // 200s budget probed every 5s.
    assert_eq!(harness.probe.probe_count(), 40);

    let health_url = outcome.plan.as_ref().unwrap().primary_health_url().unwrap();
    assert_eq!(harness.watcher.armed(), [health_url]);
    let statuses = harness.sink.statuses();
    assert_eq!(
        statuses.first(),
        Some(&ReconcileResult::Waiting(
            "waiting for opencti platform to start (0s)".into()
        ))
    );
    assert_eq!(
        statuses.last(),
        Some(&ReconcileResult::Waiting(
            "waiting for opencti platform to start (195s)".into()
        ))
    );
    assert!(harness.provider.connections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_platform_healthy_after_retries() {
    let harness = Harness::with_probe(ScriptedProbe::healthy_after(3)).await;
    let snapshot = SnapshotBuilder::leader().with_all_dependencies().build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(outcome.result, ReconcileResult::Active);
    assert_eq!(harness.probe.probe_count(), 4);
    assert_eq!(harness.sink.statuses().len(), 3);
    assert!(harness.watcher.armed().is_empty());
    assert!(harness.probe.urls()[0].starts_with("http://localhost:8080/health?health_access_key="));
}

#[tokio::test]
async fn test_removed_connector_is_deactivated_then_restored() {
    let harness = Harness::new().await;
    let both = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .with_connector(101, "export-file-txt", "INTERNAL_EXPORT_FILE")
        .build();
    let first = harness.reconcile(&both).await.unwrap();
    assert_eq!(harness.directory.users().len(), 2);

    let only_mitre = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .with_writes(&first.relation_writes)
        .build();
    harness.reconcile(&only_mitre).await.unwrap();

    let removed = harness.directory.user("connector-export-file-txt").unwrap();
    assert_eq!(removed.status, AccountStatus::Inactive);
    assert_eq!(
        harness.directory.user("connector-mitre").unwrap().status,
        AccountStatus::Active
    );
    assert_eq!(harness.directory.users().len(), 2);

    harness.reconcile(&both).await.unwrap();
    assert_eq!(
        harness.directory.user("connector-export-file-txt").unwrap().status,
        AccountStatus::Active
    );
    assert_eq!(
        harness.directory.status_changes(),
        [
            ("connector-export-file-txt".to_string(), AccountStatus::Inactive),
            ("connector-export-file-txt".to_string(), AccountStatus::Active),
        ]
    );
}

#[tokio::test]
async fn test_integrations_record_assigned_account() {
    let harness = Harness::new().await;
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .with_undeclared_connector(102)
        .build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    let mitre = outcome
        .integrations
        .iter()
        .find(|r| r.integration_id == RelationId::new(100))
        .unwrap();
    let account = harness.directory.user("connector-mitre").unwrap();
    assert_eq!(mitre.assigned_user_id.as_ref(), Some(&account.id));
    assert_eq!(
        mitre.token_secret_ref.as_ref().map(ToString::to_string).as_deref(),
        Some(outcome.relation_writes[&RelationId::new(100)][TOKEN_FIELD].as_str())
    );

    let pending = outcome
        .integrations
        .iter()
        .find(|r| r.integration_id == RelationId::new(102))
        .unwrap();
    assert_eq!(pending.assigned_user_id, None);
}

#[rstest]
#[case::locked(AccountStatus::Locked)]
#[case::expired(AccountStatus::Expired)]
#[tokio::test]
async fn test_administrator_disabled_accounts_are_left_alone(#[case] status: AccountStatus) {
    let harness = Harness::new().await;
    harness.directory.insert_user("connector-mitre", status);
    harness.directory.insert_user("connector-retired", status);
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(outcome.result, ReconcileResult::Active);
    assert!(harness.directory.status_changes().is_empty());
    assert_eq!(harness.directory.user("connector-mitre").unwrap().status, status);
    assert_eq!(harness.directory.user("connector-retired").unwrap().status, status);
    assert!(outcome.relation_writes[&RelationId::new(100)].contains_key(TOKEN_FIELD));
}

#[tokio::test]
async fn test_undeclared_connector_gets_no_account() {
    let harness = Harness::new().await;
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_undeclared_connector(102)
        .build();

    let outcome = harness.reconcile(&snapshot).await.unwrap();

    assert_eq!(outcome.accounts[&RelationId::new(102)], None);
    assert!(!outcome.relation_writes.contains_key(&RelationId::new(102)));
    assert!(harness.directory.users().is_empty());
}

#[tokio::test]
async fn test_token_drift_rewrites_secret() {
    let harness = Harness::new().await;
    let builder = || {
        SnapshotBuilder::leader()
            .with_all_dependencies()
            .with_connector(100, "ipinfo", "INTERNAL_ENRICHMENT")
    };
    let first = harness.reconcile(&builder().build()).await.unwrap();
    let token_secret =
        SecretId::parse(&first.relation_writes[&RelationId::new(100)][TOKEN_FIELD]).unwrap();
    assert_eq!(harness.secrets.revision(&token_secret).await, Some(1));

    harness
        .directory
        .rotate_token("connector-ipinfo", "11111111-1111-4111-8111-111111111111");
    let second = harness
        .reconcile(&builder().with_writes(&first.relation_writes).build())
        .await
        .unwrap();

    assert_eq!(
        second.relation_writes[&RelationId::new(100)][TOKEN_FIELD],
        token_secret.to_string()
    );
    assert_eq!(harness.secrets.revision(&token_secret).await, Some(2));
    let content = harness.secrets.get(&token_secret, true).await.unwrap();
    assert_eq!(content.get("token"), Some("11111111-1111-4111-8111-111111111111"));
}

#[tokio::test]
async fn test_vanished_token_secret_is_recreated() {
    let harness = Harness::new().await;
    let builder = || {
        SnapshotBuilder::leader()
            .with_all_dependencies()
            .with_connector(100, "ipinfo", "INTERNAL_ENRICHMENT")
    };
    let first = harness.reconcile(&builder().build()).await.unwrap();
    let old = SecretId::parse(&first.relation_writes[&RelationId::new(100)][TOKEN_FIELD]).unwrap();
    harness.secrets.remove(&old).await.unwrap();

    let second = harness
        .reconcile(&builder().with_writes(&first.relation_writes).build())
        .await
        .unwrap();
    let new = SecretId::parse(&second.relation_writes[&RelationId::new(100)][TOKEN_FIELD]).unwrap();
    assert_ne!(old, new);
    assert_eq!(
        harness.secrets.grants(&new).await,
        [GrantScope::Relation(RelationId::new(100))]
    );
}

#[tokio::test]
async fn test_directory_failure_is_fatal() {
    let mut harness = Harness::new().await;
    let directory = FakeDirectory::with_groups(&["Administrators"]);
    harness.provider = FakeDirectoryProvider::new(directory);
    let snapshot = SnapshotBuilder::leader()
        .with_all_dependencies()
        .with_connector(100, "mitre", "EXTERNAL_IMPORT")
        .build();

    let err = harness.reconcile(&snapshot).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Directory(_)));
}
