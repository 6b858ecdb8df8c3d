//! Connector access provisioning.
//!
//! Each connector integration that declared its name and type gets its own
//! directory account and an API token delivered through a secret granted to
//! that relation. Accounts whose integration went away are deactivated,
//! never deleted, so their audit history survives. Locked and expired
//! accounts are never switched in either direction.

use std::collections::{BTreeMap, BTreeSet};

use octi_id::{RelationId, SecretId, UserId};
use octi_secrets::{GrantScope, SecretContent, SecretStore, SecretStoreError};
use tracing::{debug, info, warn};

use crate::directory::{AccountStatus, CachedDirectory, UserDirectoryClient};
use crate::snapshot::{DataBag, RelationData, Role};
use crate::ReconcileError;

/// Connector type whose accounts join the elevated group.
pub const FILE_EXPORT_TYPE: &str = "INTERNAL_EXPORT_FILE";

/// Secret key holding a connector's API token.
pub const TOKEN_SECRET_KEY: &str = "token";

/// Local relation field carrying the platform URL.
pub const URL_FIELD: &str = "opencti_url";

/// Local relation field carrying the token secret id.
pub const TOKEN_FIELD: &str = "opencti_token";

/// Remote relation field with the connector type.
pub const CONNECTOR_TYPE_FIELD: &str = "connector_type";

/// Remote relation field with the connector name.
pub const CONNECTOR_NAME_FIELD: &str = "connector_charm_name";

/// What one connector integration declared and was assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationRecord {
    pub integration_id: RelationId,
    pub declared_type: Option<String>,
    pub declared_name: Option<String>,
    /// Token secret published on an earlier invocation.
    pub token_secret_ref: Option<SecretId>,
    /// Directory account serving this integration, once provisioned.
    pub assigned_user_id: Option<UserId>,
}

impl IntegrationRecord {
    pub fn from_relation(relation: &RelationData) -> Self {
        let field = |key: &str| {
            relation
                .remote_app_data
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
        };
        Self {
            integration_id: relation.id,
            declared_type: field(CONNECTOR_TYPE_FIELD),
            declared_name: field(CONNECTOR_NAME_FIELD),
            token_secret_ref: relation
                .local_app_data
                .get(TOKEN_FIELD)
                .and_then(|raw| SecretId::parse(raw).ok()),
            assigned_user_id: None,
        }
    }
}

/// Account name for a declared connector name: the prefix followed by the
/// name lowercased, with every other character folded to `-`.
pub fn account_name(prefix: &str, declared_name: &str) -> String {
    let normalized: String = declared_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{prefix}{normalized}")
}

/// Result of one access pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessReport {
    /// Account assigned to each integration; `None` while it has not
    /// declared its name and type.
    pub accounts: BTreeMap<RelationId, Option<String>>,
    /// Local relation data to publish per integration.
    pub writes: BTreeMap<RelationId, DataBag>,
    /// Accounts switched to inactive by this pass.
    pub deactivated: Vec<String>,
    /// Every integration with the account and token secret it ended up with.
    pub integrations: Vec<IntegrationRecord>,
}

/// Provisions directory accounts and tokens for connector integrations.
pub struct AccessReconciler<'a> {
    secrets: &'a dyn SecretStore,
    prefix: &'a str,
    elevated_group: &'a str,
    restricted_group: &'a str,
    public_url: &'a str,
}

impl<'a> AccessReconciler<'a> {
    pub fn new(
        secrets: &'a dyn SecretStore,
        prefix: &'a str,
        elevated_group: &'a str,
        restricted_group: &'a str,
        public_url: &'a str,
    ) -> Self {
        Self {
            secrets,
            prefix,
            elevated_group,
            restricted_group,
            public_url,
        }
    }

    fn group_for(&self, connector_type: &str) -> &'a str {
        if connector_type == FILE_EXPORT_TYPE {
            self.elevated_group
        } else {
            self.restricted_group
        }
    }

    /// Bring directory accounts in line with `integrations`.
    ///
    /// Only the leader touches the directory; followers get an empty report.
    pub async fn reconcile(
        &self,
        role: Role,
        integrations: &[IntegrationRecord],
        client: &dyn UserDirectoryClient,
    ) -> Result<AccessReport, ReconcileError> {
        let mut report = AccessReport::default();
        if !role.is_leader() {
            return Ok(report);
        }

        let mut directory = CachedDirectory::new(client);
        let mut active = BTreeSet::new();

        for record in integrations {
            let (Some(connector_type), Some(declared_name)) =
                (&record.declared_type, &record.declared_name)
            else {
                debug!(integration = %record.integration_id, "connector has not declared itself yet");
                report.accounts.insert(record.integration_id, None);
                report.integrations.push(record.clone());
                continue;
            };
            let name = account_name(self.prefix, declared_name);

            let account = match directory.find_user(&name).await? {
                Some(account) => account,
                None => {
                    let group = directory.group_id(self.group_for(connector_type)).await?;
                    let account = directory.create_user(&name, &[group]).await?;
                    info!(account = %name, connector_type = %connector_type, "created connector account");
                    account
                }
            };
            match account.status {
                AccountStatus::Active => {}
                AccountStatus::Inactive => {
                    directory.set_status(&account.id, AccountStatus::Active).await?;
                    info!(account = %name, "reactivated connector account");
                }
                AccountStatus::Locked | AccountStatus::Expired => {
                    warn!(
                        account = %name,
                        status = account.status.as_str(),
                        "connector account disabled by an administrator, leaving it as is"
                    );
                }
            }
            active.insert(name.clone());

            let secret_id = self
                .sync_token(record, &account.api_token)
                .await?;
            report.writes.insert(
                record.integration_id,
                DataBag::from([
                    (URL_FIELD.to_string(), self.public_url.to_string()),
                    (TOKEN_FIELD.to_string(), secret_id.to_string()),
                ]),
            );
            report.accounts.insert(record.integration_id, Some(name));
            report.integrations.push(IntegrationRecord {
                token_secret_ref: Some(secret_id),
                assigned_user_id: Some(account.id.clone()),
                ..record.clone()
            });
        }

        for account in directory.users_with_prefix(self.prefix).await? {
            if active.contains(&account.name) || account.status != AccountStatus::Active {
                continue;
            }
            directory
                .set_status(&account.id, AccountStatus::Inactive)
                .await?;
            info!(account = %account.name, "deactivated orphaned connector account");
            report.deactivated.push(account.name);
        }

        Ok(report)
    }

    /// Make sure the integration's token secret holds `token`.
    ///
    /// The secret is created once and granted to the relation; afterwards
    /// it is only rewritten when the token drifted.
    async fn sync_token(
        &self,
        record: &IntegrationRecord,
        token: &str,
    ) -> Result<SecretId, ReconcileError> {
        if let Some(id) = &record.token_secret_ref {
            match self.secrets.get(id, true).await {
                Ok(content) if content.get(TOKEN_SECRET_KEY) == Some(token) => {
                    return Ok(id.clone());
                }
                Ok(_) => {
                    self.secrets.set_content(id, token_content(token)?).await?;
                    info!(secret_id = %id, integration = %record.integration_id, "rotated connector token secret");
                    return Ok(id.clone());
                }
                Err(SecretStoreError::NotFound(_)) => {
                    warn!(secret_id = %id, integration = %record.integration_id, "connector token secret vanished, re-creating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let id = self.secrets.create(token_content(token)?).await?;
        self.secrets
            .grant(&id, &GrantScope::Relation(record.integration_id))
            .await?;
        info!(secret_id = %id, integration = %record.integration_id, "created connector token secret");
        Ok(id)
    }
}

fn token_content(token: &str) -> Result<SecretContent, ReconcileError> {
    SecretContent::try_from_iter([(TOKEN_SECRET_KEY, token)])
        .map_err(|e| ReconcileError::Internal(e.to_string()))
}
