//! Peer secret bundle lifecycle.
//!
//! The leader mints one secret holding the platform admin token and the
//! health access key, and publishes its id in peer storage. Every unit,
//! leader included, resolves the bundle through that id with a live read.

use std::fmt;

use octi_id::SecretId;
use octi_secrets::{generate_token, SecretContent, SecretStore, SecretStoreError};
use tracing::{debug, info, warn};

use crate::peer::PeerStore;
use crate::snapshot::Role;
use crate::ReconcileError;

/// Peer storage field holding the bundle's secret id.
pub const PEER_SECRET_FIELD: &str = "secret";

/// Bundle key for the platform admin API token.
pub const ADMIN_TOKEN_KEY: &str = "admin-token";

/// Bundle key for the health endpoint access key.
pub const HEALTH_ACCESS_KEY: &str = "health-access-key";

/// Reason reported while the bundle cannot be resolved.
pub const PEER_NOT_READY: &str = "waiting for peer integration";

/// Credentials shared by every unit of the application.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerSecretBundle {
    pub admin_token: String,
    pub health_access_key: String,
}

impl fmt::Debug for PeerSecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSecretBundle")
            .field("admin_token", &"[REDACTED]")
            .field("health_access_key", &"[REDACTED]")
            .finish()
    }
}

impl PeerSecretBundle {
    fn from_content(content: &SecretContent) -> Option<Self> {
        Some(Self {
            admin_token: content.get(ADMIN_TOKEN_KEY)?.to_string(),
            health_access_key: content.get(HEALTH_ACCESS_KEY)?.to_string(),
        })
    }
}

/// Result of [`SecretManager::ensure_bundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A fresh bundle was minted and published.
    Created(SecretId),
    /// A valid bundle was already published.
    Existing(SecretId),
    /// Nothing was done; not an error for the caller.
    NotReady(String),
}

/// Owns creation, resolution and teardown of the peer secret bundle.
pub struct SecretManager<'a> {
    secrets: &'a dyn SecretStore,
    peer: &'a dyn PeerStore,
}

impl<'a> SecretManager<'a> {
    pub fn new(secrets: &'a dyn SecretStore, peer: &'a dyn PeerStore) -> Self {
        Self { secrets, peer }
    }

    /// Make sure a valid bundle is published.
    ///
    /// Followers and units without peer storage get `NotReady`. A published
    /// id whose secret vanished or lost a key is replaced.
    pub async fn ensure_bundle(&self, role: Role) -> Result<EnsureOutcome, ReconcileError> {
        if !self.peer.is_available() {
            return Ok(EnsureOutcome::NotReady(PEER_NOT_READY.to_string()));
        }
        if !role.is_leader() {
            return Ok(EnsureOutcome::NotReady(
                "only the leader provisions the peer secret".to_string(),
            ));
        }

        if let Some(raw) = self.peer.get(PEER_SECRET_FIELD)? {
            match SecretId::parse(&raw) {
                Ok(id) => match self.secrets.get(&id, true).await {
                    Ok(content) if PeerSecretBundle::from_content(&content).is_some() => {
                        debug!(secret_id = %id, "peer secret bundle already published");
                        return Ok(EnsureOutcome::Existing(id));
                    }
                    Ok(_) => {
                        warn!(secret_id = %id, "peer secret bundle incomplete, re-creating");
                    }
                    Err(SecretStoreError::NotFound(_)) => {
                        warn!(secret_id = %id, "peer secret bundle vanished, re-creating");
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(e) => {
                    warn!(value = %raw, error = %e, "peer secret field is not a secret id, re-creating");
                }
            }
        }

        let content = SecretContent::try_from_iter([
            (ADMIN_TOKEN_KEY, generate_token()),
            (HEALTH_ACCESS_KEY, generate_token()),
        ])
        .map_err(|e| ReconcileError::Internal(e.to_string()))?;
        let id = self.secrets.create(content).await?;
        self.peer.set(PEER_SECRET_FIELD, id.as_str())?;
        info!(secret_id = %id, "published peer secret bundle");
        Ok(EnsureOutcome::Created(id))
    }

    /// Read the published bundle with a live, cache-bypassing fetch.
    pub async fn resolve_bundle(&self) -> Result<PeerSecretBundle, ReconcileError> {
        let not_ready = || ReconcileError::IntegrationNotReady(PEER_NOT_READY.to_string());

        if !self.peer.is_available() {
            return Err(not_ready());
        }
        let Some(raw) = self.peer.get(PEER_SECRET_FIELD)? else {
            return Err(not_ready());
        };
        let id = SecretId::parse(&raw).map_err(|_| not_ready())?;

        let content = match self.secrets.get(&id, true).await {
            Ok(content) => content,
            Err(SecretStoreError::NotFound(_) | SecretStoreError::PermissionDenied(_)) => {
                debug!(secret_id = %id, "peer secret bundle not readable yet");
                return Err(not_ready());
            }
            Err(e) => return Err(e.into()),
        };
        PeerSecretBundle::from_content(&content).ok_or_else(not_ready)
    }

    /// Remove the bundle when the peer relation goes away.
    pub async fn teardown(&self, role: Role) -> Result<(), ReconcileError> {
        if !role.is_leader() || !self.peer.is_available() {
            return Ok(());
        }
        let Some(raw) = self.peer.get(PEER_SECRET_FIELD)? else {
            return Ok(());
        };
        if let Ok(id) = SecretId::parse(&raw) {
            match self.secrets.remove(&id).await {
                Ok(()) | Err(SecretStoreError::NotFound(_)) => {
                    info!(secret_id = %id, "removed peer secret bundle");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.peer.remove(PEER_SECRET_FIELD)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::InMemoryPeerStore;
    use crate::Disposition;
    use octi_secrets::InMemorySecretStore;

    #[tokio::test]
    async fn test_leader_creates_once() {
        let secrets = InMemorySecretStore::new();
        let peer = InMemoryPeerStore::new();
        let manager = SecretManager::new(&secrets, &peer);

        let first = manager.ensure_bundle(Role::Leader).await.unwrap();
        let EnsureOutcome::Created(id) = first else {
            panic!("expected creation, got {first:?}");
        };
        let second = manager.ensure_bundle(Role::Leader).await.unwrap();
        assert_eq!(second, EnsureOutcome::Existing(id));
        assert_eq!(secrets.len().await, 1);
    }

    #[tokio::test]
    async fn test_follower_never_creates() {
        let secrets = InMemorySecretStore::new();
        let peer = InMemoryPeerStore::new();
        let manager = SecretManager::new(&secrets, &peer);

        let outcome = manager.ensure_bundle(Role::Follower).await.unwrap();
        assert!(matches!(outcome, EnsureOutcome::NotReady(_)));
        assert!(secrets.is_empty().await);

        let err = manager.resolve_bundle().await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Waiting);
        assert_eq!(err.to_string(), PEER_NOT_READY);
    }

    #[tokio::test]
    async fn test_vanished_bundle_is_recreated() {
        let secrets = InMemorySecretStore::new();
        let peer = InMemoryPeerStore::new();
        let manager = SecretManager::new(&secrets, &peer);

        let EnsureOutcome::Created(old) = manager.ensure_bundle(Role::Leader).await.unwrap() else {
            panic!("expected creation");
        };
        secrets.remove(&old).await.unwrap();

        let EnsureOutcome::Created(new) = manager.ensure_bundle(Role::Leader).await.unwrap() else {
            panic!("expected re-creation");
        };
        assert_ne!(old, new);
        assert_eq!(peer.get(PEER_SECRET_FIELD).unwrap(), Some(new.to_string()));
    }

    #[tokio::test]
    async fn test_resolve_reads_tokens() {
        let secrets = InMemorySecretStore::new();
        let peer = InMemoryPeerStore::new();
        let manager = SecretManager::new(&secrets, &peer);
        manager.ensure_bundle(Role::Leader).await.unwrap();

        let bundle = manager.resolve_bundle().await.unwrap();
        assert_eq!(bundle.admin_token.len(), 36);
        assert_ne!(bundle.admin_token, bundle.health_access_key);
        assert!(!format!("{bundle:?}").contains(&bundle.admin_token));
    }

    #[tokio::test]
    async fn test_without_peer_storage() {
        let secrets = InMemorySecretStore::new();
        let peer = InMemoryPeerStore::unavailable();
        let manager = SecretManager::new(&secrets, &peer);

        let outcome = manager.ensure_bundle(Role::Leader).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::NotReady(PEER_NOT_READY.to_string()));
        assert!(manager.resolve_bundle().await.is_err());
    }

    #[tokio::test]
    async fn test_teardown_removes_secret_and_field() {
        let secrets = InMemorySecretStore::new();
        let peer = InMemoryPeerStore::new();
        let manager = SecretManager::new(&secrets, &peer);
        manager.ensure_bundle(Role::Leader).await.unwrap();

        manager.teardown(Role::Leader).await.unwrap();
        assert!(secrets.is_empty().await);
        assert_eq!(peer.get(PEER_SECRET_FIELD).unwrap(), None);
    }
}
