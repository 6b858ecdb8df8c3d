//! The secret store collaborator.
//!
//! Secret content can rotate out-of-band, so callers that need the current
//! value pass `refresh = true` to force a live read that bypasses any cache.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use octi_id::{RelationId, SecretId};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::SecretContent;

/// Errors from the secret store.
///
/// `NotFound` and `PermissionDenied` are kept distinct because callers
/// report them to the operator differently.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("secret not found: {0}")]
    NotFound(SecretId),

    #[error("permission denied for secret: {0}")]
    PermissionDenied(SecretId),

    #[error("secret store error: {0}")]
    Backend(String),
}

impl SecretStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Who a secret is shared with.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GrantScope {
    /// Every application on the other end of a relation.
    Relation(RelationId),
    /// One named application.
    Application(String),
}

impl std::fmt::Display for GrantScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relation(id) => write!(f, "relation:{id}"),
            Self::Application(name) => write!(f, "application:{name}"),
        }
    }
}

/// Secret store interface.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret's content; `refresh` forces a live re-fetch.
    async fn get(&self, id: &SecretId, refresh: bool) -> Result<SecretContent, SecretStoreError>;

    /// Create a secret owned by this application.
    async fn create(&self, content: SecretContent) -> Result<SecretId, SecretStoreError>;

    /// Replace a secret's content (creates a new revision).
    async fn set_content(
        &self,
        id: &SecretId,
        content: SecretContent,
    ) -> Result<(), SecretStoreError>;

    /// Share a secret.
    async fn grant(&self, id: &SecretId, scope: &GrantScope) -> Result<(), SecretStoreError>;

    /// Remove a secret and all its revisions.
    async fn remove(&self, id: &SecretId) -> Result<(), SecretStoreError>;
}

#[derive(Debug, Clone)]
struct StoredSecret {
    content: SecretContent,
    revision: u32,
    grants: BTreeSet<GrantScope>,
}

#[derive(Debug, Default)]
struct Inner {
    secrets: BTreeMap<SecretId, StoredSecret>,
    denied: BTreeSet<SecretId>,
}

/// In-memory secret store.
///
/// Used by tests and by dry runs of the operator binary. Supports
/// denying access to a specific id to simulate a missing grant.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    inner: Mutex<Inner>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a secret under a caller-chosen id (simulates a secret owned
    /// by another application or by the operator).
    pub async fn insert(&self, id: SecretId, content: SecretContent) {
        let mut inner = self.inner.lock().await;
        inner.secrets.insert(
            id,
            StoredSecret {
                content,
                revision: 1,
                grants: BTreeSet::new(),
            },
        );
    }

    /// Make every subsequent read of `id` fail with `PermissionDenied`.
    pub async fn deny(&self, id: &SecretId) {
        self.inner.lock().await.denied.insert(id.clone());
    }

    /// Current revision of a secret, if it exists.
    pub async fn revision(&self, id: &SecretId) -> Option<u32> {
        self.inner.lock().await.secrets.get(id).map(|s| s.revision)
    }

    /// Scopes a secret has been granted to.
    pub async fn grants(&self, id: &SecretId) -> Vec<GrantScope> {
        self.inner
            .lock()
            .await
            .secrets
            .get(id)
            .map(|s| s.grants.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of stored secrets.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.secrets.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.secrets.is_empty()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, id: &SecretId, _refresh: bool) -> Result<SecretContent, SecretStoreError> {
        let inner = self.inner.lock().await;
        if inner.denied.contains(id) {
            return Err(SecretStoreError::PermissionDenied(id.clone()));
        }
        inner
            .secrets
            .get(id)
            .map(|s| s.content.clone())
            .ok_or_else(|| SecretStoreError::NotFound(id.clone()))
    }

    async fn create(&self, content: SecretContent) -> Result<SecretId, SecretStoreError> {
        let id = SecretId::generate();
        debug!(secret_id = %id, keys = content.len(), "creating secret");
        self.insert(id.clone(), content).await;
        Ok(id)
    }

    async fn set_content(
        &self,
        id: &SecretId,
        content: SecretContent,
    ) -> Result<(), SecretStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .secrets
            .get_mut(id)
            .ok_or_else(|| SecretStoreError::NotFound(id.clone()))?;
        if stored.content.data_hash() != content.data_hash() {
            stored.content = content;
            stored.revision += 1;
        }
        Ok(())
    }

    async fn grant(&self, id: &SecretId, scope: &GrantScope) -> Result<(), SecretStoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .secrets
            .get_mut(id)
            .ok_or_else(|| SecretStoreError::NotFound(id.clone()))?;
        stored.grants.insert(scope.clone());
        Ok(())
    }

    async fn remove(&self, id: &SecretId) -> Result<(), SecretStoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .secrets
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SecretStoreError::NotFound(id.clone()))
    }
}
