//! Application-scoped key-value storage shared by all units.

use std::collections::BTreeMap;
use std::sync::RwLock;

use octi_id::RelationId;
use thiserror::Error;

use crate::snapshot::{DataBag, Snapshot};

/// Endpoint of the peer relation shared by all units.
pub const PEER_ENDPOINT: &str = "opencti-peer";

/// Peer storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerStoreError {
    /// Peer storage does not exist yet.
    #[error("peer storage is not available")]
    Unavailable,

    #[error("peer storage backend error: {0}")]
    Backend(String),
}

/// Peer storage interface.
///
/// Only the leader writes; every unit reads.
pub trait PeerStore: Send + Sync {
    /// Whether the peer relation exists.
    fn is_available(&self) -> bool;

    fn get(&self, key: &str) -> Result<Option<String>, PeerStoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), PeerStoreError>;

    fn remove(&self, key: &str) -> Result<(), PeerStoreError>;
}

/// In-memory peer storage.
#[derive(Debug)]
pub struct InMemoryPeerStore {
    available: bool,
    data: RwLock<BTreeMap<String, String>>,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self {
            available: true,
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// A store whose peer relation has not been created yet.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Copy of everything stored.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.data
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for InMemoryPeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerStore for InMemoryPeerStore {
    fn is_available(&self) -> bool {
        self.available
    }

    fn get(&self, key: &str) -> Result<Option<String>, PeerStoreError> {
        if !self.available {
            return Err(PeerStoreError::Unavailable);
        }
        let data = self
            .data
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PeerStoreError> {
        if !self.available {
            return Err(PeerStoreError::Unavailable);
        }
        self.data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PeerStoreError> {
        if !self.available {
            return Err(PeerStoreError::Unavailable);
        }
        self.data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Peer storage backed by the application data of the peer relation.
///
/// Reads see what the host published plus the changes staged by this
/// invocation. Changes only reach other units once the host publishes
/// [`RelationPeerStore::writes`].
#[derive(Debug)]
pub struct RelationPeerStore {
    relation: Option<RelationId>,
    published: DataBag,
    staged: RwLock<DataBag>,
}

impl RelationPeerStore {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let relation = snapshot.relation(PEER_ENDPOINT);
        Self {
            relation: relation.map(|r| r.id),
            published: relation
                .map(|r| r.local_app_data.clone())
                .unwrap_or_default(),
            staged: RwLock::new(DataBag::new()),
        }
    }

    pub fn relation_id(&self) -> Option<RelationId> {
        self.relation
    }

    /// Staged changes that differ from the published data. A removed key
    /// maps to an empty value, which the host publishes as a deletion.
    pub fn writes(&self) -> DataBag {
        let staged = self
            .staged
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        staged
            .iter()
            .filter(|(key, value)| match self.published.get(*key) {
                Some(published) => published != *value,
                None => !value.is_empty(),
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn check(&self) -> Result<(), PeerStoreError> {
        if self.relation.is_some() {
            Ok(())
        } else {
            Err(PeerStoreError::Unavailable)
        }
    }
}

impl PeerStore for RelationPeerStore {
    fn is_available(&self) -> bool {
        self.relation.is_some()
    }

    fn get(&self, key: &str) -> Result<Option<String>, PeerStoreError> {
        self.check()?;
        let staged = self
            .staged
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let value = staged.get(key).or_else(|| self.published.get(key));
        Ok(value.filter(|v| !v.is_empty()).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PeerStoreError> {
        self.check()?;
        self.staged
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PeerStoreError> {
        self.set(key, "")
    }
}
