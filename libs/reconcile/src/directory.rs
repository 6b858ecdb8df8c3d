//! Platform user directory collaborator.

use async_trait::async_trait;
use octi_id::{GroupId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Directory errors. All of them abort the invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The query ran but reported errors.
    #[error("query error: {0}")]
    Query(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),
}

/// Whether an account may authenticate.
///
/// Only `Active` and `Inactive` are managed by the controller; locked and
/// expired accounts were put there by an administrator or by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Inactive,
    Locked,
    Expired,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
            Self::Locked => "Locked",
            Self::Expired => "Expired",
        }
    }
}

/// A directory account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub status: AccountStatus,
    /// API token issued by the platform for this account.
    pub api_token: String,
}

/// A directory group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

/// User directory interface.
#[async_trait]
pub trait UserDirectoryClient: Send + Sync {
    /// List accounts, optionally only those whose name starts with a prefix.
    async fn list_users(
        &self,
        name_starts_with: Option<&str>,
    ) -> Result<Vec<UserAccount>, DirectoryError>;

    async fn list_groups(&self) -> Result<Vec<Group>, DirectoryError>;

    async fn create_user(
        &self,
        name: &str,
        email: Option<&str>,
        groups: &[GroupId],
    ) -> Result<UserAccount, DirectoryError>;

    async fn set_account_status(
        &self,
        id: &UserId,
        status: AccountStatus,
    ) -> Result<(), DirectoryError>;
}

/// Connects to the directory once the admin token is known.
pub trait DirectoryProvider: Send + Sync {
    fn connect(
        &self,
        platform_url: &str,
        api_token: &str,
    ) -> Result<Box<dyn UserDirectoryClient>, DirectoryError>;
}

/// Per-invocation read cache in front of a directory client.
///
/// Every mutation drops the cached account list so later reads see it.
pub struct CachedDirectory<'a> {
    client: &'a dyn UserDirectoryClient,
    users: Option<Vec<UserAccount>>,
    groups: Option<Vec<Group>>,
}

impl<'a> CachedDirectory<'a> {
    pub fn new(client: &'a dyn UserDirectoryClient) -> Self {
        Self {
            client,
            users: None,
            groups: None,
        }
    }

    pub async fn find_user(&mut self, name: &str) -> Result<Option<UserAccount>, DirectoryError> {
        if self.users.is_none() {
            debug!("loading directory accounts");
            self.users = Some(self.client.list_users(None).await?);
        }
        Ok(self
            .users
            .iter()
            .flatten()
            .find(|u| u.name == name)
            .cloned())
    }

    pub async fn group_id(&mut self, name: &str) -> Result<GroupId, DirectoryError> {
        if self.groups.is_none() {
            self.groups = Some(self.client.list_groups().await?);
        }
        self.groups
            .iter()
            .flatten()
            .find(|g| g.name == name)
            .map(|g| g.id.clone())
            .ok_or_else(|| DirectoryError::GroupNotFound(name.to_string()))
    }

    pub async fn create_user(
        &mut self,
        name: &str,
        groups: &[GroupId],
    ) -> Result<UserAccount, DirectoryError> {
        self.users = None;
        self.client.create_user(name, None, groups).await
    }

    pub async fn set_status(
        &mut self,
        id: &UserId,
        status: AccountStatus,
    ) -> Result<(), DirectoryError> {
        self.users = None;
        self.client.set_account_status(id, status).await
    }

    /// Fresh listing of accounts carrying `prefix`, bypassing the cache.
    pub async fn users_with_prefix(
        &mut self,
        prefix: &str,
    ) -> Result<Vec<UserAccount>, DirectoryError> {
        let users = self.client.list_users(Some(prefix)).await?;
        Ok(users
            .into_iter()
            .filter(|u| u.name.starts_with(prefix))
            .collect())
    }
}
