use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use octi_id::{GroupId, UserId};
use octi_reconcile::{
    AccountStatus, DirectoryError, DirectoryProvider, Group, UserAccount, UserDirectoryClient,
};

use crate::lock;

#[derive(Debug, Default)]
struct State {
    users: Vec<UserAccount>,
    /// Group ids each account was created with.
    memberships: Vec<(String, Vec<GroupId>)>,
    groups: Vec<Group>,
    list_calls: u32,
    status_changes: Vec<(String, AccountStatus)>,
    next_id: u32,
}

/// In-memory user directory. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeDirectory {
    state: Arc<Mutex<State>>,
}

impl FakeDirectory {
    /// A directory with the default `Administrators` and `Connectors`
    /// groups.
    pub fn new() -> Self {
        Self::with_groups(&["Administrators", "Connectors"])
    }

    pub fn with_groups(names: &[&str]) -> Self {
        let groups = names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                GroupId::parse(&format!("group-{i}"))
                    .ok()
                    .map(|id| Group {
                        id,
                        name: name.to_string(),
                    })
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(State {
                groups,
                ..State::default()
            })),
        }
    }

    /// Seed an existing account.
    pub fn insert_user(&self, name: &str, status: AccountStatus) -> UserAccount {
        let mut state = lock(&self.state);
        let account = new_account(&mut state, name, status);
        state.users.push(account.clone());
        account
    }

    pub fn user(&self, name: &str) -> Option<UserAccount> {
        lock(&self.state).users.iter().find(|u| u.name == name).cloned()
    }

    pub fn users(&self) -> Vec<UserAccount> {
        lock(&self.state).users.clone()
    }

    /// Group ids an account was created with.
    pub fn groups_of(&self, name: &str) -> Vec<GroupId> {
        lock(&self.state)
            .memberships
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, groups)| groups.clone())
            .unwrap_or_default()
    }

    pub fn group_id(&self, name: &str) -> Option<GroupId> {
        lock(&self.state)
            .groups
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.id.clone())
    }

    /// Issue a new API token for an account, as a platform-side rotation
    /// would.
    pub fn rotate_token(&self, name: &str, token: &str) {
        let mut state = lock(&self.state);
        if let Some(user) = state.users.iter_mut().find(|u| u.name == name) {
            user.api_token = token.to_string();
        }
    }

    pub fn list_calls(&self) -> u32 {
        lock(&self.state).list_calls
    }

    pub fn status_changes(&self) -> Vec<(String, AccountStatus)> {
        lock(&self.state).status_changes.clone()
    }
}

impl Default for FakeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn new_account(state: &mut State, name: &str, status: AccountStatus) -> UserAccount {
    state.next_id += 1;
    let n = state.next_id;
    UserAccount {
        id: UserId::parse(&format!("user-{n}")).expect("generated user id is well-formed"),
        name: name.to_string(),
        email: Some(format!("{name}@opencti.local")),
        status,
        api_token: format!("00000000-0000-4000-8000-{n:012}"),
    }
}

#[async_trait]
impl UserDirectoryClient for FakeDirectory {
    async fn list_users(
        &self,
        name_starts_with: Option<&str>,
    ) -> Result<Vec<UserAccount>, DirectoryError> {
        let mut state = lock(&self.state);
        state.list_calls += 1;
        Ok(state
            .users
            .iter()
            .filter(|u| name_starts_with.is_none_or(|prefix| u.name.starts_with(prefix)))
            .cloned()
            .collect())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, DirectoryError> {
        Ok(lock(&self.state).groups.clone())
    }

    async fn create_user(
        &self,
        name: &str,
        _email: Option<&str>,
        groups: &[GroupId],
    ) -> Result<UserAccount, DirectoryError> {
        let mut state = lock(&self.state);
        if state.users.iter().any(|u| u.name == name) {
            return Err(DirectoryError::Query(format!("user {name} already exists")));
        }
        let account = new_account(&mut state, name, AccountStatus::Active);
        state.users.push(account.clone());
        state.memberships.push((name.to_string(), groups.to_vec()));
        Ok(account)
    }

    async fn set_account_status(
        &self,
        id: &UserId,
        status: AccountStatus,
    ) -> Result<(), DirectoryError> {
        let mut state = lock(&self.state);
        let Some(user) = state.users.iter_mut().find(|u| &u.id == id) else {
            return Err(DirectoryError::Query(format!("user {id} not found")));
        };
        user.status = status;
        let name = user.name.clone();
        state.status_changes.push((name, status));
        Ok(())
    }
}

/// Hands out handles to one shared [`FakeDirectory`].
#[derive(Debug, Default)]
pub struct FakeDirectoryProvider {
    directory: FakeDirectory,
    connections: Mutex<Vec<(String, String)>>,
}

impl FakeDirectoryProvider {
    pub fn new(directory: FakeDirectory) -> Self {
        Self {
            directory,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// `(platform url, api token)` of every connection made.
    pub fn connections(&self) -> Vec<(String, String)> {
        lock(&self.connections).clone()
    }
}

impl DirectoryProvider for FakeDirectoryProvider {
    fn connect(
        &self,
        platform_url: &str,
        api_token: &str,
    ) -> Result<Box<dyn UserDirectoryClient>, DirectoryError> {
        lock(&self.connections).push((platform_url.to_string(), api_token.to_string()));
        Ok(Box::new(self.directory.clone()))
    }
}
