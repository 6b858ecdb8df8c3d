//! GraphQL user directory client.
//!
//! The platform exposes its users and groups over GraphQL at `/graphql`,
//! authenticated with a bearer API token. Listings are cursor-paginated and
//! followed to the last page.

use std::time::Duration;

use async_trait::async_trait;
use octi_id::{GroupId, UserId};
use octi_reconcile::{
    AccountStatus, DirectoryError, DirectoryProvider, Group, UserAccount, UserDirectoryClient,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

const PAGE_SIZE: u32 = 500;

const LIST_USERS: &str = "query ListUsers($first: Int, $after: ID, $filters: FilterGroup) { users(first: $first, after: $after, filters: $filters) { edges { node { id name user_email account_status api_token } } pageInfo { hasNextPage endCursor } } }";

const LIST_GROUPS: &str = "query ListGroups($first: Int, $after: ID) { groups(first: $first, after: $after) { edges { node { id name } } pageInfo { hasNextPage endCursor } } }";

const ADD_USER: &str = "mutation AddUser($input: UserAddInput!) { userAdd(input: $input) { id name user_email account_status api_token } }";

const EDIT_USER: &str = "mutation EditUser($id: ID!, $input: [EditInput]!) { userEdit(id: $id) { fieldPatch(input: $input) { id account_status } } }";

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    edges: Vec<Edge<T>>,
    #[serde(default, rename = "pageInfo")]
    page_info: PageInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
struct UserNode {
    id: String,
    name: String,
    #[serde(default)]
    user_email: Option<String>,
    #[serde(default)]
    account_status: Option<String>,
    #[serde(default)]
    api_token: Option<String>,
}

impl TryFrom<UserNode> for UserAccount {
    type Error = DirectoryError;

    fn try_from(node: UserNode) -> Result<Self, Self::Error> {
        let id = UserId::parse(&node.id).map_err(|e| DirectoryError::Decode(e.to_string()))?;
        // Unknown statuses are treated as locked so the account is left alone.
        let status = match node.account_status.as_deref() {
            Some("Active") | None => AccountStatus::Active,
            Some("Inactive") => AccountStatus::Inactive,
            Some("Expired") => AccountStatus::Expired,
            Some(_) => AccountStatus::Locked,
        };
        Ok(UserAccount {
            id,
            name: node.name,
            email: node.user_email,
            status,
            api_token: node.api_token.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GroupNode {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct UsersData {
    users: Connection<UserNode>,
}

#[derive(Debug, Deserialize)]
struct GroupsData {
    groups: Connection<GroupNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddUserData {
    user_add: UserNode,
}

/// Directory client bound to one platform and API token.
#[derive(Debug, Clone)]
pub struct GraphqlDirectory {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl GraphqlDirectory {
    pub fn new(platform_url: &str, token: &str) -> Result<Self, DirectoryError> {
        let base = Url::parse(platform_url)
            .map_err(|e| DirectoryError::Transport(format!("invalid platform url: {e}")))?;
        let endpoint = base
            .join("graphql")
            .map_err(|e| DirectoryError::Transport(format!("invalid platform url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            token: token.to_string(),
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, DirectoryError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: GraphqlResponse<T> = response
            .json()
            .await
            .map_err(|e| DirectoryError::Decode(e.to_string()))?;
        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(DirectoryError::Query(messages.join("; ")));
        }
        body.data
            .ok_or_else(|| DirectoryError::Decode("response has no data".to_string()))
    }

    /// Follow a paginated listing to its last page.
    async fn paginate<D, T>(
        &self,
        query: &str,
        mut variables: Value,
        connection: impl Fn(D) -> Connection<T>,
    ) -> Result<Vec<T>, DirectoryError>
    where
        D: DeserializeOwned,
    {
        let mut nodes = Vec::new();
        let mut after: Option<String> = None;
        loop {
            variables["first"] = json!(PAGE_SIZE);
            variables["after"] = json!(after);
            let page = connection(self.execute(query, variables.clone()).await?);
            nodes.extend(page.edges.into_iter().map(|edge| edge.node));
            if !page.page_info.has_next_page {
                return Ok(nodes);
            }
            match page.page_info.end_cursor {
                Some(cursor) if after.as_deref() != Some(cursor.as_str()) => after = Some(cursor),
                _ => {
                    return Err(DirectoryError::Decode(
                        "pagination cursor did not advance".to_string(),
                    ))
                }
            }
        }
    }
}

/// Server-side filter on account names starting with `prefix`.
fn name_prefix_filter(prefix: &str) -> Value {
    json!({
        "mode": "and",
        "filters": [{ "key": ["name"], "values": [prefix], "operator": "starts_with" }],
        "filterGroups": [],
    })
}

#[async_trait]
impl UserDirectoryClient for GraphqlDirectory {
    async fn list_users(
        &self,
        name_starts_with: Option<&str>,
    ) -> Result<Vec<UserAccount>, DirectoryError> {
        let mut variables = json!({});
        if let Some(prefix) = name_starts_with {
            variables["filters"] = name_prefix_filter(prefix);
        }
        let nodes = self
            .paginate(LIST_USERS, variables, |data: UsersData| data.users)
            .await?;
        // The filter is advisory; keep only matching names regardless.
        let users = nodes
            .into_iter()
            .filter(|node| name_starts_with.is_none_or(|prefix| node.name.starts_with(prefix)))
            .map(UserAccount::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = users.len(), "listed directory accounts");
        Ok(users)
    }

    async fn list_groups(&self) -> Result<Vec<Group>, DirectoryError> {
        let nodes = self
            .paginate(LIST_GROUPS, json!({}), |data: GroupsData| data.groups)
            .await?;
        nodes
            .into_iter()
            .map(|node| {
                let id =
                    GroupId::parse(&node.id).map_err(|e| DirectoryError::Decode(e.to_string()))?;
                Ok(Group {
                    id,
                    name: node.name,
                })
            })
            .collect()
    }

    async fn create_user(
        &self,
        name: &str,
        email: Option<&str>,
        groups: &[GroupId],
    ) -> Result<UserAccount, DirectoryError> {
        // The platform requires an email and a password even for API-only
        // accounts; the password is never used.
        let email = email
            .map(str::to_string)
            .unwrap_or_else(|| format!("{name}@opencti.local"));
        let input = json!({
            "name": name,
            "user_email": email,
            "password": octi_secrets::generate_password(),
            "groups": groups.iter().map(GroupId::as_str).collect::<Vec<_>>(),
        });
        let data: AddUserData = self.execute(ADD_USER, json!({ "input": input })).await?;
        let account = UserAccount::try_from(data.user_add)?;
        debug!(name = name, user_id = %account.id, "directory account created");
        Ok(account)
    }

    async fn set_account_status(
        &self,
        id: &UserId,
        status: AccountStatus,
    ) -> Result<(), DirectoryError> {
        let variables = json!({
            "id": id.as_str(),
            "input": [{ "key": "account_status", "value": [status.as_str()] }],
        });
        let _: Value = self.execute(EDIT_USER, variables).await?;
        debug!(user_id = %id, status = status.as_str(), "directory account status set");
        Ok(())
    }
}

/// Opens [`GraphqlDirectory`] clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphqlDirectoryProvider;

impl DirectoryProvider for GraphqlDirectoryProvider {
    fn connect(
        &self,
        platform_url: &str,
        api_token: &str,
    ) -> Result<Box<dyn UserDirectoryClient>, DirectoryError> {
        Ok(Box::new(GraphqlDirectory::new(platform_url, api_token)?))
    }
}
