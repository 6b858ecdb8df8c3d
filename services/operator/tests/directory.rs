//! GraphQL directory client against a mock platform.

use octi_id::{GroupId, UserId};
use octi_operator::{GraphqlDirectory, GraphqlDirectoryProvider};
use octi_reconcile::{AccountStatus, DirectoryError, DirectoryProvider, UserDirectoryClient};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "2b5a9c0e-7f3d-4c1a-8e6b-0d9f4a3c2e1b";

fn users_body() -> serde_json::Value {
    json!({
        "data": {
            "users": {
                "edges": [
                    { "node": {
                        "id": "7a3e1c52-0d4b-4f8e-9a61-2c5b8d0e4f13",
                        "name": "admin",
                        "user_email": "admin@example.com",
                        "account_status": "Active",
                        "api_token": TOKEN
                    } },
                    { "node": {
                        "id": "c41f7b09-5e2a-4d36-b8c7-91a0e3f6d258",
                        "name": "connector-mitre",
                        "user_email": "connector-mitre@opencti.local",
                        "account_status": "Inactive",
                        "api_token": "e8d1c3b2-4a5f-4e6d-9c7b-1a2b3c4d5e6f"
                    } }
                ]
            }
        }
    })
}

#[tokio::test]
async fn test_list_users_with_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .and(body_string_contains("ListUsers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(users_body()))
        .expect(2)
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    let all = directory.list_users(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let connectors = directory.list_users(Some("connector-")).await.unwrap();
    assert_eq!(connectors.len(), 1);
    assert_eq!(connectors[0].name, "connector-mitre");
    assert_eq!(connectors[0].status, AccountStatus::Inactive);
}

#[tokio::test]
async fn test_create_user_sends_groups() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("userAdd"))
        .and(body_string_contains("\"groups\":[\"4f2d8a61-93be-4c07-a5e1-6b0c2d7f9e38\"]"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "userAdd": {
                "id": "0e6f2a1d-8b3c-4d5e-a7f9-c1b2d3e4f506",
                "name": "connector-crowdstrike",
                "user_email": "connector-crowdstrike@opencti.local",
                "account_status": "Active",
                "api_token": "f0e1d2c3-b4a5-4697-8879-6a5b4c3d2e1f"
            } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    let group = GroupId::parse("4f2d8a61-93be-4c07-a5e1-6b0c2d7f9e38").unwrap();
    let account = directory
        .create_user("connector-crowdstrike", None, &[group])
        .await
        .unwrap();
    assert_eq!(account.name, "connector-crowdstrike");
    assert_eq!(account.api_token, "f0e1d2c3-b4a5-4697-8879-6a5b4c3d2e1f");
    assert_eq!(account.status, AccountStatus::Active);
}

#[tokio::test]
async fn test_set_account_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("fieldPatch"))
        .and(body_string_contains("\"value\":[\"Inactive\"]"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "userEdit": { "fieldPatch": {
                "id": "c41f7b09-5e2a-4d36-b8c7-91a0e3f6d258",
                "account_status": "Inactive"
            } } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    let id = UserId::parse("c41f7b09-5e2a-4d36-b8c7-91a0e3f6d258").unwrap();
    directory
        .set_account_status(&id, AccountStatus::Inactive)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_groups_via_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("ListGroups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "groups": { "edges": [
                { "node": { "id": "4f2d8a61-93be-4c07-a5e1-6b0c2d7f9e38", "name": "Administrators" } },
                { "node": { "id": "9b8c7d6e-5f4a-4b3c-8d2e-1f0a9b8c7d6e", "name": "Connectors" } }
            ] } }
        })))
        .mount(&server)
        .await;

    let client = GraphqlDirectoryProvider.connect(&server.uri(), TOKEN).unwrap();
    let groups = client.list_groups().await.unwrap();
    let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, ["Administrators", "Connectors"]);
}

#[tokio::test]
async fn test_graphql_errors_surface() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": [{ "message": "You are not allowed to do this." }]
        })))
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    assert_eq!(
        directory.list_groups().await.unwrap_err(),
        DirectoryError::Query("You are not allowed to do this.".into())
    );
}

#[tokio::test]
async fn test_http_failure_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    assert_eq!(
        directory.list_users(None).await.unwrap_err(),
        DirectoryError::Api {
            status: 502,
            message: "bad gateway".into()
        }
    );
}

fn user_page(names: &[&str], next: Option<&str>) -> serde_json::Value {
    let edges: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            json!({ "node": {
                "id": format!("00000000-0000-4000-8000-{:012}", name.len() * 100 + i),
                "name": name,
                "account_status": "Active",
                "api_token": format!("token-{name}")
            } })
        })
        .collect();
    json!({
        "data": { "users": {
            "edges": edges,
            "pageInfo": { "hasNextPage": next.is_some(), "endCursor": next }
        } }
    })
}

#[tokio::test]
async fn test_list_users_follows_pages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"after\":null"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(user_page(&["connector-a", "connector-b"], Some("cursor-1"))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"after\":\"cursor-1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_page(&["connector-c"], None)))
        .expect(1)
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    let users = directory.list_users(Some("connector-")).await.unwrap();
    let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, ["connector-a", "connector-b", "connector-c"]);
}

#[tokio::test]
async fn test_list_users_filters_by_prefix_on_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"operator\":\"starts_with\""))
        .and(body_string_contains("\"values\":[\"connector-\"]"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_page(&["connector-a"], None)))
        .expect(1)
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    let users = directory.list_users(Some("connector-")).await.unwrap();
    assert_eq!(users.len(), 1);
}

#[tokio::test]
async fn test_stuck_cursor_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(user_page(&["connector-a"], Some("cursor-1"))),
        )
        .expect(2)
        .mount(&server)
        .await;

    let directory = GraphqlDirectory::new(&server.uri(), TOKEN).unwrap();
    assert!(matches!(
        directory.list_users(None).await,
        Err(DirectoryError::Decode(_))
    ));
}
