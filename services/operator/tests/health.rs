//! HTTP health probe and the degraded watcher loop.

use std::time::Duration;

use octi_operator::health::wait_healthy;
use octi_operator::HttpProbe;
use octi_reconcile::{HealthProbe, ProbeError};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_probe_passes_on_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .and(query_param("health_access_key", "key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let probe = HttpProbe::new(Duration::from_secs(5)).unwrap();
    let url = format!("{}/health?health_access_key=key", server.uri());
    probe.probe(&url).await.unwrap();
}

#[tokio::test]
async fn test_probe_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let probe = HttpProbe::new(Duration::from_secs(5)).unwrap();
    let err = probe
        .probe(&format!("{}/health", server.uri()))
        .await
        .unwrap_err();
    assert_eq!(err, ProbeError::Unhealthy { status: 503 });
}

#[tokio::test]
async fn test_probe_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let probe = HttpProbe::new(Duration::from_millis(200)).unwrap();
    let err = probe
        .probe(&format!("{}/health", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::Transport(_)));
}

#[tokio::test]
async fn test_wait_healthy_runs_notify() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("notified");
    let probe = HttpProbe::new(Duration::from_secs(5)).unwrap();
    wait_healthy(
        &probe,
        &format!("{}/health", server.uri()),
        Duration::from_millis(10),
        Some(10),
        &format!("touch {}", marker.display()),
    )
    .await
    .unwrap();

    assert!(marker.exists());
}

#[tokio::test]
async fn test_wait_healthy_gives_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("notified");
    let probe = HttpProbe::new(Duration::from_secs(5)).unwrap();
    let result = wait_healthy(
        &probe,
        &format!("{}/health", server.uri()),
        Duration::from_millis(10),
        Some(3),
        &format!("touch {}", marker.display()),
    )
    .await;

    assert!(result.is_err());
    assert!(!marker.exists());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}
