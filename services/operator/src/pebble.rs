//! Process supervisor client.
//!
//! Speaks the supervisor's JSON API over the Unix socket it exposes to the
//! operator. Service actions are asynchronous on the supervisor side: each
//! returns a change id which is waited on before the call returns.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use octi_reconcile::plan::{CheckSpec, DesiredPlan, ServiceSpec};
use octi_reconcile::{Supervisor, SupervisorError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

/// Multipart boundary used for file pushes.
const BOUNDARY: &str = "octi-operator-file-boundary";

/// How long the supervisor may take to settle a change.
const CHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the supervisor API.
#[derive(Debug, Error)]
pub enum PebbleError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("change {id} failed: {message}")]
    Change { id: String, message: String },
}

impl From<hyper::http::Error> for PebbleError {
    fn from(err: hyper::http::Error) -> Self {
        PebbleError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

impl From<PebbleError> for SupervisorError {
    fn from(err: PebbleError) -> Self {
        match err {
            PebbleError::Http(e) => SupervisorError::Unreachable(e.to_string()),
            PebbleError::Api { status, message } => SupervisorError::Api { status, message },
            other => SupervisorError::Api {
                status: 0,
                message: other.to_string(),
            },
        }
    }
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "status-code", default)]
    status_code: u16,
    #[serde(default)]
    change: Option<String>,
    #[serde(default)]
    result: Value,
}

impl Envelope {
    fn error_message(&self) -> String {
        self.result
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// Layer document; plan files are pushed separately.
#[derive(Debug, Serialize)]
struct Layer<'a> {
    summary: &'a str,
    description: &'a str,
    services: &'a BTreeMap<String, ServiceSpec>,
    #[serde(skip_serializing_if = "no_checks")]
    checks: &'a BTreeMap<String, CheckSpec>,
}

fn no_checks(checks: &&BTreeMap<String, CheckSpec>) -> bool {
    checks.is_empty()
}

impl<'a> From<&'a DesiredPlan> for Layer<'a> {
    fn from(plan: &'a DesiredPlan) -> Self {
        Self {
            summary: &plan.summary,
            description: &plan.description,
            services: &plan.services,
            checks: &plan.checks,
        }
    }
}

#[derive(Debug, Serialize)]
struct AddLayer<'a> {
    action: &'static str,
    combine: bool,
    label: &'a str,
    format: &'static str,
    layer: String,
}

#[derive(Debug, Serialize)]
struct ServiceAction<'a> {
    action: &'static str,
    services: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct ChangeResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: Option<String>,
}

/// Supervisor client for one workload container.
pub struct PebbleClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl PebbleClient {
    /// Create a new client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn services_action(&self, action: &'static str, services: &[&str]) -> Result<(), PebbleError> {
        let envelope = self
            .send_json(Method::POST, "/v1/services", &ServiceAction { action, services })
            .await?;
        self.settle(envelope).await
    }

    /// Wait for an asynchronous change to finish.
    async fn settle(&self, envelope: Envelope) -> Result<(), PebbleError> {
        let Some(id) = envelope.change else {
            return Ok(());
        };
        let path = format!("/v1/changes/{id}/wait?timeout={}s", CHANGE_TIMEOUT.as_secs());
        let envelope = self.send(Method::GET, &path, None, Body::empty()).await?;
        let change: ChangeResult = serde_json::from_value(envelope.result)?;
        match change.err {
            Some(message) if !message.is_empty() => {
                error!(change = %id, status = %change.status, message = %message, "supervisor change failed");
                Err(PebbleError::Change { id, message })
            }
            _ => {
                debug!(change = %id, status = %change.status, "supervisor change settled");
                Ok(())
            }
        }
    }

    async fn send_json<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<Envelope, PebbleError> {
        let body = serde_json::to_vec(body)?;
        self.send(method, path, Some("application/json".to_string()), Body::from(body))
            .await
    }

    /// Perform one request and unwrap the response envelope.
    async fn send(
        &self,
        method: Method,
        path: &str,
        content_type: Option<String>,
        body: Body,
    ) -> Result<Envelope, PebbleError> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(method = %method, path = path, "request to supervisor API");

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        if let Some(content_type) = content_type {
            request = request.header("Content-Type", content_type);
        }
        let request = request.body(body)?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(PebbleError::Api {
                    status: status.as_u16(),
                    message: String::from_utf8_lossy(&bytes).to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !status.is_success() || envelope.kind == "error" {
            let message = envelope.error_message();
            error!(status = %status, message = %message, "supervisor API error");
            return Err(PebbleError::Api {
                status: if envelope.status_code > 0 {
                    envelope.status_code
                } else {
                    status.as_u16()
                },
                message,
            });
        }
        Ok(envelope)
    }
}

/// Multipart body writing one file, creating parent directories.
fn file_push_body(path: &str, content: &str) -> Result<Vec<u8>, serde_json::Error> {
    let request = serde_json::json!({
        "action": "write",
        "files": [{ "path": path, "make-dirs": true, "permissions": "600" }],
    });
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"request\"\r\n");
    body.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    body.extend_from_slice(&serde_json::to_vec(&request)?);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"files\"; filename=\"{path}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content.as_bytes());
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}

/// First per-file error reported by a file push.
fn file_error(result: &Value) -> Option<String> {
    result.as_array()?.iter().find_map(|entry| {
        entry
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

#[async_trait]
impl Supervisor for PebbleClient {
    async fn can_connect(&self) -> bool {
        match self.send(Method::GET, "/v1/system-info", None, Body::empty()).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, socket = %self.socket_path, "supervisor not reachable");
                false
            }
        }
    }

    async fn add_layer(
        &self,
        label: &str,
        plan: &DesiredPlan,
        combine: bool,
    ) -> Result<(), SupervisorError> {
        let layer = serde_json::to_string(&Layer::from(plan)).map_err(PebbleError::from)?;
        let request = AddLayer {
            action: "add",
            combine,
            label,
            format: "yaml",
            layer,
        };
        self.send_json(Method::POST, "/v1/layers", &request).await?;
        debug!(label = label, services = plan.services.len(), "layer added");
        Ok(())
    }

    async fn replan(&self) -> Result<(), SupervisorError> {
        Ok(self.services_action("replan", &[]).await?)
    }

    async fn start(&self, service: &str) -> Result<(), SupervisorError> {
        Ok(self.services_action("start", &[service]).await?)
    }

    async fn stop(&self, service: &str) -> Result<(), SupervisorError> {
        Ok(self.services_action("stop", &[service]).await?)
    }

    async fn push_file(&self, path: &str, content: &str) -> Result<(), SupervisorError> {
        let body = file_push_body(path, content).map_err(PebbleError::from)?;
        let envelope = self
            .send(
                Method::POST,
                "/v1/files",
                Some(format!("multipart/form-data; boundary={BOUNDARY}")),
                Body::from(body),
            )
            .await?;
        if let Some(message) = file_error(&envelope.result) {
            return Err(SupervisorError::Api {
                status: envelope.status_code,
                message,
            });
        }
        debug!(path = path, "file pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use octi_reconcile::plan::{Override, Startup};

    use super::*;

    fn plan() -> DesiredPlan {
        DesiredPlan {
            summary: "opencti".into(),
            description: "opencti".into(),
            services: BTreeMap::from([(
                "platform".to_string(),
                ServiceSpec {
                    override_: Override::Replace,
                    summary: "platform".into(),
                    command: "node build/back.js".into(),
                    startup: Some(Startup::Disabled),
                    on_failure: None,
                    working_dir: None,
                    environment: BTreeMap::new(),
                    after: Vec::new(),
                    requires: Vec::new(),
                },
            )]),
            checks: BTreeMap::new(),
            files: BTreeMap::from([("/opt/ca.pem".to_string(), "pem".to_string())]),
        }
    }

    #[test]
    fn test_layer_excludes_files() {
        let plan = plan();
        let value = serde_json::to_value(Layer::from(&plan)).unwrap();
        assert_eq!(value["services"]["platform"]["startup"], "disabled");
        assert!(value.get("files").is_none());
        assert!(value.get("checks").is_none());
    }

    #[test]
    fn test_file_push_body() {
        let body = String::from_utf8(file_push_body("/opt/ca.pem", "PEM DATA").unwrap()).unwrap();
        assert!(body.starts_with(&format!("--{BOUNDARY}\r\n")));
        assert!(body.contains("\"make-dirs\":true"));
        assert!(body.contains("filename=\"/opt/ca.pem\""));
        assert!(body.contains("\r\n\r\nPEM DATA\r\n"));
        assert!(body.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }

    #[test]
    fn test_file_error() {
        let ok = serde_json::json!([{ "path": "/a" }]);
        assert_eq!(file_error(&ok), None);
        let failed = serde_json::json!([{ "path": "/a", "error": { "message": "permission denied" } }]);
        assert_eq!(file_error(&failed).as_deref(), Some("permission denied"));
    }

    #[test]
    fn test_api_error_passes_through() {
        let err = PebbleError::Api {
            status: 400,
            message: "bad layer".into(),
        };
        assert_eq!(
            SupervisorError::from(err),
            SupervisorError::Api {
                status: 400,
                message: "bad layer".into()
            }
        );
    }
}
