//! Typed facade over one cluster's administrative REST surface
//!
//! A client is bound to an effective endpoint (the cluster's direct URL or
//! its tunneled loopback address) and optional basic-auth credentials. All
//! request validation happens here, before anything touches the network.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Methods permitted for ad-hoc query execution
const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::HEAD,
];

/// Recognized flags for cluster settings reads, forwarded verbatim
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SettingsOptions {
    #[serde(default)]
    pub include_defaults: bool,
    #[serde(default)]
    pub flat_settings: bool,
}

/// One administrative action against an index
#[derive(Debug, Clone, Deserialize)]
pub struct OperationRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Ad-hoc query execution request from the query workspace
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub index: Option<String>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug)]
pub struct SearchClient {
    http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    probe_timeout: Duration,
}

impl SearchClient {
    /// Create a client bound to an effective endpoint
    pub fn new(
        endpoint: &str,
        username: Option<String>,
        password: Option<String>,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            username,
            password,
            probe_timeout: config.probe_timeout(),
        })
    }

    /// The URL this client actually connects to
    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.http.request(method, url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        request
    }

    /// Issue one call, mapping transport failures into the taxonomy
    ///
    /// Idempotent reads are retried once on a transient connection error;
    /// writes never are.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let retry_read = method == Method::GET || method == Method::HEAD;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut request = self.request(method.clone(), path);
            if let Some(body) = body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) => return read_response(response).await,
                Err(e) if e.is_timeout() => {
                    return Err(GatewayError::Timeout(format!(
                        "Request to {} timed out",
                        path
                    )));
                }
                Err(e) if e.is_connect() && retry_read && attempts == 1 => {
                    debug!("Transient connection error for {}, retrying once: {}", path, e);
                    continue;
                }
                Err(e) => {
                    return Err(GatewayError::Connectivity(format!(
                        "Request to {} failed: {}",
                        path, e
                    )));
                }
            }
        }
    }

    /// Lightweight reachability probe
    ///
    /// Any response means reachable; a network failure is the answer, not
    /// an error.
    pub async fn test_connection(&self) -> bool {
        match self
            .request(Method::GET, "/")
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => {
                debug!(
                    "Connection probe of {} answered {}",
                    self.base_url,
                    response.status()
                );
                true
            }
            Err(e) => {
                debug!("Connection probe of {} failed: {}", self.base_url, e);
                false
            }
        }
    }

    pub async fn get_cluster_health(&self) -> Result<Value> {
        self.send(Method::GET, "_cluster/health", None).await
    }

    pub async fn get_cluster_stats(&self) -> Result<Value> {
        self.send(Method::GET, "_cluster/stats", None).await
    }

    pub async fn get_cluster_settings(&self, options: SettingsOptions) -> Result<Value> {
        let path = format!(
            "_cluster/settings?include_defaults={}&flat_settings={}",
            options.include_defaults, options.flat_settings
        );
        self.send(Method::GET, &path, None).await
    }

    pub async fn list_indices(&self) -> Result<Value> {
        self.send(Method::GET, "_cat/indices?format=json&bytes=b", None)
            .await
    }

    pub async fn get_index_settings(&self, index: &str) -> Result<Value> {
        validate_index_name(index)?;
        self.send(Method::GET, &format!("{}/_settings", index), None)
            .await
    }

    pub async fn get_index_stats(&self, index: &str) -> Result<Value> {
        validate_index_name(index)?;
        self.send(Method::GET, &format!("{}/_stats", index), None)
            .await
    }

    pub async fn update_index_settings(&self, index: &str, settings: &Value) -> Result<Value> {
        validate_index_name(index)?;
        if !settings.is_object() {
            return Err(GatewayError::Validation(
                "index settings body must be a JSON object".to_string(),
            ));
        }
        self.send(Method::PUT, &format!("{}/_settings", index), Some(settings))
            .await
    }

    /// Generic administrative action confined to one index (open, close,
    /// flush, forcemerge, ...)
    pub async fn execute_index_operation(
        &self,
        index: &str,
        request: &OperationRequest,
    ) -> Result<Value> {
        validate_index_name(index)?;
        let method = parse_method(&request.method)?;
        let path = validate_index_path(index, &request.path)?;
        self.send(method, &path, request.body.as_ref()).await
    }

    /// Execute an ad-hoc query from the query workspace
    pub async fn execute_query(&self, request: &QueryRequest) -> Result<Value> {
        let method = parse_method(&request.method)?;
        let body = normalize_body(&method, request.body.as_ref())?;
        let path = join_query_path(request.index.as_deref(), &request.path)?;
        self.send(method, &path, body.as_ref()).await
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await.map_err(|e| {
        GatewayError::Connectivity(format!("Failed to read response body: {}", e))
    })?;
    let body: Option<Value> = if text.is_empty() {
        None
    } else {
        serde_json::from_str(&text).ok()
    };

    if status.is_success() {
        return Ok(body.unwrap_or(Value::Null));
    }
    Err(remote_error(status, body, &text))
}

fn remote_error(status: StatusCode, body: Option<Value>, raw: &str) -> GatewayError {
    let message = body
        .as_ref()
        .and_then(extract_reason)
        .unwrap_or_else(|| {
            if raw.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("remote error")
                    .to_string()
            } else {
                raw.chars().take(200).collect()
            }
        });
    GatewayError::Remote {
        status: status.as_u16(),
        message,
        body,
    }
}

/// Pull the engine's own explanation out of an error body when present
fn extract_reason(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    if let Some(reason) = error.get("reason").and_then(Value::as_str) {
        return Some(reason.to_string());
    }
    if let Some(kind) = error.get("type").and_then(Value::as_str) {
        return Some(kind.to_string());
    }
    error.as_str().map(String::from)
}

fn parse_method(method: &str) -> Result<Method> {
    let upper = method.trim().to_ascii_uppercase();
    ALLOWED_METHODS
        .iter()
        .find(|m| m.as_str() == upper)
        .cloned()
        .ok_or_else(|| GatewayError::Validation(format!("Method {} is not allowed", method)))
}

fn validate_index_name(index: &str) -> Result<()> {
    if index.trim().is_empty() {
        return Err(GatewayError::Validation(
            "index name must not be empty".to_string(),
        ));
    }
    if index.contains('/') || index.contains('\\') {
        return Err(GatewayError::Validation(
            "index name must not contain path separators".to_string(),
        ));
    }
    if index == "." || index.contains("..") {
        return Err(GatewayError::Validation(
            "index name must not contain traversal sequences".to_string(),
        ));
    }
    Ok(())
}

/// Confine an operation path to the given index segment
fn validate_index_path(index: &str, path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    let first = trimmed.split('/').next().unwrap_or("");
    if first != index {
        return Err(GatewayError::Validation(format!(
            "Operation path must stay within index {}",
            index
        )));
    }
    if trimmed
        .split('/')
        .any(|segment| segment == ".." || segment == ".")
    {
        return Err(GatewayError::Validation(
            "Operation path must not contain traversal segments".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn join_query_path(index: Option<&str>, path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(GatewayError::Validation(
            "Query path must not contain traversal segments".to_string(),
        ));
    }
    match index {
        Some(index) => {
            validate_index_name(index)?;
            Ok(format!("{}/{}", index, trimmed))
        }
        None => Ok(trimmed.to_string()),
    }
}

/// String bodies are parsed as JSON before transmission; GET and HEAD
/// carry no body at all
fn normalize_body(method: &Method, body: Option<&Value>) -> Result<Option<Value>> {
    let Some(body) = body else {
        return Ok(None);
    };
    if *method == Method::GET || *method == Method::HEAD {
        return Ok(None);
    }
    match body {
        Value::String(raw) => {
            if raw.trim().is_empty() {
                return Ok(None);
            }
            let parsed: Value = serde_json::from_str(raw).map_err(|e| {
                GatewayError::Validation(format!("Request body is not valid JSON: {}", e))
            })?;
            Ok(Some(parsed))
        }
        other => Ok(Some(other.clone())),
    }
}
