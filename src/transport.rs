//! HTTP request/response contract and the reqwest-backed transport
//!
//! The server is opaque: it accepts `{method, endpoint, payload}` and answers
//! with `{success, data, message?}`. Everything the engine needs to know about
//! a failure is folded into [`TransportError`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// HTTP methods the engine issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request against the server API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            payload,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint, None)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Response envelope, also used for responses synthesized offline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set on responses produced by the optimistic applier
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_offline_operation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    /// Set on bulk reads served from the local store
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_offline_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<i64>,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            ..Default::default()
        }
    }
}

/// Transport-level failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// No response was received
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with a non-success status
    #[error("Server returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the request got no answer at all.
    pub fn is_no_response(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Timeout(_)
        )
    }
}

/// Sends API requests to the server
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Supplies the bearer token attached to outgoing requests
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Token fixed at startup (config or environment)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// reqwest-backed transport: auth-attach stage followed by dispatch.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            tokens,
        }
    }

    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

/// Auth-attach stage
fn attach_auth(builder: reqwest::RequestBuilder, tokens: &dyn TokenProvider) -> reqwest::RequestBuilder {
    match tokens.bearer_token() {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

/// Interpret a successful body: envelope if it looks like one, raw data otherwise.
pub fn parse_success_body(body: Value) -> ApiResponse {
    let is_envelope = body
        .as_object()
        .map(|o| o.get("success").map(Value::is_boolean).unwrap_or(false))
        .unwrap_or(false);
    if is_envelope {
        match serde_json::from_value::<ApiResponse>(body.clone()) {
            Ok(resp) => resp,
            Err(_) => ApiResponse::ok(body),
        }
    } else {
        ApiResponse::ok(body)
    }
}

/// Build the error for a non-success status.
pub fn status_error(status: u16, body: Option<Value>) -> TransportError {
    let message = body
        .as_ref()
        .and_then(|b| b.get("message").or_else(|| b.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status));
    TransportError::Status {
        status,
        message,
        body,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.endpoint);
        let mut builder = self
            .client
            .request(request.method.to_reqwest(), &url)
            .timeout(self.timeout);
        builder = attach_auth(builder, self.tokens.as_ref());
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }

        debug!(method = %request.method, %url, "Dispatching request");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Unreachable(e.to_string())
            }
        })?;
        let body: Option<Value> = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };

        if !status.is_success() {
            warn!(method = %request.method, %url, status = status.as_u16(), "Request rejected");
            return Err(status_error(status.as_u16(), body));
        }

        let resp = parse_success_body(body.unwrap_or(Value::Null));
        if !resp.success {
            return Err(TransportError::InvalidResponse(
                resp.message
                    .unwrap_or_else(|| "server reported success=false".to_string()),
            ));
        }
        Ok(resp)
    }
}
