//! Outbound transport
//!
//! Adapters describe calls as [`ServiceRequest`]s and hand them to a
//! [`Transport`]. The default transport speaks HTTP through reqwest; tests
//! inject scripted ones.

use async_trait::async_trait;
use opshub_core::AdapterSettings;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{AdapterError, AdapterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// A transport-neutral description of one call to an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ServiceRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Raw response from an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: Value,
}

impl ServiceResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map the status onto the error taxonomy, returning the body on 2xx.
    pub fn into_result(self) -> AdapterResult<Value> {
        let message = || {
            self.body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("status {}", self.status))
        };
        match self.status {
            200..=299 => Ok(self.body),
            429 => Err(AdapterError::RateLimited(message())),
            401 | 403 => Err(AdapterError::PermissionDenied(message())),
            404 => Err(AdapterError::NotFound(message())),
            status @ 500..=599 => Err(AdapterError::ServiceUnavailable {
                status: Some(status),
                message: message(),
            }),
            // Remaining 4xx, plus informational and redirect statuses.
            status => Err(AdapterError::RequestRejected {
                status,
                message: message(),
            }),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. Only network-level failures are errors; any HTTP
    /// status comes back as a response.
    async fn send(&self, request: ServiceRequest) -> AdapterResult<ServiceResponse>;
}

/// HTTP transport backed by a shared reqwest client.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: Vec::new(),
        })
    }

    pub fn from_settings(settings: &AdapterSettings) -> AdapterResult<Self> {
        Self::new(&settings.base_url, settings.request_timeout())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ServiceRequest) -> AdapterResult<ServiceResponse> {
        let url = self.url(&request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &url).query(&request.query);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout(format!("{}: {}", url, e))
            } else {
                AdapterError::ConnectionFailed(format!("{}: {}", url, e))
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| AdapterError::ConnectionFailed(format!("failed to read body: {}", e)))?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ServiceResponse { status, body })
    }
}
