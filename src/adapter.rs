//! HTTP adapter seam.
//!
//! The cache layer never talks to the network itself; callers hand it
//! fetch closures built over an [`HttpAdapter`]. The adapter owns wire
//! concerns: turning a URL and options into a transport request,
//! executing it, and folding transport failures into the crate's error
//! taxonomy. Adapters are injected wherever they are used — there is no
//! process-wide registry, so tests can run isolated instances side by
//! side.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{FetchError, FetchResult};

/// Caller-side request options handed to the adapter.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// HTTP method; empty means GET.
    pub method: String,
    /// Header name/value pairs.
    pub headers: HashMap<String, String>,
    /// JSON body for methods that carry one.
    pub body: Option<Value>,
    /// Per-request deadline.
    pub timeout: Option<Duration>,
}

/// Transport-ready request.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    /// Uppercased HTTP method.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: HashMap<String, String>,
    /// Serialized JSON body, if any.
    pub body: Option<Value>,
    /// Per-request deadline.
    pub timeout: Option<Duration>,
}

/// Transport response, already folded into adapter shape.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl AdapterResponse {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> FetchResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|err| FetchError::Parse(format!("response body: {}", err)))
    }

    /// Decode the body as UTF-8 text.
    pub fn text(&self) -> FetchResult<String> {
        String::from_utf8(self.body.clone())
            .map_err(|err| FetchError::Parse(format!("response body: {}", err)))
    }
}

/// Boundary between the cache layer and a concrete HTTP client.
#[async_trait]
pub trait HttpAdapter: Send + Sync {
    /// Adapter identifier used in logs.
    fn name(&self) -> &str;

    /// Build a transport request from a URL and caller options.
    fn transform_request(&self, url: &str, options: &RequestOptions) -> AdapterRequest {
        let method = if options.method.is_empty() {
            "GET".to_string()
        } else {
            options.method.to_uppercase()
        };
        AdapterRequest {
            method,
            url: url.to_string(),
            headers: options.headers.clone(),
            body: options.body.clone(),
            timeout: options.timeout,
        }
    }

    /// Execute a request, classifying failures into the error taxonomy.
    async fn request(&self, request: AdapterRequest) -> FetchResult<AdapterResponse>;
}

/// Default adapter over a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestAdapter {
    client: reqwest::Client,
}

impl ReqwestAdapter {
    /// Create an adapter with a fresh client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter over an existing client (shared pools,
    /// custom TLS, proxies).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn classify(err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout(0);
        }
        if let Some(status) = err.status() {
            return Self::status_error(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return FetchError::Parse(err.to_string());
        }
        if err.is_connect() || err.is_request() {
            return FetchError::Network(err.to_string());
        }
        FetchError::Unknown(err.to_string())
    }

    fn status_error(status: u16, message: String) -> FetchError {
        match status {
            400..=499 => FetchError::Client { status, message },
            500..=599 => FetchError::Server { status, message },
            _ => FetchError::Unknown(message),
        }
    }

    /// Fold a raw `reqwest` response into an [`AdapterResponse`],
    /// classifying non-success statuses.
    pub async fn transform_response(
        &self,
        response: reqwest::Response,
    ) -> FetchResult<AdapterResponse> {
        let status = response.status().as_u16();

        if !response.status().is_success() {
            let message = response
                .status()
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string();
            return Err(Self::status_error(status, message));
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(Self::classify)?.to_vec();
        Ok(AdapterResponse { status, headers, body })
    }
}

#[async_trait]
impl HttpAdapter for ReqwestAdapter {
    fn name(&self) -> &str {
        "reqwest"
    }

    async fn request(&self, request: AdapterRequest) -> FetchResult<AdapterResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FetchError::Unknown(format!("bad method: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(Self::classify)?;
        self.transform_response(response).await
    }
}
