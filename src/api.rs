//! Central POS backend client.
//!
//! The remote store is reached over HTTP: typed operations are posted to
//! `/api/pos/query`, reachability is probed with `/api/health`, and menu
//! images are streamed from the same host (or any absolute URL).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{CoreError, Result};
use crate::query::{Operation, QueryResult};

/// Connect timeout for every request; overall deadlines are set by callers.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Authoritative store the router prefers.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Lightweight reachability check.
    async fn ping(&self) -> Result<()>;

    /// Run one operation remotely.
    async fn execute(&self, op: &Operation) -> Result<QueryResult>;
}

/// Where image bytes come from.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Stream the body at `url` into `sink`, returning the bytes written.
    async fn fetch_to(&self, url: &str, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Canonical backend address: a scheme, no trailing slash and no `/api`
/// suffix, since request paths are appended per call. Bare loopback hosts
/// get plain http.
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let address = trimmed
        .strip_suffix("/api")
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    if address.contains("://") {
        return address.to_string();
    }
    let scheme = if is_loopback(address) { "http" } else { "https" };
    format!("{scheme}://{address}")
}

fn is_loopback(address: &str) -> bool {
    let host = address.split([':', '/']).next().unwrap_or_default();
    host == "localhost" || host.starts_with("127.")
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Every transport failure means the backend could not be reached.
fn friendly_error(url: &str, err: &reqwest::Error) -> CoreError {
    let message = if err.is_connect() {
        format!("cannot reach POS backend at {url}")
    } else if err.is_timeout() {
        format!("connection to {url} timed out")
    } else if err.is_builder() {
        format!("invalid POS backend URL: {url}")
    } else {
        format!("network error communicating with {url}: {err}")
    };
    CoreError::Connectivity(message)
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "terminal not authorized".to_string(),
        404 => "POS backend endpoint not found".to_string(),
        s if s >= 500 => format!("POS backend server error (HTTP {s})"),
        s => format!("unexpected response from POS backend (HTTP {s})"),
    }
}

/// Build a `RemoteQuery` error, preserving the backend's own message if any.
fn rejection(status: StatusCode, body_text: &str) -> CoreError {
    let body_text = body_text.trim();
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| (!body_text.is_empty()).then(|| body_text.to_string()))
        .unwrap_or_else(|| status_error(status));
    CoreError::RemoteQuery {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpRemote {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| CoreError::connectivity(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        // Only our own backend gets the key
        match &self.api_key {
            Some(key) if url.starts_with(&self.base_url) => req.header("X-POS-API-Key", key),
            _ => req,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/health", self.base_url);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        if status.is_success() {
            trace!("health check passed");
            Ok(())
        } else {
            Err(CoreError::connectivity(status_error(status)))
        }
    }

    async fn execute(&self, op: &Operation) -> Result<QueryResult> {
        let url = format!("{}/api/pos/query", self.base_url);
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "operation": op }))
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !status.is_success() {
            return Err(rejection(status, &body_text));
        }
        serde_json::from_str(&body_text).map_err(|e| CoreError::RemoteQuery {
            status: status.as_u16(),
            message: format!("invalid JSON from POS backend: {e}"),
        })
    }
}

#[async_trait]
impl AssetSource for HttpRemote {
    async fn fetch_to(&self, url: &str, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        let mut resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| friendly_error(url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::RemoteQuery {
                status: status.as_u16(),
                message: status_error(status),
            });
        }

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|e| friendly_error(url, &e))? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        debug!(url, bytes = written, "asset downloaded");
        Ok(written)
    }
}
