// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! aria2 JSON-RPC client.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{DaemonClient, DaemonStatus, TransferId, TransferStatus};
use crate::error::{DaemonError, DaemonResult};

/// Default aria2 RPC endpoint.
pub const DEFAULT_RPC_URL: &str = "http://localhost:6801/jsonrpc";

/// Default timeout for a single RPC call (in seconds).
const CALL_TIMEOUT_SECS: u64 = 5;

/// Default timeout for establishing the HTTP connection (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 2;

/// Fields requested from `aria2.tellStatus`.
const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "completedLength",
    "totalLength",
    "downloadSpeed",
    "errorCode",
    "errorMessage",
    "files",
];

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Internal shape of a `tellStatus` result. aria2 encodes every number as a string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    gid: String,
    status: DaemonStatus,
    #[serde(default)]
    completed_length: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    download_speed: String,
    error_code: Option<String>,
    error_message: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    path: String,
}

impl RawStatus {
    fn into_status(self) -> DaemonResult<TransferStatus> {
        let file_path = self
            .files
            .into_iter()
            .map(|f| f.path)
            .find(|p| !p.is_empty())
            .map(PathBuf::from);

        // errorCode "0" means the last error was cleared
        let error_message = match self.error_code.as_deref() {
            Some("0") => None,
            _ => self.error_message.filter(|m| !m.is_empty()),
        };

        Ok(TransferStatus {
            id: TransferId::new(self.gid),
            status: self.status,
            completed_length: parse_length("completedLength", &self.completed_length)?,
            total_length: parse_length("totalLength", &self.total_length)?,
            download_speed: parse_length("downloadSpeed", &self.download_speed)?,
            error_message,
            file_path,
        })
    }
}

fn parse_length(field: &str, raw: &str) -> DaemonResult<u64> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse()
        .map_err(|_| DaemonError::Protocol(format!("{} is not a number: {:?}", field, raw)))
}

/// Client for an aria2 daemon's JSON-RPC interface.
#[derive(Debug)]
pub struct Aria2Client {
    /// Full RPC endpoint, e.g. `http://localhost:6801/jsonrpc`.
    endpoint: String,
    /// `--rpc-secret` of the daemon, sent as `token:<secret>`.
    secret: Option<String>,
    http: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl Aria2Client {
    /// Create a client with the default call timeout.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::with_timeout(endpoint, Duration::from_secs(CALL_TIMEOUT_SECS))
    }

    /// Create a client whose calls give up after `timeout`.
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS).min(timeout))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: endpoint.into(),
            secret: None,
            http,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Authenticate every call with the daemon's RPC secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask the daemon for its version. Used as a liveness probe.
    pub async fn version(&self) -> DaemonResult<String> {
        let result = self.call("aria2.getVersion", Vec::new()).await?;
        result
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| DaemonError::Protocol("getVersion result has no version".into()))
    }

    fn transport_error(&self, err: reqwest::Error) -> DaemonError {
        if err.is_timeout() {
            DaemonError::Timeout(self.timeout)
        } else if err.is_decode() {
            DaemonError::Protocol(err.to_string())
        } else {
            DaemonError::Unreachable(err.to_string())
        }
    }

    async fn call(&self, method: &str, mut params: Vec<Value>) -> DaemonResult<Value> {
        if let Some(secret) = &self.secret {
            params.insert(0, Value::String(format!("token:{}", secret)));
        }

        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
            method,
            params,
        };

        tracing::trace!(method, id = %request.id, "aria2 rpc call");

        // aria2 answers RPC errors with a non-2xx status and an error body,
        // so the body is decoded regardless of the HTTP status.
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let body: RpcResponse = response.json().await.map_err(|e| self.transport_error(e))?;

        if let Some(err) = body.error {
            return Err(DaemonError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        body.result
            .ok_or_else(|| DaemonError::Protocol(format!("{} returned neither result nor error", method)))
    }

    async fn call_gid(&self, method: &str, id: &TransferId) -> DaemonResult<()> {
        self.call(method, vec![json!(id.as_str())]).await.map(|_| ())
    }
}

#[async_trait]
impl DaemonClient for Aria2Client {
    async fn create(&self, url: &str, dir: &Path) -> DaemonResult<TransferId> {
        let options = json!({ "dir": dir.to_string_lossy() });
        let result = self.call("aria2.addUri", vec![json!([url]), options]).await?;
        result
            .as_str()
            .map(TransferId::new)
            .ok_or_else(|| DaemonError::Protocol("addUri did not return a GID".into()))
    }

    async fn query(&self, id: &TransferId) -> DaemonResult<TransferStatus> {
        let result = self
            .call("aria2.tellStatus", vec![json!(id.as_str()), json!(STATUS_KEYS)])
            .await?;
        let raw: RawStatus =
            serde_json::from_value(result).map_err(|e| DaemonError::Protocol(e.to_string()))?;
        raw.into_status()
    }

    async fn pause(&self, id: &TransferId) -> DaemonResult<()> {
        self.call_gid("aria2.pause", id).await
    }

    async fn force_pause(&self, id: &TransferId) -> DaemonResult<()> {
        self.call_gid("aria2.forcePause", id).await
    }

    async fn resume(&self, id: &TransferId) -> DaemonResult<()> {
        self.call_gid("aria2.unpause", id).await
    }

    async fn remove(&self, id: &TransferId, force: bool) -> DaemonResult<()> {
        let method = if force { "aria2.forceRemove" } else { "aria2.remove" };
        self.call_gid(method, id).await
    }

    async fn set_global_download_limit(&self, limit: &str) -> DaemonResult<()> {
        let options = json!({ "max-overall-download-limit": limit });
        self.call("aria2.changeGlobalOption", vec![options]).await.map(|_| ())
    }

    async fn shutdown(&self) -> DaemonResult<()> {
        self.call("aria2.shutdown", Vec::new()).await.map(|_| ())
    }
}
