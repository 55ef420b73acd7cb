// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download daemon boundary.
//!
//! Everything varia knows about the remote daemon goes through the
//! [`DaemonClient`] trait: create, query, pause, resume and remove a
//! transfer, change the global rate limit, and shut the daemon down.
//! [`Aria2Client`] is the production implementation speaking aria2's
//! JSON-RPC over HTTP; [`MemoryDaemon`] is an in-process stand-in that
//! records every call, used by the test suites.
//!
//! # Example
//!
//! ```no_run
//! use varia::daemon::{Aria2Client, DaemonClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = Aria2Client::new("http://localhost:6801/jsonrpc")?;
//! let id = client.create("https://example.com/file.iso", "/tmp".as_ref()).await?;
//! let status = client.query(&id).await?;
//! println!("{}: {:.1}%", id, status.progress_percent());
//! # Ok(())
//! # }
//! ```

mod aria2;
mod memory;

pub use aria2::{Aria2Client, DEFAULT_RPC_URL};
pub use memory::{DaemonCall, MemoryDaemon};

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DaemonResult;

/// Daemon-assigned identity of one transfer (an aria2 GID).
///
/// Stable for the lifetime of the transfer and used as the join key
/// between an in-memory session and its persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Transfer status as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

/// Snapshot of one transfer returned by [`DaemonClient::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatus {
    pub id: TransferId,
    pub status: DaemonStatus,
    /// Bytes written so far.
    pub completed_length: u64,
    /// Total size in bytes, 0 while unknown.
    pub total_length: u64,
    /// Current download speed in bytes per second.
    pub download_speed: u64,
    pub error_message: Option<String>,
    /// Path of the first file of the transfer, once the daemon knows it.
    pub file_path: Option<PathBuf>,
}

impl TransferStatus {
    /// A fresh active transfer with nothing downloaded yet.
    pub fn new(id: impl Into<TransferId>, status: DaemonStatus) -> Self {
        Self {
            id: id.into(),
            status,
            completed_length: 0,
            total_length: 0,
            download_speed: 0,
            error_message: None,
            file_path: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == DaemonStatus::Complete
    }

    pub fn is_paused(&self) -> bool {
        self.status == DaemonStatus::Paused
    }

    /// Progress percentage (0-100).
    pub fn progress_percent(&self) -> f64 {
        if self.is_complete() {
            100.0
        } else if self.total_length == 0 {
            0.0
        } else {
            (self.completed_length as f64 / self.total_length as f64 * 100.0).min(100.0)
        }
    }
}

/// The only component allowed to talk to the download daemon.
///
/// Every call may fail with a [`DaemonError`](crate::error::DaemonError);
/// implementations must bound each call with a timeout.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// Add a transfer for `url`, writing into `dir`.
    async fn create(&self, url: &str, dir: &Path) -> DaemonResult<TransferId>;

    async fn query(&self, id: &TransferId) -> DaemonResult<TransferStatus>;

    async fn pause(&self, id: &TransferId) -> DaemonResult<()>;

    /// Pause without waiting for the daemon to wind down connections.
    async fn force_pause(&self, id: &TransferId) -> DaemonResult<()>;

    async fn resume(&self, id: &TransferId) -> DaemonResult<()>;

    async fn remove(&self, id: &TransferId, force: bool) -> DaemonResult<()>;

    /// Set the daemon-wide download limit, e.g. `"500M"`. `"0"` is unlimited.
    async fn set_global_download_limit(&self, limit: &str) -> DaemonResult<()>;

    async fn shutdown(&self) -> DaemonResult<()>;
}
