// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process daemon that keeps transfers in memory and records every call.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DaemonClient, DaemonStatus, TransferId, TransferStatus};
use crate::error::{DaemonError, DaemonResult};
use crate::utils::file_name_from_url;

/// One recorded call against a [`MemoryDaemon`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCall {
    Create { url: String, dir: PathBuf },
    Query(TransferId),
    Pause(TransferId),
    ForcePause(TransferId),
    Resume(TransferId),
    Remove { id: TransferId, force: bool },
    SetGlobalDownloadLimit(String),
    Shutdown,
}

impl DaemonCall {
    fn method(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Query(_) => "query",
            Self::Pause(_) => "pause",
            Self::ForcePause(_) => "force_pause",
            Self::Resume(_) => "resume",
            Self::Remove { .. } => "remove",
            Self::SetGlobalDownloadLimit(_) => "set_global_download_limit",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A [`DaemonClient`] backed by a map of transfers.
///
/// Transfers only change state when told to, either through the trait
/// calls or through [`MemoryDaemon::update`]. Individual methods can be
/// made to fail with [`MemoryDaemon::fail`], or the whole daemon can be
/// taken offline with [`MemoryDaemon::set_unreachable`].
#[derive(Debug, Default)]
pub struct MemoryDaemon {
    transfers: Mutex<HashMap<TransferId, TransferStatus>>,
    calls: Mutex<Vec<DaemonCall>>,
    failing: Mutex<HashSet<&'static str>>,
    unreachable: AtomicBool,
    next_gid: AtomicU64,
    global_limit: Mutex<Option<String>>,
    shut_down: AtomicBool,
}

impl MemoryDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer the daemon already knows about.
    pub fn insert(&self, status: TransferStatus) {
        self.transfers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(status.id.clone(), status);
    }

    /// Mutate a known transfer. Returns false if the identity is unknown.
    pub fn update(&self, id: &TransferId, f: impl FnOnce(&mut TransferStatus)) -> bool {
        let mut transfers = self.transfers.lock().unwrap_or_else(|p| p.into_inner());
        match transfers.get_mut(id) {
            Some(status) => {
                f(status);
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &TransferId) -> Option<TransferStatus> {
        self.transfers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Make every call to `method` fail as if the daemon were unreachable.
    ///
    /// Method names match the trait: `"create"`, `"query"`, `"pause"`,
    /// `"force_pause"`, `"resume"`, `"remove"`, `"set_global_download_limit"`,
    /// `"shutdown"`.
    pub fn fail(&self, method: &'static str) {
        self.failing.lock().unwrap_or_else(|p| p.into_inner()).insert(method);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<DaemonCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of recorded calls for which `pred` holds.
    pub fn count(&self, pred: impl Fn(&DaemonCall) -> bool) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|c| pred(c))
            .count()
    }

    pub fn global_limit(&self) -> Option<String> {
        self.global_limit.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn record(&self, call: DaemonCall) -> DaemonResult<()> {
        let method = call.method();
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DaemonError::Unreachable("connection refused".into()));
        }
        if self.failing.lock().unwrap_or_else(|p| p.into_inner()).contains(method) {
            return Err(DaemonError::Unreachable(format!("{} failed", method)));
        }
        Ok(())
    }

    fn with_transfer<T>(
        &self,
        id: &TransferId,
        f: impl FnOnce(&mut TransferStatus) -> T,
    ) -> DaemonResult<T> {
        let mut transfers = self.transfers.lock().unwrap_or_else(|p| p.into_inner());
        transfers.get_mut(id).map(f).ok_or_else(|| DaemonError::Rpc {
            code: 1,
            message: format!("GID {} is not found", id),
        })
    }
}

#[async_trait]
impl DaemonClient for MemoryDaemon {
    async fn create(&self, url: &str, dir: &Path) -> DaemonResult<TransferId> {
        self.record(DaemonCall::Create {
            url: url.to_owned(),
            dir: dir.to_path_buf(),
        })?;

        let gid = self.next_gid.fetch_add(1, Ordering::SeqCst) + 1;
        let id = TransferId::new(format!("{:016x}", gid));
        let mut status = TransferStatus::new(id.clone(), DaemonStatus::Active);
        status.file_path = Some(dir.join(file_name_from_url(url)));
        self.insert(status);
        Ok(id)
    }

    async fn query(&self, id: &TransferId) -> DaemonResult<TransferStatus> {
        self.record(DaemonCall::Query(id.clone()))?;
        self.with_transfer(id, |status| status.clone())
    }

    async fn pause(&self, id: &TransferId) -> DaemonResult<()> {
        self.record(DaemonCall::Pause(id.clone()))?;
        self.with_transfer(id, |status| {
            status.status = DaemonStatus::Paused;
            status.download_speed = 0;
        })
    }

    async fn force_pause(&self, id: &TransferId) -> DaemonResult<()> {
        self.record(DaemonCall::ForcePause(id.clone()))?;
        self.with_transfer(id, |status| {
            status.status = DaemonStatus::Paused;
            status.download_speed = 0;
        })
    }

    async fn resume(&self, id: &TransferId) -> DaemonResult<()> {
        self.record(DaemonCall::Resume(id.clone()))?;
        self.with_transfer(id, |status| status.status = DaemonStatus::Active)
    }

    async fn remove(&self, id: &TransferId, force: bool) -> DaemonResult<()> {
        self.record(DaemonCall::Remove {
            id: id.clone(),
            force,
        })?;
        self.with_transfer(id, |status| {
            status.status = DaemonStatus::Removed;
            status.download_speed = 0;
        })
    }

    async fn set_global_download_limit(&self, limit: &str) -> DaemonResult<()> {
        self.record(DaemonCall::SetGlobalDownloadLimit(limit.to_owned()))?;
        *self.global_limit.lock().unwrap_or_else(|p| p.into_inner()) = Some(limit.to_owned());
        Ok(())
    }

    async fn shutdown(&self) -> DaemonResult<()> {
        self.record(DaemonCall::Shutdown)?;
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_query() {
        let daemon = MemoryDaemon::new();
        let id = daemon
            .create("http://example.com/file.iso", Path::new("/tmp/dl"))
            .await
            .unwrap();

        let status = daemon.query(&id).await.unwrap();
        assert_eq!(status.status, DaemonStatus::Active);
        assert_eq!(status.file_path, Some(PathBuf::from("/tmp/dl/file.iso")));
        assert_eq!(daemon.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_rpc_error() {
        let daemon = MemoryDaemon::new();
        let err = daemon.query(&TransferId::new("nope")).await.unwrap_err();
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn test_failure_injection_still_records() {
        let daemon = MemoryDaemon::new();
        daemon.fail("pause");
        let id = TransferId::new("abc");
        daemon.insert(TransferStatus::new(id.clone(), DaemonStatus::Active));

        assert!(daemon.pause(&id).await.is_err());
        assert!(daemon.force_pause(&id).await.is_ok());
        assert_eq!(daemon.count(|c| matches!(c, DaemonCall::Pause(_))), 1);
        assert!(daemon.status(&id).unwrap().is_paused());
    }
}
