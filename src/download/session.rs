// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One download session: the in-memory handle to a single remote transfer.
//!
//! A session owns its poll task, translates daemon status into a
//! [`SessionState`], and publishes a [`SessionSnapshot`] on a watch
//! channel. Every state-changing operation (poll, pause, resume, stop,
//! snapshot) runs under the session's own mutex, so an explicit resume can
//! never be overwritten by a poll that observed the older "paused" status.
//!
//! ```text
//!   Pending ──create ok──▶ Active ◀──resume── Paused
//!      │                  │  │  └──pause/daemon──▲
//!   bad URL               │  └─▶ Completed
//!      ▼                  └────▶ Failed
//!   Invalid          stop (any) ─▶ Cancelled
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{PersistedRecord, SessionStore};
use super::types::{PauseControl, SessionSnapshot, SessionState, Throughput};
use crate::daemon::{DaemonClient, DaemonStatus, TransferId, TransferStatus};
use crate::error::{user_message, DaemonError};
use crate::utils::{file_name_from_url, is_valid_url};

/// Message shown for a URL that fails the well-formedness check.
pub const INVALID_URL_MESSAGE: &str = "This is not a valid URL.";

/// Message shown when the daemon dropped a transfer on its own.
pub const REMOVED_MESSAGE: &str = "The download was removed.";

/// Suffix of the control file aria2 keeps next to a partial download.
const CONTROL_FILE_SUFFIX: &str = ".aria2";

/// Everything a session needs from its surroundings.
#[derive(Clone)]
pub struct SessionContext {
    pub daemon: Arc<dyn DaemonClient>,
    pub store: SessionStore,
    /// Directory the daemon writes into
    pub download_dir: PathBuf,
    pub poll_interval: Duration,
}

/// Result of one poll iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Keep polling
    Continue,
    /// The session reached a state polling cannot change
    Finished,
}

#[derive(Debug, Default)]
struct Inner {
    identity: Option<TransferId>,
    /// Identity read from a persisted record, not yet confirmed by the daemon
    candidate: Option<TransferId>,
    file_path: Option<PathBuf>,
}

/// In-memory handle to one remote transfer.
pub struct Session {
    url: String,
    ctx: SessionContext,
    inner: Mutex<Inner>,
    view: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a session for a user-supplied URL.
    ///
    /// A URL without a scheme or host yields an [`SessionState::Invalid`]
    /// session that never talks to the daemon.
    pub fn new(url: impl Into<String>, ctx: SessionContext) -> Arc<Self> {
        let url = url.into().trim().to_string();
        let mut snapshot = SessionSnapshot::new(&url, file_name_from_url(&url));

        if !is_valid_url(&url) {
            info!(url = %url, "rejected malformed download URL");
            snapshot.state = SessionState::Invalid {
                message: INVALID_URL_MESSAGE.to_string(),
            };
            snapshot.control = PauseControl::Hidden;
        }

        let (view, _) = watch::channel(snapshot);
        Arc::new(Self {
            url,
            ctx,
            inner: Mutex::new(Inner::default()),
            view,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            task: StdMutex::new(None),
        })
    }

    /// Rebuild a session from the persisted record for `id`.
    ///
    /// The record file is consumed: it is deleted whether or not a session
    /// can be built from it. The session starts Pending and its first poll
    /// asks the daemon about `id`; if the daemon no longer knows that
    /// identity the transfer is added again from the URL.
    pub fn recover(id: &TransferId, ctx: SessionContext) -> Result<Arc<Self>> {
        let PersistedRecord { url, downloaded } = ctx.store.take(id)?;
        debug!(id = %id, url = %url, downloaded, "recovering session from record");

        let session = Self::new(url, ctx);
        if !session.state().is_terminal() {
            session.inner.try_lock()?.candidate = Some(id.clone());
        }
        Ok(session)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current published view.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.view.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.view.borrow().state.clone()
    }

    pub fn identity(&self) -> Option<TransferId> {
        self.view.borrow().identity.clone()
    }

    pub fn throughput(&self) -> Throughput {
        self.view.borrow().throughput
    }

    /// Receive every published change to this session.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.view.subscribe()
    }

    /// Set the pause affordance shown for this session.
    pub fn set_control(&self, control: PauseControl) {
        self.view.send_if_modified(|view| {
            if view.control == control {
                false
            } else {
                view.control = control;
                true
            }
        });
    }

    fn publish(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        self.view.send_modify(|view| {
            f(view);
            view.updated_at = Utc::now();
        });
    }

    /// Spawn the poll task. Does nothing for a terminal or already started session.
    pub fn start(self: &Arc<Self>) {
        if self.state().is_terminal() || self.cancel.is_cancelled() {
            return;
        }

        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return;
        }

        let session = Arc::clone(self);
        *task = Some(tokio::spawn(async move { session.run().await }));
    }

    /// Whether the poll task is still running.
    pub fn is_polling(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.poll_once().await == PollOutcome::Finished {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.poll_interval) => {}
            }
        }
        debug!(url = %self.url, "poll task finished");
    }

    /// Run one poll iteration.
    ///
    /// Daemon failures never escape: an unreachable daemon just ends this
    /// cycle and the next one tries again.
    pub async fn poll_once(&self) -> PollOutcome {
        let mut inner = self.inner.lock().await;
        if self.cancel.is_cancelled() || self.state().is_terminal() {
            return PollOutcome::Finished;
        }

        let id = match inner.identity.clone() {
            Some(id) => id,
            None => return self.acquire_identity(&mut inner).await,
        };

        match self.ctx.daemon.query(&id).await {
            Ok(status) => self.apply_status(&mut inner, &id, status),
            Err(e) => {
                debug!(id = %id, error = %e, "status poll failed");
                PollOutcome::Continue
            }
        }
    }

    async fn acquire_identity(&self, inner: &mut Inner) -> PollOutcome {
        if let Some(candidate) = inner.candidate.clone() {
            match self.ctx.daemon.query(&candidate).await {
                Ok(status) => {
                    info!(id = %candidate, url = %self.url, "reattached to recovered transfer");
                    inner.candidate = None;
                    self.assign_identity(inner, candidate.clone());
                    return self.apply_status(inner, &candidate, status);
                }
                Err(e) if e.is_unreachable() => {
                    debug!(id = %candidate, error = %e, "daemon unreachable, recovery deferred");
                    return PollOutcome::Continue;
                }
                Err(e) => {
                    info!(id = %candidate, error = %e, "daemon no longer knows recovered transfer, adding it again");
                    inner.candidate = None;
                }
            }
        }

        match self.ctx.daemon.create(&self.url, &self.ctx.download_dir).await {
            Ok(id) => {
                info!(id = %id, url = %self.url, "transfer created");
                self.assign_identity(inner, id);
                self.publish(|view| view.state = SessionState::Active);
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "could not add download to daemon, will retry");
            }
        }
        PollOutcome::Continue
    }

    fn assign_identity(&self, inner: &mut Inner, id: TransferId) {
        inner.identity = Some(id.clone());
        self.publish(|view| view.identity = Some(id));
    }

    fn apply_status(&self, inner: &mut Inner, id: &TransferId, status: TransferStatus) -> PollOutcome {
        if let Some(path) = &status.file_path {
            inner.file_path = Some(path.clone());
        }
        let progress = status.progress_percent() / 100.0;

        if status.is_complete() {
            if let Err(e) = self.ctx.store.remove(id) {
                warn!(id = %id, error = %e, "failed to delete record of completed transfer");
            }
            info!(id = %id, url = %self.url, "download complete");
            self.publish(|view| {
                view.state = SessionState::Completed;
                view.progress = 1.0;
                view.throughput = Throughput::ZERO;
                view.completed_bytes = status.completed_length;
                view.total_bytes = status.total_length;
                view.message = None;
                view.control = PauseControl::Hidden;
            });
            return PollOutcome::Finished;
        }

        match status.status {
            DaemonStatus::Error | DaemonStatus::Removed => {
                let message = match (status.status, status.error_message.as_deref()) {
                    (_, Some(detail)) => user_message(detail),
                    (DaemonStatus::Removed, None) => REMOVED_MESSAGE.to_string(),
                    _ => user_message("unknown error"),
                };
                warn!(id = %id, url = %self.url, message = %message, "download failed");
                if status.status == DaemonStatus::Removed {
                    if let Err(e) = self.ctx.store.remove(id) {
                        warn!(id = %id, error = %e, "failed to delete record of removed transfer");
                    }
                }
                self.publish(|view| {
                    view.state = SessionState::Failed {
                        message: message.clone(),
                    };
                    view.throughput = Throughput::ZERO;
                    view.message = Some(message);
                    view.control = PauseControl::Hidden;
                });
                PollOutcome::Finished
            }
            DaemonStatus::Paused => {
                self.publish(|view| {
                    view.state = SessionState::Paused;
                    view.progress = progress;
                    view.throughput = Throughput::ZERO;
                    view.completed_bytes = status.completed_length;
                    view.total_bytes = status.total_length;
                    view.control = PauseControl::Resume;
                });
                PollOutcome::Continue
            }
            DaemonStatus::Active | DaemonStatus::Waiting | DaemonStatus::Complete => {
                self.publish(|view| {
                    view.state = SessionState::Active;
                    view.progress = progress;
                    view.throughput = Throughput::from(status.download_speed);
                    view.completed_bytes = status.completed_length;
                    view.total_bytes = status.total_length;
                    view.message = None;
                    view.control = PauseControl::Pause;
                });
                PollOutcome::Continue
            }
        }
    }

    fn mark_paused(&self) {
        self.publish(|view| {
            view.state = SessionState::Paused;
            view.throughput = Throughput::ZERO;
            view.control = PauseControl::Resume;
        });
    }

    /// Pause the transfer.
    ///
    /// No-op when already paused, terminal, or without a transfer identity.
    /// A refused pause is retried as a force pause; if that fails too the
    /// session is cancelled rather than left in an unknown state.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.identity.clone() else {
            return;
        };
        let state = self.state();
        if state.is_paused() || state.is_terminal() {
            return;
        }

        let Err(e) = self.ctx.daemon.pause(&id).await else {
            debug!(id = %id, "paused");
            self.mark_paused();
            return;
        };
        warn!(id = %id, error = %e, "pause failed, retrying as force pause");

        let Err(e) = self.ctx.daemon.force_pause(&id).await else {
            self.mark_paused();
            return;
        };
        warn!(id = %id, error = %e, "pause could not be confirmed, cancelling download");
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_locked(&mut inner, false).await;
        }
    }

    /// Resume a paused transfer. No-op unless the session is Paused.
    pub async fn resume(&self) {
        let inner = self.inner.lock().await;
        if !self.state().is_paused() {
            return;
        }
        let Some(id) = inner.identity.clone() else {
            return;
        };

        match self.ctx.daemon.resume(&id).await {
            Ok(()) => {
                debug!(id = %id, "resumed");
                self.publish(|view| {
                    view.state = SessionState::Active;
                    view.message = None;
                    view.control = PauseControl::Pause;
                });
            }
            Err(e) => {
                let message = user_message(&daemon_detail(&e));
                warn!(id = %id, error = %e, "resume failed");
                self.publish(|view| view.message = Some(message));
            }
        }
    }

    /// Stop the transfer and tell the daemon to drop it.
    ///
    /// Idempotent: only the first call, even among concurrent ones, reaches
    /// the daemon. With `delete_files`, an unfinished transfer also loses its
    /// persisted record and partial file.
    pub async fn stop(&self, delete_files: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner, delete_files).await;
    }

    async fn stop_locked(&self, inner: &mut Inner, delete_files: bool) {
        self.cancel.cancel();
        let was_complete = self.state() == SessionState::Completed;
        let target = inner.identity.clone().or_else(|| inner.candidate.clone());

        if let Some(id) = &target {
            if let Err(e) = self.ctx.daemon.remove(id, true).await {
                warn!(id = %id, error = %e, "daemon removal failed");
            }
        }

        if delete_files && !was_complete {
            if let Some(id) = &target {
                if let Err(e) = self.ctx.store.remove(id) {
                    warn!(id = %id, error = %e, "failed to delete session record");
                }
                let path = inner
                    .file_path
                    .take()
                    .unwrap_or_else(|| self.ctx.download_dir.join(file_name_from_url(&self.url)));
                self.remove_partial_file(&path);
            }
        }

        info!(url = %self.url, "download stopped");
        self.publish(|view| {
            if !was_complete {
                view.state = SessionState::Cancelled;
            }
            view.throughput = Throughput::ZERO;
            view.control = PauseControl::Hidden;
        });
    }

    fn remove_partial_file(&self, path: &Path) {
        if !path.starts_with(&self.ctx.download_dir) {
            warn!(path = %path.display(), "partial file outside download directory, leaving it");
            return;
        }

        let mut control = path.as_os_str().to_owned();
        control.push(CONTROL_FILE_SUFFIX);

        for target in [path.to_path_buf(), PathBuf::from(control)] {
            match fs::remove_file(&target) {
                Ok(()) => debug!(path = %target.display(), "deleted partial download"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %target.display(), error = %e, "failed to delete partial download"),
            }
        }
    }

    /// Refresh from the daemon and persist `{url, downloaded}` for recovery.
    ///
    /// Skipped silently when there is no transfer identity or the daemon is
    /// unreachable; a failed write is logged and swallowed. Transfers the
    /// daemon reports as complete or removed never keep a record.
    pub async fn snapshot_state(&self) {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.identity.clone() else {
            return;
        };
        if matches!(
            self.state(),
            SessionState::Completed | SessionState::Cancelled | SessionState::Invalid { .. }
        ) {
            return;
        }

        let status = match self.ctx.daemon.query(&id).await {
            Ok(status) => status,
            Err(e) => {
                debug!(id = %id, error = %e, "skipping state snapshot");
                return;
            }
        };
        let downloaded = status.completed_length;
        let removed = status.status == DaemonStatus::Removed;
        self.apply_status(&mut inner, &id, status);
        if removed || self.state() == SessionState::Completed {
            return;
        }

        let record = PersistedRecord {
            url: self.url.clone(),
            downloaded,
        };
        match self.ctx.store.save(&id, &record) {
            Ok(()) => debug!(id = %id, downloaded, "session state saved"),
            Err(e) => warn!(id = %id, error = %e, "failed to persist session state"),
        }
    }

    /// Stop the poll task without touching the transfer on the daemon.
    pub async fn halt(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(url = %self.url, error = %e, "poll task ended abnormally");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Text of a daemon failure suitable for a user-facing message.
fn daemon_detail(err: &DaemonError) -> String {
    match err {
        DaemonError::Rpc { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
