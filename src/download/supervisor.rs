// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session supervisor: owns the live session set and the two background loops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{Session, SessionContext};
use super::types::{PauseControl, SessionKey, SessionSnapshot, SessionState, Throughput};
use crate::locks::{resilient_read, resilient_write};

type SessionSet = Arc<RwLock<IndexMap<SessionKey, Arc<Session>>>>;

/// Owner of every live [`Session`].
///
/// Sessions are addressed by a [`SessionKey`] handed out when they are
/// added; keys are never reused. Bulk operations work on a copy of the set
/// taken under the lock, so no lock is held across a daemon call.
pub struct Supervisor {
    ctx: SessionContext,
    sessions: SessionSet,
    next_key: AtomicU64,
    /// Set by pause-all, cleared by resume-all and by any individual toggle
    all_paused: AtomicBool,
    shutdown: CancellationToken,
    aggregate: Arc<watch::Sender<Throughput>>,
    loops: StdMutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(ctx: SessionContext) -> Self {
        let (aggregate, _) = watch::channel(Throughput::ZERO);
        Self {
            ctx,
            sessions: Arc::new(RwLock::new(IndexMap::new())),
            next_key: AtomicU64::new(1),
            all_paused: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            aggregate: Arc::new(aggregate),
            loops: StdMutex::new(Vec::new()),
        }
    }

    /// Spawn the status loop and the aggregator loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        if !loops.is_empty() || self.shutdown.is_cancelled() {
            return;
        }

        let interval = self.ctx.poll_interval;
        loops.push(tokio::spawn(status_loop(
            Arc::clone(&self.sessions),
            interval,
            self.shutdown.clone(),
        )));
        loops.push(tokio::spawn(aggregator_loop(
            Arc::clone(&self.sessions),
            Arc::clone(&self.aggregate),
            interval,
            self.shutdown.clone(),
        )));
        debug!("supervisor loops started");
    }

    fn insert(&self, session: Arc<Session>) -> SessionKey {
        let key = SessionKey(self.next_key.fetch_add(1, Ordering::SeqCst));
        resilient_write(&self.sessions).insert(key, Arc::clone(&session));
        session.start();
        key
    }

    /// Add a download for `url` and start polling it.
    ///
    /// A malformed URL still gets a key: the session is Invalid and shows
    /// why until it is stopped.
    pub fn add_download(&self, url: impl Into<String>) -> SessionKey {
        let session = Session::new(url, self.ctx.clone());
        let key = self.insert(Arc::clone(&session));
        info!(key = %key, url = %session.url(), "download added");
        key
    }

    /// Rebuild a session for every persisted record and start polling it.
    ///
    /// Each record is consumed whether or not it could be read. Returns the
    /// number of sessions recovered.
    pub fn recover_sessions(&self) -> Result<usize> {
        let ids = self.ctx.store.scan()?;
        let mut recovered = 0;

        for id in ids {
            match Session::recover(&id, self.ctx.clone()) {
                Ok(session) => {
                    let key = self.insert(session);
                    debug!(key = %key, id = %id, "session recovered");
                    recovered += 1;
                }
                Err(e) => warn!(id = %id, error = %e, "discarding unreadable session record"),
            }
        }

        if recovered > 0 {
            info!(count = recovered, "recovered unfinished downloads");
        }
        Ok(recovered)
    }

    pub fn session(&self, key: SessionKey) -> Option<Arc<Session>> {
        resilient_read(&self.sessions).get(&key).cloned()
    }

    /// Keys of all live sessions, in insertion order.
    pub fn keys(&self) -> Vec<SessionKey> {
        resilient_read(&self.sessions).keys().copied().collect()
    }

    /// Current view of every live session, in insertion order.
    pub fn snapshots(&self) -> Vec<(SessionKey, SessionSnapshot)> {
        resilient_read(&self.sessions)
            .iter()
            .map(|(key, session)| (*key, session.snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        resilient_read(&self.sessions).is_empty()
    }

    fn all_sessions(&self) -> Vec<Arc<Session>> {
        live_sessions(&self.sessions)
    }

    pub fn is_all_paused(&self) -> bool {
        self.all_paused.load(Ordering::SeqCst)
    }

    /// Pause every session and persist its state.
    pub async fn pause_all(&self) {
        self.all_paused.store(true, Ordering::SeqCst);
        for session in self.all_sessions() {
            session.pause().await;
            session.snapshot_state().await;
            sync_control(&session);
        }
    }

    /// Resume every paused session.
    pub async fn resume_all(&self) {
        self.all_paused.store(false, Ordering::SeqCst);
        for session in self.all_sessions() {
            session.resume().await;
            sync_control(&session);
        }
    }

    /// Pause everything, or resume everything if the last bulk action was a pause.
    pub async fn toggle_all(&self) {
        if self.is_all_paused() {
            self.resume_all().await;
        } else {
            self.pause_all().await;
        }
    }

    /// Pause the session if it is running, resume it if it is paused.
    ///
    /// Clears the "all paused" flag. Returns false for an unknown key.
    pub async fn toggle(&self, key: SessionKey) -> bool {
        let Some(session) = self.session(key) else {
            return false;
        };
        self.all_paused.store(false, Ordering::SeqCst);

        if session.state().is_paused() {
            session.resume().await;
        } else {
            session.pause().await;
        }
        session.snapshot_state().await;
        sync_control(&session);
        true
    }

    /// Stop one session, deleting its partial download, and drop it from the set.
    pub async fn stop(&self, key: SessionKey) -> bool {
        let removed = resilient_write(&self.sessions).shift_remove(&key);
        let Some(session) = removed else {
            return false;
        };
        session.stop(true).await;
        info!(key = %key, "download removed");
        true
    }

    /// Stop and drop every session. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<_> = resilient_write(&self.sessions).drain(..).collect();
        let count = drained.len();

        for (key, session) in drained {
            session.stop(true).await;
            debug!(key = %key, "download removed");
        }
        if count > 0 {
            info!(count, "all downloads cancelled");
        }
        count
    }

    /// Receive the sum of every session's throughput, as published by the
    /// aggregator loop.
    pub fn subscribe_aggregate(&self) -> watch::Receiver<Throughput> {
        self.aggregate.subscribe()
    }

    /// Stop the background loops, pause and persist every session, then
    /// shut the daemon down.
    ///
    /// Sessions stay on the daemon and on disk so the next start can
    /// recover them. Only the first call has an effect.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "supervisor loop ended abnormally");
            }
        }

        self.pause_all().await;
        for session in self.all_sessions() {
            session.halt().await;
        }

        if let Err(e) = self.ctx.daemon.shutdown().await {
            warn!(error = %e, "daemon shutdown request failed");
        }
        info!("supervisor shut down");
    }
}

fn live_sessions(sessions: &SessionSet) -> Vec<Arc<Session>> {
    resilient_read(sessions).values().cloned().collect()
}

fn total_throughput(sessions: &[Arc<Session>]) -> Throughput {
    sessions.iter().map(|s| s.throughput()).sum()
}

/// Make the pause affordance match the session's state.
fn sync_control(session: &Session) {
    let state = session.state();
    let control = if state.is_terminal() {
        PauseControl::Hidden
    } else if state.is_paused() {
        PauseControl::Resume
    } else {
        PauseControl::Pause
    };
    session.set_control(control);
}

async fn status_loop(sessions: SessionSet, interval: Duration, shutdown: CancellationToken) {
    loop {
        for session in live_sessions(&sessions) {
            if matches!(session.state(), SessionState::Completed | SessionState::Failed { .. }) {
                session.set_control(PauseControl::Hidden);
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("status loop stopped");
}

async fn aggregator_loop(
    sessions: SessionSet,
    aggregate: Arc<watch::Sender<Throughput>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let total = total_throughput(&live_sessions(&sessions));
        aggregate.send_if_modified(|current| {
            if *current == total {
                false
            } else {
                *current = total;
                true
            }
        });

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("aggregator loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{DaemonCall, MemoryDaemon};
    use crate::download::SessionStore;
    use tempfile::TempDir;

    fn supervisor() -> (Supervisor, Arc<MemoryDaemon>, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let daemon = Arc::new(MemoryDaemon::new());
        let ctx = SessionContext {
            daemon: daemon.clone(),
            store: SessionStore::new(dir.path()),
            download_dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
        };
        (Supervisor::new(ctx), daemon, dir)
    }

    #[tokio::test]
    async fn test_bulk_operations_on_empty_set() {
        let (sup, daemon, _dir) = supervisor();

        sup.pause_all().await;
        assert!(sup.is_all_paused());
        sup.resume_all().await;
        assert!(!sup.is_all_paused());
        assert_eq!(sup.stop_all().await, 0);

        assert!(sup.is_empty());
        let aggregate = sup.subscribe_aggregate();
        assert!(aggregate.borrow().is_zero());
        assert_eq!(aggregate.borrow().to_string(), "0 B/s");
        assert!(daemon.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let (sup, _daemon, _dir) = supervisor();
        assert!(!sup.toggle(SessionKey(42)).await);
        assert!(!sup.stop(SessionKey(42)).await);
        assert!(sup.session(SessionKey(42)).is_none());
    }

    #[tokio::test]
    async fn test_keys_are_stable_after_removal() {
        let (sup, _daemon, _dir) = supervisor();
        let a = sup.add_download("not a url");
        let b = sup.add_download("also not a url");
        let c = sup.add_download("still not a url");

        assert!(sup.stop(b).await);
        assert_eq!(sup.keys(), vec![a, c]);
        assert_eq!(sup.session(c).unwrap().url(), "still not a url");

        let d = sup.add_download("nope");
        assert!(d > c);
    }

    #[tokio::test]
    async fn test_shutdown_pauses_and_shuts_daemon_down() {
        let (sup, daemon, _dir) = supervisor();
        sup.start();
        sup.shutdown().await;
        sup.shutdown().await;

        assert!(daemon.is_shut_down());
        assert_eq!(daemon.count(|c| *c == DaemonCall::Shutdown), 1);
    }
}
