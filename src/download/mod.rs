// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download session supervision for varia
//!
//! This module tracks downloads running on the aria2 daemon:
//! - One [`Session`] per transfer, polling the daemon every second
//! - Pause/resume/cancel for one session or all of them at once
//! - Unfinished downloads survive restarts via per-transfer records
//! - A global speed figure summed from every session
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ Supervisor      │────▶│ status loop +   │
//! │ (session set)   │     │ aggregator loop │
//! └────────┬────────┘     └─────────────────┘
//!          │ one per transfer
//!          ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ Session         │────▶│ DaemonClient    │
//! │ (poll task)     │     │ (aria2 RPC)     │
//! └────────┬────────┘     └─────────────────┘
//!          ▼
//! ┌─────────────────┐
//! │ SessionStore    │
//! │ <gid>.varia.json│
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use varia::daemon::Aria2Client;
//! use varia::download::{SessionContext, SessionStore, Supervisor};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = SessionContext {
//!     daemon: Arc::new(Aria2Client::new("http://localhost:6801/jsonrpc")?),
//!     store: SessionStore::new("/home/me/Downloads"),
//!     download_dir: "/home/me/Downloads".into(),
//!     poll_interval: Duration::from_secs(1),
//! };
//!
//! let supervisor = Supervisor::new(ctx);
//! supervisor.start();
//! supervisor.recover_sessions()?;
//!
//! let key = supervisor.add_download("https://example.com/file.iso");
//! println!("{}", supervisor.session(key).unwrap().snapshot().status_line());
//! println!("total: {}", *supervisor.subscribe_aggregate().borrow());
//!
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod store;
pub mod session;
pub mod supervisor;

// Re-export commonly used items
pub use types::{PauseControl, SessionKey, SessionSnapshot, SessionState, SpeedUnit, Throughput};
pub use store::{PersistedRecord, SessionStore, RECORD_SUFFIX};
pub use session::{PollOutcome, Session, SessionContext, INVALID_URL_MESSAGE, REMOVED_MESSAGE};
pub use supervisor::Supervisor;
