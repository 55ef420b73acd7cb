// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! varia - Download session supervisor for aria2
//!
//! Varia keeps track of downloads running on a separate aria2 daemon. It
//! polls each transfer, survives restarts by persisting unfinished work,
//! and offers pause/resume/cancel for one download or all of them.
//!
//! **URL** -> **Session** -> **aria2 daemon**
//!
//! # Core Modules
//!
//! - [`download`] - Sessions, the supervisor, and persisted session records
//! - [`daemon`] - The daemon client boundary and the aria2 JSON-RPC client
//! - [`rate_limit`] - Global download speed limit
//! - [`config`] - `varia.conf` and runtime settings
//! - [`error`] - Daemon errors and user-facing error formatting
//! - [`logging`] - Log output setup

pub mod config;
pub mod daemon;
pub mod download;
pub mod error;
pub mod locks;
pub mod logging;
pub mod rate_limit;
pub mod utils;

// Re-export commonly used types from download
pub use download::{
    PauseControl, Session, SessionContext, SessionKey, SessionSnapshot, SessionState,
    SessionStore, Supervisor, Throughput,
};

// Re-export from other modules
pub use config::{AppConfig, ConfigStore, Settings};
pub use daemon::{Aria2Client, DaemonClient, DaemonStatus, TransferId, TransferStatus};
pub use error::{DaemonError, ErrorBuilder};
pub use rate_limit::{LimitUnit, RateLimit, RateLimitController};
