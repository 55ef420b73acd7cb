// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application configuration.
//!
//! Two layers:
//! - [`AppConfig`], the small JSON file `varia.conf` in the app directory
//!   holding what the user chose last time (currently the speed limit)
//! - [`Settings`], runtime settings assembled from CLI flags and the
//!   environment, never written to disk
//!
//! Writes to `varia.conf` go through an exclusive lock on `varia.conf.lock`
//! and a temp file + atomic rename, so two running instances cannot
//! interleave their writes.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::daemon::DEFAULT_RPC_URL;

/// Name of the app configuration file.
pub const CONFIG_FILE_NAME: &str = "varia.conf";

/// Default timeout for acquiring the config lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Persisted user preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Last applied global download limit, e.g. `"500M"`; `"0"` is unlimited
    #[serde(default = "default_speed_limit")]
    pub download_speed_limit: String,
}

fn default_speed_limit() -> String {
    "0".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_speed_limit: default_speed_limit(),
        }
    }
}

/// Location of `varia.conf`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store for `varia.conf` inside `app_dir`.
    pub fn new(app_dir: impl AsRef<Path>) -> Self {
        Self {
            path: app_dir.as_ref().join(CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("conf.lock")
    }

    /// Load the config, writing the defaults first if the file does not exist.
    pub fn load(&self) -> Result<AppConfig> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no config file, writing defaults");
                let config = AppConfig::default();
                self.save(&config)?;
                return Ok(config);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config: {:?}", self.path))
            }
        };

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", self.path))
    }

    /// Write the config atomically under the exclusive lock.
    pub fn save(&self, config: &AppConfig) -> Result<()> {
        self.save_with_timeout(config, LOCK_TIMEOUT)
    }

    /// Write the config with a custom timeout for lock acquisition.
    pub fn save_with_timeout(&self, config: &AppConfig, timeout: Duration) -> Result<()> {
        let _lock_guard = acquire_exclusive_lock_with_timeout(&self.lock_path(), timeout)?;

        let content = serde_json::to_string(config).with_context(|| "Failed to serialize config")?;
        let temp_path = self.path.with_extension("conf.tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write config")?;

            temp_file
                .sync_all()
                .with_context(|| "Failed to sync config to disk")?;
        }

        // The lock is still held, protecting the final file
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!("Failed to rename temp file to config: {:?} -> {:?}", temp_path, self.path)
        })?;
        Ok(())
    }
}

/// Acquire an exclusive lock with timeout.
///
/// Returns the locked file handle on success; the lock is released when it
/// is dropped.
fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))?;

    let start = Instant::now();
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing the config file.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Runtime settings, assembled once at process start.
#[derive(Debug, Clone)]
pub struct Settings {
    /// aria2 JSON-RPC endpoint
    pub rpc_url: String,
    /// aria2 `--rpc-secret`, if the daemon was started with one
    pub rpc_secret: Option<String>,
    /// Where downloads and their records are written
    pub download_dir: PathBuf,
    /// Where `varia.conf` lives
    pub app_dir: PathBuf,
    /// Upper bound on any single daemon call
    pub call_timeout: Duration,
    pub poll_interval: Duration,
}

impl Settings {
    pub fn config_store(&self) -> ConfigStore {
        ConfigStore::new(&self.app_dir)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            rpc_secret: None,
            download_dir: default_download_dir(),
            app_dir: default_app_dir(),
            call_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The user's download directory, or `./downloads` if the platform has none.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

/// `<config dir>/varia`, or `./.varia` if the platform has none.
pub fn default_app_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("varia"))
        .unwrap_or_else(|| PathBuf::from(".varia"))
}
