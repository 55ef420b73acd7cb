// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted session records.
//!
//! One small JSON file per in-flight transfer, named
//! `<transfer identity>.varia.json` and kept in the downloads directory,
//! so unfinished downloads can be picked up again after a restart.
//! Each file is owned by the session for that identity; the only other
//! reader is startup recovery, which consumes the file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::daemon::TransferId;

/// File name suffix marking a persisted record.
pub const RECORD_SUFFIX: &str = ".varia.json";

/// Recoverable state of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Source URL of the transfer
    pub url: String,
    /// Bytes completed at the time of the snapshot. Informational only;
    /// the daemon is the source of truth when resuming.
    pub downloaded: u64,
}

/// Directory of persisted records keyed by transfer identity.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `id`.
    pub fn record_path(&self, id: &TransferId) -> PathBuf {
        self.dir.join(format!("{}{}", id, RECORD_SUFFIX))
    }

    pub fn exists(&self, id: &TransferId) -> bool {
        self.record_path(id).exists()
    }

    /// Write the record for `id`, replacing any previous one.
    ///
    /// Uses a temp file + atomic rename so a crash never leaves a torn record.
    pub fn save(&self, id: &TransferId, record: &PersistedRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create record directory: {:?}", self.dir))?;

        let path = self.record_path(id);
        let temp_path = self.dir.join(format!(".{}{}.tmp", id, RECORD_SUFFIX));

        let content = serde_json::to_string(record)
            .with_context(|| "Failed to serialize session record")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write session record")?;

            temp_file
                .sync_all()
                .with_context(|| "Failed to sync session record to disk")?;
        }

        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to move record into place: {:?}", path))?;

        Ok(())
    }

    /// Read the record for `id` without consuming it.
    pub fn load(&self, id: &TransferId) -> Result<Option<PersistedRecord>> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read record: {:?}", path)),
        };

        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse record: {:?}", path))?;
        Ok(Some(record))
    }

    /// Delete the record for `id`. Returns whether a record existed.
    pub fn remove(&self, id: &TransferId) -> Result<bool> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete record: {:?}", path)),
        }
    }

    /// Identities of every record currently on disk, sorted.
    pub fn scan(&self) -> Result<Vec<TransferId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list records in {:?}", self.dir))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| "Failed to read directory entry")?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(RECORD_SUFFIX) {
                if !id.is_empty() && !id.starts_with('.') {
                    ids.push(TransferId::new(id));
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Read and delete the record for `id`.
    ///
    /// The file is removed even when its content cannot be parsed, so a
    /// record is consumed exactly once.
    pub fn take(&self, id: &TransferId) -> Result<PersistedRecord> {
        let path = self.record_path(id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read record: {:?}", path))?;

        fs::remove_file(&path).with_context(|| format!("Failed to delete record: {:?}", path))?;

        serde_json::from_str(&content).with_context(|| format!("Failed to parse record: {:?}", path))
    }
}
