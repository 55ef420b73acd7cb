// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types and user-facing error formatting for varia.
//!
//! Two layers live here:
//! - [`DaemonError`], the typed failure of a single daemon call. Sessions
//!   match on it to tell "daemon not there" apart from "daemon said no".
//! - Message helpers that turn failures into the short strings shown next
//!   to a download, plus [`ErrorBuilder`] for the CLI's startup errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Prefix of every error string shown alongside a download.
pub const ERROR_PREFIX: &str = "An error occurred:";

/// Failure of one call across the daemon boundary.
#[derive(Debug, Clone, Error)]
pub enum DaemonError {
    /// Connection refused, reset, DNS failure and similar transport problems.
    #[error("download daemon unreachable: {0}")]
    Unreachable(String),

    /// The call did not complete within the configured timeout.
    #[error("download daemon did not answer within {0:?}")]
    Timeout(Duration),

    /// The daemon answered with a JSON-RPC error object.
    #[error("download daemon rejected the request ({code}): {message}")]
    Rpc { code: i64, message: String },

    /// The daemon answered with something that is not a valid response.
    #[error("malformed response from download daemon: {0}")]
    Protocol(String),
}

impl DaemonError {
    /// True when the daemon could not be reached at all.
    ///
    /// RPC and protocol errors mean the daemon is alive and answered.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

pub type DaemonResult<T> = std::result::Result<T, DaemonError>;

/// Extract the interesting part of a daemon error detail.
///
/// aria2 error messages often carry a long prefix followed by
/// `status=<detail>`; only the part after the marker is worth showing.
pub fn error_detail(raw: &str) -> &str {
    match raw.split_once("status=") {
        Some((_, detail)) => detail.trim(),
        None => raw.trim(),
    }
}

/// Build the short user-facing string shown in place of a download's speed.
pub fn user_message(raw: &str) -> String {
    format!("{} {}", ERROR_PREFIX, error_detail(raw))
}

/// Builder for multi-line CLI error messages with causes and fixes.
///
/// # Example
///
/// ```
/// use varia::error::ErrorBuilder;
///
/// let error = ErrorBuilder::new("Could not reach aria2")
///     .cause("aria2c is not running")
///     .fix("Start it: aria2c --enable-rpc --rpc-listen-port=6801")
///     .build();
/// assert!(error.contains("Possible causes:"));
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[✗] {}", self.title)?;

        if !self.causes.is_empty() {
            write!(f, "\n\nPossible causes:")?;
            for cause in &self.causes {
                write!(f, "\n  - {}", cause)?;
            }
        }

        if !self.fixes.is_empty() {
            write!(f, "\n\nTry these fixes:")?;
            for (i, fix) in self.fixes.iter().enumerate() {
                write!(f, "\n  {}. {}", i + 1, fix)?;
            }
        }

        Ok(())
    }
}
