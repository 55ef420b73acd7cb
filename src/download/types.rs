// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download session types.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use chrono::{DateTime, Utc};

use crate::daemon::TransferId;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Supervisor-assigned handle for one session.
///
/// Unlike the transfer identity, which arrives only after the daemon
/// accepts the download, a key exists from the moment the session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// URL accepted, no transfer identity yet
    Pending,
    /// Transferring
    Active,
    /// Paused on the daemon
    Paused,
    /// Daemon reported completion
    Completed,
    /// Daemon reported an error; stays visible until cancelled
    Failed { message: String },
    /// Explicitly stopped
    Cancelled,
    /// URL rejected before any daemon call
    Invalid { message: String },
}

impl SessionState {
    /// Returns true once polling has nothing left to observe.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed { .. }
                | SessionState::Cancelled
                | SessionState::Invalid { .. }
        )
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SessionState::Paused)
    }
}

/// Display unit for a transfer speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpeedUnit {
    Bytes,
    Kilobytes,
    Megabytes,
}

impl SpeedUnit {
    /// Bytes per second in one of this unit.
    pub fn factor(self) -> f64 {
        match self {
            SpeedUnit::Bytes => 1.0,
            SpeedUnit::Kilobytes => KIB,
            SpeedUnit::Megabytes => MIB,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SpeedUnit::Bytes => "B/s",
            SpeedUnit::Kilobytes => "KB/s",
            SpeedUnit::Megabytes => "MB/s",
        }
    }
}

/// A transfer speed, kept as bytes per second.
///
/// Formatting happens only through [`fmt::Display`]; everything else
/// (summing, comparing) works on the number.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Throughput(f64);

impl Throughput {
    pub const ZERO: Throughput = Throughput(0.0);

    pub fn from_bytes_per_sec(bytes: f64) -> Self {
        if bytes.is_finite() && bytes > 0.0 {
            Self(bytes)
        } else {
            Self::ZERO
        }
    }

    pub fn bytes_per_sec(self) -> f64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Largest unit in which the value is at least one.
    pub fn unit(self) -> SpeedUnit {
        if self.0 >= MIB {
            SpeedUnit::Megabytes
        } else if self.0 >= KIB {
            SpeedUnit::Kilobytes
        } else {
            SpeedUnit::Bytes
        }
    }

    /// Value expressed in `unit`, rounded to two decimal places.
    pub fn value_in(self, unit: SpeedUnit) -> f64 {
        (self.0 / unit.factor() * 100.0).round() / 100.0
    }
}

impl From<u64> for Throughput {
    fn from(bytes: u64) -> Self {
        Self::from_bytes_per_sec(bytes as f64)
    }
}

impl Add for Throughput {
    type Output = Throughput;

    fn add(self, rhs: Throughput) -> Throughput {
        Throughput(self.0 + rhs.0)
    }
}

impl Sum for Throughput {
    fn sum<I: Iterator<Item = Throughput>>(iter: I) -> Self {
        iter.fold(Throughput::ZERO, Add::add)
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0 B/s");
        }
        let unit = self.unit();
        write!(f, "{} {}", self.value_in(unit), unit.label())
    }
}

/// Which pause affordance the UI should show for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseControl {
    /// Show "pause"
    #[default]
    Pause,
    /// Show "resume"
    Resume,
    /// Nothing left to pause
    Hidden,
}

/// Published view of one session, read by the supervisor loops and the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub url: String,
    /// File name derived from the URL
    pub name: String,
    pub identity: Option<TransferId>,
    pub state: SessionState,
    /// Progress fraction in [0.0, 1.0]
    pub progress: f64,
    pub throughput: Throughput,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    /// User-facing message replacing the speed display, if any
    pub message: Option<String>,
    pub control: PauseControl,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            identity: None,
            state: SessionState::Pending,
            progress: 0.0,
            throughput: Throughput::ZERO,
            completed_bytes: 0,
            total_bytes: 0,
            message: None,
            control: PauseControl::default(),
            updated_at: Utc::now(),
        }
    }

    /// Progress as a whole percentage.
    pub fn percent(&self) -> u64 {
        (self.progress.clamp(0.0, 1.0) * 100.0).round() as u64
    }

    /// One-line status text, e.g. `"42%  |  1.5 MB/s"`.
    pub fn status_line(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        match &self.state {
            SessionState::Pending => "Waiting for the download daemon...".to_string(),
            SessionState::Completed => "Download complete.".to_string(),
            SessionState::Cancelled => "Cancelled.".to_string(),
            SessionState::Failed { message } | SessionState::Invalid { message } => message.clone(),
            SessionState::Active | SessionState::Paused => {
                format!("{}%  |  {}", self.percent(), self.throughput)
            }
        }
    }
}
