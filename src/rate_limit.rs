// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Global download rate limit.
//!
//! The user picks a whole number and a unit; the daemon receives one
//! daemon-wide limit such as `"500M"`, and the same string is remembered in
//! `varia.conf` so it can be re-applied on the next start.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::daemon::DaemonClient;

/// Unit of a rate limit, sent to the daemon as its letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitUnit {
    Kilobytes,
    Megabytes,
    Gigabytes,
}

impl LimitUnit {
    pub fn letter(self) -> char {
        match self {
            LimitUnit::Kilobytes => 'K',
            LimitUnit::Megabytes => 'M',
            LimitUnit::Gigabytes => 'G',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'K' => Some(LimitUnit::Kilobytes),
            'M' => Some(LimitUnit::Megabytes),
            'G' => Some(LimitUnit::Gigabytes),
            _ => None,
        }
    }
}

impl FromStr for LimitUnit {
    type Err = RateLimitError;

    /// Accepts `K`, `KB`, `M`, `MB`, `G`, `GB` in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_uppercase();
        let letter = s.strip_suffix('B').unwrap_or(&s);
        let mut chars = letter.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => LimitUnit::from_letter(c),
            _ => None,
        }
        .ok_or_else(|| RateLimitError::InvalidUnit(s.clone()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("speed limit must be a whole non-negative number, got {0:?}")]
    InvalidValue(String),

    #[error("unknown speed limit unit {0:?}, expected KB, MB or GB")]
    InvalidUnit(String),
}

/// A validated limit, displayed the way the daemon expects it (`500M`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub value: u64,
    pub unit: LimitUnit,
}

impl RateLimit {
    /// Validate user input. An empty value means `0`, i.e. unlimited.
    pub fn new(value: &str, unit: LimitUnit) -> Result<Self, RateLimitError> {
        let value = value.trim();
        let value = if value.is_empty() { "0" } else { value };

        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RateLimitError::InvalidValue(value.to_string()));
        }
        let value = value
            .parse()
            .map_err(|_| RateLimitError::InvalidValue(value.to_string()))?;
        Ok(Self { value, unit })
    }

    /// Parse a composed limit such as `"500M"`.
    pub fn parse(composed: &str) -> Option<Self> {
        let composed = composed.trim();
        let letter = composed.chars().last()?;
        let unit = LimitUnit::from_letter(letter)?;
        Self::new(&composed[..composed.len() - letter.len_utf8()], unit).ok()
    }

    pub fn is_unlimited(&self) -> bool {
        self.value == 0
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.letter())
    }
}

/// What [`RateLimitController::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub limit: RateLimit,
    /// False when the daemon call failed; the limit was still saved
    pub daemon_applied: bool,
}

/// Applies the global limit to the daemon and remembers it.
pub struct RateLimitController {
    daemon: Arc<dyn DaemonClient>,
    config: ConfigStore,
}

impl RateLimitController {
    pub fn new(daemon: Arc<dyn DaemonClient>, config: ConfigStore) -> Self {
        Self { daemon, config }
    }

    /// Validate, send to the daemon, then persist.
    ///
    /// The limit is saved even if the daemon rejected it, so the config
    /// always reflects what the user asked for; `daemon_applied` tells the
    /// caller whether the daemon agreed. Reapplying the same limit is harmless.
    pub async fn apply(&self, value: &str, unit: LimitUnit) -> Result<RateLimitOutcome> {
        let limit = RateLimit::new(value, unit)?;
        let composed = limit.to_string();

        let daemon_applied = match self.daemon.set_global_download_limit(&composed).await {
            Ok(()) => true,
            Err(e) => {
                warn!(limit = %composed, error = %e, "daemon did not accept speed limit");
                false
            }
        };

        let mut config = self.config.load().unwrap_or_else(|e| {
            warn!(error = %e, "unreadable config, overwriting with defaults");
            Default::default()
        });
        config.download_speed_limit = composed;
        self.config.save(&config)?;

        info!(limit = %limit, daemon_applied, "speed limit set");
        Ok(RateLimitOutcome {
            limit,
            daemon_applied,
        })
    }

    /// Re-apply the saved limit at startup.
    ///
    /// Nothing is sent when the saved limit is unlimited. Returns the limit
    /// that was sent, if any.
    pub async fn restore(&self) -> Result<Option<RateLimit>> {
        let saved = self.config.load()?.download_speed_limit;
        if saved.is_empty() || saved.starts_with('0') {
            return Ok(None);
        }

        let Some(limit) = RateLimit::parse(&saved) else {
            warn!(limit = %saved, "ignoring malformed saved speed limit");
            return Ok(None);
        };

        if let Err(e) = self.daemon.set_global_download_limit(&limit.to_string()).await {
            warn!(limit = %limit, error = %e, "could not restore speed limit");
        }
        Ok(Some(limit))
    }

    /// The limit currently saved in the config.
    pub fn current(&self) -> Result<String> {
        Ok(self.config.load()?.download_speed_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::daemon::{DaemonCall, MemoryDaemon};
    use tempfile::TempDir;

    fn controller() -> (RateLimitController, Arc<MemoryDaemon>, ConfigStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let daemon = Arc::new(MemoryDaemon::new());
        let store = ConfigStore::new(temp_dir.path());
        let controller = RateLimitController::new(daemon.clone(), store.clone());
        (controller, daemon, store, temp_dir)
    }

    #[test]
    fn test_compose() {
        assert_eq!(RateLimit::new("500", LimitUnit::Megabytes).unwrap().to_string(), "500M");
        assert_eq!(RateLimit::new("", LimitUnit::Kilobytes).unwrap().to_string(), "0K");
        assert_eq!(RateLimit::new(" 2 ", LimitUnit::Gigabytes).unwrap().to_string(), "2G");
    }

    #[test]
    fn test_rejects_non_integers() {
        for bad in ["-1", "1.5", "abc", "5M", "99999999999999999999999"] {
            assert!(
                matches!(RateLimit::new(bad, LimitUnit::Kilobytes), Err(RateLimitError::InvalidValue(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_composed() {
        assert_eq!(
            RateLimit::parse("500M"),
            Some(RateLimit { value: 500, unit: LimitUnit::Megabytes })
        );
        assert_eq!(RateLimit::parse("12k").map(|l| l.unit), Some(LimitUnit::Kilobytes));
        assert_eq!(RateLimit::parse("500"), None);
        assert_eq!(RateLimit::parse("M"), Some(RateLimit { value: 0, unit: LimitUnit::Megabytes }));
        assert_eq!(RateLimit::parse(""), None);
    }

    #[test]
    fn test_unit_from_str() {
        assert_eq!("MB".parse::<LimitUnit>().unwrap(), LimitUnit::Megabytes);
        assert_eq!("k".parse::<LimitUnit>().unwrap(), LimitUnit::Kilobytes);
        assert_eq!("gb".parse::<LimitUnit>().unwrap(), LimitUnit::Gigabytes);
        assert!("TB".parse::<LimitUnit>().is_err());
        assert!("".parse::<LimitUnit>().is_err());
    }

    #[tokio::test]
    async fn test_apply_sends_and_persists() {
        let (controller, daemon, store, _dir) = controller();

        let outcome = controller.apply("500", LimitUnit::Megabytes).await.unwrap();
        assert!(outcome.daemon_applied);
        assert_eq!(daemon.global_limit().as_deref(), Some("500M"));
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            r#"{"download_speed_limit":"500M"}"#
        );

        // Same value again is harmless
        controller.apply("500", LimitUnit::Megabytes).await.unwrap();
        assert_eq!(controller.current().unwrap(), "500M");
    }

    #[tokio::test]
    async fn test_apply_persists_even_if_daemon_fails() {
        let (controller, daemon, _store, _dir) = controller();
        daemon.set_unreachable(true);

        let outcome = controller.apply("100", LimitUnit::Kilobytes).await.unwrap();
        assert!(!outcome.daemon_applied);
        assert_eq!(controller.current().unwrap(), "100K");
    }

    #[tokio::test]
    async fn test_apply_invalid_value_touches_nothing() {
        let (controller, daemon, store, _dir) = controller();

        assert!(controller.apply("fast", LimitUnit::Megabytes).await.is_err());
        assert!(daemon.calls().is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_restore() {
        let (controller, daemon, store, _dir) = controller();

        // Unlimited: nothing to send
        assert_eq!(controller.restore().await.unwrap(), None);
        assert!(daemon.calls().is_empty());

        store
            .save(&AppConfig {
                download_speed_limit: "2G".into(),
            })
            .unwrap();
        let restored = controller.restore().await.unwrap();
        assert_eq!(restored, Some(RateLimit { value: 2, unit: LimitUnit::Gigabytes }));
        assert_eq!(
            daemon.calls(),
            vec![DaemonCall::SetGlobalDownloadLimit("2G".into())]
        );
    }
}
