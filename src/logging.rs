// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Log output setup.
//!
//! Logs go to stderr so they never interleave with the progress bars on
//! stdout. `RUST_LOG` overrides the default filter.

use anyhow::{anyhow, Result};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "varia=error"
    } else if verbose {
        "varia=debug"
    } else {
        "varia=info"
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(verbose: bool, quiet: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
