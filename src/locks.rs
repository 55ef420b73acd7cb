// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The session set is read by two background loops and written by the
//! command side. A panic in one of them must not take the others down, so
//! a poisoned lock is logged and recovered instead of unwrapped.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "varia::locks",
            "RwLock poisoned during read; a task panicked while holding it. Continuing with recovered data."
        );
        poisoned.into_inner()
    })
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "varia::locks",
            "RwLock poisoned during write; a task panicked while holding it. Continuing with recovered data."
        );
        poisoned.into_inner()
    })
}
