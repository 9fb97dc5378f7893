// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Error type for pool operations.

use std::fmt;
use std::io;

/// Errors surfaced by [`EventPool`](crate::EventPool) operations.
///
/// Stale-handle conditions (a handle whose slot was recycled or vacated) are
/// deliberately *not* represented here: from the caller's point of view the
/// descriptor was already gone, so those paths log at error level and return
/// success.
#[derive(Debug)]
pub enum DispatchError {
    /// Every slot in every page is occupied.
    TableFull,

    /// The readiness engine rejected an add/modify/delete.
    Engine(io::Error),

    /// The handle's index points at a page that was never allocated.
    NotFound { idx: u32 },

    /// The pool is shutting down; new registrations are denied.
    PoolDestroying,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => write!(f, "slot registry exhausted"),
            Self::Engine(e) => write!(f, "readiness engine operation failed: {e}"),
            Self::NotFound { idx } => write!(f, "no slot registered at index {idx}"),
            Self::PoolDestroying => write!(f, "event pool is being destroyed"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Engine(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, DispatchError>;
