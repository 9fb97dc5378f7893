// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the poller threads to track dispatch outcomes.
///
/// All fields use relaxed atomics; consumers only need monotonic snapshots
/// for observability.
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Events that reached a user handler.
    pub events_dispatched: AtomicU64,
    /// Events dropped because the slot was vacant or its page missing.
    pub stale_events: AtomicU64,
    /// Events dropped because the slot was recycled for another descriptor.
    pub generation_mismatches: AtomicU64,
    /// Events skipped because a handler for the slot was already running.
    pub busy_skips: AtomicU64,
    /// Error/hangup edges coalesced by the per-slot latch.
    pub duplicate_error_edges: AtomicU64,
    /// Poller threads that exited through the cooperative shrink path.
    pub worker_exits: AtomicU64,
    /// Death notifications delivered to opted-in registrations.
    pub death_notifications: AtomicU64,
}

impl DispatchMetrics {
    /// Create a zeroed metrics struct ready for concurrent updates.
    #[inline]
    pub fn new() -> Self {
        Self {
            events_dispatched: AtomicU64::new(0),
            stale_events: AtomicU64::new(0),
            generation_mismatches: AtomicU64::new(0),
            busy_skips: AtomicU64::new(0),
            duplicate_error_edges: AtomicU64::new(0),
            worker_exits: AtomicU64::new(0),
            death_notifications: AtomicU64::new(0),
        }
    }

    /// Return the current counters without synchronisation penalties.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64, u64, u64) {
        (
            self.events_dispatched.load(Ordering::Relaxed),
            self.stale_events.load(Ordering::Relaxed),
            self.generation_mismatches.load(Ordering::Relaxed),
            self.busy_skips.load(Ordering::Relaxed),
            self.duplicate_error_edges.load(Ordering::Relaxed),
            self.worker_exits.load(Ordering::Relaxed),
            self.death_notifications.load(Ordering::Relaxed),
        )
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
