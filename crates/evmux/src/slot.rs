// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Slot records and registration handles.
//!
//! A slot describes one registered descriptor. Slots sit at fixed positions
//! inside registry pages and are recycled across registrations; the
//! generation counter is what distinguishes the current registration from a
//! stale event queued for a previous occupant of the same position.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::EventMask;
use crate::handler::EventHandler;

/// Sentinel descriptor value for a vacant slot.
pub(crate) const VACANT_FD: RawFd = -1;

/// Stable identifier for one registration.
///
/// The pair is packed into the readiness engine's 64-bit per-event user data
/// and validated when the event comes back out: a handle is live only while
/// the slot at `idx` still carries the same generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    idx: u32,
    gen: u32,
}

impl Handle {
    pub(crate) fn new(idx: u32, gen: u32) -> Self {
        Self { idx, gen }
    }

    /// Slot index of this registration.
    #[inline]
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Generation the registration was created under.
    #[inline]
    pub fn gen(&self) -> u32 {
        self.gen
    }

    /// Pack into the engine's opaque token: index in the high half,
    /// generation in the low half.
    #[inline]
    pub(crate) fn to_token(self) -> u64 {
        (u64::from(self.idx) << 32) | u64::from(self.gen)
    }

    #[inline]
    pub(crate) fn from_token(token: u64) -> Self {
        Self {
            idx: (token >> 32) as u32,
            gen: token as u32,
        }
    }
}

/// Mutable slot fields, guarded by the per-slot lock.
pub(crate) struct SlotState {
    /// Registered descriptor, or [`VACANT_FD`].
    pub(crate) fd: RawFd,
    /// Bumped on every allocation and every unregister.
    pub(crate) gen: u32,
    /// Current interest mask (always includes [`EventMask::MANDATORY`]).
    pub(crate) events: EventMask,
    /// User callback; present exactly while the slot is live.
    pub(crate) handler: Option<Arc<dyn EventHandler>>,
    /// Nonzero while a worker is executing this slot's handler.
    pub(crate) in_handler: u32,
    /// Latched on the first delivered error/hangup edge.
    pub(crate) handled_error: bool,
    /// Close the descriptor when the last reference is released.
    pub(crate) do_close: bool,
    /// Membership in the pool's death-notification list.
    pub(crate) notify_death: bool,
}

impl SlotState {
    fn vacant() -> Self {
        Self {
            fd: VACANT_FD,
            gen: 0,
            events: EventMask::empty(),
            handler: None,
            in_handler: 0,
            handled_error: false,
            do_close: false,
            notify_death: false,
        }
    }

    /// Reset everything except the generation, which is bumped, and install
    /// the new descriptor.
    pub(crate) fn wipe_for_alloc(&mut self, fd: RawFd) {
        self.fd = fd;
        self.gen = self.gen.wrapping_add(1);
        self.events = EventMask::empty();
        self.handler = None;
        self.in_handler = 0;
        self.handled_error = false;
        self.do_close = false;
        self.notify_death = false;
    }
}

/// One slot record. The reference count is touched only with atomics; all
/// other mutable fields live behind the per-slot mutex.
pub(crate) struct Slot {
    refs: AtomicI64,
    pub(crate) state: Mutex<SlotState>,
}

impl Slot {
    pub(crate) fn vacant() -> Self {
        Self {
            refs: AtomicI64::new(0),
            state: Mutex::new(SlotState::vacant()),
        }
    }

    #[inline]
    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; true when this was the last one.
    #[inline]
    pub(crate) fn ref_dec(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }
}
