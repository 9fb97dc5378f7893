// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! The event pool: registration surface and slot lifecycle.
//!
//! # Reference counting
//!
//! Every live registration holds references in fixed combinations:
//!
//! - `register` creates the slot with one reference, held until
//!   `unregister`;
//! - every internal `get` pairs with exactly one `slot_unref`;
//! - `unregister` releases two: the registration's and its own `get`.
//!
//! When the count reaches zero the slot is vacated under the pool mutex and,
//! if `unregister_close` was used, the descriptor is closed: exactly once,
//! strictly after the last in-flight handler for the registration returned.
//!
//! # Lock order
//!
//! The pool mutex is only taken while holding no slot lock. The dispatch
//! path takes slot locks without the pool mutex; `dealloc` runs under the
//! pool mutex only after the slot lock has been released.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::backend::{Epoll, EventMask, ReadinessEngine};
use crate::config::{self, DEFAULT_WORKERS, MAX_WORKERS};
use crate::error::{DispatchError, Result};
use crate::handler::EventHandler;
use crate::metrics::DispatchMetrics;
use crate::registry::{SlotRef, SlotRegistry};
use crate::slot::{Handle, VACANT_FD};

/// Tri-state interest directive: enable, disable, or leave unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// Enable this interest axis.
    On,
    /// Disable this interest axis.
    Off,
    /// Leave this interest axis as it is.
    Keep,
}

/// Pool state guarded by the single pool mutex.
pub(crate) struct PoolShared {
    /// Occupancy of the worker index space; entry `i` is worker `i + 1`.
    pub(crate) workers: [bool; MAX_WORKERS],
    /// Threads currently inside the dispatch machinery, including the
    /// caller blocked in `dispatch`.
    pub(crate) active: usize,
    /// Authoritative configured worker count.
    pub(crate) configured: usize,
    /// One exiting worker is currently draining the death list.
    pub(crate) death_sliced: bool,
    /// Tear-down has begun; registrations are denied.
    pub(crate) destroy: bool,
    /// Bumped once per worker exit; passed to death notifications.
    pub(crate) poller_gen: u64,
    /// Slot indices that opted into death notification.
    pub(crate) death_list: Vec<u32>,
}

/// Multi-threaded one-shot readiness dispatcher.
///
/// Construct with [`EventPool::new`], call [`dispatch`](Self::dispatch) from
/// a thread you dedicate to it, and register descriptors from anywhere,
/// including from inside handlers.
pub struct EventPool {
    pub(crate) engine: Box<dyn ReadinessEngine>,
    pub(crate) registry: SlotRegistry,
    /// Racy fast-path copy of `PoolShared::configured`, read at the top of
    /// every worker iteration without the pool mutex.
    pub(crate) configured: AtomicUsize,
    pub(crate) metrics: DispatchMetrics,
    pub(crate) shared: Mutex<PoolShared>,
    pub(crate) cond: Condvar,
    /// Back-reference for handing owned pool clones to spawned workers.
    pub(crate) self_ref: Weak<EventPool>,
}

impl EventPool {
    /// Create a pool backed by the platform epoll engine.
    ///
    /// `workers` is clamped to `[1, MAX_WORKERS]`; passing 0 selects the
    /// `EVMUX_WORKERS` environment override, or 1.
    pub fn new(workers: usize) -> Result<Arc<Self>> {
        let engine = Epoll::new().map_err(DispatchError::Engine)?;
        Ok(Self::with_engine(Box::new(engine), workers))
    }

    /// Create a pool on an explicit readiness engine.
    pub fn with_engine(engine: Box<dyn ReadinessEngine>, workers: usize) -> Arc<Self> {
        let workers = if workers == 0 {
            config::workers_from_env().unwrap_or(DEFAULT_WORKERS)
        } else {
            workers
        };
        let workers = workers.clamp(1, MAX_WORKERS);
        Arc::new_cyclic(|self_ref| Self {
            engine,
            registry: SlotRegistry::new(),
            configured: AtomicUsize::new(workers),
            metrics: DispatchMetrics::new(),
            shared: Mutex::new(PoolShared {
                workers: [false; MAX_WORKERS],
                active: 0,
                configured: workers,
                death_sliced: false,
                destroy: false,
                poller_gen: 0,
                death_list: Vec::new(),
            }),
            cond: Condvar::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Register `fd` with the pool.
    ///
    /// The descriptor is armed one-shot with the mandatory
    /// priority/hangup/error bits plus the requested read/write interest.
    /// `notify_death` opts the registration into
    /// [`EventHandler::poller_death`] when the worker serving it exits.
    ///
    /// The returned [`Handle`] stays valid until
    /// [`unregister`](Self::unregister); events carrying an older generation
    /// for the same slot are filtered out by the dispatch path.
    pub fn register(
        &self,
        fd: RawFd,
        handler: Arc<dyn EventHandler>,
        read: Toggle,
        write: Toggle,
        notify_death: bool,
    ) -> Result<Handle> {
        let (idx, slot) = {
            let mut shared = self.shared.lock();
            // A destroy flagged right after this check is tolerated: such a
            // registration stays open until unregistered and is drained by
            // the shutdown wake loop.
            if shared.destroy {
                return Err(DispatchError::PoolDestroying);
            }
            self.registry
                .alloc_locked(fd, notify_death, &mut shared.death_list)?
        };

        let (gen, add_result) = {
            let mut state = slot.state.lock();
            state.handler = Some(handler);
            // One-shot arming: the engine disarms the descriptor on every
            // delivery, so a second worker can never pick it up while the
            // first is still in the handler. Re-armed by `handled`.
            state.events = EventMask::MANDATORY;
            update_interest(&mut state.events, read, write);
            let token = Handle::new(idx, state.gen).to_token();
            (state.gen, self.engine.add(fd, state.events, token))
        };

        if let Err(e) = add_result {
            log::error!("failed to add fd={fd} to the readiness engine: {e}");
            self.slot_unref(&slot);
            return Err(DispatchError::Engine(e));
        }

        Ok(Handle::new(idx, gen))
    }

    /// Update the read/write interest of a registration.
    ///
    /// If the registration's handler is currently executing, no engine call
    /// is made: the new mask is picked up by the re-arm that
    /// [`handled`](Self::handled) performs, so the update cannot be lost and
    /// no extra syscall is spent.
    pub fn modify_interest(&self, handle: Handle, read: Toggle, write: Toggle) -> Result<()> {
        let Some(slot) = self.registry.get(handle.idx()) else {
            log::error!("no slot for idx={}", handle.idx());
            return Err(DispatchError::NotFound { idx: handle.idx() });
        };

        let result = {
            let mut state = slot.state.lock();
            if state.fd == VACANT_FD || state.gen != handle.gen() {
                log::error!(
                    "stale modify for idx={} gen={} (slot gen={})",
                    handle.idx(),
                    handle.gen(),
                    state.gen
                );
                Ok(())
            } else {
                update_interest(&mut state.events, read, write);
                if state.in_handler > 0 {
                    // The worker inside the handler re-arms with the current
                    // mask when it finishes; issuing a modify here would also
                    // let a second worker pick up the next event early.
                    Ok(())
                } else {
                    self.engine
                        .modify(state.fd, state.events, Handle::new(handle.idx(), state.gen).to_token())
                        .map_err(|e| {
                            log::error!(
                                "failed to modify fd={} in the readiness engine: {e}",
                                state.fd
                            );
                            DispatchError::Engine(e)
                        })
                }
            }
        };

        self.slot_unref(&slot);
        result
    }

    /// Remove a registration. The descriptor is left open.
    pub fn unregister(&self, handle: Handle) -> Result<()> {
        self.unregister_common(handle, false)
    }

    /// Remove a registration and close the descriptor once the last
    /// reference (including any in-flight handler) is gone.
    pub fn unregister_close(&self, handle: Handle) -> Result<()> {
        self.unregister_common(handle, true)
    }

    fn unregister_common(&self, handle: Handle, do_close: bool) -> Result<()> {
        let Some(slot) = self.registry.get(handle.idx()) else {
            log::error!("no slot for idx={}", handle.idx());
            return Err(DispatchError::NotFound { idx: handle.idx() });
        };

        let result = {
            let mut state = slot.state.lock();
            if state.fd == VACANT_FD || state.gen != handle.gen() {
                // Already unregistered (possibly by a racing caller); the
                // descriptor is gone from the caller's point of view.
                log::error!(
                    "stale unregister for idx={} gen={} (slot gen={})",
                    handle.idx(),
                    handle.gen(),
                    state.gen
                );
                drop(state);
                self.slot_unref(&slot);
                return Ok(());
            }
            match self.engine.delete(state.fd) {
                Err(e) => {
                    log::error!(
                        "failed to delete fd={} from the readiness engine: {e}",
                        state.fd
                    );
                    Err(DispatchError::Engine(e))
                }
                Ok(()) => {
                    state.do_close = do_close;
                    // Invalidate in-flight events for this registration.
                    state.gen = state.gen.wrapping_add(1);
                    Ok(())
                }
            }
        };

        self.slot_unref(&slot); // the register reference
        self.slot_unref(&slot); // our get above
        result
    }

    /// Report handler completion for one delivery, re-arming the descriptor.
    ///
    /// Must be called exactly once per [`EventHandler::handle_event`]
    /// invocation, after the handler has done whatever I/O it chose to do.
    /// The re-arm carries the slot's *current* interest mask, which is how
    /// interest updates issued during the handler take effect.
    pub fn handled(&self, handle: Handle) -> Result<()> {
        let Some(slot) = self.registry.get(handle.idx()) else {
            log::error!("no slot for idx={}", handle.idx());
            return Err(DispatchError::NotFound { idx: handle.idx() });
        };

        let result = {
            let mut state = slot.state.lock();
            if state.gen != handle.gen() {
                // Unregistered while the handler ran; nothing to re-arm. The
                // lingering in_handler count is reset when the slot is next
                // allocated.
                log::debug!(
                    "generation bumped on idx={} from gen={} to {}; skipping rearm",
                    handle.idx(),
                    handle.gen(),
                    state.gen
                );
                Ok(())
            } else {
                state.in_handler = state.in_handler.saturating_sub(1);
                if state.in_handler == 0 {
                    self.engine
                        .modify(state.fd, state.events, handle.to_token())
                        .map_err(|e| {
                            log::error!(
                                "failed to rearm fd={} in the readiness engine: {e}",
                                state.fd
                            );
                            DispatchError::Engine(e)
                        })
                } else {
                    Ok(())
                }
            }
        };

        self.slot_unref(&slot);
        result
    }

    /// Drop one slot reference, vacating the slot when it was the last.
    ///
    /// Takes the pool mutex internally; safe from handler context. The
    /// shrink path uses [`slot_unref_locked`](Self::slot_unref_locked)
    /// instead.
    pub(crate) fn slot_unref(&self, slot: &SlotRef) {
        if !slot.ref_dec() {
            return;
        }
        let (fd, do_close) = {
            let mut state = slot.state.lock();
            let fd = state.fd;
            let do_close = state.do_close;
            state.do_close = false;
            (fd, do_close)
        };
        let handler = {
            let mut shared = self.shared.lock();
            self.registry.dealloc_locked(slot.idx(), &mut shared.death_list)
        };
        if do_close && fd != VACANT_FD {
            // SAFETY: fd belongs to the registration just vacated and is
            // closed exactly once, after the slot is fully recycled.
            unsafe { libc::close(fd) };
        }
        drop(handler);
    }

    /// Variant of [`slot_unref`](Self::slot_unref) for callers that already
    /// hold the pool mutex. Returns the displaced handler, which the caller
    /// must drop after releasing the mutex.
    pub(crate) fn slot_unref_locked(
        &self,
        shared: &mut PoolShared,
        slot: &SlotRef,
    ) -> Option<Arc<dyn EventHandler>> {
        if !slot.ref_dec() {
            return None;
        }
        let (fd, do_close) = {
            let mut state = slot.state.lock();
            let fd = state.fd;
            let do_close = state.do_close;
            state.do_close = false;
            (fd, do_close)
        };
        let handler = self.registry.dealloc_locked(slot.idx(), &mut shared.death_list);
        if do_close && fd != VACANT_FD {
            // SAFETY: as in slot_unref.
            unsafe { libc::close(fd) };
        }
        handler
    }

    /// Dispatch counters.
    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Threads currently inside the dispatch machinery (workers plus the
    /// caller blocked in [`dispatch`](Self::dispatch)).
    pub fn active_workers(&self) -> usize {
        self.shared.lock().active
    }

    /// The configured worker count.
    pub fn configured_workers(&self) -> usize {
        self.configured.load(Ordering::Acquire)
    }

    /// Racy count of live registrations, for observability.
    pub fn registered_slots(&self) -> usize {
        self.registry.occupied()
    }
}

/// Fold tri-state read/write directives into an interest mask.
pub(crate) fn update_interest(events: &mut EventMask, read: Toggle, write: Toggle) {
    match read {
        Toggle::On => events.insert(EventMask::READABLE),
        Toggle::Off => events.remove(EventMask::READABLE),
        Toggle::Keep => {}
    }
    match write {
        Toggle::On => events.insert(EventMask::WRITABLE),
        Toggle::Off => events.remove(EventMask::WRITABLE),
        Toggle::Keep => {}
    }
}
