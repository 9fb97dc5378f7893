// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Poller threads: the wait/dispatch cycle, cooperative shrink, and pool
//! tear-down.
//!
//! # Architecture
//!
//! ```text
//! dispatch() caller ----joins----> worker 1 (joinable)
//!                                  worker 2..n (detached)
//!                                      |
//!            +-------------------------+--------------------------+
//!            v                         v                          v
//!     over quota?  ---yes--->  death-slice drain  --->  exit thread
//!            | no
//!            v
//!     engine.wait(one event)
//!            v
//!     dispatch_event: get slot -> validate fd/gen -> in_handler gate
//!            v
//!     user handler (outside all locks) ... pool.handled() re-arms
//! ```
//!
//! One event per wait: one-shot arming already disarms the descriptor on
//! delivery, and taking a single event keeps every other worker free to pick
//! up other descriptors instead of stalling behind this worker's handler.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::backend::{EventMask, RawEvent};
use crate::config::MAX_WORKERS;
use crate::error::{DispatchError, Result};
use crate::handler::{EventHandler, ReadyEvent};
use crate::pool::{EventPool, Toggle};
use crate::slot::{Handle, VACANT_FD};

/// Interval between wake-pipe kicks while tear-down waits for pollers.
const SHUTDOWN_KICK_INTERVAL: Duration = Duration::from_millis(10);

impl EventPool {
    /// Run the dispatcher.
    ///
    /// Spawns the configured number of poller threads and blocks on the
    /// first (joinable) one; the rest are detached. Returns only after
    /// [`shutdown`](Self::shutdown) has driven the worker quota to zero.
    /// Spawn failure of the joinable worker aborts; failures of the others
    /// are logged and tolerated.
    pub fn dispatch(&self) -> Result<()> {
        let joinable = {
            let mut shared = self.shared.lock();
            if shared.destroy {
                return Err(DispatchError::PoolDestroying);
            }
            let count = shared.configured;
            shared.active += 1; // the caller thread itself
            let mut joinable = None;
            for index in 1..=count {
                match self.spawn_worker(index) {
                    Ok(handle) => {
                        shared.workers[index - 1] = true;
                        if index == 1 {
                            joinable = Some(handle);
                        }
                    }
                    Err(e) => {
                        log::warn!("failed to start poller {index}: {e}");
                        if index == 1 {
                            break;
                        }
                    }
                }
            }
            joinable
        };

        let Some(first) = joinable else {
            let mut shared = self.shared.lock();
            shared.active -= 1;
            self.cond.notify_all();
            return Err(DispatchError::Engine(io::Error::other(
                "failed to start the joinable poller",
            )));
        };

        // Worker 1 only exits when the quota reaches zero, so this join is
        // what parks the caller for the pool's lifetime.
        let _ = first.join();

        let mut shared = self.shared.lock();
        shared.active -= 1;
        self.cond.notify_all();
        Ok(())
    }

    /// Resize the worker pool.
    ///
    /// Growing spawns detached pollers immediately (no worker has to wake).
    /// Shrinking is cooperative: pollers above the new quota exit after
    /// their next return from the engine wait. Returns the clamped count
    /// actually stored.
    pub fn reconfigure(&self, value: usize) -> usize {
        let mut shared = self.shared.lock();
        let value = if shared.destroy {
            0
        } else {
            value.clamp(1, MAX_WORKERS)
        };
        let old = shared.configured;

        // Spawn only if dispatch() already started; otherwise the new count
        // simply takes effect when it does.
        if shared.workers[0] && old < value {
            for index in (old + 1)..=value {
                if !shared.workers[index - 1] {
                    match self.spawn_worker(index) {
                        Ok(_) => shared.workers[index - 1] = true,
                        Err(e) => log::warn!("failed to start poller {index}: {e}"),
                    }
                }
            }
        }

        shared.configured = value;
        self.configured.store(value, Ordering::Release);
        value
    }

    /// Tear the pool down.
    ///
    /// Denies further registrations, drives the worker quota to zero, and
    /// blocks until every poller (and the `dispatch` caller) has left. A
    /// self-pipe registered with the pool is kicked repeatedly so pollers
    /// blocked in the indefinite engine wait come around to observe the new
    /// quota.
    pub fn shutdown(&self) -> Result<()> {
        // Register the wake pipe first; registration is denied once the
        // destroy flag is up.
        let mut wake_fds = [-1; 2];
        // SAFETY: wake_fds is a valid two-element array.
        let have_pipe = unsafe {
            libc::pipe2(wake_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK)
        } == 0;
        let wake = if have_pipe {
            let drain: Arc<dyn EventHandler> = Arc::new(DrainHandler {
                pool: self.self_ref.clone(),
            });
            match self.register(wake_fds[0], drain, Toggle::On, Toggle::Off, false) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::warn!("wake pipe registration failed during shutdown: {e}");
                    // SAFETY: both ends were just created and are unused.
                    unsafe {
                        libc::close(wake_fds[0]);
                        libc::close(wake_fds[1]);
                    }
                    None
                }
            }
        } else {
            log::warn!(
                "wake pipe creation failed during shutdown: {}",
                io::Error::last_os_error()
            );
            None
        };

        self.shared.lock().destroy = true;
        self.reconfigure(0);

        let mut shared = self.shared.lock();
        while shared.active > 0 {
            if wake.is_some() {
                // One byte frees one poller from the engine wait; keep
                // kicking until they have all seen the zero quota.
                // SAFETY: wake_fds[1] is our non-blocking pipe write end.
                unsafe { libc::write(wake_fds[1], [1u8].as_ptr().cast(), 1) };
            }
            let _ = self
                .cond
                .wait_for(&mut shared, SHUTDOWN_KICK_INTERVAL);
        }
        drop(shared);

        if let Some(handle) = wake {
            let _ = self.unregister_close(handle);
            // SAFETY: the write end is still owned here.
            unsafe { libc::close(wake_fds[1]) };
        }
        Ok(())
    }

    fn spawn_worker(&self, index: usize) -> io::Result<thread::JoinHandle<()>> {
        let Some(pool) = self.self_ref.upgrade() else {
            return Err(io::Error::other("event pool already released"));
        };
        thread::Builder::new()
            .name(format!("evmux-poll-{index:03}"))
            .spawn(move || worker_loop(&pool, index))
    }

    /// Translate one engine event back into a handler invocation.
    ///
    /// The hot path: look the slot up by index, then validate under its lock
    /// that the registration the event was queued for is still the current
    /// occupant, that no other worker is in the handler, and that the error
    /// latch has not already fired.
    pub(crate) fn dispatch_event(&self, event: &RawEvent) {
        let handle = Handle::from_token(event.token);
        let Some(slot) = self.registry.get(handle.idx()) else {
            self.metrics.stale_events.fetch_add(1, Ordering::Relaxed);
            log::error!("no slot for event idx={}", handle.idx());
            return;
        };

        let invoke = {
            let mut state = slot.state.lock();
            if state.fd == VACANT_FD {
                // Unregistered in another thread after the event was queued.
                self.metrics.stale_events.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "stale event on idx={} gen={} (slot vacant, slot gen={})",
                    handle.idx(),
                    handle.gen(),
                    state.gen
                );
                None
            } else if state.gen != handle.gen() {
                // Slot was recycled and now belongs to another descriptor.
                self.metrics
                    .generation_mismatches
                    .fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "generation mismatch on idx={}: event gen={} slot gen={} fd={}",
                    handle.idx(),
                    handle.gen(),
                    state.gen,
                    state.fd
                );
                None
            } else if state.in_handler > 0 {
                // Another worker is dispatching this slot; its rearm will
                // deliver any later edges.
                self.metrics.busy_skips.fetch_add(1, Ordering::Relaxed);
                None
            } else if state.handled_error {
                self.metrics
                    .duplicate_error_edges
                    .fetch_add(1, Ordering::Relaxed);
                None
            } else {
                state.handled_error = event.mask.intersects(EventMask::ERROR | EventMask::HANGUP);
                state.in_handler += 1;
                state.handler.clone().map(|handler| (handler, state.fd))
            }
        };

        if let Some((handler, fd)) = invoke {
            self.metrics.events_dispatched.fetch_add(1, Ordering::Relaxed);
            handler.handle_event(ReadyEvent {
                fd,
                handle,
                readable: event
                    .mask
                    .intersects(EventMask::READABLE | EventMask::PRIORITY),
                writable: event.mask.contains(EventMask::WRITABLE),
                error_or_hup: event.mask.intersects(EventMask::ERROR | EventMask::HANGUP),
            });
        }

        self.slot_unref(&slot);
    }

    /// Over-quota exit path. Returns true when the worker confirmed the
    /// shrink under the pool mutex and has fully retired; false when the
    /// quota grew back before the lock was taken.
    ///
    /// Exactly one exiting worker drains the death-notification list at a
    /// time (`death_sliced` + condvar). The drained slots are referenced
    /// before the fan-out so they cannot be vacated mid-notification, and
    /// survivors are spliced back afterwards.
    fn worker_exit(&self, index: usize) -> bool {
        let mut shared = self.shared.lock();
        if shared.configured >= index {
            return false;
        }
        while shared.death_sliced {
            self.cond.wait(&mut shared);
        }

        shared.workers[index - 1] = false;
        shared.active -= 1;
        shared.poller_gen += 1;
        let poller_gen = shared.poller_gen;

        let drained = std::mem::take(&mut shared.death_list);
        let mut notify = Vec::with_capacity(drained.len());
        for &idx in &drained {
            if let Some(slot) = self.registry.get(idx) {
                notify.push(slot);
            }
        }
        shared.death_sliced = true;
        self.cond.notify_all();
        drop(shared);

        for slot in &notify {
            let (handler, fd) = {
                let state = slot.state.lock();
                (state.handler.clone(), state.fd)
            };
            if let Some(handler) = handler {
                if fd != VACANT_FD {
                    self.metrics
                        .death_notifications
                        .fetch_add(1, Ordering::Relaxed);
                    handler.poller_death(fd, poller_gen);
                }
            }
        }

        let mut displaced = Vec::new();
        let mut shared = self.shared.lock();
        for slot in &notify {
            if let Some(handler) = self.slot_unref_locked(&mut shared, slot) {
                displaced.push(handler);
            }
        }
        for idx in drained {
            if self.registry.death_linked(idx) {
                shared.death_list.push(idx);
            }
        }
        shared.death_sliced = false;
        self.cond.notify_all();
        drop(shared);
        drop(displaced);

        self.metrics.worker_exits.fetch_add(1, Ordering::Relaxed);
        log::info!("poller {index} exited");
        true
    }
}

fn worker_loop(pool: &Arc<EventPool>, index: usize) {
    log::info!("poller {index} started");
    {
        let mut shared = pool.shared.lock();
        shared.active += 1;
    }

    loop {
        // Racy fast check; worker_exit re-validates under the pool mutex.
        if pool.configured.load(Ordering::Acquire) < index && pool.worker_exit(index) {
            return;
        }

        match pool.engine.wait(None) {
            Ok(Some(event)) => pool.dispatch_event(&event),
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("readiness wait failed on poller {index}: {e}");
                thread::yield_now();
            }
        }
    }
}

/// Handler for the shutdown wake pipe: drain it and re-arm, so every byte
/// written can rouse another blocked poller.
struct DrainHandler {
    pool: Weak<EventPool>,
}

impl EventHandler for DrainHandler {
    fn handle_event(&self, event: ReadyEvent) {
        let mut buf = [0u8; 64];
        // SAFETY: reading from our own pipe into a local buffer.
        while unsafe { libc::read(event.fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
        if let Some(pool) = self.pool.upgrade() {
            let _ = pool.handled(event.handle);
        }
    }
}
