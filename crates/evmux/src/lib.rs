// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! # evmux - multi-threaded one-shot readiness dispatcher
//!
//! evmux multiplexes an open-ended population of file descriptors across a
//! dynamically resizable pool of poller threads, delivering readiness events
//! to user handlers with a strict exclusivity guarantee: for any single
//! registration, no two handler invocations ever overlap.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use evmux::{CallbackHandler, EventPool, Toggle};
//! use std::sync::Arc;
//!
//! fn main() -> evmux::Result<()> {
//!     let pool = EventPool::new(4)?;
//!
//!     // Dedicate a thread to the dispatcher; it blocks until shutdown.
//!     let dispatcher = {
//!         let pool = Arc::clone(&pool);
//!         std::thread::spawn(move || pool.dispatch())
//!     };
//!
//!     let handler = {
//!         let pool = Arc::clone(&pool);
//!         Arc::new(CallbackHandler::new(move |event| {
//!             // ... read from / write to event.fd ...
//!             let _ = pool.handled(event.handle); // re-arm
//!         }))
//!     };
//!     let fd = 0; // some non-blocking descriptor
//!     let handle = pool.register(fd, handler, Toggle::On, Toggle::Off, false)?;
//!
//!     pool.unregister(handle)?;
//!     pool.shutdown()?;
//!     let _ = dispatcher.join();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                            EventPool                                |
//! |  register / modify_interest / unregister / handled                  |
//! +---------------------------------------------------------------------+
//! |                          Slot Registry                              |
//! |  pages of generation-tagged, reference-counted slots                |
//! |  handle (idx, gen) <-> 64-bit engine token                          |
//! +---------------------------------------------------------------------+
//! |                         Worker Pool                                 |
//! |  wait one event -> validate handle -> invoke handler -> re-arm      |
//! |  cooperative shrink with death-notification fan-out                 |
//! +---------------------------------------------------------------------+
//! |                       Readiness Engine                              |
//! |  epoll (one-shot), or any ReadinessEngine implementation            |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`EventPool`] | The dispatcher: registration surface and worker pool |
//! | [`Handle`] | Stable `(index, generation)` identity of a registration |
//! | [`EventHandler`] | Receiver of readiness events for one registration |
//! | [`Toggle`] | Tri-state read/write interest directive |
//! | [`ReadinessEngine`] | Pluggable one-shot readiness backend |
//!
//! ## The stale-wake race
//!
//! The kernel may queue an event for a descriptor, after which the owner
//! unregisters it and the slot is recycled for a different descriptor, all
//! before any worker dequeues the event. The handle's generation travels
//! through the engine's opaque user data and is compared against the slot's
//! current generation under the slot lock, so such events are dropped
//! instead of being delivered to the wrong registration.
//!
//! ## One-shot exclusivity
//!
//! Descriptors are armed with the engine's one-shot flag: delivery disarms
//! them. A slot-level `in_handler` gate filters the duplicate deliveries
//! that remain possible (e.g. an event already queued when a re-arm races
//! in), and [`EventPool::handled`] re-arms with the slot's current interest
//! mask, which is also how interest changes made *during* a handler take
//! effect without an extra engine call.

/// Readiness engine abstraction and the epoll backend.
pub mod backend;
/// Compile-time pool geometry and runtime knobs.
pub mod config;
mod error;
mod handler;
mod metrics;
mod pool;
mod registry;
mod slot;
mod worker;

pub use backend::{Epoll, EventMask, RawEvent, ReadinessEngine};
pub use error::{DispatchError, Result};
pub use handler::{CallbackHandler, EventHandler, ReadyEvent};
pub use metrics::DispatchMetrics;
pub use pool::{EventPool, Toggle};
pub use slot::Handle;
