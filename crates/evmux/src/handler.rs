// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Handler trait and callback adapter.

use std::os::fd::RawFd;

use crate::slot::Handle;

/// One readiness delivery, as seen by a handler.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    /// The descriptor the event is for.
    pub fd: RawFd,
    /// The registration the event belongs to; pass this back to
    /// [`EventPool::handled`](crate::EventPool::handled) to re-arm.
    pub handle: Handle,
    /// Read (or priority) readiness fired.
    pub readable: bool,
    /// Write readiness fired.
    pub writable: bool,
    /// An error or hangup edge fired. Delivered at most once per
    /// registration; later error edges are coalesced until the slot is
    /// recycled.
    pub error_or_hup: bool,
}

/// Receiver of readiness events for one registration.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`: callbacks are invoked from poller
/// threads, and a registration can migrate between pollers over its
/// lifetime.
///
/// # Exclusivity
/// For a given registration, `handle_event` invocations never overlap. The
/// descriptor stays disarmed until the handler reports completion via
/// [`EventPool::handled`](crate::EventPool::handled); forgetting that call
/// silences the registration permanently.
///
/// # Reentrancy
/// Handlers run outside all dispatcher locks and may call back into any
/// pool operation, including unregistering themselves.
pub trait EventHandler: Send + Sync {
    /// Called with a snapshot of the readiness edge that fired.
    fn handle_event(&self, event: ReadyEvent);

    /// Called when the poller thread that delivered this registration's
    /// events is exiting, if the registration opted in with
    /// `notify_death`. `poller_gen` is the pool-wide exit generation.
    ///
    /// The default implementation ignores the notification.
    fn poller_death(&self, _fd: RawFd, _poller_gen: u64) {}
}

/// Closure-based handler wrapper.
///
/// Wraps a plain function as an [`EventHandler`] for callers that do not
/// need a custom type or death notifications.
///
/// # Examples
/// ```no_run
/// use evmux::CallbackHandler;
/// use std::sync::Arc;
///
/// let handler = Arc::new(CallbackHandler::new(|event| {
///     println!("fd {} readable={}", event.fd, event.readable);
/// }));
/// ```
pub struct CallbackHandler<F>
where
    F: Fn(ReadyEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: Fn(ReadyEvent) + Send + Sync,
{
    /// Create a new callback handler.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventHandler for CallbackHandler<F>
where
    F: Fn(ReadyEvent) + Send + Sync,
{
    fn handle_event(&self, event: ReadyEvent) {
        (self.callback)(event);
    }
}
