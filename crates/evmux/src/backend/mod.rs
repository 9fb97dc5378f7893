// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Readiness engine abstraction.
//!
//! The pool talks to the host OS's readiness facility through the
//! [`ReadinessEngine`] trait: add/modify/delete a descriptor with an interest
//! mask and a 64-bit opaque token, and wait for one event at a time. The
//! token is reported back verbatim in [`RawEvent`]; the pool packs its slot
//! handle into it.
//!
//! The production backend is [`Epoll`], selected once at pool construction.
//! Backends must support one-shot arming: a descriptor is disarmed on
//! delivery and stays quiet until the consumer re-issues a modify.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use bitflags::bitflags;

mod epoll;
#[cfg(test)]
pub(crate) mod mock;

pub use epoll::Epoll;

bitflags! {
    /// Interest/readiness mask shared between the pool and its backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        /// Data can be read without blocking.
        const READABLE = 1 << 0;
        /// Data can be written without blocking.
        const WRITABLE = 1 << 1;
        /// Urgent/priority data is pending.
        const PRIORITY = 1 << 2;
        /// Peer hung up.
        const HANGUP = 1 << 3;
        /// Error condition on the descriptor.
        const ERROR = 1 << 4;
        /// Disarm the descriptor after delivering one event.
        const ONE_SHOT = 1 << 5;
    }
}

impl EventMask {
    /// Bits that are always armed for a registration, independent of the
    /// caller's read/write interest.
    pub const MANDATORY: Self = Self::PRIORITY
        .union(Self::HANGUP)
        .union(Self::ERROR)
        .union(Self::ONE_SHOT);
}

/// One event as reported by a backend.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    /// Readiness bits that fired.
    pub mask: EventMask,
    /// The token supplied at add/modify time, verbatim.
    pub token: u64,
}

/// One-shot readiness facility consumed by the pool.
///
/// Implementations must be safe to call from any thread; `wait` is called
/// concurrently by every poller thread.
pub trait ReadinessEngine: Send + Sync {
    /// Start watching `fd` with the given interest mask and token.
    fn add(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()>;

    /// Replace the interest mask and token of a watched descriptor. This is
    /// also the re-arm operation for one-shot descriptors.
    fn modify(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()>;

    /// Stop watching `fd`.
    fn delete(&self, fd: RawFd) -> io::Result<()>;

    /// Block until one event is available, the timeout elapses (`Ok(None)`),
    /// or the wait is interrupted (`ErrorKind::Interrupted`). `None` means
    /// wait indefinitely.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<RawEvent>>;
}

impl<E: ReadinessEngine + ?Sized> ReadinessEngine for std::sync::Arc<E> {
    fn add(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()> {
        (**self).add(fd, mask, token)
    }

    fn modify(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()> {
        (**self).modify(fd, mask, token)
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        (**self).delete(fd)
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<RawEvent>> {
        (**self).wait(timeout)
    }
}
