// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Linux epoll backend.
//!
//! Thin wrapper over `epoll_create1`/`epoll_ctl`/`epoll_wait`. The pool's
//! 64-bit token travels in `epoll_event.u64`; `EventMask::ONE_SHOT` maps to
//! `EPOLLONESHOT`, which is what gives the dispatcher its exclusivity
//! guarantee.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{EventMask, RawEvent, ReadinessEngine};

/// Readiness engine backed by a Linux epoll instance.
#[derive(Debug)]
pub struct Epoll {
    epfd: OwnedFd,
}

impl Epoll {
    /// Create a new epoll instance (close-on-exec).
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 returns a fresh descriptor or -1; ownership
        // is transferred to the OwnedFd on success.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: Option<&mut libc::epoll_event>) -> io::Result<()> {
        let ptr = event.map_or(std::ptr::null_mut(), |e| e as *mut libc::epoll_event);
        // SAFETY: epfd is a valid epoll descriptor for the lifetime of self;
        // `ptr` is either null (DEL) or points at a live epoll_event.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ptr) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn to_epoll(mask: EventMask) -> u32 {
    let mut bits = 0u32;
    if mask.contains(EventMask::READABLE) {
        bits |= libc::EPOLLIN as u32;
    }
    if mask.contains(EventMask::WRITABLE) {
        bits |= libc::EPOLLOUT as u32;
    }
    if mask.contains(EventMask::PRIORITY) {
        bits |= libc::EPOLLPRI as u32;
    }
    if mask.contains(EventMask::HANGUP) {
        bits |= libc::EPOLLHUP as u32;
    }
    if mask.contains(EventMask::ERROR) {
        bits |= libc::EPOLLERR as u32;
    }
    if mask.contains(EventMask::ONE_SHOT) {
        bits |= libc::EPOLLONESHOT as u32;
    }
    bits
}

fn from_epoll(bits: u32) -> EventMask {
    let mut mask = EventMask::empty();
    if bits & libc::EPOLLIN as u32 != 0 {
        mask |= EventMask::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        mask |= EventMask::WRITABLE;
    }
    if bits & libc::EPOLLPRI as u32 != 0 {
        mask |= EventMask::PRIORITY;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        mask |= EventMask::HANGUP;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        mask |= EventMask::ERROR;
    }
    mask
}

impl ReadinessEngine for Epoll {
    fn add(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll(mask),
            u64: token,
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(&mut event))
    }

    fn modify(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll(mask),
            u64: token,
        };
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(&mut event))
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<RawEvent>> {
        let timeout_ms = timeout.map_or(-1, |d| {
            libc::c_int::try_from(d.as_millis()).unwrap_or(libc::c_int::MAX)
        });
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        // SAFETY: `event` outlives the call; maxevents is 1 to match its size.
        let rc = unsafe { libc::epoll_wait(self.epfd.as_raw_fd(), &mut event, 1, timeout_ms) };
        match rc {
            0 => Ok(None),
            1 => {
                let events = event.events;
                let token = event.u64;
                Ok(Some(RawEvent {
                    mask: from_epoll(events),
                    token,
                }))
            }
            _ => Err(io::Error::last_os_error()),
        }
    }
}
