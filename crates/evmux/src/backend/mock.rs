// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Scriptable readiness engine for unit tests.
//!
//! Records every add/modify/delete and serves events from an in-memory
//! queue. An indefinite `wait` is served in short ticks so poller threads
//! still observe pool reconfiguration in tests that never push events.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{EventMask, RawEvent, ReadinessEngine};

const IDLE_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineOp {
    Add {
        fd: RawFd,
        mask: EventMask,
        token: u64,
    },
    Modify {
        fd: RawFd,
        mask: EventMask,
        token: u64,
    },
    Delete {
        fd: RawFd,
    },
}

pub(crate) struct MockEngine {
    ops: Mutex<Vec<EngineOp>>,
    queue: Mutex<VecDeque<RawEvent>>,
    cond: Condvar,
    fail_add: Mutex<bool>,
}

impl MockEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            fail_add: Mutex::new(false),
        })
    }

    /// Queue one event for delivery to the next waiter.
    pub(crate) fn push_event(&self, mask: EventMask, token: u64) {
        self.queue.lock().push_back(RawEvent { mask, token });
        self.cond.notify_one();
    }

    /// Drain the recorded operation log.
    pub(crate) fn take_ops(&self) -> Vec<EngineOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Make subsequent `add` calls fail, for rollback tests.
    pub(crate) fn set_fail_add(&self, fail: bool) {
        *self.fail_add.lock() = fail;
    }
}

impl ReadinessEngine for MockEngine {
    fn add(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()> {
        if *self.fail_add.lock() {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        self.ops.lock().push(EngineOp::Add { fd, mask, token });
        Ok(())
    }

    fn modify(&self, fd: RawFd, mask: EventMask, token: u64) -> io::Result<()> {
        self.ops.lock().push(EngineOp::Modify { fd, mask, token });
        Ok(())
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ops.lock().push(EngineOp::Delete { fd });
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<RawEvent>> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            let tick = timeout.unwrap_or(IDLE_TICK).min(IDLE_TICK);
            let _ = self.cond.wait_for(&mut queue, tick);
        }
        Ok(queue.pop_front())
    }
}
