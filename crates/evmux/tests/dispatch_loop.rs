// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::cast_sign_loss)] // Test data conversions
#![allow(clippy::items_after_statements)] // Test helpers

//! End-to-end dispatch tests against the real epoll backend.
//!
//! Every scenario runs a live worker pool and drives it with pipes: write a
//! byte, expect a handler invocation, and verify the slot machinery (stale
//! filtering, deferred close, cooperative resize) from the outside.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use evmux::{CallbackHandler, EventHandler, EventPool, ReadyEvent, Toggle};

fn pipe_nonblocking() -> (RawFd, RawFd) {
    let mut fds = [-1; 2];
    // SAFETY: fds is a valid two-element array.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(rc, 0, "pipe2 failed");
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) -> bool {
    // SAFETY: fd is a pipe write end owned by the test; SIGPIPE is ignored
    // by the test harness, so a closed reader surfaces as EPIPE.
    unsafe { libc::write(fd, [1u8].as_ptr().cast(), 1) == 1 }
}

/// Whether the read end of a pipe is still open, probed from the write end.
/// Immune to fd-number reuse by tests running in parallel.
fn reader_open(wr: RawFd) -> bool {
    if write_byte(wr) {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN)
}

fn drain(fd: RawFd) {
    let mut buf = [0u8; 256];
    // SAFETY: reading from our own pipe into a local buffer.
    while unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
}

fn close_fd(fd: RawFd) {
    // SAFETY: each test closes its own descriptors exactly once.
    unsafe { libc::close(fd) };
}

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

fn start_pool(workers: usize) -> (Arc<EventPool>, thread::JoinHandle<()>) {
    let pool = EventPool::new(workers).expect("pool");
    let dispatcher = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.dispatch().expect("dispatch");
        })
    };
    assert!(
        wait_until(Duration::from_secs(5), || pool.active_workers() == workers + 1),
        "workers failed to come up"
    );
    (pool, dispatcher)
}

fn stop_pool(pool: &Arc<EventPool>, dispatcher: thread::JoinHandle<()>) {
    pool.shutdown().expect("shutdown");
    dispatcher.join().expect("dispatcher join");
    assert_eq!(pool.active_workers(), 0);
}

#[test]
fn test_readiness_is_delivered_and_rearmed() {
    let (pool, dispatcher) = start_pool(2);
    let (rd, wr) = pipe_nonblocking();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&deliveries);
    let rearm = Arc::downgrade(&pool);
    let handle = pool
        .register(
            rd,
            Arc::new(CallbackHandler::new(move |event: ReadyEvent| {
                assert!(event.readable);
                drain(event.fd);
                if let Some(pool) = rearm.upgrade() {
                    pool.handled(event.handle).expect("handled");
                }
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            Toggle::On,
            Toggle::Off,
            false,
        )
        .expect("register");

    assert!(write_byte(wr));
    assert!(wait_until(Duration::from_secs(5), || {
        deliveries.load(Ordering::SeqCst) == 1
    }));

    // The re-arm from `handled` makes the next edge deliverable.
    assert!(write_byte(wr));
    assert!(wait_until(Duration::from_secs(5), || {
        deliveries.load(Ordering::SeqCst) == 2
    }));

    pool.unregister(handle).expect("unregister");
    close_fd(rd);
    close_fd(wr);
    stop_pool(&pool, dispatcher);
}

#[test]
fn test_unregister_close_from_handler_closes_after_return() {
    let (pool, dispatcher) = start_pool(2);
    let (rd, wr) = pipe_nonblocking();

    let handler_done = Arc::new(AtomicUsize::new(0));
    let done = Arc::clone(&handler_done);
    let pool_in_handler = Arc::downgrade(&pool);
    pool.register(
        rd,
        Arc::new(CallbackHandler::new(move |event: ReadyEvent| {
            assert!(event.readable);
            drain(event.fd);
            if let Some(pool) = pool_in_handler.upgrade() {
                pool.unregister_close(event.handle).expect("unregister_close");
            }
            done.fetch_add(1, Ordering::SeqCst);
        })),
        Toggle::On,
        Toggle::Off,
        false,
    )
    .expect("register");

    assert!(write_byte(wr));
    assert!(wait_until(Duration::from_secs(5), || {
        !reader_open(wr)
    }));
    // The close is deferred to the last unref, strictly after the handler
    // body finished.
    assert_eq!(handler_done.load(Ordering::SeqCst), 1);

    close_fd(wr);
    stop_pool(&pool, dispatcher);
}

#[test]
fn test_hangup_edge_reports_error_or_hup() {
    let (pool, dispatcher) = start_pool(2);
    let (rd, wr) = pipe_nonblocking();

    let hups = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hups);
    let handle = pool
        .register(
            rd,
            Arc::new(CallbackHandler::new(move |event: ReadyEvent| {
                if event.error_or_hup {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })),
            Toggle::On,
            Toggle::Off,
            false,
        )
        .expect("register");

    // Closing the write end raises a hangup edge on the reader.
    close_fd(wr);
    assert!(wait_until(Duration::from_secs(5), || {
        hups.load(Ordering::SeqCst) == 1
    }));

    pool.unregister_close(handle).expect("unregister_close");
    stop_pool(&pool, dispatcher);
}

/// Kick helper: a registration whose handler just drains and re-arms, used
/// to wake pollers blocked in the indefinite wait during resize tests.
struct Kick {
    pool: Weak<EventPool>,
}

impl EventHandler for Kick {
    fn handle_event(&self, event: ReadyEvent) {
        drain(event.fd);
        if let Some(pool) = self.pool.upgrade() {
            let _ = pool.handled(event.handle);
        }
    }
}

#[test]
fn test_pool_resizes_up_and_down() {
    let (pool, dispatcher) = start_pool(1);
    let (kick_rd, kick_wr) = pipe_nonblocking();
    let kick = pool
        .register(
            kick_rd,
            Arc::new(Kick {
                pool: Arc::downgrade(&pool),
            }),
            Toggle::On,
            Toggle::Off,
            false,
        )
        .expect("register kick");

    // Grow 1 -> 8: immediate, nobody has to wake.
    assert_eq!(pool.reconfigure(8), 8);
    assert!(wait_until(Duration::from_secs(5), || {
        pool.active_workers() == 9
    }));

    // Shrink 8 -> 2: cooperative. Kick the pool so blocked pollers return
    // from their wait and observe the new quota.
    assert_eq!(pool.reconfigure(2), 2);
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.active_workers() > 3 && Instant::now() < deadline {
        write_byte(kick_wr);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pool.active_workers(), 3, "six pollers should have exited");
    assert!(pool.metrics().worker_exits.load(Ordering::Relaxed) >= 6);

    pool.unregister_close(kick).expect("unregister kick");
    close_fd(kick_wr);
    stop_pool(&pool, dispatcher);
}

/// Per-registration exclusivity probe: counts overlapping invocations.
struct ExclusiveProbe {
    pool: Weak<EventPool>,
    in_flight: AtomicI32,
    overlaps: Arc<AtomicUsize>,
    deliveries: Arc<AtomicUsize>,
}

impl EventHandler for ExclusiveProbe {
    fn handle_event(&self, event: ReadyEvent) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        drain(event.fd);
        thread::sleep(Duration::from_micros(fastrand::u64(0..80)));
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(pool) = self.pool.upgrade() {
            let _ = pool.handled(event.handle);
        }
    }
}

#[test]
fn test_randomized_stress_holds_exclusivity() {
    const PIPES: usize = 6;
    const WRITERS: usize = 3;
    const WRITES_PER_THREAD: usize = 300;

    let (pool, dispatcher) = start_pool(4);
    let overlaps = Arc::new(AtomicUsize::new(0));
    let deliveries = Arc::new(AtomicUsize::new(0));

    let mut write_ends = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..PIPES {
        let (rd, wr) = pipe_nonblocking();
        let handle = pool
            .register(
                rd,
                Arc::new(ExclusiveProbe {
                    pool: Arc::downgrade(&pool),
                    in_flight: AtomicI32::new(0),
                    overlaps: Arc::clone(&overlaps),
                    deliveries: Arc::clone(&deliveries),
                }),
                Toggle::On,
                Toggle::Off,
                false,
            )
            .expect("register");
        write_ends.push(wr);
        handles.push(handle);
    }

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let write_ends = write_ends.clone();
            thread::spawn(move || {
                for _ in 0..WRITES_PER_THREAD {
                    let wr = write_ends[fastrand::usize(0..write_ends.len())];
                    write_byte(wr);
                    if fastrand::u8(0..4) == 0 {
                        thread::sleep(Duration::from_micros(fastrand::u64(0..50)));
                    }
                }
            })
        })
        .collect();

    // Interest churn from a non-dispatcher thread while handlers run.
    for _ in 0..100 {
        let handle = handles[fastrand::usize(0..handles.len())];
        let write = if fastrand::bool() { Toggle::On } else { Toggle::Off };
        pool.modify_interest(handle, Toggle::On, write)
            .expect("modify_interest");
        thread::sleep(Duration::from_micros(200));
    }

    for writer in writers {
        writer.join().expect("writer join");
    }
    assert!(wait_until(Duration::from_secs(5), || {
        deliveries.load(Ordering::SeqCst) > 0
    }));

    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "handlers overlapped");

    for handle in handles {
        pool.unregister_close(handle).expect("unregister");
    }
    for wr in write_ends {
        close_fd(wr);
    }
    stop_pool(&pool, dispatcher);
}

#[test]
fn test_recycled_slot_does_not_misdeliver() {
    let (pool, dispatcher) = start_pool(2);

    // Register A, make it ready, then immediately unregister and register B
    // into the recycled slot while the event may still be in flight.
    let misdelivered = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let (rd_a, wr_a) = pipe_nonblocking();
        let (rd_b, wr_b) = pipe_nonblocking();

        let handle_a = pool
            .register(
                rd_a,
                Arc::new(CallbackHandler::new(|_| {})),
                Toggle::On,
                Toggle::Off,
                false,
            )
            .expect("register a");
        assert!(write_byte(wr_a));

        pool.unregister_close(handle_a).expect("unregister a");

        let wrong = Arc::clone(&misdelivered);
        let rearm = Arc::downgrade(&pool);
        let expected_fd = rd_b;
        let handle_b = pool
            .register(
                rd_b,
                Arc::new(CallbackHandler::new(move |event: ReadyEvent| {
                    if event.fd != expected_fd {
                        wrong.fetch_add(1, Ordering::SeqCst);
                    }
                    drain(event.fd);
                    if let Some(pool) = rearm.upgrade() {
                        let _ = pool.handled(event.handle);
                    }
                })),
                Toggle::On,
                Toggle::Off,
                false,
            )
            .expect("register b");

        write_byte(wr_b);
        thread::sleep(Duration::from_millis(2));

        pool.unregister_close(handle_b).expect("unregister b");
        close_fd(wr_a);
        close_fd(wr_b);
    }

    assert_eq!(misdelivered.load(Ordering::SeqCst), 0);
    stop_pool(&pool, dispatcher);
}
