// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 evmux.dev

//! Two-level slot registry.
//!
//! Slots live in pages of [`SLOTS_PER_PAGE`] records; up to [`SLOT_PAGES`]
//! pages are allocated lazily and never freed while the pool exists. The
//! stable index of a slot is `page * SLOTS_PER_PAGE + offset`, so handles
//! stay small integers and a growing registrant population never relocates
//! slots out from under in-flight events.
//!
//! Allocation and deallocation run under the pool mutex. `get` is the hot
//! path: a lock-free page-pointer load followed by an atomic reference
//! increment, with no liveness check; callers validate `fd` and generation
//! under the slot lock afterwards.

use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::{SLOTS_PER_PAGE, SLOT_PAGES};
use crate::error::DispatchError;
use crate::handler::EventHandler;
use crate::slot::{Slot, VACANT_FD};

/// One lazily allocated page of slots.
pub(crate) struct SlotPage {
    slots: Box<[Slot]>,
    /// Occupancy count; mutated only under the pool mutex.
    slots_used: AtomicUsize,
}

impl SlotPage {
    fn new() -> Self {
        Self {
            slots: (0..SLOTS_PER_PAGE).map(|_| Slot::vacant()).collect(),
            slots_used: AtomicUsize::new(0),
        }
    }
}

/// A counted reference to one slot.
///
/// Holds the owning page's `Arc`, so the underlying memory can never move or
/// be freed while the reference exists. Does not release the slot's
/// reference count on drop: every `SlotRef` obtained from
/// [`SlotRegistry::alloc_locked`] or [`SlotRegistry::get`] must be paired
/// with exactly one `slot_unref`/`slot_unref_locked` on the pool.
pub(crate) struct SlotRef {
    page: Arc<SlotPage>,
    idx: u32,
}

impl SlotRef {
    #[inline]
    pub(crate) fn idx(&self) -> u32 {
        self.idx
    }
}

impl Deref for SlotRef {
    type Target = Slot;

    #[inline]
    fn deref(&self) -> &Slot {
        &self.page.slots[self.idx as usize % SLOTS_PER_PAGE]
    }
}

pub(crate) struct SlotRegistry {
    pages: Box<[ArcSwapOption<SlotPage>]>,
}

impl SlotRegistry {
    pub(crate) fn new() -> Self {
        let registry = Self {
            pages: (0..SLOT_PAGES).map(|_| ArcSwapOption::from(None)).collect(),
        };
        // Page 0 is always present so the first registration never pays the
        // page-allocation cost inside a critical section.
        registry.ensure_page(0);
        registry
    }

    fn ensure_page(&self, page_idx: usize) -> Arc<SlotPage> {
        if let Some(page) = self.pages[page_idx].load_full() {
            return page;
        }
        let page = Arc::new(SlotPage::new());
        self.pages[page_idx].store(Some(Arc::clone(&page)));
        page
    }

    /// Allocate a slot for `fd`. Caller must hold the pool mutex.
    ///
    /// Returns the stable index and a reference with the slot's count at one
    /// (the registration reference). `notify_death` links the index into the
    /// supplied death-notification list.
    pub(crate) fn alloc_locked(
        &self,
        fd: RawFd,
        notify_death: bool,
        death_list: &mut Vec<u32>,
    ) -> Result<(u32, SlotRef), DispatchError> {
        for page_idx in 0..SLOT_PAGES {
            let page = self.ensure_page(page_idx);
            if page.slots_used.load(Ordering::Relaxed) == SLOTS_PER_PAGE {
                continue;
            }
            for offset in 0..SLOTS_PER_PAGE {
                let slot = &page.slots[offset];
                let mut state = slot.state.lock();
                if state.fd != VACANT_FD {
                    continue;
                }
                state.wipe_for_alloc(fd);
                state.notify_death = notify_death;
                drop(state);

                let idx = (page_idx * SLOTS_PER_PAGE + offset) as u32;
                // Never reset the count: a stale `get` may transiently hold a
                // reference on a vacant slot, and it will balance itself out.
                slot.ref_inc();
                page.slots_used.fetch_add(1, Ordering::Relaxed);
                if notify_death {
                    death_list.push(idx);
                }
                return Ok((idx, SlotRef { page, idx }));
            }
        }
        Err(DispatchError::TableFull)
    }

    /// Look up the slot at `idx`, incrementing its reference count.
    ///
    /// Lock-free on the page pointer. Liveness is *not* checked here; the
    /// returned slot may already be vacant or recycled, and callers must
    /// validate `fd`/generation under the slot lock.
    pub(crate) fn get(&self, idx: u32) -> Option<SlotRef> {
        let page_idx = idx as usize / SLOTS_PER_PAGE;
        if page_idx >= SLOT_PAGES {
            return None;
        }
        let page = self.pages[page_idx].load_full()?;
        let slot_ref = SlotRef { page, idx };
        slot_ref.ref_inc();
        Some(slot_ref)
    }

    /// Vacate the slot at `idx`. Caller must hold the pool mutex and the
    /// slot's reference count must have reached zero.
    ///
    /// Idempotent: occupancy and death-list linkage are only touched when
    /// the slot was not already vacant. Returns the displaced handler so the
    /// caller can drop it outside the pool mutex (a handler's drop may call
    /// back into the pool).
    pub(crate) fn dealloc_locked(
        &self,
        idx: u32,
        death_list: &mut Vec<u32>,
    ) -> Option<Arc<dyn EventHandler>> {
        let page_idx = idx as usize / SLOTS_PER_PAGE;
        let page = self.pages.get(page_idx)?.load_full()?;
        let slot = &page.slots[idx as usize % SLOTS_PER_PAGE];

        let mut state = slot.state.lock();
        state.gen = state.gen.wrapping_add(1);
        let was_live = state.fd != VACANT_FD;
        state.fd = VACANT_FD;
        state.in_handler = 0;
        state.handled_error = false;
        state.do_close = false;
        let handler = state.handler.take();
        if was_live {
            page.slots_used.fetch_sub(1, Ordering::Relaxed);
            if state.notify_death {
                death_list.retain(|&linked| linked != idx);
            }
            state.notify_death = false;
        }
        handler
    }

    /// Whether the slot at `idx` is live and still opted into death
    /// notification. Caller must hold the pool mutex; used when splicing the
    /// drained notification list back after a worker exit.
    pub(crate) fn death_linked(&self, idx: u32) -> bool {
        let Some(page) = self
            .pages
            .get(idx as usize / SLOTS_PER_PAGE)
            .and_then(ArcSwapOption::load_full)
        else {
            return false;
        };
        let state = page.slots[idx as usize % SLOTS_PER_PAGE].state.lock();
        state.fd != VACANT_FD && state.notify_death
    }

    /// Racy occupancy total across all pages, for observability.
    pub(crate) fn occupied(&self) -> usize {
        self.pages
            .iter()
            .filter_map(ArcSwapOption::load_full)
            .map(|page| page.slots_used.load(Ordering::Relaxed))
            .sum()
    }
}
