// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process batches and the per-scheduler batch pool.
//!
//! A batch is the unit of cross-thread transfer: a FIFO list of workspaces
//! plus a small bookkeeping header. Batches are recycled through a
//! free-list (clean, reinitialized) and a laundry-list (still possibly
//! visible to a foreign scheduler via a migration window).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::priofinity::Priofinity;
use crate::proc::ProcPtr;

/// Sticky bit recording that every workspace this batch ever held has been
/// dispatched. `size & ~EMPTIED` is always the live chain length.
pub const EMPTIED: u64 = 1 << 62;
/// `Batch::state`: set while a foreign scheduler may still hold a pointer
/// to this batch (via a migration window slot), i.e. it cannot be reused.
pub const DIRTY: u64 = 1 << 63;
/// `Batch::state` low 8 bits: migration window index, `0` = unpublished,
/// `1..=15` = published slot.
pub const WINDOW_MASK: u64 = 0xff;

/// Dispatch budget is `BATCH_PPD * size`, capped at `BATCH_MD_MASK`.
pub const BATCH_PPD: u64 = 8;
pub const BATCH_MD_MASK: i64 = 127;

/// A fixed-capacity batch of workspaces belonging to one priority level.
pub struct Batch {
    pub head: Option<ProcPtr>,
    pub tail: Option<ProcPtr>,
    /// Low bits: chain length. Bit 62: [`EMPTIED`].
    pub size: u64,
    pub next: Option<Box<Batch>>,
    /// Bit 63: [`DIRTY`]. Low 8 bits: migration window index.
    pub state: AtomicU64,
    pub priofinity: Priofinity<u64>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            size: 0,
            next: None,
            state: AtomicU64::new(0),
            priofinity: Priofinity::default(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.size & !EMPTIED
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.head.is_none() && self.size == 0 && self.state.load(Ordering::Acquire) == 0
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let s = self.state.load(Ordering::Acquire);
        s & DIRTY != 0 || s & WINDOW_MASK != 0
    }

    /// Dispatch budget for a batch of this size, per §4.2.
    #[must_use]
    pub fn dispatch_budget(&self) -> i64 {
        let raw = BATCH_PPD.saturating_mul(self.len()) as i64;
        raw.min(BATCH_MD_MASK)
    }

    /// Appends `w` to the tail, updating `head`/`tail`/`size`.
    ///
    /// # Safety
    /// `w` must not already be linked into any other list.
    pub unsafe fn push_back(&mut self, w: ProcPtr) {
        w.as_mut().link = None;
        match self.tail {
            Some(t) => t.as_mut().link = Some(w),
            None => self.head = Some(w),
        }
        self.tail = Some(w);
        self.size = (self.size & EMPTIED) | (self.len() + 1);
    }

    /// Pops the head workspace, if any.
    pub fn pop_front(&mut self) -> Option<ProcPtr> {
        let head = self.head?;
        // Safety: `head` is this batch's exclusively-owned head pointer.
        let next = unsafe { head.as_ref().link };
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        self.size = (self.size & EMPTIED) | (self.len() - 1);
        if self.head.is_none() {
            self.size |= EMPTIED;
        }
        Some(head)
    }

    /// Splits off the head workspace into a fresh one-element batch,
    /// leaving the remainder (at least one element) in `self`. Used by the
    /// scheduler's end-of-batch split rule.
    pub fn split_head(&mut self) -> Option<Box<Batch>> {
        let head = self.pop_front()?;
        let mut fresh = Box::new(Batch::new());
        fresh.priofinity = self.priofinity;
        // Safety: `head` was just detached from `self`, uniquely owned here.
        unsafe { fresh.push_back(head) };
        Some(fresh)
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-scheduler free-list / laundry-list of recycled batches.
pub struct BatchPool {
    free: Vec<Box<Batch>>,
    laundry: Vec<Box<Batch>>,
    max_free: usize,
}

impl BatchPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            laundry: Vec::new(),
            max_free: 32,
        }
    }

    /// Pops a clean batch off the free-list, topping up from a fresh
    /// allocation of 16 if empty (after a laundry sweep).
    pub fn allocate(&mut self) -> Box<Batch> {
        if self.free.is_empty() {
            self.laundry_sweep();
        }
        if self.free.is_empty() {
            self.free.extend((0..16).map(|_| Box::new(Batch::new())));
        }
        let mut b = self.free.pop().expect("just topped up");
        debug_assert!(b.is_clean(), "allocate() returned a dirty batch");
        b.next = None;
        b
    }

    /// Returns a batch to the free-list, asserting it is clean.
    pub fn release_clean(&mut self, mut b: Box<Batch>) {
        debug_assert!(b.is_empty(), "release_clean on non-empty batch");
        b.head = None;
        b.tail = None;
        b.size = 0;
        b.state = AtomicU64::new(0);
        b.next = None;
        self.free.push(b);
    }

    /// Returns a batch that may still be foreign-visible to the
    /// laundry-list, without reinitializing it.
    pub fn release_dirty(&mut self, b: Box<Batch>) {
        debug_assert!(b.is_dirty(), "release_dirty on a clean batch");
        self.laundry.push(b);
    }

    /// Walks the laundry-list, moving any batch whose dirty bit has since
    /// been cleared by its foreign holder onto the free-list.
    pub fn laundry_sweep(&mut self) {
        let mut still_dirty = Vec::with_capacity(self.laundry.len());
        for b in self.laundry.drain(..) {
            if b.is_dirty() {
                still_dirty.push(b);
            } else {
                self.release_clean(b);
            }
        }
        self.laundry = still_dirty;
    }

    /// Caps the free-list at `max_free`, dropping the excess.
    pub fn trim(&mut self) {
        if self.free.len() > self.max_free {
            self.free.truncate(self.max_free);
        }
    }
}

impl Default for BatchPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::{BoxedFuture, Proc};

    fn dummy_proc() -> ProcPtr {
        let fut: BoxedFuture = Box::pin(async {});
        ProcPtr::new(Proc::new(fut, Priofinity::any(10)))
    }

    #[test]
    fn push_pop_preserves_fifo_order() {
        let mut b = Batch::new();
        let a = dummy_proc();
        let c = dummy_proc();
        unsafe {
            b.push_back(a);
            b.push_back(c);
        }
        assert_eq!(b.len(), 2);
        assert_eq!(b.pop_front(), Some(a));
        assert_eq!(b.pop_front(), Some(c));
        assert!(b.is_empty());
        assert_ne!(b.size & EMPTIED, 0);
        unsafe {
            drop(a.into_box());
            drop(c.into_box());
        }
    }

    #[test]
    fn pool_allocate_returns_clean_batch() {
        let mut pool = BatchPool::new();
        let b = pool.allocate();
        assert!(b.is_clean());
        pool.release_clean(b);
        assert_eq!(pool.free.len(), 1);
    }

    #[test]
    fn laundry_sweep_releases_when_dirty_clears() {
        let mut pool = BatchPool::new();
        let b = pool.allocate();
        b.state.store(DIRTY, Ordering::Release);
        pool.release_dirty(b);
        assert_eq!(pool.laundry.len(), 1);
        pool.laundry[0].state.store(0, Ordering::Release);
        pool.laundry_sweep();
        assert!(pool.laundry.is_empty());
        assert_eq!(pool.free.len(), 1);
    }

    #[test]
    fn dispatch_budget_caps_at_md_mask() {
        let mut b = Batch::new();
        for _ in 0..40 {
            let p = dummy_proc();
            unsafe { b.push_back(p) };
        }
        assert_eq!(b.dispatch_budget(), BATCH_MD_MASK);
        while let Some(p) = b.pop_front() {
            unsafe { drop(p.into_box()) };
        }
    }
}
