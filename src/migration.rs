// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Migration windows: per-priority rings of recently-published non-affine
//! batches, visible to peer schedulers for work stealing.

use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::batch::{Batch, DIRTY};

/// Slots per priority ring. Slot `0` is never used (mirrors the source's
/// 1-based window indices so `state & 0 == "unpublished"` stays meaningful).
pub const SLOTS: usize = 16;

/// One priority level's migration window: a ring of up to 15 batch
/// pointers plus a compact head/occupancy word.
pub struct MigrationWindow {
    slots: [AtomicPtr<Batch>; SLOTS],
    /// Low 4 bits: head index. Bits `4..=19`: occupancy bitmap over slots
    /// `1..=15`.
    state: AtomicU32,
}

impl MigrationWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            state: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        (self.state.load(Ordering::Acquire) >> 4) == 0
    }

    /// Publishes `raw` (a leaked `Box<Batch>` pointer) into the next slot,
    /// stamping its `state` word with `DIRTY | index`. Returns the batch
    /// pointer previously occupying that slot, if the slot was reused
    /// before being stolen (its DIRTY bit is cleared since it's still
    /// reachable through the local run-queue).
    pub fn publish(&self, batch: *mut Batch) -> Option<*mut Batch> {
        // Advance only the low nibble (the head counter) and leave the
        // occupancy bitmap in bits 4..=19 untouched: a plain `fetch_add`
        // on the whole word would carry into it every 16th publish.
        let prev_state = {
            let mut s = self.state.load(Ordering::Acquire);
            loop {
                let h = s & 0xf;
                let next_h = ((h + 1) | ((h + 1) >> 4)) & 0xf;
                let new_s = (s & !0xf) | next_h;
                match self.state.compare_exchange_weak(
                    s,
                    new_s,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(old) => break old,
                    Err(cur) => s = cur,
                }
            }
        };
        let head = (prev_state & 0xf) % 15 + 1;
        // Safety: `batch` is a valid pointer to a `Batch` whose `state`
        // field the caller owns exclusively at this point (it was just
        // dequeued from the local run-queue or freshly split).
        unsafe { (*batch).state.store(DIRTY | head as u64, Ordering::Release) };
        let prev = self.slots[head as usize].swap(batch, Ordering::AcqRel);
        self.state.fetch_or(1 << (4 + head), Ordering::AcqRel);
        if prev.is_null() {
            None
        } else {
            // Safety: `prev` was published by a prior `publish` call and
            // has not since been freed (it would have been stolen first,
            // which clears the slot to null).
            unsafe { (*prev).state.fetch_and(!DIRTY, Ordering::AcqRel) };
            Some(prev)
        }
    }

    /// Attempts to steal the newest occupied slot. Returns the stolen
    /// batch pointer on success.
    pub fn steal(&self) -> Option<*mut Batch> {
        loop {
            let s = self.state.load(Ordering::Acquire);
            let occupied = s >> 4;
            if occupied == 0 {
                return None;
            }
            let head = s & 0xf;
            // Newest slot first: rotate so `head` is the high bit, take
            // the highest set bit of the rotated mask.
            let rotated = occupied.rotate_right(head);
            let newest_rel = 31 - rotated.leading_zeros();
            let slot = ((head + newest_rel) % 15) + 1;
            let candidate = self.slots[slot as usize].load(Ordering::Acquire);
            if candidate.is_null() {
                // Raced with another thief; try again.
                continue;
            }
            if self.slots[slot as usize]
                .compare_exchange(
                    candidate,
                    std::ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.state.fetch_and(!(1 << (4 + slot)), Ordering::AcqRel);
                return Some(candidate);
            }
            // Lost the race to another thief for this slot; retry.
        }
    }
}

impl Default for MigrationWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_batch() -> *mut Batch {
        Box::into_raw(Box::new(Batch::new()))
    }

    #[test]
    fn publish_then_steal_round_trips() {
        let w = MigrationWindow::new();
        assert!(w.is_empty());
        let b = leaked_batch();
        assert!(w.publish(b).is_none());
        assert!(!w.is_empty());
        let stolen = w.steal();
        assert_eq!(stolen, Some(b));
        assert!(w.is_empty());
        // Safety: no other pointer to `b` is live after the steal.
        unsafe { drop(Box::from_raw(b)) };
    }

    #[test]
    fn steal_on_empty_window_returns_none() {
        let w = MigrationWindow::new();
        assert!(w.steal().is_none());
    }

    #[test]
    fn republishing_slot_clears_dirty_on_evicted_batch() {
        let w = MigrationWindow::new();
        for _ in 0..20 {
            let b = leaked_batch();
            if let Some(evicted) = w.publish(b) {
                // Safety: evicted batch is exclusively owned by this test
                // once its DIRTY bit cleared, no thief reached it.
                unsafe {
                    assert_eq!((*evicted).state.load(Ordering::Acquire) & DIRTY, 0);
                    drop(Box::from_raw(evicted));
                }
            }
        }
        while let Some(b) = w.steal() {
            unsafe { drop(Box::from_raw(b)) };
        }
    }
}
