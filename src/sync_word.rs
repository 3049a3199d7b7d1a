// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-scheduler `sync` word: an atomic bitmap of pending asynchronous
//! events, set by producers (timer signal handler, mail producers) and
//! drained by the owning scheduler at the top of each dispatch cycle.

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Sync: u32 {
        /// The interval timer fired; walk the timer queue.
        const TIME  = 1 << 0;
        /// `bmail` has entries to drain into the run-queues.
        const BMAIL = 1 << 1;
        /// `pmail` has entries to drain into the run-queues.
        const PMAIL = 1 << 2;
        /// A foreign scheduler cancelled one of our timer nodes; walk and
        /// reap cancelled entries even if nothing has expired yet.
        const TQ    = 1 << 3;
    }
}

#[derive(Debug, Default)]
pub struct SyncWord(AtomicU32);

impl SyncWord {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn set(&self, bits: Sync) {
        self.0.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Atomically takes and clears the full word, returning what was
    /// pending. Only the bits actually observed are cleared — a producer
    /// setting a new bit concurrently is never silently dropped.
    pub fn take(&self) -> Sync {
        let bits = self.0.swap(0, Ordering::AcqRel);
        Sync::from_bits_truncate(bits)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    /// Re-publishes bits that were taken but not fully consumed, without
    /// clobbering anything a producer set in the meantime.
    pub fn restore(&self, bits: Sync) {
        self.0.fetch_or(bits.bits(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_take_returns_exact_bits() {
        let s = SyncWord::new();
        s.set(Sync::TIME);
        s.set(Sync::PMAIL);
        let taken = s.take();
        assert!(taken.contains(Sync::TIME));
        assert!(taken.contains(Sync::PMAIL));
        assert!(s.is_empty());
    }
}
