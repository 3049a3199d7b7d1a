// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-priority run-queues.
//!
//! Each scheduler owns 32 run-queues, one per priority level. Each queue
//! holds a FIFO list of published batches plus one "pending" batch that
//! absorbs newly enqueued workspaces before it's big enough to publish.

use crate::batch::Batch;
use crate::priofinity::MAX_PRIORITY;

const NUM_PRIORITIES: usize = MAX_PRIORITY as usize + 1;

/// One priority level's queue of published batches, plus a pending batch
/// still being filled.
#[derive(Default)]
pub struct PriorityQueue {
    head: Option<Box<Batch>>,
    tail: *mut Batch,
    pub pending: Option<Box<Batch>>,
}

impl PriorityQueue {
    fn push_back(&mut self, mut b: Box<Batch>) {
        b.next = None;
        let raw: *mut Batch = &mut *b;
        if self.head.is_none() {
            self.head = Some(b);
        } else {
            // Safety: `self.tail` was set to a live node's address the last
            // time this queue was non-empty and is only ever invalidated by
            // clearing `head`, which also clears `tail` below.
            unsafe { (*self.tail).next = Some(b) };
        }
        self.tail = raw;
    }

    fn pop_front(&mut self) -> Option<Box<Batch>> {
        let mut b = self.head.take()?;
        self.head = b.next.take();
        if self.head.is_none() {
            self.tail = std::ptr::null_mut();
        }
        Some(b)
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// The set of 32 per-priority run-queues owned by one scheduler.
pub struct RunQueues {
    queues: Vec<PriorityQueue>,
    /// Bit `p` set iff priority `p`'s queue (published or pending) is
    /// non-empty. Mirrors the spec's `rqstate`.
    pub rqstate: u32,
}

impl RunQueues {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: (0..NUM_PRIORITIES).map(|_| PriorityQueue::default()).collect(),
            rqstate: 0,
        }
    }

    fn mark_nonempty(&mut self, priority: u8) {
        self.rqstate |= 1 << priority;
    }

    fn refresh_bit(&mut self, priority: u8) {
        let q = &self.queues[priority as usize];
        let nonempty = !q.is_empty() || q.pending.as_ref().is_some_and(|p| !p.is_empty());
        if nonempty {
            self.rqstate |= 1 << priority;
        } else {
            self.rqstate &= !(1 << priority);
        }
    }

    /// Publishes a filled batch onto the given priority's queue.
    pub fn publish(&mut self, priority: u8, b: Box<Batch>) {
        self.mark_nonempty(priority);
        self.queues[priority as usize].push_back(b);
    }

    /// Takes (and clears) the pending batch for `priority`, if any.
    pub fn take_pending(&mut self, priority: u8) -> Option<Box<Batch>> {
        let b = self.queues[priority as usize].pending.take();
        self.refresh_bit(priority);
        b
    }

    pub fn set_pending(&mut self, priority: u8, b: Box<Batch>) {
        self.mark_nonempty(priority);
        self.queues[priority as usize].pending = Some(b);
    }

    /// Pops the head published batch of the lowest-numbered set priority,
    /// promoting that priority's pending batch onto the published list
    /// first if nothing has been published there yet.
    pub fn pop_highest(&mut self) -> Option<(u8, Box<Batch>)> {
        while self.rqstate != 0 {
            let priority = self.rqstate.trailing_zeros() as u8;
            let q = &mut self.queues[priority as usize];
            if let Some(b) = q.pop_front() {
                self.refresh_bit(priority);
                return Some((priority, b));
            }
            if let Some(pending) = q.pending.take() {
                // `rqstate`'s bit was set by this pending batch alone;
                // promote it so the next pass actually dispatches it,
                // instead of spinning on a bit no published batch backs.
                q.push_back(pending);
                self.refresh_bit(priority);
                continue;
            }
            self.refresh_bit(priority);
        }
        None
    }

    #[must_use]
    pub fn highest_pending_priority(&self) -> Option<u8> {
        if self.rqstate == 0 {
            None
        } else {
            Some(self.rqstate.trailing_zeros() as u8)
        }
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_pop_highest_priority_first() {
        let mut rq = RunQueues::new();
        rq.publish(5, Box::new(Batch::new()));
        rq.publish(2, Box::new(Batch::new()));
        let (p, _) = rq.pop_highest().unwrap();
        assert_eq!(p, 2);
        let (p, _) = rq.pop_highest().unwrap();
        assert_eq!(p, 5);
        assert!(rq.pop_highest().is_none());
    }

    #[test]
    fn pending_batch_marks_rqstate() {
        let mut rq = RunQueues::new();
        assert!(rq.highest_pending_priority().is_none());
        rq.set_pending(7, Box::new(Batch::new()));
        assert_eq!(rq.highest_pending_priority(), Some(7));
        let taken = rq.take_pending(7);
        assert!(taken.is_some());
        assert!(rq.highest_pending_priority().is_none());
    }
}
